/// Signing capability for runtime certificates

use super::CredentialError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;

/// Opaque `sign(request) -> signature` capability.
///
/// Implementations may block (an HSM, a remote CA); the issuer always calls
/// them from a blocking task.
pub trait CertificateSigner: Send + Sync {
    /// Stable identifier of the signing key, hex encoded
    fn key_id(&self) -> String;

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CredentialError>;

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;
}

/// In-process Ed25519 signer
#[derive(Clone)]
pub struct Ed25519Signer {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519Signer {
    /// Generate a fresh random key. Keys are never written to disk, so a
    /// daemon restart rotates the issuer key.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut secret_bytes);
        Self::from_secret_bytes(&secret_bytes)
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }
}

impl CertificateSigner for Ed25519Signer {
    fn key_id(&self) -> String {
        let digest = blake3::hash(&self.public_bytes());
        hex::encode(&digest.as_bytes()[..16])
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CredentialError> {
        Ok(self.signing_key.sign(data).to_bytes().to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        self.verifying_key
            .verify(data, &Signature::from_bytes(&bytes))
            .is_ok()
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("key_id", &self.key_id())
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = Ed25519Signer::generate();
        let signature = signer.sign(b"subject=billing").unwrap();

        assert_eq!(signature.len(), 64);
        assert!(signer.verify(b"subject=billing", &signature));
        assert!(!signer.verify(b"subject=ghost", &signature));
        assert!(!signer.verify(b"subject=billing", &signature[..63]));
    }

    #[test]
    fn test_key_id_is_stable() {
        let signer = Ed25519Signer::from_secret_bytes(&[7u8; 32]);
        let again = Ed25519Signer::from_secret_bytes(&[7u8; 32]);
        assert_eq!(signer.key_id(), again.key_id());
        assert_eq!(signer.key_id().len(), 32);
        assert_ne!(signer.key_id(), Ed25519Signer::generate().key_id());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let signer = Ed25519Signer::generate();
        assert!(format!("{:?}", signer).contains("<redacted>"));
    }
}
