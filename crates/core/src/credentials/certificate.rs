use super::{CertificateSigner, CredentialError};
use hostlink_common::AppIdentity;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SIGNING_CONTEXT: &[u8] = b"hostlink-runtime-cert-v1";

/// A credential bound to one application identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCertificate {
    pub subject: AppIdentity,
    pub serial: u64,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub issuer_key_id: String,
    pub signature: Vec<u8>,
}

impl RuntimeCertificate {
    /// Unsigned certificate valid from `now` for `validity`.
    pub fn new(
        subject: AppIdentity,
        serial: u64,
        now: SystemTime,
        validity: Duration,
        issuer_key_id: String,
    ) -> Self {
        Self {
            subject,
            serial,
            not_before: now,
            not_after: now + validity,
            issuer_key_id,
            signature: Vec::new(),
        }
    }

    pub fn sign(&mut self, signer: &dyn CertificateSigner) -> Result<(), CredentialError> {
        self.signature = signer.sign(&self.signing_data())?;
        Ok(())
    }

    pub fn verify_signature(&self, signer: &dyn CertificateSigner) -> Result<(), CredentialError> {
        if self.issuer_key_id != signer.key_id() {
            return Err(CredentialError::UnknownIssuer(self.issuer_key_id.clone()));
        }
        if !signer.verify(&self.signing_data(), &self.signature) {
            return Err(CredentialError::InvalidSignature);
        }
        Ok(())
    }

    pub fn check_validity(&self, now: SystemTime) -> Result<(), CredentialError> {
        if now < self.not_before {
            return Err(CredentialError::NotYetValid);
        }
        if now >= self.not_after {
            return Err(CredentialError::Expired);
        }
        Ok(())
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        self.check_validity(now).is_ok()
    }

    /// Whether the certificate should be re-issued rather than handed out
    pub fn needs_renewal(&self, now: SystemTime, margin: Duration) -> bool {
        match self.not_after.checked_sub(margin) {
            Some(renew_at) => now >= renew_at,
            None => true,
        }
    }

    /// Canonical bytes covered by the signature
    pub fn signing_data(&self) -> Vec<u8> {
        let subject = self.subject.as_str().as_bytes();
        let mut data = Vec::with_capacity(SIGNING_CONTEXT.len() + subject.len() + 64);
        data.extend_from_slice(SIGNING_CONTEXT);
        data.extend_from_slice(&(subject.len() as u32).to_le_bytes());
        data.extend_from_slice(subject);
        data.extend_from_slice(&self.serial.to_le_bytes());
        data.extend_from_slice(&epoch_millis(self.not_before).to_le_bytes());
        data.extend_from_slice(&epoch_millis(self.not_after).to_le_bytes());
        data.extend_from_slice(self.issuer_key_id.as_bytes());
        data
    }
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Ed25519Signer;

    fn cert(signer: &Ed25519Signer, validity: Duration) -> RuntimeCertificate {
        let mut cert = RuntimeCertificate::new(
            "billing".parse().unwrap(),
            42,
            SystemTime::now(),
            validity,
            signer.key_id(),
        );
        cert.sign(signer).unwrap();
        cert
    }

    #[test]
    fn test_certificate_signature() {
        let signer = Ed25519Signer::generate();
        let mut cert = cert(&signer, Duration::from_secs(60));
        assert!(cert.verify_signature(&signer).is_ok());

        cert.serial = 43;
        assert!(matches!(
            cert.verify_signature(&signer),
            Err(CredentialError::InvalidSignature)
        ));
    }

    #[test]
    fn test_certificate_from_other_issuer() {
        let signer = Ed25519Signer::generate();
        let other = Ed25519Signer::generate();
        let cert = cert(&signer, Duration::from_secs(60));
        assert!(matches!(
            cert.verify_signature(&other),
            Err(CredentialError::UnknownIssuer(_))
        ));
    }

    #[test]
    fn test_certificate_expiry() {
        let signer = Ed25519Signer::generate();
        let cert = cert(&signer, Duration::from_secs(0));
        assert!(!cert.is_valid_at(SystemTime::now()));
        assert!(matches!(
            cert.check_validity(SystemTime::now()),
            Err(CredentialError::Expired)
        ));
    }

    #[test]
    fn test_needs_renewal() {
        let signer = Ed25519Signer::generate();
        let cert = cert(&signer, Duration::from_secs(600));
        let now = SystemTime::now();
        assert!(!cert.needs_renewal(now, Duration::from_secs(60)));
        assert!(cert.needs_renewal(now, Duration::from_secs(600)));
        assert!(cert.needs_renewal(now + Duration::from_secs(550), Duration::from_secs(60)));
    }
}
