/// Short-lived runtime credentials
///
/// Credentials are bound to a registered identity, cached until they get
/// close to expiry, and never persisted. Signing goes through the
/// `CertificateSigner` capability so the key material can live elsewhere.

pub mod certificate;
pub mod issuer;
pub mod signer;

pub use certificate::RuntimeCertificate;
pub use issuer::{CertificateIssuer, CredentialSummary, IssuerConfig, IssuerStats};
pub use signer::{CertificateSigner, Ed25519Signer};

use hostlink_common::{AppIdentity, BrokerError};

/// Errors from credential issuance and verification
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Identity {0} is not registered")]
    NotRegistered(AppIdentity),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Credential expired")]
    Expired,

    #[error("Credential not yet valid")]
    NotYetValid,

    #[error("Credential was issued by key {0}, not this issuer")]
    UnknownIssuer(String),
}

impl From<CredentialError> for BrokerError {
    fn from(err: CredentialError) -> Self {
        BrokerError::credential(err.to_string())
    }
}
