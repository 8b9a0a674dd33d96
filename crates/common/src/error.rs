use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure categories reported back to applications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    InvalidRequest,
    PolicyDenied,
    UnreachableDestination,
    CredentialUnavailable,
    HandoffTimeout,
    HandoffRejected,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidRequest => "invalid request",
            Self::PolicyDenied => "policy denied",
            Self::UnreachableDestination => "unreachable destination",
            Self::CredentialUnavailable => "credential unavailable",
            Self::HandoffTimeout => "handoff timeout",
            Self::HandoffRejected => "handoff rejected",
            Self::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Wire form of an error, carried in `Failed` responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: Option<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn bare(kind: FailureKind) -> Self {
        Self { kind, detail: None }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.kind, detail),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Failure {}

/// Common error type for broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    #[error("Unreachable destination: {0}")]
    Unreachable(String),

    #[error("Credential unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("Handoff timed out waiting for adoption acknowledgement")]
    HandoffTimeout,

    #[error("Handoff rejected: {0}")]
    HandoffRejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A failure reported by the remote end of a control channel
    #[error("{0}")]
    Remote(Failure),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn denied(msg: impl Into<String>) -> Self {
        Self::PolicyDenied(msg.into())
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    pub fn credential(msg: impl Into<String>) -> Self {
        Self::CredentialUnavailable(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::HandoffRejected(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidRequest(_) => FailureKind::InvalidRequest,
            Self::PolicyDenied(_) => FailureKind::PolicyDenied,
            Self::Unreachable(_) => FailureKind::UnreachableDestination,
            Self::CredentialUnavailable(_) => FailureKind::CredentialUnavailable,
            Self::HandoffTimeout => FailureKind::HandoffTimeout,
            Self::HandoffRejected(_) => FailureKind::HandoffRejected,
            Self::Remote(failure) => failure.kind,
            Self::Transport(_) | Self::Internal(_) | Self::Io(_) => FailureKind::Internal,
        }
    }

    /// Maps the error to what is written back on the control channel.
    pub fn failure(&self) -> Failure {
        match self {
            Self::HandoffTimeout => Failure::bare(FailureKind::HandoffTimeout),
            Self::Remote(failure) => failure.clone(),
            Self::InvalidRequest(detail)
            | Self::PolicyDenied(detail)
            | Self::Unreachable(detail)
            | Self::CredentialUnavailable(detail)
            | Self::HandoffRejected(detail) => Failure::new(self.kind(), detail.clone()),
            // Local transport and I/O details stay in the daemon's logs.
            Self::Transport(_) | Self::Internal(_) | Self::Io(_) => {
                Failure::bare(FailureKind::Internal)
            }
        }
    }
}

impl From<Failure> for BrokerError {
    fn from(failure: Failure) -> Self {
        Self::Remote(failure)
    }
}

impl From<crate::DomainError> for BrokerError {
    fn from(err: crate::DomainError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}
