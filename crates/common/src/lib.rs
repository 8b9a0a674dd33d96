use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub mod config;
pub mod error;
pub mod types;

pub use config::{BrokerConfig, ConfigError, IdentityBinding};
pub use error::{BrokerError, Failure, FailureKind};
pub use types::{InvalidLocation, NetworkLocation, Timestamp};

pub const MAX_IDENTITY_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 253;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid identity length: expected 1..={max}, got {actual}")]
    InvalidIdentityLength { max: usize, actual: usize },
    #[error("invalid identity character {0:?}")]
    InvalidIdentityChar(char),
    #[error("invalid service name: {0}")]
    InvalidServiceName(String),
    #[error("invalid host: {0}")]
    InvalidHost(String),
    #[error("port must be non-zero")]
    ZeroPort,
}

/// Stable principal of a workload. Survives restarts of the same workload,
/// unlike a pid.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppIdentity(String);

impl AppIdentity {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.is_empty() || value.len() > MAX_IDENTITY_LEN {
            return Err(DomainError::InvalidIdentityLength {
                max: MAX_IDENTITY_LEN,
                actual: value.len(),
            });
        }

        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
        {
            return Err(DomainError::InvalidIdentityChar(bad));
        }

        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AppIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppIdentity({})", self.0)
    }
}

impl fmt::Display for AppIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AppIdentity {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AppIdentity {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AppIdentity> for String {
    fn from(value: AppIdentity) -> Self {
        value.0
    }
}

/// What an application asks the broker to dial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// A platform service, resolved by the internal service resolver.
    Internal(String),
    /// An arbitrary host on the internet.
    InternetHost(String, u16),
    /// Another application on this host, reached without the network stack.
    SameMachinePeer(String),
}

impl Destination {
    pub fn internal(service: impl Into<String>) -> Self {
        Self::Internal(service.into())
    }

    pub fn internet(host: impl Into<String>, port: u16) -> Self {
        Self::InternetHost(host.into(), port)
    }

    pub fn peer(service: impl Into<String>) -> Self {
        Self::SameMachinePeer(service.into())
    }

    /// Checks the request shape. Does not consult policy.
    pub fn validate(&self) -> Result<(), DomainError> {
        match self {
            Self::Internal(service) | Self::SameMachinePeer(service) => {
                validate_name(service).map_err(DomainError::InvalidServiceName)
            }
            Self::InternetHost(host, port) => {
                validate_name(host).map_err(DomainError::InvalidHost)?;
                if *port == 0 {
                    return Err(DomainError::ZeroPort);
                }
                Ok(())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Internal(_) => "internal",
            Self::InternetHost(..) => "internet",
            Self::SameMachinePeer(_) => "peer",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(service) => write!(f, "internal:{}", service),
            Self::InternetHost(host, port) if host.contains(':') => {
                write!(f, "[{}]:{}", host, port)
            }
            Self::InternetHost(host, port) => write!(f, "{}:{}", host, port),
            Self::SameMachinePeer(service) => write!(f, "peer:{}", service),
        }
    }
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("{} bytes exceeds {}", name.len(), MAX_NAME_LEN));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("{:?} contains whitespace or control characters", name));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialOptions {
    pub require_same_machine: bool,
    pub require_secure: bool,
}

impl DialOptions {
    pub fn same_machine(mut self) -> Self {
        self.require_same_machine = true;
        self
    }

    pub fn secure(mut self) -> Self {
        self.require_secure = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// The identity opens the connection.
    Outbound,
    /// The identity receives a routed connection from the destination.
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => f.write_str("outbound"),
            Self::Inbound => f.write_str("inbound"),
        }
    }
}
