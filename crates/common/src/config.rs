use crate::AppIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Control channel protocol constants
pub mod protocol {
    /// Current protocol version
    pub const VERSION: u32 = 1;

    /// Maximum frame body size (64 KiB)
    pub const MAX_FRAME_SIZE: usize = 64 * 1024;

    /// Maximum descriptors carried by one frame
    pub const MAX_FDS_PER_FRAME: usize = 64;

    /// Frame header: u32 body length + u8 descriptor count
    pub const FRAME_HEADER_LEN: usize = 5;

    /// Bound on a single outbound connect attempt
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Maximum length of the credential preamble written on secure dials
    pub const MAX_CREDENTIAL_PREAMBLE: usize = 4 * 1024;
}

/// SNI multiplexor constants
pub mod sni {
    /// Bytes buffered while looking for a complete ClientHello
    pub const MAX_PREAMBLE_LEN: usize = 20_480;

    /// Time allowed for a client to send its complete ClientHello
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 3_000;

    /// How long finished sessions stay visible in the tracker
    pub const SESSION_LINGER_SECS: u64 = 60;

    /// Relayed sessions with no traffic for this long are closed
    pub const RELAY_IDLE_TIMEOUT_SECS: u64 = 900; // 15 minutes

    /// Default public listen address
    pub const DEFAULT_LISTEN: &str = "0.0.0.0:443";
}

/// Credential issuance constants
pub mod credentials {
    /// Lifetime of a freshly minted runtime certificate
    pub const VALIDITY_SECS: u64 = 3600; // 1 hour

    /// Re-issue once a cached credential is this close to expiry
    pub const RENEW_MARGIN_SECS: u64 = 600; // 10 minutes
}

/// Live handoff constants
pub mod handoff {
    /// Time the coordinator waits for `AckAdoption`
    pub const ACK_TIMEOUT_MS: u64 = 5_000;

    /// Offers not adopted within this window are abandoned
    pub const OFFER_TTL_SECS: u64 = 120;

    /// Maximum connections in one offer
    pub const MAX_CONNECTIONS: usize = crate::config::protocol::MAX_FDS_PER_FRAME;
}

/// Binds a Unix uid connecting to the control socket to an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityBinding {
    pub uid: u32,
    pub identity: AppIdentity,
}

/// Broker daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Path of the local control socket applications connect to
    pub control_socket: PathBuf,

    /// Policy document written by the manifest loader
    pub policy_file: PathBuf,

    /// SNI routing table
    pub routes_file: PathBuf,

    /// Internal service name to location table
    pub services_file: PathBuf,

    /// Public SNI listen addresses
    pub sni_listen: Vec<SocketAddr>,

    /// Status API address (loopback only)
    pub api_addr: SocketAddr,

    /// Control socket peer uid to identity table
    pub identities: Vec<IdentityBinding>,

    /// Same-machine peer services and their listening paths
    pub peers: BTreeMap<String, PathBuf>,

    /// Write a TLS alert to clients the multiplexor rejects
    pub send_alerts: bool,

    pub max_preamble_len: usize,
    pub handshake_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub credential_validity_secs: u64,
    pub renew_margin_secs: u64,
    pub handoff_ack_timeout_ms: u64,
    pub offer_ttl_secs: u64,
    pub session_linger_secs: u64,
    /// Zero keeps idle relays open
    pub relay_idle_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            control_socket: PathBuf::from("/run/hostlink/control.sock"),
            policy_file: PathBuf::from("/etc/hostlink/policy.toml"),
            routes_file: PathBuf::from("/etc/hostlink/routes.toml"),
            services_file: PathBuf::from("/etc/hostlink/services.toml"),
            sni_listen: vec![sni::DEFAULT_LISTEN
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 443)))],
            api_addr: SocketAddr::from(([127, 0, 0, 1], 9190)),
            identities: Vec::new(),
            peers: BTreeMap::new(),
            send_alerts: true,
            max_preamble_len: sni::MAX_PREAMBLE_LEN,
            handshake_timeout_ms: sni::HANDSHAKE_TIMEOUT_MS,
            connect_timeout_ms: protocol::CONNECT_TIMEOUT_MS,
            credential_validity_secs: credentials::VALIDITY_SECS,
            renew_margin_secs: credentials::RENEW_MARGIN_SECS,
            handoff_ack_timeout_ms: handoff::ACK_TIMEOUT_MS,
            offer_ttl_secs: handoff::OFFER_TTL_SECS,
            session_linger_secs: sni::SESSION_LINGER_SECS,
            relay_idle_timeout_secs: sni::RELAY_IDLE_TIMEOUT_SECS,
        }
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_socket = path.into();
        self
    }

    pub fn with_policy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy_file = path.into();
        self
    }

    pub fn with_routes_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.routes_file = path.into();
        self
    }

    pub fn with_services_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.services_file = path.into();
        self
    }

    pub fn with_sni_listen(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.sni_listen = addrs;
        self
    }

    pub fn with_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = addr;
        self
    }

    pub fn with_identity(mut self, uid: u32, identity: AppIdentity) -> Self {
        self.identities.retain(|b| b.uid != uid);
        self.identities.push(IdentityBinding { uid, identity });
        self
    }

    pub fn with_peer(mut self, service: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.peers.insert(service.into(), path.into());
        self
    }

    pub fn with_send_alerts(mut self, send: bool) -> Self {
        self.send_alerts = send;
        self
    }

    pub fn identity_for_uid(&self, uid: u32) -> Option<&AppIdentity> {
        self.identities
            .iter()
            .find(|b| b.uid == uid)
            .map(|b| &b.identity)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn credential_validity(&self) -> Duration {
        Duration::from_secs(self.credential_validity_secs)
    }

    pub fn renew_margin(&self) -> Duration {
        Duration::from_secs(self.renew_margin_secs)
    }

    pub fn handoff_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_ack_timeout_ms)
    }

    pub fn offer_ttl(&self) -> Duration {
        Duration::from_secs(self.offer_ttl_secs)
    }

    pub fn session_linger(&self) -> Duration {
        Duration::from_secs(self.session_linger_secs)
    }

    pub fn relay_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_idle_timeout_secs)
    }

    /// Checks values that would make the daemon misbehave at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.api_addr.ip().is_loopback() {
            return Err(ConfigError::Invalid(format!(
                "api_addr {} is not a loopback address",
                self.api_addr
            )));
        }
        if self.max_preamble_len == 0 {
            return Err(ConfigError::Invalid("max_preamble_len must be non-zero".into()));
        }
        if self.renew_margin_secs >= self.credential_validity_secs {
            return Err(ConfigError::Invalid(
                "renew_margin_secs must be shorter than credential_validity_secs".into(),
            ));
        }
        let mut uids: Vec<u32> = self.identities.iter().map(|b| b.uid).collect();
        uids.sort_unstable();
        if uids.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::Invalid("duplicate uid in identities".into()));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
