/// Dial request handling
///
/// Validation, authorization and resolution all fail synchronously with a
/// distinct `FailureKind`. Once a socket exists, nothing can fail after it is
/// transferred.

use super::connect::{Connected, Transport};
use super::resolver::{PeerDirectory, ServiceResolver};
use crate::credentials::{CertificateIssuer, RuntimeCertificate};
use crate::policy::{Decision, PolicyRegistry};
use hostlink_common::config::protocol;
use hostlink_common::error::Result;
use hostlink_common::{
    AppIdentity, BrokerError, Destination, DialOptions, Direction, NetworkLocation,
};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DialConfig {
    /// Bound on each connect attempt
    pub connect_timeout: Duration,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
        }
    }
}

/// A connected socket ready to be transferred
#[derive(Debug)]
pub struct DialOutcome {
    pub socket: OwnedFd,
    pub peer: String,
    pub transport: Transport,
    pub credential: Option<RuntimeCertificate>,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct DialStats {
    pub dialed: u64,
    pub denied: u64,
    pub failed: u64,
}

pub struct DialBroker {
    registry: Arc<PolicyRegistry>,
    issuer: Arc<CertificateIssuer>,
    resolver: Arc<dyn ServiceResolver>,
    peers: Arc<PeerDirectory>,
    config: DialConfig,
    dialed: AtomicU64,
    denied: AtomicU64,
    failed: AtomicU64,
}

impl DialBroker {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        issuer: Arc<CertificateIssuer>,
        resolver: Arc<dyn ServiceResolver>,
        peers: Arc<PeerDirectory>,
        config: DialConfig,
    ) -> Self {
        Self {
            registry,
            issuer,
            resolver,
            peers,
            config,
            dialed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn issuer(&self) -> &Arc<CertificateIssuer> {
        &self.issuer
    }

    pub fn stats(&self) -> DialStats {
        DialStats {
            dialed: self.dialed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Runs one dial for `identity`. Dropping the returned future closes any
    /// socket it was building.
    pub async fn dial(
        &self,
        identity: &AppIdentity,
        destination: &Destination,
        options: DialOptions,
    ) -> Result<DialOutcome> {
        let result = self.dial_inner(identity, destination, options).await;
        match &result {
            Ok(outcome) => {
                self.dialed.fetch_add(1, Ordering::Relaxed);
                info!(
                    target: "audit",
                    "dial allowed: identity={} destination={} peer={} transport={}",
                    identity, destination, outcome.peer, outcome.transport
                );
            }
            Err(BrokerError::PolicyDenied(reason)) => {
                self.denied.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "audit",
                    "dial denied: identity={} destination={} reason={}",
                    identity, destination, reason
                );
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                debug!("Dial {} for {} failed: {}", destination, identity, e);
            }
        }
        result
    }

    async fn dial_inner(
        &self,
        identity: &AppIdentity,
        destination: &Destination,
        options: DialOptions,
    ) -> Result<DialOutcome> {
        destination.validate()?;
        if options.require_same_machine && matches!(destination, Destination::InternetHost(..)) {
            return Err(BrokerError::invalid(
                "internet destinations cannot be same-machine",
            ));
        }
        // Credentials are only presented to platform and peer services.
        if options.require_secure && matches!(destination, Destination::InternetHost(..)) {
            return Err(BrokerError::invalid(
                "internet destinations cannot receive a runtime credential",
            ));
        }

        if let Decision::Deny(reason) =
            self.registry
                .authorize(identity, destination, Direction::Outbound)
        {
            return Err(BrokerError::denied(reason.to_string()));
        }

        let credential = if options.require_secure {
            let cert = self.issuer.issue(identity).await?;
            self.issuer.verify(&cert)?;
            Some(cert)
        } else {
            None
        };

        let candidates = self.candidates(identity, destination, options)?;
        let mut connected = self.connect_first(&candidates).await?;

        if let Some(cert) = &credential {
            let preamble = credential_preamble(cert)?;
            connected
                .write_all(&preamble)
                .await
                .map_err(|e| BrokerError::unreachable(format!("credential preamble: {}", e)))?;
        }

        let peer = connected.peer();
        let transport = connected.transport();
        let socket = connected.into_owned_fd()?;

        Ok(DialOutcome {
            socket,
            peer,
            transport,
            credential,
        })
    }

    fn candidates(
        &self,
        identity: &AppIdentity,
        destination: &Destination,
        options: DialOptions,
    ) -> Result<Vec<NetworkLocation>> {
        match destination {
            Destination::SameMachinePeer(service) => self
                .peers
                .lookup(service)
                .map(|path| vec![NetworkLocation::Unix(path)])
                .ok_or_else(|| BrokerError::unreachable(format!("no local peer named {}", service))),

            Destination::Internal(service) => {
                let mut locations = self.resolver.resolve(service);
                if locations.is_empty() {
                    return Err(BrokerError::unreachable(format!(
                        "service {} has no known location",
                        service
                    )));
                }
                if options.require_same_machine {
                    locations.retain(NetworkLocation::is_local);
                    if locations.is_empty() {
                        return Err(BrokerError::unreachable(format!(
                            "service {} has no same-machine location",
                            service
                        )));
                    }
                }
                Ok(locations)
            }

            Destination::InternetHost(host, port) => {
                let egress = self
                    .registry
                    .egress_for(identity, destination)
                    .map_err(|e| BrokerError::unreachable(e.to_string()))?;
                if let Some(egress) = egress {
                    return Ok(vec![NetworkLocation::Tcp(egress)]);
                }

                let bare = host.trim_start_matches('[').trim_end_matches(']');
                match bare.parse::<IpAddr>() {
                    Ok(ip) => Ok(vec![NetworkLocation::Tcp(SocketAddr::new(ip, *port))]),
                    Err(_) => Ok(vec![NetworkLocation::Hostname(host.clone(), *port)]),
                }
            }
        }
    }

    /// First candidate that accepts wins; no retries beyond the list.
    async fn connect_first(&self, candidates: &[NetworkLocation]) -> Result<Connected> {
        let mut last_error = None;
        for location in candidates {
            match Connected::open(location, self.config.connect_timeout).await {
                Ok(connected) => return Ok(connected),
                Err(e) => {
                    debug!("Candidate {} failed: {}", location, e);
                    last_error = Some(format!("{}: {}", location, e));
                }
            }
        }
        Err(BrokerError::unreachable(
            last_error.unwrap_or_else(|| "no candidates".to_string()),
        ))
    }
}

/// `u32 LE length | bincode(RuntimeCertificate)`
pub fn credential_preamble(cert: &RuntimeCertificate) -> Result<Vec<u8>> {
    let body = bincode::serialize(cert).map_err(|e| BrokerError::internal(e.to_string()))?;
    if body.len() > protocol::MAX_CREDENTIAL_PREAMBLE {
        return Err(BrokerError::internal("credential preamble too large"));
    }
    let mut preamble = Vec::with_capacity(4 + body.len());
    preamble.extend_from_slice(&(body.len() as u32).to_le_bytes());
    preamble.extend_from_slice(&body);
    Ok(preamble)
}

/// Reads a credential preamble from the front of `buf`. Returns the
/// certificate and the number of bytes it occupied, or `None` if `buf` is
/// too short.
pub fn parse_credential_preamble(buf: &[u8]) -> Result<Option<(RuntimeCertificate, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > protocol::MAX_CREDENTIAL_PREAMBLE {
        return Err(BrokerError::invalid("credential preamble too large"));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let cert = bincode::deserialize(&buf[4..4 + len])
        .map_err(|e| BrokerError::invalid(format!("credential preamble: {}", e)))?;
    Ok(Some((cert, 4 + len)))
}
