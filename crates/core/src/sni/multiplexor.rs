/// Public endpoint accept loop and per-connection routing

use super::alert;
use super::preamble::{parse_server_name, MalformedReason, PreambleParse};
use super::proxy_header;
use super::relay::{relay, RelayEnd};
use super::routing::{Backend, BackendLocation, RoutingTable};
use super::session::{SessionState, SessionTracker};
use crate::broker::connect::Connected;
use crate::broker::protocol::Donation;
use crate::policy::{Decision, PolicyRegistry};
use crate::transfer::FdChannel;
use hostlink_common::config::{protocol, sni, BrokerConfig};
use hostlink_common::error::Result;
use hostlink_common::{BrokerError, Destination, Direction};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::AsFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MultiplexorConfig {
    pub max_preamble_len: usize,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Relays with no traffic for this long are closed; zero disables
    pub relay_idle_timeout: Duration,
    pub send_alerts: bool,
}

impl Default for MultiplexorConfig {
    fn default() -> Self {
        Self {
            max_preamble_len: sni::MAX_PREAMBLE_LEN,
            handshake_timeout: Duration::from_millis(sni::HANDSHAKE_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
            relay_idle_timeout: Duration::from_secs(sni::RELAY_IDLE_TIMEOUT_SECS),
            send_alerts: true,
        }
    }
}

impl MultiplexorConfig {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            max_preamble_len: config.max_preamble_len,
            handshake_timeout: config.handshake_timeout(),
            connect_timeout: config.connect_timeout(),
            relay_idle_timeout: config.relay_idle_timeout(),
            send_alerts: config.send_alerts,
        }
    }
}

/// What buffering produced
enum Buffered {
    Named(String),
    Malformed(MalformedReason),
    Closed,
    Overflow,
}

pub struct Multiplexor {
    routes: Arc<RoutingTable>,
    registry: Arc<PolicyRegistry>,
    tracker: Arc<SessionTracker>,
    config: MultiplexorConfig,
}

impl Multiplexor {
    pub fn new(
        routes: Arc<RoutingTable>,
        registry: Arc<PolicyRegistry>,
        tracker: Arc<SessionTracker>,
        config: MultiplexorConfig,
    ) -> Self {
        Self {
            routes,
            registry,
            tracker,
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &MultiplexorConfig {
        &self.config
    }

    /// Accepts connections forever; each one is handled on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!("SNI multiplexor listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("SNI accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            debug!("SNI: New connection from {}", peer);

            let mux = self.clone();
            tokio::spawn(async move {
                mux.handle_connection(stream, peer).await;
            });
        }
    }

    /// Drives one client connection to a terminal state and records it.
    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> SessionState {
        let local = stream
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        let session_id = self.tracker.start(peer, local).await;
        self.tracker
            .set_state(session_id, SessionState::Buffering)
            .await;

        let (state, reason) = self.process(session_id, stream, peer, local).await;
        match &reason {
            Some(reason) => debug!(
                "SNI session {} from {} ended {}: {}",
                session_id,
                peer,
                state.as_str(),
                reason
            ),
            None => debug!(
                "SNI session {} from {} ended {}",
                session_id,
                peer,
                state.as_str()
            ),
        }
        self.tracker.finish(session_id, state, reason).await;
        state
    }

    async fn process(
        &self,
        session_id: u64,
        mut stream: TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> (SessionState, Option<String>) {
        let mut preamble = Vec::new();
        let buffered = timeout(
            self.config.handshake_timeout,
            self.buffer_preamble(&mut stream, &mut preamble),
        )
        .await;
        let preamble_len = preamble.len();
        self.tracker
            .update(session_id, |info| info.preamble_len = preamble_len)
            .await;

        let server_name = match buffered {
            Err(_) => {
                return (
                    SessionState::TimedOut,
                    Some("no complete ClientHello before the handshake timeout".into()),
                )
            }
            Ok(Err(e)) => return (SessionState::Rejected, Some(format!("read failed: {}", e))),
            Ok(Ok(Buffered::Overflow)) => {
                return (
                    SessionState::TimedOut,
                    Some(format!(
                        "no complete ClientHello within {} bytes",
                        self.config.max_preamble_len
                    )),
                )
            }
            Ok(Ok(Buffered::Closed)) => {
                return (
                    SessionState::Rejected,
                    Some("client closed before sending a ClientHello".into()),
                )
            }
            Ok(Ok(Buffered::Malformed(reason))) => {
                return (SessionState::Rejected, Some(reason.to_string()))
            }
            Ok(Ok(Buffered::Named(name))) => name,
        };

        let name = server_name.clone();
        self.tracker
            .update(session_id, |info| info.server_name = Some(name))
            .await;

        let backend = match self.admit(&server_name, peer) {
            Ok(backend) => backend,
            Err(reason) => {
                self.alert(&mut stream, alert::UNRECOGNIZED_NAME).await;
                return (SessionState::Rejected, Some(reason));
            }
        };

        let described = describe(&backend);
        self.tracker
            .update(session_id, |info| {
                info.backend = Some(described);
                info.state = SessionState::Resolved;
            })
            .await;

        match &backend.location {
            BackendLocation::Local(path) => {
                let donation = Donation {
                    session_id,
                    server_name,
                    peer_addr: peer,
                    local_addr: local,
                    preamble,
                };
                match self.donate(&stream, donation, path).await {
                    Ok(()) => {
                        info!("SNI session {} donated to {}", session_id, path.display());
                        self.tracker
                            .update(session_id, |info| {
                                info.bytes_client_to_backend = preamble_len as u64
                            })
                            .await;
                        (SessionState::Resolved, None)
                    }
                    Err(e) => {
                        error!(
                            "SNI session {}: donation to {} failed: {}",
                            session_id,
                            path.display(),
                            e
                        );
                        self.alert(&mut stream, alert::INTERNAL_ERROR).await;
                        (SessionState::Rejected, Some(format!("backend unavailable: {}", e)))
                    }
                }
            }

            BackendLocation::Remote(location) => {
                let connected = match Connected::open(location, self.config.connect_timeout).await
                {
                    Ok(connected) => connected,
                    Err(e) => {
                        error!(
                            "SNI session {}: connect to {} failed: {}",
                            session_id, location, e
                        );
                        self.alert(&mut stream, alert::INTERNAL_ERROR).await;
                        return (
                            SessionState::Rejected,
                            Some(format!("backend unavailable: {}", e)),
                        );
                    }
                };

                let header = if backend.proxy_header {
                    proxy_header::v1(peer, local)
                } else {
                    String::new()
                };

                let Some(control) = self
                    .tracker
                    .attach_relay(session_id, self.config.relay_idle_timeout)
                    .await
                else {
                    return (SessionState::Rejected, Some("session no longer tracked".into()));
                };

                let relayed = match connected {
                    Connected::Tcp(mut upstream) => {
                        relay(&mut stream, &mut upstream, header.as_bytes(), &preamble, control)
                            .await
                    }
                    Connected::Unix(mut upstream) => {
                        relay(&mut stream, &mut upstream, header.as_bytes(), &preamble, control)
                            .await
                    }
                };

                match relayed {
                    Ok(RelayEnd::Closed) => (SessionState::Resolved, None),
                    Ok(RelayEnd::Idle) => {
                        info!("SNI session {} closed after the relay went idle", session_id);
                        (
                            SessionState::Resolved,
                            Some(format!(
                                "relay idle for {}s",
                                self.config.relay_idle_timeout.as_secs()
                            )),
                        )
                    }
                    Ok(RelayEnd::Aborted) => {
                        info!("SNI session {} aborted", session_id);
                        (SessionState::Resolved, Some("aborted".into()))
                    }
                    Err(e) => (SessionState::Resolved, Some(format!("relay ended: {}", e))),
                }
            }
        }
    }

    /// Reads until the preamble parses, turns out malformed, the client
    /// closes, or the buffer is full. Everything read stays in `preamble`.
    async fn buffer_preamble(
        &self,
        stream: &mut TcpStream,
        preamble: &mut Vec<u8>,
    ) -> io::Result<Buffered> {
        let mut chunk = [0u8; 4096];
        loop {
            let room = self.config.max_preamble_len.saturating_sub(preamble.len());
            if room == 0 {
                return Ok(Buffered::Overflow);
            }

            let want = room.min(chunk.len());
            let n = stream.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Ok(Buffered::Closed);
            }
            preamble.extend_from_slice(&chunk[..n]);

            match parse_server_name(preamble) {
                PreambleParse::Incomplete => continue,
                PreambleParse::Parsed(name) => return Ok(Buffered::Named(name)),
                PreambleParse::Malformed(reason) => return Ok(Buffered::Malformed(reason)),
            }
        }
    }

    /// Route lookup followed by the owner's inbound policy.
    fn admit(&self, server_name: &str, peer: SocketAddr) -> std::result::Result<Backend, String> {
        let backend = self
            .routes
            .lookup(server_name)
            .ok_or_else(|| format!("no route for {}", server_name))?;

        // IPv4 clients of a dual-stack listener arrive as v4-mapped addresses.
        let source = Destination::internet(peer.ip().to_canonical().to_string(), peer.port());
        match self
            .registry
            .authorize(&backend.owner, &source, Direction::Inbound)
        {
            Decision::Allow => Ok(backend),
            Decision::Deny(reason) => {
                warn!(
                    target: "audit",
                    "inbound deny: {} -> {} ({}): {}",
                    peer, server_name, backend.owner, reason
                );
                Err(format!("inbound policy for {} denied {}", backend.owner, peer))
            }
        }
    }

    async fn donate(&self, stream: &TcpStream, donation: Donation, path: &Path) -> Result<()> {
        let mut channel = match timeout(self.config.connect_timeout, FdChannel::connect(path)).await
        {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                return Err(BrokerError::unreachable(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
            Err(_) => {
                return Err(BrokerError::unreachable(format!(
                    "{}: connect timed out",
                    path.display()
                )))
            }
        };

        channel
            .send_with_fds(&donation, &[stream.as_fd()])
            .await?;
        Ok(())
    }

    async fn alert(&self, stream: &mut TcpStream, description: u8) {
        if !self.config.send_alerts {
            return;
        }
        if let Err(e) = stream.write_all(&alert::fatal(description)).await {
            debug!("Failed to send TLS alert: {}", e);
        }
        let _ = stream.shutdown().await;
    }
}

fn describe(backend: &Backend) -> String {
    match &backend.location {
        BackendLocation::Local(path) => format!("local:{}", path.display()),
        BackendLocation::Remote(location) => format!("remote:{}", location),
    }
}
