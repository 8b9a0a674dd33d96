/// Multiplexor session tracking
///
/// Finished sessions stay visible for a linger window so the status API can
/// show what recently happened to a connection. Relayed sessions report their
/// byte counters live and can be aborted.

use super::relay::{RelayControl, RelayProgress};
use hostlink_common::Timestamp;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Accepted,
    Buffering,
    Resolved,
    Rejected,
    TimedOut,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Accepted => "accepted",
            SessionState::Buffering => "buffering",
            SessionState::Resolved => "resolved",
            SessionState::Rejected => "rejected",
            SessionState::TimedOut => "timed-out",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: u64,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub server_name: Option<String>,
    pub backend: Option<String>,
    pub state: SessionState,
    pub reason: Option<String>,
    pub preamble_len: usize,
    pub bytes_client_to_backend: u64,
    pub bytes_backend_to_client: u64,
    /// Milliseconds since a live relay last moved bytes
    pub idle_ms: Option<u64>,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
}

struct Tracked {
    info: SessionInfo,
    ended: Option<Instant>,
    relay: Option<Arc<RelayProgress>>,
    abort: Option<watch::Sender<bool>>,
}

impl Tracked {
    /// Session info with the relay counters folded in
    fn snapshot(&self) -> SessionInfo {
        let mut info = self.info.clone();
        if let Some(progress) = &self.relay {
            let stats = progress.stats();
            info.bytes_client_to_backend = stats.client_to_backend;
            info.bytes_backend_to_client = stats.backend_to_client;
            if self.ended.is_none() {
                info.idle_ms = Some(progress.idle_for().as_millis() as u64);
            }
        }
        info
    }
}

/// Per-state session counts
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub active: usize,
    pub finished: usize,
    pub by_state: HashMap<&'static str, usize>,
}

pub struct SessionTracker {
    sessions: RwLock<HashMap<u64, Tracked>>,
    next_id: AtomicU64,
    linger: Duration,
}

impl SessionTracker {
    pub fn new(linger: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            linger,
        }
    }

    pub async fn start(&self, peer_addr: SocketAddr, local_addr: SocketAddr) -> u64 {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = SessionInfo {
            session_id,
            peer_addr,
            local_addr,
            server_name: None,
            backend: None,
            state: SessionState::Accepted,
            reason: None,
            preamble_len: 0,
            bytes_client_to_backend: 0,
            bytes_backend_to_client: 0,
            idle_ms: None,
            started_at: Timestamp::now(),
            ended_at: None,
        };
        self.sessions.write().await.insert(
            session_id,
            Tracked {
                info,
                ended: None,
                relay: None,
                abort: None,
            },
        );
        session_id
    }

    /// Registers a relay for the session and returns what it reports into.
    /// `None` if the session is unknown.
    pub async fn attach_relay(&self, session_id: u64, idle_timeout: Duration) -> Option<RelayControl> {
        let mut sessions = self.sessions.write().await;
        let tracked = sessions.get_mut(&session_id)?;

        let progress = Arc::new(RelayProgress::default());
        let (tx, rx) = watch::channel(false);
        tracked.relay = Some(progress.clone());
        tracked.abort = Some(tx);
        Some(RelayControl {
            progress,
            idle_timeout,
            abort: rx,
        })
    }

    /// Asks a live relay to stop. Returns false if the session is unknown,
    /// already finished, or has no relay.
    pub async fn abort(&self, session_id: u64) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(&session_id) {
            Some(tracked) if tracked.ended.is_none() => match &tracked.abort {
                Some(tx) => tx.send(true).is_ok(),
                None => false,
            },
            _ => false,
        }
    }

    pub async fn update(&self, session_id: u64, f: impl FnOnce(&mut SessionInfo)) {
        if let Some(tracked) = self.sessions.write().await.get_mut(&session_id) {
            f(&mut tracked.info);
        }
    }

    pub async fn set_state(&self, session_id: u64, state: SessionState) {
        self.update(session_id, |info| info.state = state).await;
    }

    /// Marks the session finished in `state`; it lingers until `cleanup`.
    pub async fn finish(&self, session_id: u64, state: SessionState, reason: Option<String>) {
        if let Some(tracked) = self.sessions.write().await.get_mut(&session_id) {
            tracked.info.state = state;
            tracked.info.reason = reason;
            tracked.info.ended_at = Some(Timestamp::now());
            tracked.ended = Some(Instant::now());
            tracked.abort = None;
        }
    }

    pub async fn get(&self, session_id: u64) -> Option<SessionInfo> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map(Tracked::snapshot)
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(Tracked::snapshot)
            .collect();
        sessions.sort_by_key(|s| s.session_id);
        sessions
    }

    pub async fn stats(&self) -> SessionStats {
        let sessions = self.sessions.read().await;
        let mut stats = SessionStats::default();
        for tracked in sessions.values() {
            if tracked.ended.is_some() {
                stats.finished += 1;
            } else {
                stats.active += 1;
            }
            *stats.by_state.entry(tracked.info.state.as_str()).or_insert(0) += 1;
        }
        stats
    }

    /// Forgets finished sessions older than the linger window.
    pub async fn cleanup(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        let linger = self.linger;
        sessions.retain(|_, tracked| match tracked.ended {
            Some(ended) => ended.elapsed() < linger,
            None => true,
        });
        before - sessions.len()
    }
}
