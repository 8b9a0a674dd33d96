/// Control socket server
///
/// Every accepted connection is bound to an application identity from the
/// connecting process's uid. Connections from unmapped uids are closed
/// without a response.

use anyhow::{Context, Result};
use hostlink_common::AppIdentity;
use hostlink_core::{ControlSession, FdChannel, Runtime};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct ControlServer {
    runtime: Arc<Runtime>,
}

impl ControlServer {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Binds `path`, replacing a stale socket file. Identity comes from the
    /// uid table, so the socket itself is world-connectable.
    pub fn bind(path: &Path) -> Result<UnixListener> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }

        let listener =
            UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
        Ok(listener)
    }

    /// Accepts control connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        info!("Control socket listening");

        loop {
            let (stream, _) = listener.accept().await?;
            let channel = FdChannel::new(stream);

            let uid = match channel.peer_uid() {
                Ok(uid) => uid,
                Err(e) => {
                    warn!("Control connection without credentials: {}", e);
                    continue;
                }
            };

            let Some(identity) = self.runtime.config().identity_for_uid(uid).cloned() else {
                warn!(
                    target: "audit",
                    "control connection refused: uid {} has no identity",
                    uid
                );
                continue;
            };

            debug!("Control connection from uid {} bound to {}", uid, identity);
            self.attach(identity, channel);
        }
    }

    /// Runs a session for a channel whose identity the caller vouches for,
    /// e.g. one end of a socketpair created by a launcher.
    pub fn attach(&self, identity: AppIdentity, channel: FdChannel) -> JoinHandle<()> {
        let session = ControlSession::new(
            identity,
            channel,
            self.runtime.dial_broker().clone(),
            self.runtime.handoff().clone(),
        );

        tokio::spawn(async move {
            let identity = session.identity().clone();
            if let Err(e) = session.run().await {
                error!("Control session for {} failed: {}", identity, e);
            }
        })
    }
}
