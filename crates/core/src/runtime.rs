/// Broker runtime
///
/// Wires the registry, issuer, dial broker, handoff coordinator and SNI
/// multiplexor together from a `BrokerConfig`, loads the policy, routing and
/// service documents, and runs the background maintenance tasks.

use crate::broker::dial::DialStats;
use crate::broker::{
    DialBroker, DialConfig, PeerDirectory, ServiceError, ServiceTable, StaticResolver,
};
use crate::credentials::{
    CertificateIssuer, CertificateSigner, Ed25519Signer, IssuerConfig, IssuerStats,
};
use crate::handoff::{HandoffConfig, HandoffCoordinator};
use crate::policy::{PolicyError, PolicyRegistry, PolicySnapshot};
use crate::sni::{
    Multiplexor, MultiplexorConfig, RouteError, RouteTable, RoutingTable, SessionStats,
    SessionTracker,
};
use hostlink_common::{BrokerConfig, ConfigError, Timestamp};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Routes(#[from] RouteError),

    #[error(transparent)]
    Services(#[from] ServiceError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Versions in effect after a reload
#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    pub policy_version: u64,
    pub identities: usize,
    pub routes_version: u64,
    pub routes: usize,
    pub services: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub uptime_secs: u64,
    pub policy_version: u64,
    pub identities: usize,
    pub routes_version: u64,
    pub routes: usize,
    pub dial: DialStats,
    pub sessions: SessionStats,
    pub credentials: IssuerStats,
    pub pending_handoffs: usize,
}

pub struct Runtime {
    config: BrokerConfig,
    registry: Arc<PolicyRegistry>,
    routes: Arc<RoutingTable>,
    resolver: Arc<StaticResolver>,
    peers: Arc<PeerDirectory>,
    issuer: Arc<CertificateIssuer>,
    dial: Arc<DialBroker>,
    handoff: Arc<HandoffCoordinator>,
    tracker: Arc<SessionTracker>,
    multiplexor: Arc<Multiplexor>,
    running: Arc<RwLock<bool>>,
    started_at: Timestamp,
}

impl Runtime {
    /// Builds every component with the default in-process signer.
    pub fn new(config: BrokerConfig) -> Result<Self, RuntimeError> {
        Self::with_signer(config, Arc::new(Ed25519Signer::generate()))
    }

    pub fn with_signer(
        config: BrokerConfig,
        signer: Arc<dyn CertificateSigner>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let registry = Arc::new(PolicyRegistry::empty());
        let routes = Arc::new(RoutingTable::default());
        let resolver = Arc::new(StaticResolver::default());
        let peers = Arc::new(PeerDirectory::new(config.peers.clone()));

        let issuer = Arc::new(CertificateIssuer::new(
            registry.clone(),
            signer,
            IssuerConfig {
                validity: config.credential_validity(),
                renew_margin: config.renew_margin(),
            },
        ));
        let dial = Arc::new(DialBroker::new(
            registry.clone(),
            issuer.clone(),
            resolver.clone(),
            peers.clone(),
            DialConfig {
                connect_timeout: config.connect_timeout(),
            },
        ));
        let handoff = Arc::new(HandoffCoordinator::new(
            registry.clone(),
            HandoffConfig {
                ack_timeout: config.handoff_ack_timeout(),
                offer_ttl: config.offer_ttl(),
            },
        ));
        let tracker = Arc::new(SessionTracker::new(config.session_linger()));
        let multiplexor = Arc::new(Multiplexor::new(
            routes.clone(),
            registry.clone(),
            tracker.clone(),
            MultiplexorConfig::from_config(&config),
        ));

        info!("Issuer key id: {}", issuer.key_id());

        Ok(Self {
            config,
            registry,
            routes,
            resolver,
            peers,
            issuer,
            dial,
            handoff,
            tracker,
            multiplexor,
            running: Arc::new(RwLock::new(false)),
            started_at: Timestamp::now(),
        })
    }

    /// Loads the documents, binds the public endpoints and starts the
    /// maintenance tasks. Returns the bound SNI addresses.
    pub async fn start(&self) -> Result<Vec<SocketAddr>, RuntimeError> {
        info!("Starting hostlink runtime...");
        *self.running.write().await = true;

        let report = self.reload()?;
        info!(
            "Loaded policy v{} ({} identities), routes v{} ({} routes), {} services",
            report.policy_version,
            report.identities,
            report.routes_version,
            report.routes,
            report.services
        );

        let mut bound = Vec::new();
        for addr in &self.config.sni_listen {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| RuntimeError::Bind { addr: *addr, source })?;
            let local = listener.local_addr().map_err(|source| RuntimeError::Bind {
                addr: *addr,
                source,
            })?;
            bound.push(local);

            let multiplexor = self.multiplexor.clone();
            tokio::spawn(async move {
                if let Err(e) = multiplexor.serve(listener).await {
                    error!("SNI listener {} failed: {}", local, e);
                }
            });
        }

        self.start_background_tasks();
        info!("Runtime started");
        Ok(bound)
    }

    pub async fn stop(&self) {
        info!("Stopping hostlink runtime...");
        *self.running.write().await = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Re-reads the policy, routing and service documents. Nothing is
    /// swapped unless all three parse. A missing file keeps what is loaded.
    pub fn reload(&self) -> Result<ReloadReport, RuntimeError> {
        let policy = if present(&self.config.policy_file) {
            PolicySnapshot::from_file(&self.config.policy_file)?
        } else {
            self.registry.snapshot().as_ref().clone()
        };
        let routes = if present(&self.config.routes_file) {
            RouteTable::from_file(&self.config.routes_file)?
        } else {
            self.routes.snapshot().as_ref().clone()
        };
        let services = if present(&self.config.services_file) {
            ServiceTable::from_file(&self.config.services_file)?
        } else {
            self.resolver.snapshot().as_ref().clone()
        };

        // Version checks happen before anything is swapped.
        let routes_version = self.routes.version();
        if routes.version < routes_version {
            return Err(RouteError::StaleVersion {
                current: routes_version,
                offered: routes.version,
            }
            .into());
        }

        self.registry.replace(policy)?;
        let report = ReloadReport {
            policy_version: self.registry.version(),
            identities: self.registry.snapshot().identities.len(),
            routes_version: routes.version,
            routes: routes.routes.len(),
            services: services.services.len(),
        };
        self.routes.replace(routes)?;
        self.resolver.replace(services);
        self.peers.replace(self.config.peers.clone());

        Ok(report)
    }

    fn start_background_tasks(&self) {
        let running = self.running.clone();
        let issuer = self.issuer.clone();

        // Drop expired and revoked credentials
        tokio::spawn(async move {
            while *running.read().await {
                tokio::time::sleep(Duration::from_secs(60)).await;
                let pruned = issuer.prune().await;
                if pruned > 0 {
                    debug!("Pruned {} credentials", pruned);
                }
            }
        });

        let running = self.running.clone();
        let handoff = self.handoff.clone();

        // Abandon offers nobody adopted
        tokio::spawn(async move {
            while *running.read().await {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let expired = handoff.reap_expired().await;
                if expired > 0 {
                    warn!("{} handoff offers expired", expired);
                }
            }
        });

        let running = self.running.clone();
        let tracker = self.tracker.clone();

        // Forget finished SNI sessions
        tokio::spawn(async move {
            while *running.read().await {
                tokio::time::sleep(Duration::from_secs(10)).await;
                tracker.cleanup().await;
            }
        });
    }

    pub async fn stats(&self) -> RuntimeStats {
        let policy = self.registry.snapshot();
        let routes = self.routes.snapshot();
        RuntimeStats {
            uptime_secs: self.started_at.elapsed().as_secs(),
            policy_version: policy.version,
            identities: policy.identities.len(),
            routes_version: routes.version,
            routes: routes.routes.len(),
            dial: self.dial.stats(),
            sessions: self.tracker.stats().await,
            credentials: self.issuer.stats().await,
            pending_handoffs: self.handoff.pending().await.len(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    pub fn issuer(&self) -> &Arc<CertificateIssuer> {
        &self.issuer
    }

    pub fn dial_broker(&self) -> &Arc<DialBroker> {
        &self.dial
    }

    pub fn handoff(&self) -> &Arc<HandoffCoordinator> {
        &self.handoff
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub fn multiplexor(&self) -> &Arc<Multiplexor> {
        &self.multiplexor
    }
}

fn present(path: &Path) -> bool {
    let exists = path.exists();
    if !exists {
        debug!("{} not found, keeping current contents", path.display());
    }
    exists
}
