/// Certificate issuance service
///
/// One cache slot per identity. A slot is an async mutex, so concurrent
/// `issue` calls for the same identity queue behind the one signing
/// operation in flight and then share its result. Different identities never
/// wait on each other.

use super::{CertificateSigner, CredentialError, RuntimeCertificate};
use crate::policy::PolicyRegistry;
use hostlink_common::config::credentials;
use hostlink_common::{AppIdentity, Timestamp};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

type Slot = Arc<Mutex<Option<RuntimeCertificate>>>;

/// Issuer configuration
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Lifetime of minted certificates
    pub validity: Duration,

    /// Re-issue when this close to `not_after`
    pub renew_margin: Duration,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            validity: Duration::from_secs(credentials::VALIDITY_SECS),
            renew_margin: Duration::from_secs(credentials::RENEW_MARGIN_SECS),
        }
    }
}

/// Issuer statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct IssuerStats {
    pub cached: usize,
    pub issued: u64,
    pub cache_hits: u64,
}

/// What the status API shows about a cached credential
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub subject: AppIdentity,
    pub serial: u64,
    pub not_after: Timestamp,
    pub issuer_key_id: String,
}

pub struct CertificateIssuer {
    registry: Arc<PolicyRegistry>,
    signer: Arc<dyn CertificateSigner>,
    config: IssuerConfig,
    slots: RwLock<HashMap<AppIdentity, Slot>>,
    next_serial: AtomicU64,
    issued: AtomicU64,
    cache_hits: AtomicU64,
}

impl CertificateIssuer {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        signer: Arc<dyn CertificateSigner>,
        config: IssuerConfig,
    ) -> Self {
        Self {
            registry,
            signer,
            config,
            slots: RwLock::new(HashMap::new()),
            next_serial: AtomicU64::new(rand::random::<u32>() as u64 + 1),
            issued: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    pub fn key_id(&self) -> String {
        self.signer.key_id()
    }

    /// Returns a valid credential for `identity`, minting one if the cached
    /// credential is missing or inside the renewal margin.
    pub async fn issue(
        &self,
        identity: &AppIdentity,
    ) -> Result<RuntimeCertificate, CredentialError> {
        if !self.registry.contains(identity) {
            return Err(CredentialError::NotRegistered(identity.clone()));
        }

        let slot = self.slot(identity).await;
        let mut cached = slot.lock().await;

        if let Some(cert) = cached.as_ref() {
            let now = SystemTime::now();
            if cert.is_valid_at(now) && !cert.needs_renewal(now, self.config.renew_margin) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cert.clone());
            }
        }

        let cert = self.mint(identity).await?;
        *cached = Some(cert.clone());
        Ok(cert)
    }

    /// Checks signature, validity window and that the subject is still
    /// registered.
    pub fn verify(&self, cert: &RuntimeCertificate) -> Result<(), CredentialError> {
        cert.verify_signature(self.signer.as_ref())?;
        cert.check_validity(SystemTime::now())?;
        if !self.registry.contains(&cert.subject) {
            return Err(CredentialError::NotRegistered(cert.subject.clone()));
        }
        Ok(())
    }

    /// Drops expired credentials and identities no longer registered.
    /// Slots another caller still holds are left alone, so a pending
    /// `issue` never ends up signing into a slot that left the table.
    pub async fn prune(&self) -> usize {
        let now = SystemTime::now();
        let mut slots = self.slots.write().await;
        let before = slots.len();

        slots.retain(|identity, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            if !self.registry.contains(identity) {
                return false;
            }
            match slot.try_lock() {
                Ok(cached) => cached.as_ref().map_or(false, |c| c.is_valid_at(now)),
                Err(_) => true,
            }
        });

        let removed = before - slots.len();
        if removed > 0 {
            info!("Pruned {} cached credentials", removed);
        }
        removed
    }

    pub async fn stats(&self) -> IssuerStats {
        IssuerStats {
            cached: self.slots.read().await.len(),
            issued: self.issued.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    pub async fn cached_credentials(&self) -> Vec<CredentialSummary> {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Ok(cached) = slot.try_lock() {
                if let Some(cert) = cached.as_ref() {
                    summaries.push(CredentialSummary {
                        subject: cert.subject.clone(),
                        serial: cert.serial,
                        not_after: Timestamp::from_system_time(cert.not_after),
                        issuer_key_id: cert.issuer_key_id.clone(),
                    });
                }
            }
        }
        summaries.sort_by(|a, b| a.subject.cmp(&b.subject));
        summaries
    }

    async fn slot(&self, identity: &AppIdentity) -> Slot {
        if let Some(slot) = self.slots.read().await.get(identity) {
            return slot.clone();
        }

        self.slots
            .write()
            .await
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    async fn mint(&self, identity: &AppIdentity) -> Result<RuntimeCertificate, CredentialError> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let mut cert = RuntimeCertificate::new(
            identity.clone(),
            serial,
            SystemTime::now(),
            self.config.validity,
            self.signer.key_id(),
        );

        let signer = self.signer.clone();
        cert = tokio::task::spawn_blocking(move || {
            cert.sign(signer.as_ref())?;
            Ok::<_, CredentialError>(cert)
        })
        .await
        .map_err(|e| CredentialError::Signing(e.to_string()))??;

        self.issued.fetch_add(1, Ordering::Relaxed);
        debug!("Issued credential {} for {}", serial, identity);
        Ok(cert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Ed25519Signer;
    use crate::policy::{PolicyEntry, PolicySnapshot};
    use std::sync::atomic::AtomicUsize;

    fn id(name: &str) -> AppIdentity {
        name.parse().unwrap()
    }

    fn registry() -> Arc<PolicyRegistry> {
        Arc::new(PolicyRegistry::new(
            PolicySnapshot::new(1).with_entry(id("billing"), PolicyEntry::default()),
        ))
    }

    /// Counts signing calls and sleeps to widen the race window.
    struct SlowSigner {
        inner: Ed25519Signer,
        calls: AtomicUsize,
    }

    impl CertificateSigner for SlowSigner {
        fn key_id(&self) -> String {
            self.inner.key_id()
        }

        fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CredentialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.inner.sign(data)
        }

        fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
            self.inner.verify(data, signature)
        }
    }

    #[tokio::test]
    async fn test_unregistered_identity() {
        let issuer = CertificateIssuer::new(
            registry(),
            Arc::new(Ed25519Signer::generate()),
            IssuerConfig::default(),
        );
        let err = issuer.issue(&id("ghost")).await.unwrap_err();
        assert!(matches!(err, CredentialError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn test_issue_caches_until_renewal() {
        let issuer = CertificateIssuer::new(
            registry(),
            Arc::new(Ed25519Signer::generate()),
            IssuerConfig::default(),
        );

        let first = issuer.issue(&id("billing")).await.unwrap();
        let second = issuer.issue(&id("billing")).await.unwrap();
        assert_eq!(first, second);
        assert!(issuer.verify(&first).is_ok());

        let stats = issuer.stats().await;
        assert_eq!(stats.issued, 1);
        assert_eq!(stats.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_reissues_inside_margin() {
        let issuer = CertificateIssuer::new(
            registry(),
            Arc::new(Ed25519Signer::generate()),
            IssuerConfig {
                validity: Duration::from_secs(60),
                renew_margin: Duration::from_secs(60),
            },
        );

        let first = issuer.issue(&id("billing")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = issuer.issue(&id("billing")).await.unwrap();
        assert_ne!(first.serial, second.serial);
        assert!(second.not_before >= first.not_before);
        assert!(second.not_after > first.not_after);
    }

    #[tokio::test]
    async fn test_prune_keeps_slot_held_by_issue() {
        let issuer = CertificateIssuer::new(
            registry(),
            Arc::new(Ed25519Signer::generate()),
            IssuerConfig::default(),
        );

        // An `issue` that has fetched its slot but not yet locked it.
        let held = issuer.slot(&id("billing")).await;
        assert_eq!(issuer.prune().await, 0);
        assert!(Arc::ptr_eq(&held, &issuer.slot(&id("billing")).await));

        drop(held);
        assert_eq!(issuer.prune().await, 1);
        assert_eq!(issuer.stats().await.cached, 0);
    }

    #[tokio::test]
    async fn test_single_flight_per_identity() {
        let signer = Arc::new(SlowSigner {
            inner: Ed25519Signer::generate(),
            calls: AtomicUsize::new(0),
        });
        let issuer = Arc::new(CertificateIssuer::new(
            registry(),
            signer.clone(),
            IssuerConfig::default(),
        ));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let issuer = issuer.clone();
            tasks.push(tokio::spawn(async move {
                issuer.issue(&"billing".parse().unwrap()).await
            }));
        }

        let mut serials = Vec::new();
        for task in tasks {
            serials.push(task.await.unwrap().unwrap().serial);
        }

        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
        assert!(serials.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_verify_rejects_deregistered_subject() {
        let registry = registry();
        let issuer = CertificateIssuer::new(
            registry.clone(),
            Arc::new(Ed25519Signer::generate()),
            IssuerConfig::default(),
        );

        let cert = issuer.issue(&id("billing")).await.unwrap();
        registry.replace(PolicySnapshot::new(2)).unwrap();

        assert!(matches!(
            issuer.verify(&cert),
            Err(CredentialError::NotRegistered(_))
        ));
        assert_eq!(issuer.prune().await, 1);
        assert_eq!(issuer.stats().await.cached, 0);
    }

    #[tokio::test]
    async fn test_cached_credentials_summary() {
        let issuer = CertificateIssuer::new(
            registry(),
            Arc::new(Ed25519Signer::generate()),
            IssuerConfig::default(),
        );
        let cert = issuer.issue(&id("billing")).await.unwrap();

        let summaries = issuer.cached_credentials().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].serial, cert.serial);
        assert_eq!(summaries[0].issuer_key_id, issuer.key_id());
    }
}
