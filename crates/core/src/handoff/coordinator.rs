use super::{ConnectionMeta, HandoffOutcome, HandoffToken};
use crate::broker::protocol::{Request, Response};
use crate::policy::PolicyRegistry;
use crate::transfer::FdChannel;
use hostlink_common::config::handoff;
use hostlink_common::error::Result;
use hostlink_common::{AppIdentity, BrokerError, Timestamp};
use serde::Serialize;
use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// How long `complete_handoff` waits for `AckAdoption`
    pub ack_timeout: Duration,

    /// Offers older than this are abandoned
    pub offer_ttl: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(handoff::ACK_TIMEOUT_MS),
            offer_ttl: Duration::from_secs(handoff::OFFER_TTL_SECS),
        }
    }
}

/// Status API view of a pending offer
#[derive(Debug, Clone, Serialize)]
pub struct HandoffSummary {
    /// First characters of the token only
    pub token: String,
    pub old_identity: AppIdentity,
    pub connections: usize,
    pub classes: Vec<String>,
    pub created_at: Timestamp,
    pub age_secs: u64,
}

struct PendingOffer {
    old_identity: AppIdentity,
    connections: Vec<(ConnectionMeta, OwnedFd)>,
    created_at: Instant,
    created_ts: Timestamp,
}

struct OutcomeSlot {
    owner: AppIdentity,
    tx: watch::Sender<Option<HandoffOutcome>>,
    finished_at: Option<Instant>,
}

pub struct HandoffCoordinator {
    registry: Arc<PolicyRegistry>,
    config: HandoffConfig,
    offers: Mutex<HashMap<HandoffToken, PendingOffer>>,
    outcomes: Mutex<HashMap<HandoffToken, OutcomeSlot>>,
}

impl HandoffCoordinator {
    pub fn new(registry: Arc<PolicyRegistry>, config: HandoffConfig) -> Self {
        Self {
            registry,
            config,
            offers: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    /// Records an offer. Every class must be resumable for `old_identity`;
    /// otherwise nothing is retained and the descriptors are closed.
    pub async fn begin_handoff(
        &self,
        old_identity: &AppIdentity,
        connections: Vec<(ConnectionMeta, OwnedFd)>,
    ) -> Result<HandoffToken> {
        if connections.is_empty() {
            return Err(BrokerError::invalid("handoff offer carries no connections"));
        }
        if connections.len() > handoff::MAX_CONNECTIONS {
            return Err(BrokerError::invalid(format!(
                "handoff offer carries {} connections (max {})",
                connections.len(),
                handoff::MAX_CONNECTIONS
            )));
        }
        if !self.registry.contains(old_identity) {
            return Err(BrokerError::rejected("identity is not registered"));
        }

        let resumable = self.registry.resumable_classes(old_identity);
        if let Some((meta, _)) = connections
            .iter()
            .find(|(meta, _)| !resumable.contains(&meta.class))
        {
            return Err(BrokerError::rejected(format!(
                "connection class {} is not resumable",
                meta.class
            )));
        }

        let token = HandoffToken::generate();
        let count = connections.len();
        let (tx, _) = watch::channel(None);

        self.outcomes.lock().await.insert(
            token.clone(),
            OutcomeSlot {
                owner: old_identity.clone(),
                tx,
                finished_at: None,
            },
        );
        self.offers.lock().await.insert(
            token.clone(),
            PendingOffer {
                old_identity: old_identity.clone(),
                connections,
                created_at: Instant::now(),
                created_ts: Timestamp::now(),
            },
        );

        info!(
            "Handoff {} offered by {} with {} connections",
            token, old_identity, count
        );
        Ok(token)
    }

    /// Hands the offer's sockets to `new_identity` over `channel` and waits
    /// for the acknowledgement. The record is removed before anything is
    /// sent, so a token can be adopted at most once.
    pub async fn complete_handoff(
        &self,
        token: &HandoffToken,
        new_identity: &AppIdentity,
        channel: &mut FdChannel,
    ) -> Result<()> {
        let offer = {
            let mut offers = self.offers.lock().await;
            let status = offers.get(token).map(|offer| {
                (
                    offer.old_identity == *new_identity,
                    offer.created_at.elapsed() > self.config.offer_ttl,
                )
            });

            match status {
                None => return Err(BrokerError::rejected("unknown or already consumed token")),
                Some((false, _)) => {
                    warn!(
                        target: "audit",
                        "handoff adoption refused: token={} offered to another identity, requested by {}",
                        token, new_identity
                    );
                    return Err(BrokerError::rejected("token belongs to another identity"));
                }
                Some((true, true)) => {
                    offers.remove(token);
                    drop(offers);
                    self.finish(token, HandoffOutcome::Aborted).await;
                    return Err(BrokerError::rejected("offer expired"));
                }
                Some((true, false)) => {}
            }

            offers
                .remove(token)
                .ok_or_else(|| BrokerError::rejected("unknown or already consumed token"))?
        };

        let metas: Vec<ConnectionMeta> = offer.connections.iter().map(|(m, _)| m.clone()).collect();
        let fds: Vec<BorrowedFd<'_>> = offer.connections.iter().map(|(_, fd)| fd.as_fd()).collect();

        let adopted = Response::Adopted {
            token: token.clone(),
            connections: metas,
        };
        if let Err(e) = channel.send_with_fds(&adopted, &fds).await {
            self.finish(token, HandoffOutcome::Aborted).await;
            return Err(e.into());
        }
        drop(fds);
        // Our duplicates are no longer needed once the new instance has them.
        drop(offer);

        match timeout(self.config.ack_timeout, channel.recv::<Request>()).await {
            Ok(Ok(Some((Request::AckAdoption { token: acked }, _)))) if acked == *token => {
                self.finish(token, HandoffOutcome::Committed).await;
                channel
                    .send(&Response::Acknowledged {
                        token: token.clone(),
                    })
                    .await?;
                Ok(())
            }
            Ok(Ok(Some((other, _)))) => {
                self.finish(token, HandoffOutcome::Aborted).await;
                Err(BrokerError::rejected(format!(
                    "expected AckAdoption, got {}",
                    other.name()
                )))
            }
            Ok(Ok(None)) => {
                self.finish(token, HandoffOutcome::Aborted).await;
                Err(BrokerError::transport("channel closed before AckAdoption"))
            }
            Ok(Err(e)) => {
                self.finish(token, HandoffOutcome::Aborted).await;
                Err(e.into())
            }
            Err(_) => {
                self.finish(token, HandoffOutcome::Aborted).await;
                Err(BrokerError::HandoffTimeout)
            }
        }
    }

    /// Waits for the outcome of an offer made by `identity`.
    pub async fn await_handoff(
        &self,
        identity: &AppIdentity,
        token: &HandoffToken,
    ) -> Result<HandoffOutcome> {
        let mut rx = {
            let outcomes = self.outcomes.lock().await;
            let slot = outcomes
                .get(token)
                .ok_or_else(|| BrokerError::rejected("unknown token"))?;
            if slot.owner != *identity {
                return Err(BrokerError::rejected("token belongs to another identity"));
            }
            slot.tx.subscribe()
        };

        loop {
            if let Some(outcome) = *rx.borrow_and_update() {
                return Ok(outcome);
            }
            if rx.changed().await.is_err() {
                // Slot dropped without a decision
                return Ok(HandoffOutcome::Aborted);
            }
        }
    }

    /// Abandons offers older than `offer_ttl` and forgets decided outcomes
    /// after the same window. Returns the number of abandoned offers.
    pub async fn reap_expired(&self) -> usize {
        let ttl = self.config.offer_ttl;
        let expired: Vec<HandoffToken> = {
            let mut offers = self.offers.lock().await;
            let expired: Vec<HandoffToken> = offers
                .iter()
                .filter(|(_, offer)| offer.created_at.elapsed() > ttl)
                .map(|(token, _)| token.clone())
                .collect();
            for token in &expired {
                offers.remove(token);
            }
            expired
        };

        for token in &expired {
            info!("Handoff {} expired before adoption", token);
            self.finish(token, HandoffOutcome::Aborted).await;
        }

        self.outcomes.lock().await.retain(|_, slot| match slot.finished_at {
            Some(at) => at.elapsed() <= ttl,
            None => true,
        });

        expired.len()
    }

    pub async fn pending(&self) -> Vec<HandoffSummary> {
        let offers = self.offers.lock().await;
        let mut summaries: Vec<HandoffSummary> = offers
            .iter()
            .map(|(token, offer)| HandoffSummary {
                token: token.to_string(),
                old_identity: offer.old_identity.clone(),
                connections: offer.connections.len(),
                classes: offer
                    .connections
                    .iter()
                    .map(|(meta, _)| meta.class.clone())
                    .collect(),
                created_at: offer.created_ts,
                age_secs: offer.created_at.elapsed().as_secs(),
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    async fn finish(&self, token: &HandoffToken, outcome: HandoffOutcome) {
        let mut outcomes = self.outcomes.lock().await;
        if let Some(slot) = outcomes.get_mut(token) {
            if slot.tx.borrow().is_none() {
                slot.tx.send_replace(Some(outcome));
                slot.finished_at = Some(Instant::now());
                info!("Handoff {} finished: {:?}", token, outcome);
            } else {
                debug!("Handoff {} already decided", token);
            }
        }
    }
}
