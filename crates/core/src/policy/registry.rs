/// Policy registry
///
/// `authorize` is a pure function of the current snapshot. Reloads build a
/// new `PolicySnapshot` off to the side and `replace` publishes it with a
/// single pointer swap, so concurrent readers never observe a half-applied
/// policy.

use super::pattern::Rule;
use arc_swap::ArcSwap;
use hostlink_common::{AppIdentity, Destination, Direction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Policy for one identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyEntry {
    /// Destinations this identity may dial
    pub outbound: Vec<Rule>,

    /// Sources that may be routed to this identity
    pub inbound_from: Vec<Rule>,

    /// Connection classes eligible for live handoff
    pub resumable_classes: BTreeSet<String>,
}

impl PolicyEntry {
    pub fn allow_outbound(mut self, rule: impl Into<Rule>) -> Self {
        self.outbound.push(rule.into());
        self
    }

    pub fn allow_inbound(mut self, rule: impl Into<Rule>) -> Self {
        self.inbound_from.push(rule.into());
        self
    }

    pub fn resumable(mut self, class: impl Into<String>) -> Self {
        self.resumable_classes.insert(class.into());
        self
    }

    fn rules(&self, direction: Direction) -> &[Rule] {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound_from,
        }
    }
}

/// An immutable, complete view of policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySnapshot {
    /// Increases with every document the manifest loader writes
    pub version: u64,

    /// Shared egress used by `via_egress` rules
    #[serde(skip_serializing_if = "Option::is_none")]
    pub egress: Option<SocketAddr>,

    pub identities: BTreeMap<AppIdentity, PolicyEntry>,
}

impl PolicySnapshot {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    pub fn with_entry(mut self, identity: AppIdentity, entry: PolicyEntry) -> Self {
        self.identities.insert(identity, entry);
        self
    }

    pub fn with_egress(mut self, egress: SocketAddr) -> Self {
        self.egress = Some(egress);
        self
    }

    pub fn from_toml(contents: &str) -> Result<Self, PolicyError> {
        toml::from_str(contents).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PolicyError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    /// First rule of `identity` matching `destination` in `direction`.
    pub fn matching_rule(
        &self,
        identity: &AppIdentity,
        destination: &Destination,
        direction: Direction,
    ) -> Result<&Rule, DenyReason> {
        let entry = self
            .identities
            .get(identity)
            .ok_or(DenyReason::UnknownIdentity)?;

        entry
            .rules(direction)
            .iter()
            .find(|rule| rule.pattern.matches(destination))
            .ok_or(DenyReason::NoMatchingRule)
    }
}

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    UnknownIdentity,
    NoMatchingRule,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::UnknownIdentity => f.write_str("UnknownIdentity"),
            DenyReason::NoMatchingRule => f.write_str("NoMatchingRule"),
        }
    }
}

/// Policy errors
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Failed to read policy: {0}")]
    Read(String),

    #[error("Failed to parse policy: {0}")]
    Parse(String),

    #[error("Policy version {offered} is older than the active version {current}")]
    StaleVersion { current: u64, offered: u64 },

    #[error("Rule requires shared egress but none is configured")]
    EgressUnavailable,
}

/// Lock-free policy registry
pub struct PolicyRegistry {
    current: ArcSwap<PolicySnapshot>,
}

impl PolicyRegistry {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// A registry that denies everything until the first load.
    pub fn empty() -> Self {
        Self::new(PolicySnapshot::default())
    }

    pub fn authorize(
        &self,
        identity: &AppIdentity,
        destination: &Destination,
        direction: Direction,
    ) -> Decision {
        match self
            .current
            .load()
            .matching_rule(identity, destination, direction)
        {
            Ok(_) => Decision::Allow,
            Err(reason) => Decision::Deny(reason),
        }
    }

    /// Where an allowed outbound internet dial must be sent instead of
    /// connecting directly. `None` means dial the destination itself.
    pub fn egress_for(
        &self,
        identity: &AppIdentity,
        destination: &Destination,
    ) -> Result<Option<SocketAddr>, PolicyError> {
        let snapshot = self.current.load();
        match snapshot.matching_rule(identity, destination, Direction::Outbound) {
            Ok(rule) if rule.via_egress => snapshot
                .egress
                .map(Some)
                .ok_or(PolicyError::EgressUnavailable),
            _ => Ok(None),
        }
    }

    pub fn contains(&self, identity: &AppIdentity) -> bool {
        self.current.load().identities.contains_key(identity)
    }

    pub fn resumable_classes(&self, identity: &AppIdentity) -> BTreeSet<String> {
        self.current
            .load()
            .identities
            .get(identity)
            .map(|entry| entry.resumable_classes.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Publishes `snapshot`. Older versions are refused; re-publishing the
    /// active version is allowed so an unchanged document can be reloaded.
    pub fn replace(&self, snapshot: PolicySnapshot) -> Result<(), PolicyError> {
        let current = self.version();
        if snapshot.version < current {
            return Err(PolicyError::StaleVersion {
                current,
                offered: snapshot.version,
            });
        }

        info!(
            "Policy updated: version {} -> {}, {} identities",
            current,
            snapshot.version,
            snapshot.identities.len()
        );
        self.current.store(Arc::new(snapshot));
        Ok(())
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Pattern;

    fn id(name: &str) -> AppIdentity {
        name.parse().unwrap()
    }

    fn billing_snapshot(version: u64) -> PolicySnapshot {
        PolicySnapshot::new(version)
            .with_egress("10.0.0.254:3128".parse().unwrap())
            .with_entry(
                id("billing"),
                PolicyEntry::default()
                    .allow_outbound(Pattern::Internal {
                        service: "db".into(),
                    })
                    .allow_outbound(
                        Rule::new(Pattern::Host {
                            host: "api.stripe.com".into(),
                            port: Some(443),
                        })
                        .via_egress(),
                    )
                    .allow_inbound(Pattern::Public)
                    .resumable("websocket"),
            )
    }

    #[test]
    fn test_unknown_identity_denied() {
        let registry = PolicyRegistry::new(billing_snapshot(1));
        assert_eq!(
            registry.authorize(&id("ghost"), &Destination::internal("db"), Direction::Outbound),
            Decision::Deny(DenyReason::UnknownIdentity)
        );
    }

    #[test]
    fn test_empty_registry_denies() {
        let registry = PolicyRegistry::empty();
        assert!(!registry
            .authorize(&id("billing"), &Destination::internal("db"), Direction::Outbound)
            .is_allowed());
    }

    #[test]
    fn test_authorize_outbound_and_inbound() {
        let registry = PolicyRegistry::new(billing_snapshot(1));
        let billing = id("billing");

        assert!(registry
            .authorize(&billing, &Destination::internal("db"), Direction::Outbound)
            .is_allowed());
        assert_eq!(
            registry.authorize(&billing, &Destination::internal("cache"), Direction::Outbound),
            Decision::Deny(DenyReason::NoMatchingRule)
        );
        assert_eq!(
            registry.authorize(
                &billing,
                &Destination::internet("evil.example", 443),
                Direction::Outbound
            ),
            Decision::Deny(DenyReason::NoMatchingRule)
        );
        assert!(registry
            .authorize(
                &billing,
                &Destination::internet("203.0.113.9", 55000),
                Direction::Inbound
            )
            .is_allowed());
    }

    #[test]
    fn test_egress_for() {
        let registry = PolicyRegistry::new(billing_snapshot(1));
        let billing = id("billing");

        assert_eq!(
            registry
                .egress_for(&billing, &Destination::internet("api.stripe.com", 443))
                .unwrap(),
            Some("10.0.0.254:3128".parse().unwrap())
        );
        assert_eq!(
            registry
                .egress_for(&billing, &Destination::internal("db"))
                .unwrap(),
            None
        );

        let mut snapshot = billing_snapshot(2);
        snapshot.egress = None;
        registry.replace(snapshot).unwrap();
        assert!(matches!(
            registry.egress_for(&billing, &Destination::internet("api.stripe.com", 443)),
            Err(PolicyError::EgressUnavailable)
        ));
    }

    #[test]
    fn test_replace_swaps_and_refuses_stale() {
        let registry = PolicyRegistry::new(billing_snapshot(5));
        let old = registry.snapshot();

        registry.replace(PolicySnapshot::new(6)).unwrap();
        assert_eq!(registry.version(), 6);
        assert!(!registry.contains(&id("billing")));

        // Readers holding the old snapshot keep a consistent view.
        assert!(old.identities.contains_key(&id("billing")));

        assert!(matches!(
            registry.replace(billing_snapshot(4)),
            Err(PolicyError::StaleVersion { current: 6, offered: 4 })
        ));
        assert!(registry.replace(PolicySnapshot::new(6)).is_ok());
    }

    #[test]
    fn test_resumable_classes() {
        let registry = PolicyRegistry::new(billing_snapshot(1));
        assert!(registry
            .resumable_classes(&id("billing"))
            .contains("websocket"));
        assert!(registry.resumable_classes(&id("ghost")).is_empty());
    }

    #[test]
    fn test_snapshot_from_toml() {
        let snapshot = PolicySnapshot::from_toml(
            r#"
            version = 3
            egress = "10.0.0.254:3128"

            [identities.billing]
            outbound = [
                { kind = "internal", service = "db" },
                { kind = "domain_suffix", suffix = "stripe.com", port = 443, via_egress = true },
            ]
            inbound_from = [{ kind = "cidr", network = "198.51.100.0", prefix_len = 24 }]
            resumable_classes = ["websocket"]

            [identities.logger]
            "#,
        )
        .unwrap();

        assert_eq!(snapshot.version, 3);
        assert_eq!(snapshot.identities.len(), 2);
        let registry = PolicyRegistry::new(snapshot);
        assert!(registry
            .authorize(
                &id("billing"),
                &Destination::internet("198.51.100.7", 40000),
                Direction::Inbound
            )
            .is_allowed());
        assert!(registry.egress_for(
            &id("billing"),
            &Destination::internet("checkout.stripe.com", 443)
        )
        .unwrap()
        .is_some());
        assert!(!registry
            .authorize(&id("logger"), &Destination::internal("db"), Direction::Outbound)
            .is_allowed());
    }

    #[test]
    fn test_invalid_identity_in_document_fails() {
        let err = PolicySnapshot::from_toml("[identities.\"bad name\"]\n").unwrap_err();
        assert!(matches!(err, PolicyError::Parse(_)));
    }
}
