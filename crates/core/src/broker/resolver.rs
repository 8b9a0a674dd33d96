/// Service and peer lookup
///
/// Both tables are snapshots swapped whole on reload.

use arc_swap::ArcSwap;
use hostlink_common::NetworkLocation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Resolves internal service names to candidate locations.
pub trait ServiceResolver: Send + Sync {
    /// Candidate locations in preference order. Empty when unknown.
    fn resolve(&self, service: &str) -> Vec<NetworkLocation>;
}

/// Service table document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceTable {
    pub services: BTreeMap<String, Vec<NetworkLocation>>,
}

impl ServiceTable {
    pub fn with_service(mut self, name: impl Into<String>, locations: Vec<NetworkLocation>) -> Self {
        self.services.insert(name.into(), locations);
        self
    }

    pub fn from_toml(contents: &str) -> Result<Self, ServiceError> {
        toml::from_str(contents).map_err(|e| ServiceError::Parse(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ServiceError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }
}

/// Service table document errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to read services: {0}")]
    Read(String),

    #[error("Failed to parse services: {0}")]
    Parse(String),
}

/// Resolver backed by a static table the daemon reloads
#[derive(Debug)]
pub struct StaticResolver {
    table: ArcSwap<ServiceTable>,
}

impl StaticResolver {
    pub fn new(table: ServiceTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    pub fn replace(&self, table: ServiceTable) {
        info!("Service table updated: {} services", table.services.len());
        self.table.store(Arc::new(table));
    }

    pub fn snapshot(&self) -> Arc<ServiceTable> {
        self.table.load_full()
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new(ServiceTable::default())
    }
}

impl ServiceResolver for StaticResolver {
    fn resolve(&self, service: &str) -> Vec<NetworkLocation> {
        self.table
            .load()
            .services
            .get(service)
            .cloned()
            .unwrap_or_default()
    }
}

/// Same-machine peers and the Unix paths they listen on
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: ArcSwap<BTreeMap<String, PathBuf>>,
}

impl PeerDirectory {
    pub fn new(peers: BTreeMap<String, PathBuf>) -> Self {
        Self {
            peers: ArcSwap::from_pointee(peers),
        }
    }

    pub fn lookup(&self, service: &str) -> Option<PathBuf> {
        self.peers.load().get(service).cloned()
    }

    pub fn replace(&self, peers: BTreeMap<String, PathBuf>) {
        self.peers.store(Arc::new(peers));
    }

    pub fn snapshot(&self) -> Arc<BTreeMap<String, PathBuf>> {
        self.peers.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver() {
        let resolver = StaticResolver::new(ServiceTable::default().with_service(
            "db",
            vec!["unix:/run/db.sock".parse().unwrap(), "10.0.0.5:5432".parse().unwrap()],
        ));

        assert_eq!(resolver.resolve("db").len(), 2);
        assert!(resolver.resolve("cache").is_empty());

        resolver.replace(ServiceTable::default());
        assert!(resolver.resolve("db").is_empty());
    }

    #[test]
    fn test_service_table_from_toml() {
        let table = ServiceTable::from_toml(
            r#"
            [services]
            db = ["unix:/run/db.sock", "10.0.0.5:5432"]
            search = ["dns:search.internal:9200"]
            "#,
        )
        .unwrap();

        assert_eq!(
            table.services["search"],
            vec![NetworkLocation::Hostname("search.internal".into(), 9200)]
        );
        assert!(table.services["db"][0].is_local());
    }

    #[test]
    fn test_bad_location_fails_to_parse() {
        assert!(matches!(
            ServiceTable::from_toml("[services]\ndb = [\"nowhere\"]\n"),
            Err(ServiceError::Parse(_))
        ));
    }

    #[test]
    fn test_peer_directory() {
        let mut peers = BTreeMap::new();
        peers.insert("logger".to_string(), PathBuf::from("/run/logger.sock"));
        let directory = PeerDirectory::new(peers);

        assert_eq!(directory.lookup("logger"), Some(PathBuf::from("/run/logger.sock")));
        assert_eq!(directory.lookup("metrics"), None);
    }
}
