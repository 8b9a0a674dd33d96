/// Server name to backend routing table
///
/// Entries are exact names or `*.suffix` wildcards. An exact entry always
/// wins; otherwise the most specific wildcard does.

use arc_swap::ArcSwap;
use hostlink_common::{AppIdentity, NetworkLocation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendLocation {
    /// Donate the client socket over this Unix path
    Local(PathBuf),
    /// Relay bytes to this location
    Remote(NetworkLocation),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    /// Identity whose inbound policy admits the client
    pub owner: AppIdentity,

    pub location: BackendLocation,

    /// Prefix relayed streams with a PROXY protocol v1 header
    #[serde(default)]
    pub proxy_header: bool,
}

impl Backend {
    pub fn local(owner: AppIdentity, path: impl Into<PathBuf>) -> Self {
        Self {
            owner,
            location: BackendLocation::Local(path.into()),
            proxy_header: false,
        }
    }

    pub fn remote(owner: AppIdentity, location: NetworkLocation) -> Self {
        Self {
            owner,
            location: BackendLocation::Remote(location),
            proxy_header: false,
        }
    }

    pub fn with_proxy_header(mut self) -> Self {
        self.proxy_header = true;
        self
    }
}

/// Routing document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteTable {
    pub version: u64,
    pub routes: BTreeMap<String, Backend>,
}

impl RouteTable {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            routes: BTreeMap::new(),
        }
    }

    pub fn with_route(mut self, server_name: &str, backend: Backend) -> Self {
        self.routes.insert(normalize(server_name), backend);
        self
    }

    pub fn from_toml(contents: &str) -> Result<Self, RouteError> {
        let mut table: RouteTable =
            toml::from_str(contents).map_err(|e| RouteError::Parse(e.to_string()))?;
        table.routes = table
            .routes
            .into_iter()
            .map(|(name, backend)| (normalize(&name), backend))
            .collect();
        Ok(table)
    }

    pub fn from_file(path: &Path) -> Result<Self, RouteError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RouteError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    pub fn lookup(&self, server_name: &str) -> Option<&Backend> {
        let name = normalize(server_name);
        if let Some(backend) = self.routes.get(&name) {
            return Some(backend);
        }

        let mut rest = name.as_str();
        while let Some((_, parent)) = rest.split_once('.') {
            if let Some(backend) = self.routes.get(&format!("*.{}", parent)) {
                return Some(backend);
            }
            rest = parent;
        }
        None
    }
}

fn normalize(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}

/// Routing document errors
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Failed to read routes: {0}")]
    Read(String),

    #[error("Failed to parse routes: {0}")]
    Parse(String),

    #[error("Routes version {offered} is older than the active version {current}")]
    StaleVersion { current: u64, offered: u64 },
}

/// Atomically swapped routing table
#[derive(Debug, Default)]
pub struct RoutingTable {
    current: ArcSwap<RouteTable>,
}

impl RoutingTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    pub fn lookup(&self, server_name: &str) -> Option<Backend> {
        self.current.load().lookup(server_name).cloned()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Swaps in `table` unless it is older than the active one.
    pub fn replace(&self, table: RouteTable) -> Result<(), RouteError> {
        let current = self.version();
        if table.version < current {
            return Err(RouteError::StaleVersion {
                current,
                offered: table.version,
            });
        }

        info!(
            "Routing table updated: version {} -> {}, {} routes",
            current,
            table.version,
            table.routes.len()
        );
        self.current.store(Arc::new(table));
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> AppIdentity {
        "web".parse().unwrap()
    }

    #[test]
    fn test_exact_beats_wildcard() {
        let table = RouteTable::new(1)
            .with_route("*.example.com", Backend::local(owner(), "/run/wild.sock"))
            .with_route("api.example.com", Backend::local(owner(), "/run/api.sock"));

        assert_eq!(
            table.lookup("API.example.com.").unwrap().location,
            BackendLocation::Local("/run/api.sock".into())
        );
        assert_eq!(
            table.lookup("www.example.com").unwrap().location,
            BackendLocation::Local("/run/wild.sock".into())
        );
        assert!(table.lookup("example.com").is_none());
        assert!(table.lookup("example.org").is_none());
    }

    #[test]
    fn test_most_specific_wildcard() {
        let table = RouteTable::new(1)
            .with_route("*.example.com", Backend::local(owner(), "/run/outer.sock"))
            .with_route("*.eu.example.com", Backend::local(owner(), "/run/eu.sock"));

        assert_eq!(
            table.lookup("a.eu.example.com").unwrap().location,
            BackendLocation::Local("/run/eu.sock".into())
        );
        assert_eq!(
            table.lookup("a.us.example.com").unwrap().location,
            BackendLocation::Local("/run/outer.sock".into())
        );
    }

    #[test]
    fn test_route_table_from_toml() {
        let table = RouteTable::from_toml(
            r#"
            version = 2

            [routes."Shop.Example.com"]
            owner = "shop"
            location = { local = "/run/shop/inbound.sock" }

            [routes."*.api.example.com"]
            owner = "api"
            location = { remote = "10.0.0.8:8443" }
            proxy_header = true
            "#,
        )
        .unwrap();

        assert_eq!(table.version, 2);
        let shop = table.lookup("shop.example.com").unwrap();
        assert_eq!(shop.owner, "shop".parse::<AppIdentity>().unwrap());
        assert!(!shop.proxy_header);

        let api = table.lookup("v1.api.example.com").unwrap();
        assert!(api.proxy_header);
        assert_eq!(
            api.location,
            BackendLocation::Remote("10.0.0.8:8443".parse().unwrap())
        );
    }

    #[test]
    fn test_routing_table_swap() {
        let routing = RoutingTable::new(
            RouteTable::new(1).with_route("a.example", Backend::local(owner(), "/run/a.sock")),
        );
        assert!(routing.lookup("a.example").is_some());

        routing.replace(RouteTable::new(2)).unwrap();
        assert!(routing.lookup("a.example").is_none());
        assert_eq!(routing.snapshot().version, 2);
    }

    #[test]
    fn test_older_table_is_refused() {
        let routing = RoutingTable::new(
            RouteTable::new(5).with_route("a.example", Backend::local(owner(), "/run/a.sock")),
        );

        assert!(matches!(
            routing.replace(RouteTable::new(4)),
            Err(RouteError::StaleVersion {
                current: 5,
                offered: 4
            })
        ));
        assert!(routing.lookup("a.example").is_some());

        // Same version is a plain reload.
        routing.replace(RouteTable::new(5)).unwrap();
        assert!(routing.lookup("a.example").is_none());
    }

    #[test]
    fn test_route_document_errors() {
        assert!(matches!(
            RouteTable::from_toml("routes = 5\n"),
            Err(RouteError::Parse(_))
        ));
        assert!(matches!(
            RouteTable::from_file(Path::new("/nonexistent/routes.toml")),
            Err(RouteError::Read(_))
        ));
    }
}
