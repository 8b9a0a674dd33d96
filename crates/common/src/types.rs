use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timestamp in Unix epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let duration = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_secs())
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_secs(Self::now().0.saturating_sub(self.0))
    }
}

/// Where a service can be reached
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NetworkLocation {
    /// A Unix stream socket on this host
    Unix(PathBuf),
    /// A TCP socket address
    Tcp(SocketAddr),
    /// A name resolved at connect time
    Hostname(String, u16),
}

impl NetworkLocation {
    /// Only Unix sockets are guaranteed to stay on this machine.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Unix(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid network location {0:?}")]
pub struct InvalidLocation(pub String);

impl FromStr for NetworkLocation {
    type Err = InvalidLocation;

    /// Accepts `unix:/path`, `dns:host:port`, a socket address, a bare
    /// absolute path, or `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(InvalidLocation(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let (name, force_dns) = match s.strip_prefix("dns:") {
            Some(rest) => (rest, true),
            None => (s, false),
        };

        if !force_dns {
            if let Ok(addr) = name.parse::<SocketAddr>() {
                return Ok(Self::Tcp(addr));
            }
            if name.starts_with('/') {
                return Ok(Self::Unix(PathBuf::from(name)));
            }
        }

        let (host, port) = name
            .rsplit_once(':')
            .ok_or_else(|| InvalidLocation(s.to_string()))?;
        let port: u16 = port.parse().map_err(|_| InvalidLocation(s.to_string()))?;
        if host.is_empty() || port == 0 || host.contains(char::is_whitespace) {
            return Err(InvalidLocation(s.to_string()));
        }

        Ok(Self::Hostname(host.to_string(), port))
    }
}

impl TryFrom<String> for NetworkLocation {
    type Error = InvalidLocation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NetworkLocation> for String {
    fn from(value: NetworkLocation) -> Self {
        value.to_string()
    }
}

impl fmt::Display for NetworkLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "{}", addr),
            Self::Hostname(host, port) => write!(f, "dns:{}:{}", host, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locations() {
        assert_eq!(
            "unix:/run/db.sock".parse::<NetworkLocation>().unwrap(),
            NetworkLocation::Unix(PathBuf::from("/run/db.sock"))
        );
        assert_eq!(
            "/run/db.sock".parse::<NetworkLocation>().unwrap(),
            NetworkLocation::Unix(PathBuf::from("/run/db.sock"))
        );
        assert_eq!(
            "10.0.0.5:5432".parse::<NetworkLocation>().unwrap(),
            NetworkLocation::Tcp("10.0.0.5:5432".parse().unwrap())
        );
        assert_eq!(
            "db.internal:5432".parse::<NetworkLocation>().unwrap(),
            NetworkLocation::Hostname("db.internal".into(), 5432)
        );
        assert_eq!(
            "dns:127.0.0.1:80".parse::<NetworkLocation>().unwrap(),
            NetworkLocation::Hostname("127.0.0.1".into(), 80)
        );
    }

    #[test]
    fn test_rejects_bad_locations() {
        assert!("unix:".parse::<NetworkLocation>().is_err());
        assert!("db.internal".parse::<NetworkLocation>().is_err());
        assert!("db.internal:0".parse::<NetworkLocation>().is_err());
        assert!("db.internal:http".parse::<NetworkLocation>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for raw in ["unix:/run/a.sock", "[::1]:443", "dns:api.example.com:443"] {
            let location: NetworkLocation = raw.parse().unwrap();
            assert_eq!(location.to_string().parse::<NetworkLocation>().unwrap(), location);
        }
    }

    #[test]
    fn test_only_unix_is_local() {
        assert!(NetworkLocation::Unix("/a".into()).is_local());
        assert!(!NetworkLocation::Tcp("127.0.0.1:1".parse().unwrap()).is_local());
    }

    #[test]
    fn test_timestamp_elapsed() {
        let ts = Timestamp::now();
        assert!(ts.elapsed() < Duration::from_secs(2));
        assert_eq!(Timestamp::from_secs(10).as_secs(), 10);
    }
}
