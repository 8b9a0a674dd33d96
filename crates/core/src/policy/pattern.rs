/// Destination and source patterns used by policy rules

use hostlink_common::Destination;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// What a rule matches against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pattern {
    /// A platform service, by exact name
    Internal { service: String },

    /// A same-machine peer service, by exact name
    Peer { service: String },

    /// One internet host, optionally pinned to a port
    Host {
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },

    /// `*.suffix` and `suffix` itself
    DomainSuffix {
        suffix: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },

    /// An address range, for IP literal hosts
    Cidr { network: IpAddr, prefix_len: u8 },

    /// Any internet host
    Public,
}

impl Pattern {
    pub fn matches(&self, destination: &Destination) -> bool {
        match (self, destination) {
            (Pattern::Internal { service }, Destination::Internal(name)) => service == name,
            (Pattern::Peer { service }, Destination::SameMachinePeer(name)) => service == name,
            (Pattern::Host { host, port }, Destination::InternetHost(target, target_port)) => {
                port_matches(*port, *target_port) && normalize_host(host) == normalize_host(target)
            }
            (
                Pattern::DomainSuffix { suffix, port },
                Destination::InternetHost(target, target_port),
            ) => port_matches(*port, *target_port) && suffix_matches(suffix, target),
            (Pattern::Cidr { network, prefix_len }, Destination::InternetHost(target, _)) => {
                match target.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
                    Ok(addr) => cidr_contains(*network, *prefix_len, addr),
                    Err(_) => false,
                }
            }
            (Pattern::Public, Destination::InternetHost(..)) => true,
            _ => false,
        }
    }
}

/// A pattern plus how matching dials are delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(flatten)]
    pub pattern: Pattern,

    /// Deliver through the shared egress instead of dialing directly
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub via_egress: bool,
}

impl Rule {
    pub fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            via_egress: false,
        }
    }

    pub fn via_egress(mut self) -> Self {
        self.via_egress = true;
        self
    }
}

impl From<Pattern> for Rule {
    fn from(pattern: Pattern) -> Self {
        Self::new(pattern)
    }
}

fn port_matches(pattern: Option<u16>, port: u16) -> bool {
    pattern.map_or(true, |p| p == port)
}

/// Lowercases and drops one trailing dot.
fn normalize_host(host: &str) -> String {
    host.strip_suffix('.').unwrap_or(host).to_ascii_lowercase()
}

fn suffix_matches(suffix: &str, host: &str) -> bool {
    let suffix = normalize_host(suffix.trim_start_matches("*."));
    let host = normalize_host(host);
    if suffix.is_empty() {
        return false;
    }
    if host == suffix {
        return true;
    }
    host.len() > suffix.len()
        && host.ends_with(&suffix)
        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
}

fn cidr_contains(network: IpAddr, prefix_len: u8, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            if prefix_len > 32 {
                return false;
            }
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - prefix_len)
            };
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            if prefix_len > 128 {
                return false;
            }
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - prefix_len)
            };
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_service_match() {
        let pattern = Pattern::Internal {
            service: "db".into(),
        };
        assert!(pattern.matches(&Destination::internal("db")));
        assert!(!pattern.matches(&Destination::internal("db2")));
        assert!(!pattern.matches(&Destination::peer("db")));
    }

    #[test]
    fn test_host_match_ignores_case_and_trailing_dot() {
        let pattern = Pattern::Host {
            host: "API.Stripe.com".into(),
            port: Some(443),
        };
        assert!(pattern.matches(&Destination::internet("api.stripe.com.", 443)));
        assert!(!pattern.matches(&Destination::internet("api.stripe.com", 80)));
    }

    #[test]
    fn test_domain_suffix() {
        let pattern = Pattern::DomainSuffix {
            suffix: "*.example.com".into(),
            port: None,
        };
        assert!(pattern.matches(&Destination::internet("a.b.example.com", 443)));
        assert!(pattern.matches(&Destination::internet("example.com", 443)));
        assert!(!pattern.matches(&Destination::internet("badexample.com", 443)));
        assert!(!pattern.matches(&Destination::internal("example.com")));
    }

    #[test]
    fn test_cidr() {
        let pattern = Pattern::Cidr {
            network: "10.1.0.0".parse().unwrap(),
            prefix_len: 16,
        };
        assert!(pattern.matches(&Destination::internet("10.1.200.3", 5000)));
        assert!(!pattern.matches(&Destination::internet("10.2.0.1", 5000)));
        assert!(!pattern.matches(&Destination::internet("host.example", 5000)));

        let v6 = Pattern::Cidr {
            network: "fd00::".parse().unwrap(),
            prefix_len: 8,
        };
        assert!(v6.matches(&Destination::internet("fd12::1", 1)));
        assert!(!v6.matches(&Destination::internet("10.1.0.1", 1)));
    }

    #[test]
    fn test_public_only_matches_internet() {
        assert!(Pattern::Public.matches(&Destination::internet("1.2.3.4", 1)));
        assert!(!Pattern::Public.matches(&Destination::peer("logger")));
    }

    #[test]
    fn test_rule_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            rules: Vec<Rule>,
        }

        let doc: Doc = toml::from_str(
            r#"
            rules = [
                { kind = "host", host = "api.stripe.com", port = 443, via_egress = true },
                { kind = "internal", service = "db" },
                { kind = "public" },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(doc.rules.len(), 3);
        assert!(doc.rules[0].via_egress);
        assert_eq!(
            doc.rules[1],
            Rule::new(Pattern::Internal {
                service: "db".into()
            })
        );
        assert_eq!(doc.rules[2].pattern, Pattern::Public);
    }
}
