/// PROXY protocol v1 header for relayed streams

use std::net::{IpAddr, SocketAddr};

/// Renders the text header announcing `client` connecting to `local`.
///
/// Mixed address families are announced as TCP6 with v4-mapped addresses.
pub fn v1(client: SocketAddr, local: SocketAddr) -> String {
    match (client.ip(), local.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            src,
            dst,
            client.port(),
            local.port()
        ),
        (src, dst) => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            as_v6(src),
            as_v6(dst),
            client.port(),
            local.port()
        ),
    }
}

fn as_v6(ip: IpAddr) -> std::net::Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp4_header() {
        let header = v1(
            "203.0.113.7:51000".parse().unwrap(),
            "192.0.2.1:443".parse().unwrap(),
        );
        assert_eq!(header, "PROXY TCP4 203.0.113.7 192.0.2.1 51000 443\r\n");
    }

    #[test]
    fn test_tcp6_and_mixed_families() {
        let header = v1(
            "[2001:db8::1]:40000".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        );
        assert_eq!(header, "PROXY TCP6 2001:db8::1 2001:db8::2 40000 443\r\n");

        let mixed = v1(
            "203.0.113.7:51000".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        );
        assert_eq!(
            mixed,
            "PROXY TCP6 ::ffff:203.0.113.7 2001:db8::2 51000 443\r\n"
        );
    }
}
