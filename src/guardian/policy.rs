//! SSRF dial policy

use crate::error::{GatewayError, Result};
use ipnetwork::IpNetwork;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tracing::debug;
use url::{Host, Url};

/// IANA special-use ranges refused by the default policy
pub const DEFAULT_BLOCKED_CIDRS: &[&str] = &[
    // IPv4
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
    // IPv6
    "::/128",
    "::1/128",
    "::ffff:0:0/96",
    "64:ff9b::/96",
    "64:ff9b:1::/48",
    "100::/64",
    "2001::/23",
    "2001:db8::/32",
    "2002::/16",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

/// Decides whether an outbound connection may be opened
#[derive(Debug, Clone)]
pub struct Policy {
    allow_loopback: bool,
    blocked: Vec<IpNetwork>,
}

impl Policy {
    /// Policy blocking every IANA special-use range, loopback included
    pub fn new() -> Self {
        let blocked = DEFAULT_BLOCKED_CIDRS
            .iter()
            .filter_map(|cidr| IpNetwork::from_str(cidr).ok())
            .collect();

        Self {
            allow_loopback: false,
            blocked,
        }
    }

    /// Policy with a caller supplied block list. An empty list permits everything.
    pub fn unsafe_policy<S: AsRef<str>>(cidrs: &[S]) -> Result<Self> {
        let mut blocked = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            let network = IpNetwork::from_str(cidr.as_ref()).map_err(|e| {
                GatewayError::config(format!("invalid CIDR block '{}': {}", cidr.as_ref(), e))
            })?;
            blocked.push(network);
        }

        Ok(Self {
            allow_loopback: false,
            blocked,
        })
    }

    /// Permit loopback addresses even when a blocked range covers them
    pub fn with_allow_loopback(mut self, allow: bool) -> Self {
        self.allow_loopback = allow;
        self
    }

    pub fn allows_loopback(&self) -> bool {
        self.allow_loopback
    }

    pub fn blocked_ranges(&self) -> &[IpNetwork] {
        &self.blocked
    }

    /// Decide whether `address` (a literal `ip:port`) may be dialed over `network`
    pub fn check(&self, network: &str, address: &str) -> Result<()> {
        let socket: SocketAddr = address.parse().map_err(|_| {
            GatewayError::bad_host(format!("{} address '{}' is not a literal ip:port", network, address))
        })?;

        self.check_ip(socket.ip())
    }

    /// Decide whether a resolved IP may be dialed
    pub fn check_ip(&self, ip: IpAddr) -> Result<()> {
        let ip = normalize(ip);

        if self.allow_loopback && ip.is_loopback() {
            return Ok(());
        }

        if let Some(range) = self.blocked.iter().find(|range| range.contains(ip)) {
            debug!(ip = %ip, range = %range, "guardian blocked dial");
            return Err(GatewayError::blocked_ip(format!("{} is in blocked range {}", ip, range)));
        }

        Ok(())
    }

    /// Check a URL whose host is a literal IP. Hostnames are checked at resolution time.
    pub fn check_url(&self, url: &Url) -> Result<()> {
        match url.host() {
            Some(Host::Ipv4(ip)) => self.check_ip(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => self.check_ip(IpAddr::V6(ip)),
            Some(Host::Domain(_)) => Ok(()),
            None => Err(GatewayError::bad_host(format!("url has no host: {}", url.scheme()))),
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new()
    }
}

/// IPv4-mapped IPv6 addresses are checked as their IPv4 form
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuardianErrorKind;

    fn kind(result: Result<()>) -> Option<GuardianErrorKind> {
        result.err().and_then(|e| e.guardian_kind())
    }

    #[test]
    fn test_default_policy_blocks_private_ranges() {
        let policy = Policy::new();
        for address in ["10.0.0.1:80", "172.16.0.1:80", "192.168.1.1:80", "127.0.0.1:80", "[::1]:80"] {
            assert_eq!(kind(policy.check("tcp", address)), Some(GuardianErrorKind::BlockedIp), "{}", address);
        }
    }

    #[test]
    fn test_default_policy_allows_public_addresses() {
        let policy = Policy::new();
        assert!(policy.check("tcp", "8.8.8.8:80").is_ok());
        assert!(policy.check("tcp", "1.1.1.1:443").is_ok());
        assert!(policy.check("tcp", "[::ffff:8.8.8.8]:80").is_ok());
    }

    #[test]
    fn test_non_literal_hosts_are_bad_hosts() {
        let policy = Policy::new();
        assert_eq!(kind(policy.check("tcp", "192.168.1.1")), Some(GuardianErrorKind::BadHost));
        assert_eq!(kind(policy.check("tcp", "localhost:80")), Some(GuardianErrorKind::BadHost));
    }

    #[test]
    fn test_ipv4_mapped_addresses_use_ipv4_rules() {
        let policy = Policy::new();
        for address in [
            "[::ffff:127.0.0.1]:80",
            "[::ffff:10.0.0.1]:80",
            "[::ffff:192.168.1.1]:80",
            "[::ffff:169.254.1.1]:80",
            "[::ffff:0.0.0.0]:80",
        ] {
            assert_eq!(kind(policy.check("tcp", address)), Some(GuardianErrorKind::BlockedIp), "{}", address);
        }

        let custom = Policy::unsafe_policy(&["192.168.1.1/32"]).unwrap();
        assert_eq!(
            kind(custom.check("tcp", "[::ffff:192.168.1.1]:443")),
            Some(GuardianErrorKind::BlockedIp)
        );
    }

    #[test]
    fn test_ipv6_variations_blocked() {
        let policy = Policy::new();
        for address in [
            "[0000:0000:0000:0000:0000:0000:0000:0001]:80",
            "[fe80::1]:80",
            "[fc00::1]:80",
            "[ff02::1]:80",
            "[::]:80",
            "[2001:db8::1]:80",
        ] {
            assert_eq!(kind(policy.check("tcp", address)), Some(GuardianErrorKind::BlockedIp), "{}", address);
        }
    }

    #[test]
    fn test_allow_loopback() {
        let policy = Policy::new().with_allow_loopback(true);
        assert!(policy.check("tcp", "127.0.0.1:8080").is_ok());
        assert!(policy.check("tcp", "[::1]:8080").is_ok());
        assert!(policy.check("tcp", "[::ffff:127.0.0.1]:8080").is_ok());
        assert!(policy.check("tcp", "10.1.2.3:80").is_err());
    }

    #[test]
    fn test_unsafe_policy_cidr_validation() {
        assert!(Policy::unsafe_policy(&["10.0.0.0/8", "192.168.0.0/16"]).is_ok());
        assert!(Policy::unsafe_policy::<&str>(&[]).is_ok());
        assert!(Policy::unsafe_policy(&["2001:db8::/32", "::1/128"]).is_ok());
        assert!(Policy::unsafe_policy(&["invalid-cidr"]).is_err());
        assert!(Policy::unsafe_policy(&["10.0.0.0/8", "invalid-cidr"]).is_err());

        let open = Policy::unsafe_policy::<&str>(&[]).unwrap();
        assert!(open.check("tcp", "10.0.0.1:80").is_ok());
    }

    #[test]
    fn test_check_url_literal_hosts() {
        let policy = Policy::new();
        assert!(policy.check_url(&Url::parse("http://192.168.1.1/x").unwrap()).is_err());
        assert!(policy.check_url(&Url::parse("http://[::ffff:127.0.0.1]:8080/").unwrap()).is_err());
        assert!(policy.check_url(&Url::parse("https://example.com/").unwrap()).is_ok());
    }
}
