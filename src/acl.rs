//! CIDR allow/deny rules for endpoint ingress.

use ipnet::IpNet;
use std::net::IpAddr;

use crate::error::{Result, SluiceError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
}

impl Acl {
    pub fn parse(allow: &[String], deny: &[String]) -> Result<Self> {
        Ok(Self {
            allow: parse_all(allow)?,
            deny: parse_all(deny)?,
        })
    }

    /// Deny rules win; a non-empty allow list must match.
    pub fn allows(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        if self.deny.iter().any(|net| net.contains(&ip)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|net| net.contains(&ip))
    }

    pub fn is_open(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

fn parse_all(cidrs: &[String]) -> Result<Vec<IpNet>> {
    cidrs
        .iter()
        .map(|cidr| {
            cidr.trim()
                .parse::<IpNet>()
                .map_err(|_| SluiceError::InvalidCidr(cidr.clone()))
        })
        .collect()
}

// Dual-stack listeners report IPv4 peers as ::ffff:a.b.c.d.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(allow: &[&str], deny: &[&str]) -> Acl {
        let allow: Vec<String> = allow.iter().map(|s| s.to_string()).collect();
        let deny: Vec<String> = deny.iter().map(|s| s.to_string()).collect();
        Acl::parse(&allow, &deny).unwrap()
    }

    #[test]
    fn test_empty_acl_allows_everything() {
        let acl = acl(&[], &[]);
        assert!(acl.is_open());
        assert!(acl.allows("203.0.113.9".parse().unwrap()));
        assert!(acl.allows("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let acl = acl(&["0.0.0.0/0"], &["10.1.1.1/32"]);
        assert!(acl.allows("10.1.1.2".parse().unwrap()));
        assert!(!acl.allows("10.1.1.1".parse().unwrap()));
    }

    #[test]
    fn test_allow_list_must_match() {
        let acl = acl(&["192.168.0.0/16"], &[]);
        assert!(acl.allows("192.168.4.20".parse().unwrap()));
        assert!(!acl.allows("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_mapped_ipv4_matches_v4_rules() {
        let acl = acl(&[], &["127.0.0.0/8"]);
        assert!(!acl.allows("::ffff:127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_cidr() {
        let err = Acl::parse(&["10.0.0.0/33".to_string()], &[]).unwrap_err();
        assert!(matches!(err, SluiceError::InvalidCidr(c) if c == "10.0.0.0/33"));
    }
}
