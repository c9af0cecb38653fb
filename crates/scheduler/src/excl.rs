use std::net::IpAddr;

use regex::Regex;

use sner_core::errors::{SnerError, SnerResult};
use sner_core::models::{Excl, ExclFamily};
use sner_core::netutils::CidrNet;

/// Aggregate exclusion matcher compiled from all excl rows. A target
/// matching any rule is forbidden.
pub struct ExclMatcher {
    networks: Vec<CidrNet>,
    regexes: Vec<Regex>,
}

impl ExclMatcher {
    pub fn new(excls: &[Excl]) -> SnerResult<Self> {
        let mut networks = Vec::new();
        let mut regexes = Vec::new();

        for excl in excls {
            match excl.family {
                ExclFamily::Network => networks.push(excl.value.parse()?),
                ExclFamily::Regex => regexes.push(
                    Regex::new(&excl.value)
                        .map_err(|err| SnerError::Parse(format!("invalid regex: {err}")))?,
                ),
            }
        }

        Ok(Self { networks, regexes })
    }

    /// True when the target is forbidden by any rule.
    pub fn matches(&self, target: &str) -> bool {
        if let Some(addr) = target_address(target) {
            if self.networks.iter().any(|net| net.contains(&addr)) {
                return true;
            }
        }
        self.regexes.iter().any(|regex| regex.is_match(target))
    }
}

/// Validate a family/value pair at excl creation time.
pub fn validate_excl(family: ExclFamily, value: &str) -> SnerResult<()> {
    match family {
        ExclFamily::Network => value.parse::<CidrNet>().map(|_| ()),
        ExclFamily::Regex => Regex::new(value)
            .map(|_| ())
            .map_err(|err| SnerError::Parse(format!("invalid regex: {err}"))),
    }
}

/// Address of a target: either a bare IP, or the host part of a
/// `proto://host:port` spec (square brackets stripped for IPv6).
fn target_address(target: &str) -> Option<IpAddr> {
    if let Ok(addr) = target.parse() {
        return Some(addr);
    }

    let (_, rest) = target.split_once("://")?;
    let host = match rest.strip_prefix('[') {
        // [v6addr]:port
        Some(bracketed) => bracketed.split_once(']')?.0,
        None => rest.rsplit_once(':')?.0,
    };
    host.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn excl(family: ExclFamily, value: &str) -> Excl {
        Excl {
            id: 0,
            family,
            value: value.to_string(),
            comment: None,
        }
    }

    #[test]
    fn network_matches_bare_ip() {
        let matcher =
            ExclMatcher::new(&[excl(ExclFamily::Network, "127.66.66.0/26")]).unwrap();
        assert!(matcher.matches("127.66.66.0"));
        assert!(matcher.matches("127.66.66.63"));
        assert!(!matcher.matches("127.66.66.64"));
        assert!(!matcher.matches("hostname.example.com"));
    }

    #[test]
    fn network_matches_service_spec() {
        let matcher =
            ExclMatcher::new(&[excl(ExclFamily::Network, "127.66.66.0/26")]).unwrap();
        assert!(matcher.matches("tcp://127.66.66.1:443"));
        assert!(!matcher.matches("tcp://127.66.67.1:443"));

        let matcher = ExclMatcher::new(&[excl(ExclFamily::Network, "2001:db8::/32")]).unwrap();
        assert!(matcher.matches("tcp://[2001:db8::1]:443"));
        assert!(matcher.matches("2001:db8::1"));
        assert!(!matcher.matches("tcp://[2001:db9::1]:443"));
    }

    #[test]
    fn regex_matches_search_semantics() {
        let matcher = ExclMatcher::new(&[excl(ExclFamily::Regex, r"^tcp://.*:22$")]).unwrap();
        assert!(matcher.matches("tcp://10.0.0.1:22"));
        assert!(!matcher.matches("tcp://10.0.0.1:2222"));

        // substring search, no implicit anchors
        let matcher = ExclMatcher::new(&[excl(ExclFamily::Regex, "example")]).unwrap();
        assert!(matcher.matches("test.example.com"));
    }

    #[test]
    fn any_rule_hit_matches() {
        let matcher = ExclMatcher::new(&[
            excl(ExclFamily::Network, "10.0.0.0/8"),
            excl(ExclFamily::Regex, "forbidden"),
        ])
        .unwrap();
        assert!(matcher.matches("10.1.2.3"));
        assert!(matcher.matches("forbidden.example.com"));
        assert!(!matcher.matches("192.0.2.1"));
    }

    #[test]
    fn validation_rejects_cross_family_values() {
        assert!(validate_excl(ExclFamily::Network, "127.0.0.0/24").is_ok());
        assert!(validate_excl(ExclFamily::Network, "not-a-network").is_err());
        assert!(validate_excl(ExclFamily::Regex, "ok.*").is_ok());
        assert!(validate_excl(ExclFamily::Regex, "un(closed").is_err());
    }
}
