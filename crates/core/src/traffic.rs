//! Pre-ingest traffic filter: internal traffic, user agents, ASNs and IP ranges.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::event::RequestContext;
use crate::privacy::{ipv4_to_u32, normalize_ip};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficFilterConfig {
    pub ua_deny_patterns: Vec<String>,
    pub ua_allow_patterns: Vec<String>,
    /// Exact IPv4 addresses or CIDR ranges
    pub ip_denylist: Vec<String>,
    pub ip_allowlist: Vec<String>,
    pub asn_denylist: Vec<u32>,
    pub asn_allowlist: Vec<u32>,
    pub block_internal_traffic: bool,
}

impl TrafficFilterConfig {
    /// True when no rule could reject a request
    pub fn is_noop(&self) -> bool {
        !self.block_internal_traffic
            && self.ua_deny_patterns.is_empty()
            && self.ip_denylist.is_empty()
            && self.ip_allowlist.is_empty()
            && self.asn_denylist.is_empty()
            && self.asn_allowlist.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficRejection {
    InternalTrafficBlocked,
    UaBlocked,
    AsnNotAllowlisted,
    AsnBlocked,
    IpNotAllowlisted,
    IpBlocked,
}

impl TrafficRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InternalTrafficBlocked => "internal_traffic_blocked",
            Self::UaBlocked => "ua_blocked",
            Self::AsnNotAllowlisted => "asn_not_allowlisted",
            Self::AsnBlocked => "asn_blocked",
            Self::IpNotAllowlisted => "ip_not_allowlisted",
            Self::IpBlocked => "ip_blocked",
        }
    }
}

impl std::fmt::Display for TrafficRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive regex; a pattern that fails to compile is matched literally
fn build_regex(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .or_else(|_| {
            RegexBuilder::new(&regex::escape(pattern))
                .case_insensitive(true)
                .build()
        })
        .ok()
}

fn match_cidr(ip: u32, cidr: &str) -> bool {
    let Some((range, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u32>() else {
        return false;
    };
    if prefix > 32 {
        return false;
    }
    let Some(range) = ipv4_to_u32(range) else {
        return false;
    };
    if prefix == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - prefix);
    (ip & mask) == (range & mask)
}

fn match_ip_rule(ip: &str, rule: &str) -> bool {
    if rule.contains('/') {
        return ipv4_to_u32(ip).is_some_and(|ip| match_cidr(ip, rule));
    }
    ip == rule
}

pub struct TrafficFilter {
    config: TrafficFilterConfig,
    ua_deny: Vec<Regex>,
    ua_allow: Vec<Regex>,
}

impl TrafficFilter {
    pub fn new(config: TrafficFilterConfig) -> Self {
        let ua_deny = config
            .ua_deny_patterns
            .iter()
            .filter_map(|p| build_regex(p))
            .collect();
        let ua_allow = config
            .ua_allow_patterns
            .iter()
            .filter_map(|p| build_regex(p))
            .collect();
        Self {
            config,
            ua_deny,
            ua_allow,
        }
    }

    pub fn config(&self) -> &TrafficFilterConfig {
        &self.config
    }

    /// `Ok(())` when the request may be ingested.
    ///
    /// Allow lists take precedence over deny lists; a non-empty allow list
    /// rejects everything it does not match.
    pub fn evaluate(&self, ctx: &RequestContext) -> Result<(), TrafficRejection> {
        if ctx.is_internal && self.config.block_internal_traffic {
            return Err(TrafficRejection::InternalTrafficBlocked);
        }

        let user_agent = ctx.user_agent.as_deref().unwrap_or("");
        let ua_allowed = self.ua_allow.iter().any(|re| re.is_match(user_agent));
        let ua_denied = self.ua_deny.iter().any(|re| re.is_match(user_agent));
        if !ua_allowed && ua_denied {
            return Err(TrafficRejection::UaBlocked);
        }

        if let Some(asn) = ctx.asn {
            let allowlisted = self.config.asn_allowlist.contains(&asn);
            if !self.config.asn_allowlist.is_empty() && !allowlisted {
                return Err(TrafficRejection::AsnNotAllowlisted);
            }
            if self.config.asn_denylist.contains(&asn) && !allowlisted {
                return Err(TrafficRejection::AsnBlocked);
            }
        }

        if let Some(ip) = normalize_ip(ctx.client_ip.as_deref()) {
            let allowlisted = self
                .config
                .ip_allowlist
                .iter()
                .any(|rule| match_ip_rule(&ip, rule));
            if !self.config.ip_allowlist.is_empty() && !allowlisted {
                return Err(TrafficRejection::IpNotAllowlisted);
            }
            let denied = self
                .config
                .ip_denylist
                .iter()
                .any(|rule| match_ip_rule(&ip, rule));
            if denied && !allowlisted {
                return Err(TrafficRejection::IpBlocked);
            }
        }

        Ok(())
    }
}
