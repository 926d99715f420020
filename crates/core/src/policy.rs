//! Privacy policy templates and the consent policy engine.

use serde::{Deserialize, Serialize};

use crate::event::ConsentState;

/// Named privacy policy template
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTemplate {
    Strict,
    #[default]
    Balanced,
    Marketing,
}

/// What happens to an event whose consent is denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeniedBehavior {
    /// Discard the event
    Drop,
    /// Store it with an empty properties object
    Minimal,
}

/// How the client IP is retained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpStorageMode {
    None,
    /// Keep the IPv4 /24 network only
    Mask24,
    /// Keep a salted SHA-256 of the address
    Hash,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(PolicyTemplate {
    Strict => "strict",
    Balanced => "balanced",
    Marketing => "marketing",
});

string_enum!(DeniedBehavior {
    Drop => "drop",
    Minimal => "minimal",
});

string_enum!(IpStorageMode {
    None => "none",
    Mask24 => "mask24",
    Hash => "hash",
});

/// Settings a template implies when a site does not override them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateDefaults {
    pub denied_behavior: DeniedBehavior,
    pub retention_days: u32,
    pub ip_storage_mode: IpStorageMode,
}

impl PolicyTemplate {
    pub fn defaults(&self) -> TemplateDefaults {
        match self {
            Self::Strict => TemplateDefaults {
                denied_behavior: DeniedBehavior::Drop,
                retention_days: 30,
                ip_storage_mode: IpStorageMode::None,
            },
            Self::Balanced => TemplateDefaults {
                denied_behavior: DeniedBehavior::Minimal,
                retention_days: 180,
                ip_storage_mode: IpStorageMode::None,
            },
            Self::Marketing => TemplateDefaults {
                denied_behavior: DeniedBehavior::Minimal,
                retention_days: 365,
                ip_storage_mode: IpStorageMode::Hash,
            },
        }
    }
}

/// Per-site override as written in a policy file; unset fields fall back to the template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SitePolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PolicyTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_behavior: Option<DeniedBehavior>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_storage_mode: Option<IpStorageMode>,
}

/// Effective policy for one site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSitePolicy {
    pub site_id: String,
    pub template: PolicyTemplate,
    pub denied_behavior: DeniedBehavior,
    pub retention_days: u32,
    pub ip_storage_mode: IpStorageMode,
}

impl ResolvedSitePolicy {
    /// Apply `site_override` on top of the defaults of its template (or `default_template`).
    pub fn resolve(
        site_id: impl Into<String>,
        site_override: Option<&SitePolicyOverride>,
        default_template: PolicyTemplate,
    ) -> Self {
        let empty = SitePolicyOverride::default();
        let site_override = site_override.unwrap_or(&empty);
        let template = site_override.template.unwrap_or(default_template);
        let defaults = template.defaults();

        Self {
            site_id: site_id.into(),
            template,
            denied_behavior: site_override
                .denied_behavior
                .unwrap_or(defaults.denied_behavior),
            retention_days: site_override
                .retention_days
                .unwrap_or(defaults.retention_days),
            ip_storage_mode: site_override
                .ip_storage_mode
                .unwrap_or(defaults.ip_storage_mode),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Store,
    Drop,
}

pub const REASON_CONSENT_DENIED_DROP: &str = "consent_denied_drop_policy";
pub const REASON_CONSENT_DENIED_MINIMAL: &str = "consent_denied_minimal_policy";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    /// Store an empty properties object instead of the payload's
    pub minimal_payload: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// Maps consent state plus site policy to a store/drop decision
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsentPolicyEngine;

impl ConsentPolicyEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, consent: ConsentState, policy: &ResolvedSitePolicy) -> PolicyDecision {
        if consent != ConsentState::Denied {
            return PolicyDecision {
                action: PolicyAction::Store,
                minimal_payload: false,
                reason: None,
            };
        }

        match policy.denied_behavior {
            DeniedBehavior::Drop => PolicyDecision {
                action: PolicyAction::Drop,
                minimal_payload: false,
                reason: Some(REASON_CONSENT_DENIED_DROP),
            },
            DeniedBehavior::Minimal => PolicyDecision {
                action: PolicyAction::Store,
                minimal_payload: true,
                reason: Some(REASON_CONSENT_DENIED_MINIMAL),
            },
        }
    }
}
