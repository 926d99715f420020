//! Site policy lookup
//!
//! A site without an override gets the defaults of the store's default
//! template. Stores are loaded once and never touch the disk afterwards.

use std::collections::BTreeMap;
use std::path::Path;

use pulse_core::{PolicyTemplate, ResolvedSitePolicy, SitePolicyOverride};
use serde::Deserialize;
use tracing::{debug, warn};

pub trait PolicyStore: Send + Sync + 'static {
    fn get_policy(&self, site_id: &str) -> ResolvedSitePolicy;

    /// Policies of every site with an explicit override
    fn list_policies(&self) -> Vec<ResolvedSitePolicy>;
}

/// Policies held in memory, keyed by site id
#[derive(Debug, Clone)]
pub struct InMemoryPolicyStore {
    policies: BTreeMap<String, SitePolicyOverride>,
    default_template: PolicyTemplate,
}

impl InMemoryPolicyStore {
    pub fn new(policies: impl IntoIterator<Item = (String, SitePolicyOverride)>) -> Self {
        Self {
            policies: policies.into_iter().collect(),
            default_template: PolicyTemplate::Balanced,
        }
    }

    pub fn with_default_template(mut self, template: PolicyTemplate) -> Self {
        self.default_template = template;
        self
    }
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self {
            policies: BTreeMap::new(),
            default_template: PolicyTemplate::Balanced,
        }
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn get_policy(&self, site_id: &str) -> ResolvedSitePolicy {
        ResolvedSitePolicy::resolve(site_id, self.policies.get(site_id), self.default_template)
    }

    fn list_policies(&self) -> Vec<ResolvedSitePolicy> {
        self.policies
            .keys()
            .map(|site_id| self.get_policy(site_id))
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    default_template: Option<String>,
    #[serde(default)]
    sites: BTreeMap<String, SitePolicyOverride>,
}

/// Policies read from a JSON file:
///
/// ```json
/// { "default_template": "strict",
///   "sites": { "shop": { "template": "marketing", "retention_days": 90 } } }
/// ```
///
/// A missing or unreadable file behaves like an empty one. An unknown
/// `default_template` falls back to the configured default.
#[derive(Debug, Clone)]
pub struct FilePolicyStore {
    inner: InMemoryPolicyStore,
}

impl FilePolicyStore {
    pub fn load(path: impl AsRef<Path>, default_template: PolicyTemplate) -> Self {
        let path = path.as_ref();
        let file = read_policy_file(path);

        let default_template = file
            .default_template
            .as_deref()
            .and_then(PolicyTemplate::parse)
            .unwrap_or(default_template);

        debug!(
            path = %path.display(),
            sites = file.sites.len(),
            default_template = %default_template,
            "loaded site policies"
        );

        Self {
            inner: InMemoryPolicyStore::new(file.sites).with_default_template(default_template),
        }
    }
}

fn read_policy_file(path: &Path) -> PolicyFile {
    if !path.exists() {
        return PolicyFile::default();
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Failed to read policy file {}: {}", path.display(), e);
            return PolicyFile::default();
        }
    };

    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!("Ignoring invalid policy file {}: {}", path.display(), e);
        PolicyFile::default()
    })
}

impl PolicyStore for FilePolicyStore {
    fn get_policy(&self, site_id: &str) -> ResolvedSitePolicy {
        self.inner.get_policy(site_id)
    }

    fn list_policies(&self) -> Vec<ResolvedSitePolicy> {
        self.inner.list_policies()
    }
}
