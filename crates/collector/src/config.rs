//! Collector configuration
//!
//! Everything is read once at startup into immutable structs. Unparsable
//! values fall back to their defaults instead of failing startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pulse_core::analytics::page_metrics::DEFAULT_BOT_UA_PATTERN;
use pulse_core::analytics::paths;
use pulse_core::{
    CohortMetricsConfig, EqsWeights, PageMetricsQuery, PolicyTemplate, TimeRange,
    TrafficFilterConfig,
};
use tracing::warn;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Shortest interval a background job may run on
pub const MIN_JOB_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// PostgreSQL when set, in-memory store otherwise
    pub database_url: Option<String>,
    pub policy: PolicyConfig,
    pub privacy: PrivacyConfig,
    pub traffic_filter: TrafficFilterConfig,
    pub retention: RetentionConfig,
    pub metrics: MetricsConfig,
    pub cohort_refresh: CohortRefreshConfig,
    pub paths: PathDefaults,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    pub default_template: PolicyTemplate,
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrivacyConfig {
    /// Required once authenticated stable ids arrive
    pub stable_id_salt: String,
    pub ip_hash_salt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub default_retention_days: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    pub session_inactivity_minutes: u32,
    pub attention_heartbeat_ms: u64,
    pub bot_user_agent_pattern: String,
    pub eqs_weights: EqsWeights,
}

impl MetricsConfig {
    pub fn page_metrics_query(&self, range: TimeRange, site_id: Option<String>) -> PageMetricsQuery {
        PageMetricsQuery {
            range,
            site_id,
            session_inactivity_minutes: self.session_inactivity_minutes,
            attention_heartbeat_ms: self.attention_heartbeat_ms,
            bot_user_agent_pattern: self.bot_user_agent_pattern.clone(),
        }
    }

    pub fn cohort_metrics(&self) -> CohortMetricsConfig {
        CohortMetricsConfig {
            eqs_weights: self.eqs_weights,
            attention_heartbeat_ms: self.attention_heartbeat_ms,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            session_inactivity_minutes: 30,
            attention_heartbeat_ms: 5000,
            bot_user_agent_pattern: DEFAULT_BOT_UA_PATTERN.to_string(),
            eqs_weights: EqsWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CohortRefreshConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub lookback_days: u32,
}

/// Defaults for path queries that leave a setting unset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathDefaults {
    pub top_n: usize,
    pub max_path_length: usize,
    pub sample_rate: f64,
    pub event_fetch_limit: usize,
}

impl Default for PathDefaults {
    fn default() -> Self {
        Self {
            top_n: paths::DEFAULT_TOP_N,
            max_path_length: paths::DEFAULT_MAX_PATH_LENGTH,
            sample_rate: paths::DEFAULT_SAMPLE_RATE,
            event_fetch_limit: paths::DEFAULT_EVENT_FETCH_LIMIT,
        }
    }
}

impl CollectorConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name);
        let metrics_defaults = MetricsConfig::default();
        let weight_defaults = metrics_defaults.eqs_weights;
        let path_defaults = PathDefaults::default();

        Self {
            database_url: var("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            policy: PolicyConfig {
                default_template: var("POLICY_DEFAULT_TEMPLATE")
                    .and_then(|value| PolicyTemplate::parse(value.trim()))
                    .unwrap_or(PolicyTemplate::Balanced),
                config_path: var("POLICY_CONFIG_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("config/site-policies.json")),
            },
            privacy: PrivacyConfig {
                stable_id_salt: var("STABLE_ID_SALT").unwrap_or_default(),
                ip_hash_salt: var("IP_HASH_SALT").unwrap_or_default(),
            },
            traffic_filter: TrafficFilterConfig {
                ua_deny_patterns: parse_csv(var("TRAFFIC_FILTER_UA_DENY").as_deref()),
                ua_allow_patterns: parse_csv(var("TRAFFIC_FILTER_UA_ALLOW").as_deref()),
                ip_denylist: parse_csv(var("TRAFFIC_FILTER_IP_DENY").as_deref()),
                ip_allowlist: parse_csv(var("TRAFFIC_FILTER_IP_ALLOW").as_deref()),
                asn_denylist: parse_csv_numbers(var("TRAFFIC_FILTER_ASN_DENY").as_deref()),
                asn_allowlist: parse_csv_numbers(var("TRAFFIC_FILTER_ASN_ALLOW").as_deref()),
                block_internal_traffic: parse_bool(
                    var("TRAFFIC_FILTER_BLOCK_INTERNAL").as_deref(),
                    true,
                ),
            },
            retention: RetentionConfig {
                enabled: parse_bool(var("RETENTION_JOB_ENABLED").as_deref(), true),
                interval: parse_interval_secs("RETENTION_INTERVAL_SECS", var("RETENTION_INTERVAL_SECS").as_deref(), DAY_SECS),
                default_retention_days: parse_number(
                    var("DEFAULT_RETENTION_DAYS").as_deref(),
                    180,
                ),
            },
            metrics: MetricsConfig {
                session_inactivity_minutes: parse_number(
                    var("METRICS_SESSION_INACTIVITY_MINUTES").as_deref(),
                    metrics_defaults.session_inactivity_minutes,
                ),
                attention_heartbeat_ms: parse_number(
                    var("METRICS_ATTENTION_HEARTBEAT_MS").as_deref(),
                    metrics_defaults.attention_heartbeat_ms,
                ),
                bot_user_agent_pattern: var("METRICS_BOT_UA_PATTERN")
                    .filter(|pattern| !pattern.is_empty())
                    .unwrap_or(metrics_defaults.bot_user_agent_pattern),
                eqs_weights: EqsWeights {
                    attention: parse_f64(
                        var("EQS_WEIGHT_ATTENTION").as_deref(),
                        weight_defaults.attention,
                    ),
                    scroll: parse_f64(var("EQS_WEIGHT_SCROLL").as_deref(), weight_defaults.scroll),
                    conversion: parse_f64(
                        var("EQS_WEIGHT_CONVERSION").as_deref(),
                        weight_defaults.conversion,
                    ),
                    attention_normalization_ms: parse_f64(
                        var("EQS_ATTENTION_NORMALIZATION_MS").as_deref(),
                        weight_defaults.attention_normalization_ms,
                    ),
                },
            },
            cohort_refresh: CohortRefreshConfig {
                enabled: parse_bool(var("COHORT_REFRESH_ENABLED").as_deref(), true),
                interval: parse_interval_secs("COHORT_REFRESH_INTERVAL_SECS", var("COHORT_REFRESH_INTERVAL_SECS").as_deref(), DAY_SECS),
                lookback_days: parse_number(var("COHORT_REFRESH_LOOKBACK_DAYS").as_deref(), 30),
            },
            paths: PathDefaults {
                top_n: parse_number(var("PATHS_DEFAULT_TOP_N").as_deref(), path_defaults.top_n),
                max_path_length: parse_number(
                    var("PATHS_DEFAULT_MAX_PATH_LENGTH").as_deref(),
                    path_defaults.max_path_length,
                ),
                sample_rate: parse_f64(
                    var("PATHS_DEFAULT_SAMPLE_RATE").as_deref(),
                    path_defaults.sample_rate,
                ),
                event_fetch_limit: parse_number(
                    var("PATHS_DEFAULT_EVENT_FETCH_LIMIT").as_deref(),
                    path_defaults.event_fetch_limit,
                ),
            },
        }
    }
}

/// `1`, `true`, `yes` and `on` (any case) are true; an unset variable gives `fallback`
pub fn parse_bool(value: Option<&str>, fallback: bool) -> bool {
    match value {
        None => fallback,
        Some(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
    }
}

pub fn parse_number<T: FromStr>(value: Option<&str>, fallback: T) -> T {
    value
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(fallback)
}

/// Job interval in whole seconds. Zero is raised to [`MIN_JOB_INTERVAL`];
/// negative or unparsable values give `fallback_secs`.
pub fn parse_interval_secs(name: &str, value: Option<&str>, fallback_secs: u64) -> Duration {
    let interval = Duration::from_secs(parse_number(value, fallback_secs));
    if interval < MIN_JOB_INTERVAL {
        warn!(
            variable = name,
            min_secs = MIN_JOB_INTERVAL.as_secs(),
            "Job interval below minimum, clamping"
        );
        return MIN_JOB_INTERVAL;
    }
    interval
}

/// Like [`parse_number`] but also rejects NaN and infinities
pub fn parse_f64(value: Option<&str>, fallback: f64) -> f64 {
    value
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(fallback)
}

/// Comma-separated list, trimmed, without empty entries
pub fn parse_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Comma-separated numbers; entries that do not parse are skipped
pub fn parse_csv_numbers<T: FromStr>(value: Option<&str>) -> Vec<T> {
    parse_csv(value)
        .iter()
        .filter_map(|item| item.parse().ok())
        .collect()
}
