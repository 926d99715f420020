//! Event model: what callers send in, and what the store keeps.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::policy::{DeniedBehavior, PolicyTemplate};

/// Well-known event names with analytic meaning
pub mod names {
    pub const PAGE_VIEW: &str = "page_view";
    /// One heartbeat of active attention; duration comes from config
    pub const ACTIVE_ATTENTION: &str = "active_attention_ms";
    pub const SCROLL_DEPTH_75: &str = "scroll_depth_75";
    pub const SCROLL_DEPTH_100: &str = "scroll_depth_100";

    pub const FORM_SUBMIT: &str = "form_submit";
    pub const FILE_DOWNLOAD: &str = "file_download";
    pub const OUTBOUND_CLICK: &str = "outbound_click";

    pub const PURCHASE: &str = "purchase";
    pub const SUBSCRIPTION_START: &str = "subscription_start";
    pub const DONATION: &str = "donation";
    pub const REFUND: &str = "refund";

    /// Micro-conversions counted by the page metrics aggregator
    pub const PAGE_MICRO_CONVERSIONS: [&str; 3] = [FORM_SUBMIT, FILE_DOWNLOAD, OUTBOUND_CLICK];

    /// Micro-conversions counted per session by the cohort evaluator
    pub const SESSION_CONVERSIONS: [&str; 6] = [
        FORM_SUBMIT,
        FILE_DOWNLOAD,
        OUTBOUND_CLICK,
        PURCHASE,
        SUBSCRIPTION_START,
        DONATION,
    ];

    /// Events that carry positive revenue
    pub const POSITIVE_REVENUE: [&str; 3] = [PURCHASE, SUBSCRIPTION_START, DONATION];

    pub fn is_scroll_read(name: &str) -> bool {
        name == SCROLL_DEPTH_75 || name == SCROLL_DEPTH_100
    }

    pub fn is_positive_revenue(name: &str) -> bool {
        POSITIVE_REVENUE.contains(&name)
    }
}

/// Consent state declared by the capture SDK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    Granted,
    Denied,
    Unknown,
}

impl ConsentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "granted" => Some(Self::Granted),
            "denied" => Some(Self::Denied),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConsentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the event's user was identified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserKind {
    /// Keyed by session id
    Anonymous,
    /// Keyed by a salted hash of an authenticated user id
    Stable,
}

impl UserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Stable => "stable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "anonymous" => Some(Self::Anonymous),
            "stable" => Some(Self::Stable),
            _ => None,
        }
    }
}

/// Event timestamp as sent by the client: RFC 3339 text or an epoch number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventTimestamp {
    /// Epoch seconds (below 10^10) or epoch milliseconds
    Epoch(serde_json::Number),
    Text(String),
}

/// Epoch values below this are read as seconds
const EPOCH_SECONDS_CUTOFF: f64 = 10_000_000_000.0;

impl EventTimestamp {
    pub fn parse(&self) -> Result<DateTime<Utc>, ValidationError> {
        match self {
            Self::Epoch(number) => {
                let value = number
                    .as_f64()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| ValidationError::InvalidTimestamp(number.to_string()))?;
                let millis = if value < EPOCH_SECONDS_CUTOFF {
                    value * 1000.0
                } else {
                    value
                };
                DateTime::from_timestamp_millis(millis.trunc() as i64)
                    .ok_or_else(|| ValidationError::InvalidTimestamp(number.to_string()))
            }
            Self::Text(text) => {
                let trimmed = text.trim();
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return Ok(parsed.with_timezone(&Utc));
                }
                NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f"))
                    .map(|naive| naive.and_utc())
                    .map_err(|_| ValidationError::InvalidTimestamp(text.clone()))
            }
        }
    }
}

impl From<DateTime<Utc>> for EventTimestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Text(value.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    }
}

/// Optional user block of an event payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_authenticated: Option<bool>,
}

/// Event as submitted by a web property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub site_id: String,
    pub session_id: String,
    pub event_name: String,
    pub ts: EventTimestamp,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub consent_state: ConsentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInput>,
}

/// Validation failures for an incoming payload
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{field} exceeds {max} characters")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("invalid ts value: {0}")]
    InvalidTimestamp(String),

    #[error("revenue events require a numeric properties.amount")]
    InvalidRevenueAmount,

    #[error("revenue events require properties.currency as ISO-4217 (e.g. USD)")]
    InvalidCurrency,

    #[error("properties.{0} must be a string when provided")]
    InvalidPropertyType(&'static str),

    #[error("{field} {message}")]
    OutOfRange {
        field: &'static str,
        message: &'static str,
    },
}

impl ValidationError {
    pub(crate) fn out_of_range(field: &'static str, message: &'static str) -> Self {
        Self::OutOfRange { field, message }
    }
}

/// Non-empty and at most `max` characters
pub(crate) fn check_len(
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    if value.chars().count() > max {
        return Err(ValidationError::FieldTooLong { field, max });
    }
    Ok(())
}

impl EventPayload {
    /// Request-schema checks applied at the ingestion boundary.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.site_id.is_empty() {
            return Err(ValidationError::MissingField("site_id"));
        }
        check_len("session_id", &self.session_id, 200)?;
        check_len("event_name", &self.event_name, 128)?;
        if let Some(key) = &self.idempotency_key {
            check_len("idempotency_key", key, 200)?;
        }
        if let Some(user) = &self.user {
            if let Some(id) = &user.anonymous_session_id {
                check_len("user.anonymous_session_id", id, 200)?;
            }
            if let Some(id) = &user.stable_user_id {
                check_len("user.stable_user_id", id, 200)?;
            }
        }
        self.ts.parse()?;

        if crate::revenue::is_revenue_event(&self.event_name) {
            if crate::revenue::parse_amount(self.properties.get("amount")).is_none() {
                return Err(ValidationError::InvalidRevenueAmount);
            }
            let currency = self.properties.get("currency").and_then(Value::as_str);
            if !currency.is_some_and(crate::revenue::is_iso_currency) {
                return Err(ValidationError::InvalidCurrency);
            }
            for field in ["product", "payment_provider"] {
                if self.properties.get(field).is_some_and(|v| !v.is_string()) {
                    return Err(ValidationError::InvalidPropertyType(field));
                }
            }
        }

        Ok(())
    }
}

/// Transport-level facts about the request that carried an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub asn: Option<u32>,
    #[serde(default)]
    pub is_internal: bool,
}

/// An event as persisted by the Event Store.
///
/// Immutable once written; only retention cleanup removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub site_id: String,
    pub event_name: String,
    pub event_ts: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub properties: Map<String, Value>,
    pub consent_state: ConsentState,
    pub policy_template: PolicyTemplate,
    pub denied_behavior: DeniedBehavior,
    pub user_kind: UserKind,
    pub user_id: String,
    pub session_id: String,
    pub stable_id_hash: Option<String>,
    pub idempotency_key: String,
    pub user_agent: Option<String>,
    pub asn: Option<u32>,
    pub ip_masked: Option<String>,
    pub ip_hash: Option<String>,
    pub revenue_amount: Option<f64>,
    pub revenue_currency: Option<String>,
    pub product: Option<String>,
    pub payment_provider: Option<String>,
}

impl StoredEvent {
    /// Page path from `properties.path`, "/" when absent or blank
    pub fn page_path(&self) -> &str {
        match self.properties.get("path").and_then(Value::as_str) {
            Some(path) if !path.trim().is_empty() => path,
            _ => "/",
        }
    }

    /// Signed revenue contribution; zero for non-revenue events
    pub fn revenue_delta(&self) -> f64 {
        self.revenue_amount.unwrap_or(0.0)
    }

    pub fn utm_source(&self) -> Option<&str> {
        self.properties.get("utm_source").and_then(Value::as_str)
    }
}

/// Half-open interval `[from, to)` over event timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.from && ts < self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(ts: EventTimestamp) -> EventPayload {
        EventPayload {
            site_id: "site".into(),
            session_id: "s1".into(),
            event_name: "page_view".into(),
            ts,
            properties: Map::new(),
            consent_state: ConsentState::Granted,
            idempotency_key: None,
            user: None,
        }
    }

    #[test]
    fn test_epoch_seconds_and_millis() {
        let secs = EventTimestamp::Epoch(1_771_027_200.into()).parse().unwrap();
        let millis = EventTimestamp::Epoch(1_771_027_200_000u64.into())
            .parse()
            .unwrap();
        assert_eq!(secs, millis);
        assert_eq!(secs.to_rfc3339(), "2026-02-14T00:00:00+00:00");
    }

    #[test]
    fn test_text_timestamp() {
        let ts = EventTimestamp::Text("2026-02-14T00:00:00.000Z".into())
            .parse()
            .unwrap();
        assert_eq!(ts.timestamp(), 1_771_027_200);

        let bad = EventTimestamp::Text("yesterday".into()).parse();
        assert!(matches!(bad, Err(ValidationError::InvalidTimestamp(_))));
    }

    #[test]
    fn test_payload_deserializes_both_ts_forms() {
        let p: EventPayload = serde_json::from_value(json!({
            "site_id": "a", "session_id": "b", "event_name": "page_view",
            "ts": 1771027200, "consent_state": "granted"
        }))
        .unwrap();
        assert!(matches!(p.ts, EventTimestamp::Epoch(_)));
        assert!(p.properties.is_empty());
    }

    #[test]
    fn test_validate_revenue_event_requires_amount_and_currency() {
        let mut p = payload(EventTimestamp::Epoch(1_771_027_200.into()));
        p.event_name = "purchase".into();
        assert_eq!(p.validate(), Err(ValidationError::InvalidRevenueAmount));

        p.properties.insert("amount".into(), json!("19.90"));
        assert_eq!(p.validate(), Err(ValidationError::InvalidCurrency));

        p.properties.insert("currency".into(), json!("usd"));
        assert_eq!(p.validate(), Err(ValidationError::InvalidCurrency));

        p.properties.insert("currency".into(), json!("USD"));
        p.properties.insert("product".into(), json!(7));
        assert_eq!(
            p.validate(),
            Err(ValidationError::InvalidPropertyType("product"))
        );

        p.properties.insert("product".into(), json!("pro"));
        assert_eq!(p.validate(), Ok(()));
    }

    #[test]
    fn test_validate_lengths() {
        let mut p = payload(EventTimestamp::Epoch(1.into()));
        p.session_id = "x".repeat(201);
        assert_eq!(
            p.validate(),
            Err(ValidationError::FieldTooLong {
                field: "session_id",
                max: 200
            })
        );
        p.session_id = String::new();
        assert_eq!(p.validate(), Err(ValidationError::MissingField("session_id")));
    }

    #[test]
    fn test_page_path_default() {
        let mut properties = Map::new();
        properties.insert("path".into(), json!("   "));
        let event = StoredEvent {
            event_id: Uuid::now_v7(),
            site_id: "s".into(),
            event_name: "page_view".into(),
            event_ts: Utc::now(),
            ingested_at: Utc::now(),
            properties,
            consent_state: ConsentState::Granted,
            policy_template: PolicyTemplate::Balanced,
            denied_behavior: DeniedBehavior::Minimal,
            user_kind: UserKind::Anonymous,
            user_id: "anon:x".into(),
            session_id: "x".into(),
            stable_id_hash: None,
            idempotency_key: "k".into(),
            user_agent: None,
            asn: None,
            ip_masked: None,
            ip_hash: None,
            revenue_amount: None,
            revenue_currency: None,
            product: None,
            payment_provider: None,
        };
        assert_eq!(event.page_path(), "/");
        assert_eq!(event.revenue_delta(), 0.0);
    }
}
