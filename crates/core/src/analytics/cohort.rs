//! Cohort DSL and per-session membership evaluation.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::definition_id;
use crate::eqs::{calculate_eqs, EqsInput, EqsWeights};
use crate::event::{check_len, names, StoredEvent, TimeRange, ValidationError};

pub const MAX_COHORT_CONDITIONS: usize = 20;

/// One membership condition; a session must satisfy every condition of a cohort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CohortCondition {
    VisitCountGte { value: u64 },
    HasEvent { event_name: String },
    EqsGte { value: f64 },
    /// Never matches with an empty list
    UtmSourceIn { values: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortDsl {
    pub all: Vec<CohortCondition>,
}

impl CohortDsl {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.all.is_empty() || self.all.len() > MAX_COHORT_CONDITIONS {
            return Err(ValidationError::out_of_range(
                "dsl.all",
                "must contain between 1 and 20 conditions",
            ));
        }
        for condition in &self.all {
            match condition {
                CohortCondition::VisitCountGte { value } if *value < 1 => {
                    return Err(ValidationError::out_of_range(
                        "visit_count_gte.value",
                        "must be at least 1",
                    ));
                }
                CohortCondition::HasEvent { event_name } => {
                    check_len("has_event.event_name", event_name, 128)?;
                }
                CohortCondition::EqsGte { value } if !(0.0..=100.0).contains(value) => {
                    return Err(ValidationError::out_of_range(
                        "eqs_gte.value",
                        "must be between 0 and 100",
                    ));
                }
                CohortCondition::UtmSourceIn { values } => {
                    if values.is_empty() || values.len() > 20 {
                        return Err(ValidationError::out_of_range(
                            "utm_source_in.values",
                            "must contain between 1 and 20 entries",
                        ));
                    }
                    for value in values {
                        check_len("utm_source_in.values[]", value, 100)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortDefinitionInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohort_id: Option<String>,
    pub site_id: String,
    pub name: String,
    pub dsl: CohortDsl,
}

impl CohortDefinitionInput {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(id) = &self.cohort_id {
            check_len("cohort_id", id, 128)?;
        }
        if self.site_id.is_empty() {
            return Err(ValidationError::MissingField("site_id"));
        }
        check_len("name", &self.name, 200)?;
        self.dsl.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortDefinition {
    pub cohort_id: String,
    pub site_id: String,
    pub name: String,
    pub dsl: CohortDsl,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CohortDefinition {
    pub fn resolve_id(input: &CohortDefinitionInput) -> String {
        definition_id(input.cohort_id.as_deref(), "cohort")
    }

    pub fn upserted(
        cohort_id: String,
        input: CohortDefinitionInput,
        existing: Option<&CohortDefinition>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            cohort_id,
            site_id: input.site_id,
            name: input.name,
            dsl: input.dsl,
            created_at: existing.map_or(now, |e| e.created_at),
            updated_at: now,
        }
    }
}

/// Scoring inputs used for the per-session EQS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CohortMetricsConfig {
    pub eqs_weights: EqsWeights,
    pub attention_heartbeat_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortRefreshQuery {
    pub cohort: CohortDefinition,
    pub range: TimeRange,
    pub metrics: CohortMetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortSnapshot {
    pub cohort_id: String,
    pub site_id: String,
    /// 1 for the first refresh of a cohort, then +1 per refresh
    pub snapshot_version: i64,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub built_at: DateTime<Utc>,
    pub member_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortRefreshResult {
    pub snapshot: CohortSnapshot,
    pub session_ids: Vec<String>,
}

impl CohortRefreshResult {
    pub fn new(query: &CohortRefreshQuery, version: i64, session_ids: Vec<String>) -> Self {
        Self {
            snapshot: CohortSnapshot {
                cohort_id: query.cohort.cohort_id.clone(),
                site_id: query.cohort.site_id.clone(),
                snapshot_version: version,
                from: query.range.from,
                to: query.range.to,
                built_at: Utc::now(),
                member_count: session_ids.len() as u64,
            },
            session_ids,
        }
    }
}

/// What the DSL can ask about one session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionProfile<'a> {
    pub visit_count: u64,
    pub event_names: HashSet<&'a str>,
    pub utm_sources: HashSet<&'a str>,
    pub eqs: f64,
}

impl<'a> SessionProfile<'a> {
    pub fn build(events: &[&'a StoredEvent], metrics: &CohortMetricsConfig) -> Self {
        let count = |pred: fn(&str) -> bool| {
            events.iter().filter(|e| pred(e.event_name.as_str())).count() as u64
        };

        let visit_count = count(|name| name == names::PAGE_VIEW);
        let attention_ms =
            count(|name| name == names::ACTIVE_ATTENTION) * metrics.attention_heartbeat_ms;
        let scroll_reads = count(names::is_scroll_read);
        let conversions = count(|name| names::SESSION_CONVERSIONS.contains(&name));

        let per_visit = |value: u64| {
            if visit_count > 0 {
                value as f64 / visit_count as f64
            } else {
                0.0
            }
        };

        let eqs = calculate_eqs(
            &EqsInput {
                page_views: visit_count,
                bot_page_views: 0,
                active_attention_ms_avg: per_visit(attention_ms),
                scroll_readthrough_avg: per_visit(scroll_reads),
                conversion_rate: per_visit(conversions),
            },
            &metrics.eqs_weights,
        );

        Self {
            visit_count,
            event_names: events.iter().map(|e| e.event_name.as_str()).collect(),
            utm_sources: events.iter().filter_map(|e| e.utm_source()).collect(),
            eqs,
        }
    }
}

impl CohortCondition {
    pub fn matches(&self, profile: &SessionProfile<'_>) -> bool {
        match self {
            Self::VisitCountGte { value } => profile.visit_count >= *value,
            Self::HasEvent { event_name } => profile.event_names.contains(event_name.as_str()),
            Self::EqsGte { value } => profile.eqs >= *value,
            Self::UtmSourceIn { values } => values
                .iter()
                .any(|v| profile.utm_sources.contains(v.as_str())),
        }
    }
}

/// Session ids of the cohort's site that satisfy every condition, sorted.
pub fn evaluate_cohort_members(events: &[StoredEvent], query: &CohortRefreshQuery) -> Vec<String> {
    let mut sessions: BTreeMap<&str, Vec<&StoredEvent>> = BTreeMap::new();
    for event in events
        .iter()
        .filter(|e| e.site_id == query.cohort.site_id && query.range.contains(e.event_ts))
    {
        sessions.entry(event.session_id.as_str()).or_default().push(event);
    }

    sessions
        .into_iter()
        .filter(|(_, session)| {
            let profile = SessionProfile::build(session, &query.metrics);
            query.cohort.dsl.all.iter().all(|c| c.matches(&profile))
        })
        .map(|(session_id, _)| session_id.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::testing::{at, event};
    use serde_json::json;

    fn cohort(all: Vec<CohortCondition>) -> CohortRefreshQuery {
        CohortRefreshQuery {
            cohort: CohortDefinition {
                cohort_id: "buyers".into(),
                site_id: "shop".into(),
                name: "Repeat buyers".into(),
                dsl: CohortDsl { all },
                created_at: at(0),
                updated_at: at(0),
            },
            range: TimeRange::new(at(-60), at(180)),
            metrics: CohortMetricsConfig {
                eqs_weights: EqsWeights::default(),
                attention_heartbeat_ms: 5000,
            },
        }
    }

    fn events() -> Vec<StoredEvent> {
        let usd = json!({"amount": 10, "currency": "USD"});
        vec![
            event("shop", "c1", "page_view", 0, json!({"utm_source": "newsletter"})),
            event("shop", "c1", "page_view", 1, json!({})),
            event("shop", "c1", "purchase", 2, usd.clone()),
            event("shop", "c2", "page_view", 0, json!({"utm_source": "ads"})),
            event("shop", "c2", "purchase", 1, usd),
            event("shop", "c3", "page_view", 0, json!({})),
            event("shop", "c3", "page_view", 1, json!({})),
            event("blog", "c4", "page_view", 0, json!({})),
            event("blog", "c4", "page_view", 1, json!({})),
        ]
    }

    #[test]
    fn test_conjunction() {
        let q = cohort(vec![
            CohortCondition::VisitCountGte { value: 2 },
            CohortCondition::HasEvent {
                event_name: "purchase".into(),
            },
        ]);
        assert_eq!(evaluate_cohort_members(&events(), &q), vec!["c1"]);
    }

    #[test]
    fn test_members_sorted_and_site_scoped() {
        let q = cohort(vec![CohortCondition::VisitCountGte { value: 1 }]);
        assert_eq!(evaluate_cohort_members(&events(), &q), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_utm_source() {
        let q = cohort(vec![CohortCondition::UtmSourceIn {
            values: vec!["ads".into(), "social".into()],
        }]);
        assert_eq!(evaluate_cohort_members(&events(), &q), vec!["c2"]);

        let empty = cohort(vec![CohortCondition::UtmSourceIn { values: vec![] }]);
        assert!(evaluate_cohort_members(&events(), &empty).is_empty());
    }

    #[test]
    fn test_eqs_threshold() {
        // c2: one visit with one conversion -> 0.2 * 1.0 = 20 points
        let q = cohort(vec![CohortCondition::EqsGte { value: 20.0 }]);
        assert_eq!(evaluate_cohort_members(&events(), &q), vec!["c2"]);
    }

    #[test]
    fn test_dsl_wire_format() {
        let dsl: CohortDsl = serde_json::from_value(json!({
            "all": [
                {"type": "visit_count_gte", "value": 2},
                {"type": "has_event", "event_name": "purchase"},
                {"type": "eqs_gte", "value": 40},
                {"type": "utm_source_in", "values": ["ads"]}
            ]
        }))
        .unwrap();
        assert_eq!(dsl.all.len(), 4);
        assert_eq!(dsl.all[0], CohortCondition::VisitCountGte { value: 2 });
        assert_eq!(dsl.validate(), Ok(()));

        let invalid = CohortDsl {
            all: vec![CohortCondition::EqsGte { value: 120.0 }],
        };
        assert!(invalid.validate().is_err());
    }
}
