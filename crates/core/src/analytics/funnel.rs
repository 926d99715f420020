//! Ordered multi-step funnels with a conversion window.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::{definition_id, round4};
use crate::event::{check_len, StoredEvent, TimeRange, ValidationError};

pub const MAX_FUNNEL_STEPS: usize = 12;
pub const MAX_CONVERSION_WINDOW_MINUTES: u32 = 7 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelDefinitionInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funnel_id: Option<String>,
    pub site_id: String,
    pub name: String,
    /// Event names, or page paths when a step starts with "/"
    pub steps: Vec<String>,
    pub conversion_window_minutes: u32,
}

impl FunnelDefinitionInput {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(id) = &self.funnel_id {
            check_len("funnel_id", id, 128)?;
        }
        if self.site_id.is_empty() {
            return Err(ValidationError::MissingField("site_id"));
        }
        check_len("name", &self.name, 200)?;
        if self.steps.len() < 2 || self.steps.len() > MAX_FUNNEL_STEPS {
            return Err(ValidationError::out_of_range(
                "steps",
                "must contain between 2 and 12 entries",
            ));
        }
        for step in &self.steps {
            check_len("steps[]", step, 200)?;
        }
        if self.conversion_window_minutes < 1
            || self.conversion_window_minutes > MAX_CONVERSION_WINDOW_MINUTES
        {
            return Err(ValidationError::out_of_range(
                "conversion_window_minutes",
                "must be between 1 and 10080",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelDefinition {
    pub funnel_id: String,
    pub site_id: String,
    pub name: String,
    pub steps: Vec<String>,
    pub conversion_window_minutes: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FunnelDefinition {
    /// Id the upsert of `input` will write under
    pub fn resolve_id(input: &FunnelDefinitionInput) -> String {
        definition_id(input.funnel_id.as_deref(), "funnel")
    }

    /// Record for an upsert under `funnel_id`, keeping `created_at` of `existing`
    pub fn upserted(
        funnel_id: String,
        input: FunnelDefinitionInput,
        existing: Option<&FunnelDefinition>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            funnel_id,
            site_id: input.site_id,
            name: input.name,
            steps: input.steps,
            conversion_window_minutes: input.conversion_window_minutes,
            created_at: existing.map_or(now, |e| e.created_at),
            updated_at: now,
        }
    }

    fn window(&self) -> Duration {
        Duration::minutes(i64::from(self.conversion_window_minutes.max(1)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelAggregateQuery {
    pub funnel: FunnelDefinition,
    pub range: TimeRange,
    /// Defaults to the funnel's own site
    pub site_id: Option<String>,
}

impl FunnelAggregateQuery {
    pub fn site_id(&self) -> &str {
        self.site_id.as_deref().unwrap_or(&self.funnel.site_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunnelAggregate {
    pub step_sessions: Vec<u64>,
    pub base_sessions: u64,
    pub converted_sessions: u64,
    pub revenue_total: f64,
    pub revenue_avg: f64,
}

fn matches_step(event: &StoredEvent, step: &str) -> bool {
    if step.starts_with('/') {
        event.page_path() == step
    } else {
        event.event_name == step
    }
}

/// Earliest event from `start` on matching `step` with `min_ts <= ts <= max_ts`
fn find_step(
    events: &[&StoredEvent],
    step: &str,
    start: usize,
    min_ts: Option<DateTime<Utc>>,
    max_ts: Option<DateTime<Utc>>,
) -> Option<usize> {
    for (index, event) in events.iter().enumerate().skip(start) {
        if min_ts.is_some_and(|min| event.event_ts < min) {
            continue;
        }
        if max_ts.is_some_and(|max| event.event_ts > max) {
            break;
        }
        if matches_step(event, step) {
            return Some(index);
        }
    }
    None
}

pub fn aggregate_funnel(events: &[StoredEvent], query: &FunnelAggregateQuery) -> FunnelAggregate {
    let steps = &query.funnel.steps;
    let site_id = query.site_id();
    let window = query.funnel.window();

    let Some(first_step) = steps.first() else {
        return FunnelAggregate::default();
    };

    let mut sessions: BTreeMap<&str, Vec<&StoredEvent>> = BTreeMap::new();
    for event in events
        .iter()
        .filter(|e| e.site_id == site_id && query.range.contains(e.event_ts))
    {
        sessions.entry(event.session_id.as_str()).or_default().push(event);
    }

    let mut step_sessions = vec![0u64; steps.len()];
    let mut base_sessions = 0u64;
    let mut converted_sessions = 0u64;
    let mut revenue_total = 0.0;

    for session in sessions.values_mut() {
        session.sort_by_key(|e| e.event_ts);

        let Some(first_index) = find_step(session, first_step, 0, None, None) else {
            continue;
        };
        let first_ts = session[first_index].event_ts;
        let deadline = first_ts + window;

        base_sessions += 1;
        step_sessions[0] += 1;

        let mut previous = first_index;
        let mut converted = true;
        for (step_index, step) in steps.iter().enumerate().skip(1) {
            let previous_ts = session[previous].event_ts;
            match find_step(session, step, previous, Some(previous_ts), Some(deadline)) {
                Some(matched) => {
                    step_sessions[step_index] += 1;
                    previous = matched;
                }
                None => {
                    converted = false;
                    break;
                }
            }
        }

        if !converted {
            continue;
        }

        converted_sessions += 1;
        revenue_total += session
            .iter()
            .filter(|e| e.event_ts >= first_ts && e.event_ts <= deadline)
            .map(|e| e.revenue_delta())
            .sum::<f64>();
    }

    FunnelAggregate {
        step_sessions,
        base_sessions,
        converted_sessions,
        revenue_total: round4(revenue_total),
        revenue_avg: if converted_sessions > 0 {
            round4(revenue_total / converted_sessions as f64)
        } else {
            0.0
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStepReport {
    pub step_index: usize,
    pub step: String,
    pub sessions: u64,
    pub conversion_rate: f64,
    pub drop_off: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelReport {
    pub funnel_id: String,
    pub site_id: String,
    pub name: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub conversion_window_minutes: u32,
    pub steps: Vec<FunnelStepReport>,
    pub revenue_total: f64,
    pub revenue_avg: f64,
}

/// Step-to-step conversion and drop-off for an aggregate of `funnel`
pub fn build_funnel_report(
    funnel: &FunnelDefinition,
    range: TimeRange,
    aggregate: &FunnelAggregate,
) -> FunnelReport {
    let count = |index: usize| aggregate.step_sessions.get(index).copied().unwrap_or(0);

    let steps = funnel
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let sessions = count(index);
            let previous = count(index.saturating_sub(1));
            let conversion_rate = if index == 0 {
                1.0
            } else if previous > 0 {
                sessions as f64 / previous as f64
            } else {
                0.0
            };
            FunnelStepReport {
                step_index: index,
                step: step.clone(),
                sessions,
                conversion_rate: round4(conversion_rate),
                drop_off: previous.saturating_sub(sessions),
            }
        })
        .collect();

    FunnelReport {
        funnel_id: funnel.funnel_id.clone(),
        site_id: funnel.site_id.clone(),
        name: funnel.name.clone(),
        from: range.from,
        to: range.to,
        conversion_window_minutes: funnel.conversion_window_minutes,
        steps,
        revenue_total: aggregate.revenue_total,
        revenue_avg: aggregate.revenue_avg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::testing::{at, event};
    use serde_json::json;

    fn funnel(steps: &[&str], window: u32) -> FunnelDefinition {
        FunnelDefinition {
            funnel_id: "checkout".into(),
            site_id: "shop".into(),
            name: "Checkout".into(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
            conversion_window_minutes: window,
            created_at: at(0),
            updated_at: at(0),
        }
    }

    fn query(funnel: FunnelDefinition) -> FunnelAggregateQuery {
        FunnelAggregateQuery {
            funnel,
            range: TimeRange::new(at(-60), at(180)),
            site_id: None,
        }
    }

    fn checkout_events() -> Vec<StoredEvent> {
        let usd = |amount: i64| json!({"amount": amount, "currency": "USD"});
        vec![
            event("shop", "s1", "page_view", 0, json!({})),
            event("shop", "s1", "form_submit", 2, json!({})),
            event("shop", "s1", "purchase", 5, usd(100)),
            event("shop", "s2", "page_view", 10, json!({})),
            event("shop", "s2", "form_submit", 12, json!({})),
            event("shop", "s3", "page_view", 20, json!({})),
            event("shop", "s3", "form_submit", 25, json!({})),
            event("shop", "s3", "purchase", 80, usd(90)),
            event("shop", "s4", "page_view", 30, json!({})),
            event("shop", "s4", "form_submit", 31, json!({})),
            event("shop", "s4", "purchase", 32, usd(120)),
            event("shop", "s4", "refund", 35, usd(20)),
        ]
    }

    #[test]
    fn test_window_bounds_progress() {
        let q = query(funnel(&["page_view", "form_submit", "purchase"], 30));
        let aggregate = aggregate_funnel(&checkout_events(), &q);

        assert_eq!(aggregate.step_sessions, vec![4, 4, 2]);
        assert_eq!(aggregate.base_sessions, 4);
        assert_eq!(aggregate.converted_sessions, 2);
        assert_eq!(aggregate.revenue_total, 200.0);
        assert_eq!(aggregate.revenue_avg, 100.0);

        let report = build_funnel_report(&q.funnel, q.range, &aggregate);
        assert_eq!(report.steps[0].conversion_rate, 1.0);
        assert_eq!(report.steps[0].drop_off, 0);
        assert_eq!(report.steps[2].conversion_rate, 0.5);
        assert_eq!(report.steps[2].drop_off, 2);
    }

    #[test]
    fn test_page_path_steps_and_order() {
        let events = vec![
            // form_submit before the landing page does not count
            event("shop", "a", "form_submit", 0, json!({})),
            event("shop", "a", "page_view", 1, json!({"path": "/pricing"})),
            event("shop", "b", "page_view", 1, json!({"path": "/pricing"})),
            event("shop", "b", "form_submit", 3, json!({})),
            event("blog", "c", "page_view", 1, json!({"path": "/pricing"})),
        ];
        let q = query(funnel(&["/pricing", "form_submit"], 30));
        let aggregate = aggregate_funnel(&events, &q);
        assert_eq!(aggregate.step_sessions, vec![2, 1]);
        assert_eq!(aggregate.revenue_total, 0.0);
        assert_eq!(aggregate.revenue_avg, 0.0);
    }

    #[test]
    fn test_site_override_and_empty_previous_step() {
        let events = vec![event("blog", "c", "page_view", 1, json!({}))];
        let mut q = query(funnel(&["signup", "page_view"], 30));
        q.site_id = Some("blog".into());

        let aggregate = aggregate_funnel(&events, &q);
        assert_eq!(aggregate.step_sessions, vec![0, 0]);

        let report = build_funnel_report(&q.funnel, q.range, &aggregate);
        assert_eq!(report.steps[1].conversion_rate, 0.0);
        assert_eq!(report.steps[1].drop_off, 0);
    }

    #[test]
    fn test_definition_validation() {
        let mut input = FunnelDefinitionInput {
            funnel_id: None,
            site_id: "shop".into(),
            name: "Checkout".into(),
            steps: vec!["page_view".into()],
            conversion_window_minutes: 30,
        };
        assert!(matches!(
            input.validate(),
            Err(ValidationError::OutOfRange { field: "steps", .. })
        ));

        input.steps.push("purchase".into());
        assert_eq!(input.validate(), Ok(()));

        input.conversion_window_minutes = 0;
        assert!(input.validate().is_err());
    }
}
