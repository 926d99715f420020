//! Navigation path mining between a start and an end event.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::analytics::round4;
use crate::analytics::sampling::is_sampled;
use crate::event::{check_len, names, StoredEvent, TimeRange, ValidationError};

pub const PATH_SEPARATOR: &str = " > ";

pub const DEFAULT_TOP_N: usize = 20;
pub const DEFAULT_MAX_PATH_LENGTH: usize = 8;
pub const DEFAULT_SAMPLE_RATE: f64 = 1.0;
pub const DEFAULT_EVENT_FETCH_LIMIT: usize = 300_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathQuery {
    pub site_id: String,
    pub range: TimeRange,
    pub start_event: String,
    pub end_event: String,
    pub top_n: usize,
    pub max_path_length: usize,
    /// Fraction of sessions kept, chosen deterministically per session id
    pub sample_rate: f64,
    /// Cap on sampled events considered, in (session id, ts) order
    pub event_fetch_limit: usize,
}

impl PathQuery {
    pub fn new(
        site_id: impl Into<String>,
        range: TimeRange,
        start_event: impl Into<String>,
        end_event: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            range,
            start_event: start_event.into(),
            end_event: end_event.into(),
            top_n: DEFAULT_TOP_N,
            max_path_length: DEFAULT_MAX_PATH_LENGTH,
            sample_rate: DEFAULT_SAMPLE_RATE,
            event_fetch_limit: DEFAULT_EVENT_FETCH_LIMIT,
        }
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    pub fn with_max_path_length(mut self, max_path_length: usize) -> Self {
        self.max_path_length = max_path_length;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_event_fetch_limit(mut self, limit: usize) -> Self {
        self.event_fetch_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.site_id.is_empty() {
            return Err(ValidationError::MissingField("site_id"));
        }
        check_len("start_event", &self.start_event, 128)?;
        check_len("end_event", &self.end_event, 128)?;
        if !(1..=100).contains(&self.top_n) {
            return Err(ValidationError::out_of_range(
                "top_n",
                "must be between 1 and 100",
            ));
        }
        if !(2..=20).contains(&self.max_path_length) {
            return Err(ValidationError::out_of_range(
                "max_path_length",
                "must be between 2 and 20",
            ));
        }
        if !(0.01..=1.0).contains(&self.sample_rate) {
            return Err(ValidationError::out_of_range(
                "sample_rate",
                "must be between 0.01 and 1",
            ));
        }
        if !(1_000..=2_000_000).contains(&self.event_fetch_limit) {
            return Err(ValidationError::out_of_range(
                "event_fetch_limit",
                "must be between 1000 and 2000000",
            ));
        }
        Ok(())
    }

    /// Whether `event` is a candidate for this query before the fetch limit
    pub fn selects(&self, event: &StoredEvent) -> bool {
        event.site_id == self.site_id
            && self.range.contains(event.event_ts)
            && is_sampled(&event.session_id, self.sample_rate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathReportRow {
    pub path: String,
    pub sessions: u64,
    pub conversion_sessions: u64,
    pub revenue_total: f64,
    pub revenue_avg: f64,
    /// Share of all conversion sessions across aggregated paths
    pub conversion_contribution: f64,
}

#[derive(Default)]
struct PathAccumulator {
    sessions: u64,
    conversion_sessions: u64,
    revenue_total: f64,
}

/// Start-to-end segment of one session's ordered events
fn session_segment<'a>(
    session: &[&'a StoredEvent],
    query: &PathQuery,
) -> Option<Vec<&'a StoredEvent>> {
    let start = session
        .iter()
        .position(|e| e.event_name == query.start_event)?;
    let end = start
        + session[start..]
            .iter()
            .position(|e| e.event_name == query.end_event)?;
    Some(session[start..=end].to_vec())
}

/// Keep the first `max - 1` steps and the final one
fn truncated_names<'a>(segment: &[&'a StoredEvent], max_len: usize) -> Vec<&'a str> {
    let labels: Vec<&str> = segment.iter().map(|e| e.event_name.as_str()).collect();
    let max_len = max_len.max(1);
    if labels.len() <= max_len {
        return labels;
    }
    let mut kept = labels[..max_len - 1].to_vec();
    kept.push(labels[labels.len() - 1]);
    kept
}

/// Rank the most common start-to-end paths.
pub fn mine_top_paths(events: &[StoredEvent], query: &PathQuery) -> Vec<PathReportRow> {
    let mut candidates: Vec<&StoredEvent> = events.iter().filter(|e| query.selects(e)).collect();
    candidates.sort_by(|a, b| {
        a.session_id
            .cmp(&b.session_id)
            .then_with(|| a.event_ts.cmp(&b.event_ts))
    });
    candidates.truncate(query.event_fetch_limit);

    let mut aggregates: HashMap<String, PathAccumulator> = HashMap::new();
    for session in candidates.chunk_by(|a, b| a.session_id == b.session_id) {
        let Some(segment) = session_segment(session, query) else {
            continue;
        };

        let path = truncated_names(&segment, query.max_path_length).join(PATH_SEPARATOR);
        let revenue: f64 = segment.iter().map(|e| e.revenue_delta()).sum();
        let converted = segment
            .iter()
            .any(|e| names::is_positive_revenue(&e.event_name));

        let row = aggregates.entry(path).or_default();
        row.sessions += 1;
        row.conversion_sessions += u64::from(converted);
        row.revenue_total += revenue;
    }

    let total_conversions: u64 = aggregates.values().map(|r| r.conversion_sessions).sum();

    let mut rows: Vec<PathReportRow> = aggregates
        .into_iter()
        .map(|(path, row)| PathReportRow {
            path,
            sessions: row.sessions,
            conversion_sessions: row.conversion_sessions,
            revenue_total: round4(row.revenue_total),
            revenue_avg: if row.sessions > 0 {
                round4(row.revenue_total / row.sessions as f64)
            } else {
                0.0
            },
            conversion_contribution: if total_conversions > 0 {
                round4(row.conversion_sessions as f64 / total_conversions as f64)
            } else {
                0.0
            },
        })
        .collect();

    rows.sort_by(|a, b| {
        b.sessions
            .cmp(&a.sessions)
            .then_with(|| b.revenue_total.total_cmp(&a.revenue_total))
            .then_with(|| a.path.cmp(&b.path))
    });
    rows.truncate(query.top_n);
    rows
}
