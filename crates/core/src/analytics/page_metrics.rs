//! Per-page engagement aggregation with gap-based sessionization.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::analytics::round4;
use crate::eqs::{calculate_eqs, round_to, EqsInput, EqsWeights};
use crate::event::{names, StoredEvent, TimeRange};

pub const DEFAULT_BOT_UA_PATTERN: &str =
    "(bot|crawler|spider|headless|slurp|bingpreview|uptime|monitor)";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMetricsQuery {
    pub range: TimeRange,
    pub site_id: Option<String>,
    /// A gap of at least this long starts a new session
    pub session_inactivity_minutes: u32,
    /// Attention credited per `active_attention_ms` event
    pub attention_heartbeat_ms: u64,
    /// Case-insensitive; user agents matching it are excluded
    pub bot_user_agent_pattern: String,
}

/// Raw per-page counters as produced by a store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetricsAggregate {
    pub page_path: String,
    pub page_views: u64,
    /// Page views from bot traffic included in `page_views`
    #[serde(default)]
    pub bot_page_views: u64,
    pub sessions: u64,
    pub active_attention_ms_total: u64,
    pub scroll_read_events: u64,
    pub scroll_base_events: u64,
    pub micro_conversions: u64,
}

/// Page metrics with derived rates and EQS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMetricsRow {
    pub page_path: String,
    pub eqs: f64,
    pub active_attention_ms_avg: u64,
    pub scroll_readthrough_avg: f64,
    pub conversion_rate: f64,
    pub page_views: u64,
    pub sessions: u64,
}

#[derive(Default)]
struct PageAccumulator<'a> {
    page_views: u64,
    attention_events: u64,
    scroll_read_events: u64,
    micro_conversions: u64,
    sessions: HashSet<(&'a str, &'a str, u64)>,
}

/// Aggregate counters per page path, ordered by path.
pub fn aggregate_page_metrics(
    events: &[StoredEvent],
    query: &PageMetricsQuery,
) -> Vec<PageMetricsAggregate> {
    let bot_pattern = RegexBuilder::new(&query.bot_user_agent_pattern)
        .case_insensitive(true)
        .build()
        .ok();
    let is_bot = |event: &StoredEvent| match (&bot_pattern, event.user_agent.as_deref()) {
        (Some(pattern), Some(ua)) if !ua.is_empty() => pattern.is_match(ua),
        _ => false,
    };

    let mut filtered: Vec<&StoredEvent> = events
        .iter()
        .filter(|e| query.range.contains(e.event_ts))
        .filter(|e| query.site_id.as_deref().map_or(true, |site| e.site_id == site))
        .filter(|e| !is_bot(e))
        .collect();
    filtered.sort_by(|a, b| {
        a.site_id
            .cmp(&b.site_id)
            .then_with(|| a.user_id.cmp(&b.user_id))
            .then_with(|| a.event_ts.cmp(&b.event_ts))
    });

    let timeout = Duration::minutes(i64::from(query.session_inactivity_minutes));
    let mut pages: BTreeMap<&str, PageAccumulator<'_>> = BTreeMap::new();
    let mut previous: Option<(&str, &str, DateTime<Utc>, u64)> = None;

    for event in filtered {
        let session_seq = match previous {
            Some((site, user, last_ts, seq)) if site == event.site_id && user == event.user_id => {
                if event.event_ts - last_ts >= timeout {
                    seq + 1
                } else {
                    seq
                }
            }
            _ => 1,
        };
        previous = Some((
            event.site_id.as_str(),
            event.user_id.as_str(),
            event.event_ts,
            session_seq,
        ));

        let page = pages.entry(event.page_path()).or_default();
        match event.event_name.as_str() {
            names::PAGE_VIEW => {
                page.page_views += 1;
                page.sessions
                    .insert((event.site_id.as_str(), event.user_id.as_str(), session_seq));
            }
            names::ACTIVE_ATTENTION => page.attention_events += 1,
            name if names::is_scroll_read(name) => page.scroll_read_events += 1,
            name if names::PAGE_MICRO_CONVERSIONS.contains(&name) => page.micro_conversions += 1,
            _ => {}
        }
    }

    pages
        .into_iter()
        .map(|(path, page)| PageMetricsAggregate {
            page_path: path.to_string(),
            page_views: page.page_views,
            // matching user agents were filtered out above
            bot_page_views: 0,
            sessions: page.sessions.len() as u64,
            active_attention_ms_total: page.attention_events * query.attention_heartbeat_ms,
            scroll_read_events: page.scroll_read_events,
            scroll_base_events: page.page_views,
            micro_conversions: page.micro_conversions,
        })
        .collect()
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Derive rates and EQS, ranked by EQS, then page views, then path.
pub fn build_page_metrics_rows(
    aggregates: Vec<PageMetricsAggregate>,
    weights: &EqsWeights,
) -> Vec<PageMetricsRow> {
    let mut rows: Vec<PageMetricsRow> = aggregates
        .into_iter()
        .map(|row| {
            let attention_avg = ratio(row.active_attention_ms_total, row.page_views);
            let readthrough = ratio(row.scroll_read_events, row.scroll_base_events);
            let conversion_rate = ratio(row.micro_conversions, row.page_views);

            let eqs = calculate_eqs(
                &EqsInput {
                    page_views: row.page_views,
                    bot_page_views: row.bot_page_views,
                    active_attention_ms_avg: attention_avg,
                    scroll_readthrough_avg: readthrough,
                    conversion_rate,
                },
                weights,
            );

            PageMetricsRow {
                page_path: row.page_path,
                eqs,
                active_attention_ms_avg: round_to(attention_avg, 0) as u64,
                scroll_readthrough_avg: round4(readthrough),
                conversion_rate: round4(conversion_rate),
                page_views: row.page_views,
                sessions: row.sessions,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.eqs
            .total_cmp(&a.eqs)
            .then_with(|| b.page_views.cmp(&a.page_views))
            .then_with(|| a.page_path.cmp(&b.page_path))
    });
    rows
}
