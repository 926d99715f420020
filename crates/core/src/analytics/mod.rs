//! Analytics algorithms over stored events.
//!
//! Every function here takes a candidate slice of events in insertion order and
//! applies its own range/site filtering, so a backend may pass a superset.

pub mod cohort;
pub mod funnel;
pub mod page_metrics;
pub mod paths;
pub mod sampling;

use uuid::Uuid;

use crate::eqs::round_to;

pub(crate) fn round4(value: f64) -> f64 {
    round_to(value, 4)
}

/// Trimmed caller id, or `<prefix>_<uuid>` when blank
pub fn definition_id(requested: Option<&str>, prefix: &str) -> String {
    match requested.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("{prefix}_{}", Uuid::now_v7()),
    }
}
