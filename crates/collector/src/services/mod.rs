// Analytics services
// Services validate requests, fill in configured defaults and call the event store

pub mod cohort;
pub mod funnel;
pub mod metrics;
pub mod paths;

pub use cohort::CohortService;
pub use funnel::{FunnelReportRequest, FunnelService};
pub use metrics::MetricsService;
pub use paths::{PathRequest, PathService};

use pulse_core::ValidationError;
use pulse_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("funnel_not_found: {0}")]
    FunnelNotFound(String),

    #[error("cohort_not_found: {0}")]
    CohortNotFound(String),

    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AnalyticsError {
    /// Stable error code for callers that map errors to responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::FunnelNotFound(_) => "funnel_not_found",
            Self::CohortNotFound(_) => "cohort_not_found",
            Self::Validation(_) => "invalid_request",
            Self::Store(_) => "storage_error",
        }
    }
}
