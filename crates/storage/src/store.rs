//! EventStore trait and related types
//!
//! The store owns raw events plus funnel and cohort definitions and the cohort
//! snapshot history. Analytics queries return the same results on every backend
//! because each backend only selects candidate rows and hands them to the
//! pulse-core algorithms.

use async_trait::async_trait;
use pulse_core::{
    CohortDefinition, CohortDefinitionInput, CohortRefreshQuery, CohortRefreshResult,
    FunnelAggregate, FunnelAggregateQuery, FunnelDefinition, FunnelDefinitionInput,
    PageMetricsAggregate, PageMetricsQuery, PathQuery, PathReportRow, StoredEvent,
};

/// Errors from the event store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result of an insert attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another event with the same (site_id, idempotency_key) already exists
    Duplicate,
}

impl std::fmt::Display for InsertOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InsertOutcome::Inserted => write!(f, "inserted"),
            InsertOutcome::Duplicate => write!(f, "duplicate"),
        }
    }
}

/// Per-site retention, in days of ingestion age
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionRule {
    pub site_id: String,
    pub retention_days: u32,
}

impl RetentionRule {
    pub fn new(site_id: impl Into<String>, retention_days: u32) -> Self {
        Self {
            site_id: site_id.into(),
            retention_days,
        }
    }
}

/// Storage for events, analytics definitions and cohort snapshots.
///
/// Implementations must be safe to share between the ingestion path and the
/// background jobs.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    // ============================================
    // Events
    // ============================================

    /// Whether an event with this key was already stored for the site
    async fn is_duplicate(&self, site_id: &str, idempotency_key: &str) -> Result<bool, StoreError>;

    /// Store an event unless its (site_id, idempotency_key) already exists.
    ///
    /// Concurrent inserts of the same key result in exactly one `Inserted`.
    async fn insert_event(&self, event: StoredEvent) -> Result<InsertOutcome, StoreError>;

    /// Remove events whose `ingested_at` is older than their site's retention.
    ///
    /// Sites without a rule use `default_retention_days`. Returns the number
    /// of deleted events.
    async fn delete_expired(
        &self,
        rules: &[RetentionRule],
        default_retention_days: u32,
    ) -> Result<u64, StoreError>;

    // ============================================
    // Page metrics
    // ============================================

    /// Per-page counters for the range, ordered by page path
    async fn query_page_metrics(
        &self,
        query: &PageMetricsQuery,
    ) -> Result<Vec<PageMetricsAggregate>, StoreError>;

    // ============================================
    // Funnels
    // ============================================

    /// Create or replace a funnel, keeping `created_at` on replace
    async fn upsert_funnel_definition(
        &self,
        input: FunnelDefinitionInput,
    ) -> Result<FunnelDefinition, StoreError>;

    /// Funnels ordered by most recently updated
    async fn list_funnel_definitions(
        &self,
        site_id: Option<&str>,
    ) -> Result<Vec<FunnelDefinition>, StoreError>;

    /// Look up a funnel; without a site the most recently updated match wins
    async fn get_funnel_definition(
        &self,
        funnel_id: &str,
        site_id: Option<&str>,
    ) -> Result<Option<FunnelDefinition>, StoreError>;

    async fn query_funnel_aggregate(
        &self,
        query: &FunnelAggregateQuery,
    ) -> Result<FunnelAggregate, StoreError>;

    // ============================================
    // Cohorts
    // ============================================

    /// Create or replace a cohort, keeping `created_at` on replace
    async fn upsert_cohort_definition(
        &self,
        input: CohortDefinitionInput,
    ) -> Result<CohortDefinition, StoreError>;

    /// Cohorts ordered by most recently updated
    async fn list_cohort_definitions(
        &self,
        site_id: Option<&str>,
    ) -> Result<Vec<CohortDefinition>, StoreError>;

    /// Look up a cohort; without a site the most recently updated match wins
    async fn get_cohort_definition(
        &self,
        cohort_id: &str,
        site_id: Option<&str>,
    ) -> Result<Option<CohortDefinition>, StoreError>;

    /// Evaluate membership and persist a new snapshot.
    ///
    /// Versions are allocated per cohort, starting at 1, and never repeat even
    /// when refreshes race.
    async fn refresh_cohort_snapshot(
        &self,
        query: &CohortRefreshQuery,
    ) -> Result<CohortRefreshResult, StoreError>;

    // ============================================
    // Paths
    // ============================================

    async fn query_top_paths(&self, query: &PathQuery) -> Result<Vec<PathReportRow>, StoreError>;
}
