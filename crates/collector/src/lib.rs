// Pulse Event Collector
//
// Ingestion and analytics on top of a pulse-storage EventStore.
//
// Key design decisions:
// - The ingestion pipeline resolves the site policy first, then deduplicates,
//   then applies consent and privacy rules before a single store insert
// - Analytics services only validate input and apply configured defaults;
//   aggregation lives in pulse-core
// - Background jobs are single-flight and log their own failures

pub mod app;
pub mod config;
pub mod ingestion;
pub mod jobs;
pub mod policy_store;
pub mod services;

pub use app::Collector;
pub use config::CollectorConfig;
pub use ingestion::{IngestError, IngestionOutcome, IngestionService, IngestionStatus};
pub use jobs::{CohortRefreshJob, JobRunner, RetentionJob, ScheduledJob, TickOutcome};
pub use policy_store::{FilePolicyStore, InMemoryPolicyStore, PolicyStore};
pub use services::{
    AnalyticsError, CohortService, FunnelReportRequest, FunnelService, MetricsService,
    PathRequest, PathService,
};
