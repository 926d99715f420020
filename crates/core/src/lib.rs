// Pulse Core
//
// Event model, consent/privacy policy and analytics algorithms shared by every
// Pulse crate.
//
// Key design decisions:
// - No I/O: stores and services live in pulse-storage and pulse-collector
// - Analytics algorithms are pure functions over a slice of StoredEvent so every
//   store backend produces identical results
// - Policy templates, EQS weights and metric settings are plain config structs
// - Errors are thiserror enums scoped to the module that raises them

pub mod analytics;
pub mod eqs;
pub mod event;
pub mod policy;
pub mod privacy;
pub mod revenue;
pub mod telemetry;
pub mod traffic;

pub use analytics::cohort::{
    CohortCondition, CohortDefinition, CohortDefinitionInput, CohortDsl, CohortMetricsConfig,
    CohortRefreshQuery, CohortRefreshResult, CohortSnapshot,
};
pub use analytics::funnel::{
    FunnelAggregate, FunnelAggregateQuery, FunnelDefinition, FunnelDefinitionInput, FunnelReport,
    FunnelStepReport,
};
pub use analytics::page_metrics::{PageMetricsAggregate, PageMetricsQuery, PageMetricsRow};
pub use analytics::paths::{PathQuery, PathReportRow};
pub use eqs::{calculate_eqs, EqsInput, EqsWeights};
pub use event::{
    ConsentState, EventPayload, EventTimestamp, RequestContext, StoredEvent, TimeRange, UserInput,
    UserKind, ValidationError,
};
pub use policy::{
    ConsentPolicyEngine, DeniedBehavior, IpStorageMode, PolicyAction, PolicyDecision,
    PolicyTemplate, ResolvedSitePolicy, SitePolicyOverride,
};
pub use privacy::PrivacyError;
pub use traffic::{TrafficFilter, TrafficFilterConfig, TrafficRejection};
