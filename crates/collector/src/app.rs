//! Collector wiring: one store and one policy store shared by every service

use std::sync::Arc;

use pulse_core::TrafficFilter;
use pulse_storage::EventStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::CollectorConfig;
use crate::ingestion::IngestionService;
use crate::jobs::{CohortRefreshJob, JobRunner, RetentionJob};
use crate::policy_store::PolicyStore;
use crate::services::{CohortService, FunnelService, MetricsService, PathService};

pub struct Collector {
    config: CollectorConfig,
    store: Arc<dyn EventStore>,
    policies: Arc<dyn PolicyStore>,
    pub ingestion: IngestionService,
    pub metrics: MetricsService,
    pub funnels: FunnelService,
    pub cohorts: Arc<CohortService>,
    pub paths: PathService,
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        store: Arc<dyn EventStore>,
        policies: Arc<dyn PolicyStore>,
    ) -> Self {
        let mut ingestion =
            IngestionService::new(store.clone(), policies.clone(), config.privacy.clone());
        if !config.traffic_filter.is_noop() {
            ingestion =
                ingestion.with_traffic_filter(TrafficFilter::new(config.traffic_filter.clone()));
        }

        Self {
            ingestion,
            metrics: MetricsService::new(store.clone(), config.metrics.clone()),
            funnels: FunnelService::new(store.clone()),
            cohorts: Arc::new(CohortService::new(
                store.clone(),
                config.metrics.cohort_metrics(),
            )),
            paths: PathService::new(store.clone(), config.paths),
            config,
            store,
            policies,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Start the enabled background jobs; they stop when `shutdown_rx` changes
    pub fn spawn_jobs(&self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let retention = &self.config.retention;
        if retention.enabled {
            info!(
                interval_secs = retention.interval.as_secs(),
                default_retention_days = retention.default_retention_days,
                "Starting retention job"
            );
            let runner = Arc::new(JobRunner::new(RetentionJob::new(
                self.store.clone(),
                self.policies.clone(),
                retention.default_retention_days,
            )));
            handles.push(runner.spawn(retention.interval, shutdown_rx.clone()));
        }

        let refresh = &self.config.cohort_refresh;
        if refresh.enabled {
            info!(
                interval_secs = refresh.interval.as_secs(),
                lookback_days = refresh.lookback_days,
                "Starting cohort refresh job"
            );
            let runner = Arc::new(JobRunner::new(CohortRefreshJob::new(
                self.cohorts.clone(),
                refresh.lookback_days,
            )));
            handles.push(runner.spawn(refresh.interval, shutdown_rx));
        }

        handles
    }
}
