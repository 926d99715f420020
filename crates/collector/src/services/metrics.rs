// Page metrics service

use std::sync::Arc;

use pulse_core::analytics::page_metrics::build_page_metrics_rows;
use pulse_core::{PageMetricsRow, TimeRange};
use pulse_storage::EventStore;
use tracing::{debug, instrument};

use super::AnalyticsError;
use crate::config::MetricsConfig;

pub struct MetricsService {
    store: Arc<dyn EventStore>,
    config: MetricsConfig,
}

impl MetricsService {
    pub fn new(store: Arc<dyn EventStore>, config: MetricsConfig) -> Self {
        Self { store, config }
    }

    /// Per-page engagement ranked by EQS
    #[instrument(skip(self))]
    pub async fn get_page_metrics(
        &self,
        range: TimeRange,
        site_id: Option<&str>,
    ) -> Result<Vec<PageMetricsRow>, AnalyticsError> {
        let query = self
            .config
            .page_metrics_query(range, site_id.map(String::from));
        let aggregates = self.store.query_page_metrics(&query).await?;
        let rows = build_page_metrics_rows(aggregates, &self.config.eqs_weights);

        debug!(pages = rows.len(), "built page metrics");
        Ok(rows)
    }
}
