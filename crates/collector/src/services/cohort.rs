// Cohort service

use std::sync::Arc;

use pulse_core::{
    CohortDefinition, CohortDefinitionInput, CohortMetricsConfig, CohortRefreshQuery,
    CohortRefreshResult, TimeRange,
};
use pulse_storage::EventStore;
use tracing::{debug, instrument};

use super::AnalyticsError;

pub struct CohortService {
    store: Arc<dyn EventStore>,
    metrics: CohortMetricsConfig,
}

impl CohortService {
    pub fn new(store: Arc<dyn EventStore>, metrics: CohortMetricsConfig) -> Self {
        Self { store, metrics }
    }

    #[instrument(skip(self, input), fields(site_id = %input.site_id))]
    pub async fn upsert_definition(
        &self,
        input: CohortDefinitionInput,
    ) -> Result<CohortDefinition, AnalyticsError> {
        input.validate()?;
        let cohort = self.store.upsert_cohort_definition(input).await?;
        debug!(cohort_id = %cohort.cohort_id, "upserted cohort");
        Ok(cohort)
    }

    pub async fn list_definitions(
        &self,
        site_id: Option<&str>,
    ) -> Result<Vec<CohortDefinition>, AnalyticsError> {
        Ok(self.store.list_cohort_definitions(site_id).await?)
    }

    /// Build a new snapshot of one cohort
    #[instrument(skip(self))]
    pub async fn refresh_one(
        &self,
        cohort_id: &str,
        site_id: Option<&str>,
        range: TimeRange,
    ) -> Result<CohortRefreshResult, AnalyticsError> {
        let cohort = self
            .store
            .get_cohort_definition(cohort_id, site_id)
            .await?
            .ok_or_else(|| AnalyticsError::CohortNotFound(cohort_id.to_string()))?;

        self.refresh(cohort, range).await
    }

    /// Build a new snapshot of every cohort, optionally limited to one site
    #[instrument(skip(self))]
    pub async fn refresh_all(
        &self,
        site_id: Option<&str>,
        range: TimeRange,
    ) -> Result<Vec<CohortRefreshResult>, AnalyticsError> {
        let cohorts = self.store.list_cohort_definitions(site_id).await?;
        let mut results = Vec::with_capacity(cohorts.len());
        for cohort in cohorts {
            results.push(self.refresh(cohort, range).await?);
        }
        Ok(results)
    }

    async fn refresh(
        &self,
        cohort: CohortDefinition,
        range: TimeRange,
    ) -> Result<CohortRefreshResult, AnalyticsError> {
        let query = CohortRefreshQuery {
            cohort,
            range,
            metrics: self.metrics,
        };
        let result = self.store.refresh_cohort_snapshot(&query).await?;
        debug!(
            cohort_id = %result.snapshot.cohort_id,
            version = result.snapshot.snapshot_version,
            members = result.snapshot.member_count,
            "refreshed cohort"
        );
        Ok(result)
    }
}
