// Funnel service

use std::sync::Arc;

use pulse_core::analytics::funnel::build_funnel_report;
use pulse_core::{
    FunnelAggregateQuery, FunnelDefinition, FunnelDefinitionInput, FunnelReport, TimeRange,
};
use pulse_storage::EventStore;
use tracing::{debug, instrument};

use super::AnalyticsError;

#[derive(Debug, Clone)]
pub struct FunnelReportRequest {
    pub funnel_id: String,
    pub site_id: Option<String>,
    pub range: TimeRange,
}

pub struct FunnelService {
    store: Arc<dyn EventStore>,
}

impl FunnelService {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, input), fields(site_id = %input.site_id))]
    pub async fn upsert_definition(
        &self,
        input: FunnelDefinitionInput,
    ) -> Result<FunnelDefinition, AnalyticsError> {
        input.validate()?;
        let funnel = self.store.upsert_funnel_definition(input).await?;
        debug!(funnel_id = %funnel.funnel_id, "upserted funnel");
        Ok(funnel)
    }

    pub async fn list_definitions(
        &self,
        site_id: Option<&str>,
    ) -> Result<Vec<FunnelDefinition>, AnalyticsError> {
        Ok(self.store.list_funnel_definitions(site_id).await?)
    }

    /// Step conversion and drop-off for one funnel over `range`
    #[instrument(skip(self))]
    pub async fn get_report(
        &self,
        request: FunnelReportRequest,
    ) -> Result<FunnelReport, AnalyticsError> {
        let funnel = self
            .store
            .get_funnel_definition(&request.funnel_id, request.site_id.as_deref())
            .await?
            .ok_or_else(|| AnalyticsError::FunnelNotFound(request.funnel_id.clone()))?;

        let query = FunnelAggregateQuery {
            funnel,
            range: request.range,
            site_id: request.site_id,
        };
        let aggregate = self.store.query_funnel_aggregate(&query).await?;

        Ok(build_funnel_report(&query.funnel, query.range, &aggregate))
    }
}
