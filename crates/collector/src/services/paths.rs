// Path service

use std::sync::Arc;

use pulse_core::{PathQuery, PathReportRow, TimeRange};
use pulse_storage::EventStore;
use tracing::instrument;

use super::AnalyticsError;
use crate::config::PathDefaults;

/// Path query where unset tuning fields take the configured defaults
#[derive(Debug, Clone)]
pub struct PathRequest {
    pub site_id: String,
    pub range: TimeRange,
    pub start_event: String,
    pub end_event: String,
    pub top_n: Option<usize>,
    pub max_path_length: Option<usize>,
    pub sample_rate: Option<f64>,
    pub event_fetch_limit: Option<usize>,
}

impl PathRequest {
    pub fn new(
        site_id: impl Into<String>,
        range: TimeRange,
        start_event: impl Into<String>,
        end_event: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            range,
            start_event: start_event.into(),
            end_event: end_event.into(),
            top_n: None,
            max_path_length: None,
            sample_rate: None,
            event_fetch_limit: None,
        }
    }

    fn into_query(self, defaults: &PathDefaults) -> PathQuery {
        PathQuery::new(self.site_id, self.range, self.start_event, self.end_event)
            .with_top_n(self.top_n.unwrap_or(defaults.top_n))
            .with_max_path_length(self.max_path_length.unwrap_or(defaults.max_path_length))
            .with_sample_rate(self.sample_rate.unwrap_or(defaults.sample_rate))
            .with_event_fetch_limit(self.event_fetch_limit.unwrap_or(defaults.event_fetch_limit))
    }
}

pub struct PathService {
    store: Arc<dyn EventStore>,
    defaults: PathDefaults,
}

impl PathService {
    pub fn new(store: Arc<dyn EventStore>, defaults: PathDefaults) -> Self {
        Self { store, defaults }
    }

    #[instrument(skip(self))]
    pub async fn query_top_paths(
        &self,
        request: PathRequest,
    ) -> Result<Vec<PathReportRow>, AnalyticsError> {
        let query = request.into_query(&self.defaults);
        query.validate()?;
        Ok(self.store.query_top_paths(&query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_request_defaults() {
        let range = TimeRange::new(Utc::now(), Utc::now());
        let defaults = PathDefaults {
            top_n: 5,
            ..Default::default()
        };

        let query = PathRequest::new("site", range, "page_view", "purchase").into_query(&defaults);
        assert_eq!(query.top_n, 5);
        assert_eq!(query.max_path_length, 8);
        assert_eq!(query.event_fetch_limit, 300_000);

        let mut request = PathRequest::new("site", range, "page_view", "purchase");
        request.max_path_length = Some(3);
        request.sample_rate = Some(0.5);
        let query = request.into_query(&defaults);
        assert_eq!(query.max_path_length, 3);
        assert_eq!(query.sample_rate, 0.5);
    }
}
