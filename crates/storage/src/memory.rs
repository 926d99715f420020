//! In-memory implementation of EventStore for dev mode and tests

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use pulse_core::analytics::cohort::evaluate_cohort_members;
use pulse_core::analytics::funnel::aggregate_funnel;
use pulse_core::analytics::page_metrics::aggregate_page_metrics;
use pulse_core::analytics::paths::mine_top_paths;
use pulse_core::{
    CohortDefinition, CohortDefinitionInput, CohortRefreshQuery, CohortRefreshResult,
    FunnelAggregate, FunnelAggregateQuery, FunnelDefinition, FunnelDefinitionInput,
    PageMetricsAggregate, PageMetricsQuery, PathQuery, PathReportRow, StoredEvent,
};
use tracing::debug;

use super::store::*;

/// Events in insertion order plus the dedup index over them
#[derive(Default)]
struct EventLog {
    events: Vec<StoredEvent>,
    keys: HashSet<(String, String)>,
}

type DefinitionKey = (String, String);

/// In-memory implementation of EventStore
///
/// Used in dev mode and by the test suites. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use pulse_storage::InMemoryEventStore;
///
/// let store = InMemoryEventStore::new();
/// assert_eq!(store.event_count(), 0);
/// ```
pub struct InMemoryEventStore {
    log: RwLock<EventLog>,
    funnels: RwLock<HashMap<DefinitionKey, FunnelDefinition>>,
    cohorts: RwLock<HashMap<DefinitionKey, CohortDefinition>>,
    snapshots: RwLock<Vec<CohortRefreshResult>>,
}

impl InMemoryEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            log: RwLock::new(EventLog::default()),
            funnels: RwLock::new(HashMap::new()),
            cohorts: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(Vec::new()),
        }
    }

    /// Get the number of stored events
    pub fn event_count(&self) -> usize {
        self.log.read().events.len()
    }

    /// Snapshots for a cohort, oldest first
    pub fn snapshots(&self, cohort_id: &str) -> Vec<CohortRefreshResult> {
        self.snapshots
            .read()
            .iter()
            .filter(|s| s.snapshot.cohort_id == cohort_id)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared lookup/listing rules for funnel and cohort definitions
trait Definition: Clone {
    fn id(&self) -> &str;
    fn site_id(&self) -> &str;
    fn updated_at(&self) -> DateTime<Utc>;
}

impl Definition for FunnelDefinition {
    fn id(&self) -> &str {
        &self.funnel_id
    }
    fn site_id(&self) -> &str {
        &self.site_id
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Definition for CohortDefinition {
    fn id(&self) -> &str {
        &self.cohort_id
    }
    fn site_id(&self) -> &str {
        &self.site_id
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Most recently updated first; ties by site then id
fn newest_first<T: Definition>(a: &T, b: &T) -> std::cmp::Ordering {
    b.updated_at()
        .cmp(&a.updated_at())
        .then_with(|| a.site_id().cmp(b.site_id()))
        .then_with(|| a.id().cmp(b.id()))
}

fn list_definitions<T: Definition>(
    definitions: &HashMap<DefinitionKey, T>,
    site_id: Option<&str>,
) -> Vec<T> {
    let mut items: Vec<T> = definitions
        .values()
        .filter(|d| site_id.map_or(true, |site| d.site_id() == site))
        .cloned()
        .collect();
    items.sort_by(newest_first);
    items
}

fn find_definition<T: Definition>(
    definitions: &HashMap<DefinitionKey, T>,
    id: &str,
    site_id: Option<&str>,
) -> Option<T> {
    match site_id {
        Some(site) => definitions
            .get(&(site.to_string(), id.to_string()))
            .cloned(),
        None => definitions
            .values()
            .filter(|d| d.id() == id)
            .min_by(|a, b| newest_first(*a, *b))
            .cloned(),
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn is_duplicate(&self, site_id: &str, idempotency_key: &str) -> Result<bool, StoreError> {
        let log = self.log.read();
        Ok(log
            .keys
            .contains(&(site_id.to_string(), idempotency_key.to_string())))
    }

    async fn insert_event(&self, event: StoredEvent) -> Result<InsertOutcome, StoreError> {
        let mut log = self.log.write();
        let key = (event.site_id.clone(), event.idempotency_key.clone());
        if log.keys.contains(&key) {
            debug!(site_id = %key.0, idempotency_key = %key.1, "duplicate event rejected");
            return Ok(InsertOutcome::Duplicate);
        }
        log.keys.insert(key);
        log.events.push(event);
        Ok(InsertOutcome::Inserted)
    }

    async fn delete_expired(
        &self,
        rules: &[RetentionRule],
        default_retention_days: u32,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let cutoffs: HashMap<&str, DateTime<Utc>> = rules
            .iter()
            .map(|r| {
                (
                    r.site_id.as_str(),
                    now - Duration::days(i64::from(r.retention_days)),
                )
            })
            .collect();
        let default_cutoff = now - Duration::days(i64::from(default_retention_days));

        let mut log = self.log.write();
        let before = log.events.len();
        log.events.retain(|e| {
            let cutoff = cutoffs
                .get(e.site_id.as_str())
                .copied()
                .unwrap_or(default_cutoff);
            e.ingested_at >= cutoff
        });
        let deleted = (before - log.events.len()) as u64;

        if deleted > 0 {
            let keys = log
                .events
                .iter()
                .map(|e| (e.site_id.clone(), e.idempotency_key.clone()))
                .collect();
            log.keys = keys;
        }
        debug!(deleted, "deleted expired events");
        Ok(deleted)
    }

    async fn query_page_metrics(
        &self,
        query: &PageMetricsQuery,
    ) -> Result<Vec<PageMetricsAggregate>, StoreError> {
        let log = self.log.read();
        Ok(aggregate_page_metrics(&log.events, query))
    }

    async fn upsert_funnel_definition(
        &self,
        input: FunnelDefinitionInput,
    ) -> Result<FunnelDefinition, StoreError> {
        let funnel_id = FunnelDefinition::resolve_id(&input);
        let key = (input.site_id.clone(), funnel_id.clone());

        let mut funnels = self.funnels.write();
        let record = FunnelDefinition::upserted(funnel_id, input, funnels.get(&key), Utc::now());
        funnels.insert(key, record.clone());
        debug!(
            funnel_id = %record.funnel_id,
            site_id = %record.site_id,
            "upserted funnel definition"
        );
        Ok(record)
    }

    async fn list_funnel_definitions(
        &self,
        site_id: Option<&str>,
    ) -> Result<Vec<FunnelDefinition>, StoreError> {
        Ok(list_definitions(&self.funnels.read(), site_id))
    }

    async fn get_funnel_definition(
        &self,
        funnel_id: &str,
        site_id: Option<&str>,
    ) -> Result<Option<FunnelDefinition>, StoreError> {
        Ok(find_definition(&self.funnels.read(), funnel_id, site_id))
    }

    async fn query_funnel_aggregate(
        &self,
        query: &FunnelAggregateQuery,
    ) -> Result<FunnelAggregate, StoreError> {
        let log = self.log.read();
        Ok(aggregate_funnel(&log.events, query))
    }

    async fn upsert_cohort_definition(
        &self,
        input: CohortDefinitionInput,
    ) -> Result<CohortDefinition, StoreError> {
        let cohort_id = CohortDefinition::resolve_id(&input);
        let key = (input.site_id.clone(), cohort_id.clone());

        let mut cohorts = self.cohorts.write();
        let record = CohortDefinition::upserted(cohort_id, input, cohorts.get(&key), Utc::now());
        cohorts.insert(key, record.clone());
        debug!(
            cohort_id = %record.cohort_id,
            site_id = %record.site_id,
            "upserted cohort definition"
        );
        Ok(record)
    }

    async fn list_cohort_definitions(
        &self,
        site_id: Option<&str>,
    ) -> Result<Vec<CohortDefinition>, StoreError> {
        Ok(list_definitions(&self.cohorts.read(), site_id))
    }

    async fn get_cohort_definition(
        &self,
        cohort_id: &str,
        site_id: Option<&str>,
    ) -> Result<Option<CohortDefinition>, StoreError> {
        Ok(find_definition(&self.cohorts.read(), cohort_id, site_id))
    }

    async fn refresh_cohort_snapshot(
        &self,
        query: &CohortRefreshQuery,
    ) -> Result<CohortRefreshResult, StoreError> {
        let members = {
            let log = self.log.read();
            evaluate_cohort_members(&log.events, query)
        };

        // version allocation and append happen under one write lock
        let mut snapshots = self.snapshots.write();
        let version = snapshots
            .iter()
            .filter(|s| s.snapshot.cohort_id == query.cohort.cohort_id)
            .map(|s| s.snapshot.snapshot_version)
            .max()
            .unwrap_or(0)
            + 1;
        let result = CohortRefreshResult::new(query, version, members);
        snapshots.push(result.clone());
        debug!(
            cohort_id = %query.cohort.cohort_id,
            version,
            members = result.snapshot.member_count,
            "stored cohort snapshot"
        );
        Ok(result)
    }

    async fn query_top_paths(&self, query: &PathQuery) -> Result<Vec<PathReportRow>, StoreError> {
        let log = self.log.read();
        Ok(mine_top_paths(&log.events, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{ConsentState, DeniedBehavior, PolicyTemplate, UserKind};
    use std::sync::Arc;
    use uuid::Uuid;

    fn event(site: &str, key: &str, age_days: i64) -> StoredEvent {
        let now = Utc::now();
        StoredEvent {
            event_id: Uuid::now_v7(),
            site_id: site.to_string(),
            event_name: "page_view".to_string(),
            event_ts: now,
            ingested_at: now - Duration::days(age_days),
            properties: serde_json::Map::new(),
            consent_state: ConsentState::Granted,
            policy_template: PolicyTemplate::Balanced,
            denied_behavior: DeniedBehavior::Minimal,
            user_kind: UserKind::Anonymous,
            user_id: "anon:s1".to_string(),
            session_id: "s1".to_string(),
            stable_id_hash: None,
            idempotency_key: key.to_string(),
            user_agent: None,
            asn: None,
            ip_masked: None,
            ip_hash: None,
            revenue_amount: None,
            revenue_currency: None,
            product: None,
            payment_provider: None,
        }
    }

    #[tokio::test]
    async fn test_concurrent_inserts_store_one_row() {
        let store = Arc::new(InMemoryEventStore::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.insert_event(event("site", "k1", 0)).await })
            })
            .collect();

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == InsertOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_same_key_on_other_site_is_not_duplicate() {
        let store = InMemoryEventStore::new();
        store.insert_event(event("a", "k1", 0)).await.unwrap();
        assert_eq!(
            store.insert_event(event("b", "k1", 0)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert!(!store.is_duplicate("c", "k1").await.unwrap());
    }

    #[tokio::test]
    async fn test_retention_forgets_deleted_keys() {
        let store = InMemoryEventStore::new();
        store.insert_event(event("short", "old", 10)).await.unwrap();
        store.insert_event(event("short", "new", 1)).await.unwrap();
        store.insert_event(event("other", "old", 10)).await.unwrap();

        let deleted = store
            .delete_expired(&[RetentionRule::new("short", 7)], 30)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(!store.is_duplicate("short", "old").await.unwrap());
        assert!(store.is_duplicate("short", "new").await.unwrap());
        assert!(store.is_duplicate("other", "old").await.unwrap());
    }
}
