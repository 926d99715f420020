//! PostgreSQL implementation of EventStore
//!
//! Production persistence using PostgreSQL with:
//! - Deduplication via a UNIQUE (site_id, idempotency_key) constraint
//! - Per-cohort snapshot versions serialized by a transaction-scoped advisory lock
//! - Range/site narrowing in SQL, aggregation in pulse-core

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pulse_core::analytics::cohort::evaluate_cohort_members;
use pulse_core::analytics::funnel::aggregate_funnel;
use pulse_core::analytics::page_metrics::aggregate_page_metrics;
use pulse_core::analytics::paths::mine_top_paths;
use pulse_core::analytics::sampling::is_sampled;
use pulse_core::{
    CohortDefinition, CohortDefinitionInput, CohortDsl, CohortRefreshQuery, CohortRefreshResult,
    ConsentState, DeniedBehavior, FunnelAggregate, FunnelAggregateQuery, FunnelDefinition,
    FunnelDefinitionInput, PageMetricsAggregate, PageMetricsQuery, PathQuery, PathReportRow,
    PolicyTemplate, StoredEvent, TimeRange, UserKind,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};

use super::store::*;

const EVENT_COLUMNS: &str = "event_id, site_id, event_name, event_ts, ingested_at, properties, \
    consent_state, policy_template, denied_behavior, user_kind, user_id, session_id, \
    stable_id_hash, idempotency_key, user_agent, asn, ip_masked, ip_hash, revenue_amount, \
    revenue_currency, product, payment_provider";

const FUNNEL_COLUMNS: &str =
    "site_id, funnel_id, name, steps, conversion_window_minutes, created_at, updated_at";

const COHORT_COLUMNS: &str = "site_id, cohort_id, name, dsl, created_at, updated_at";

/// PostgreSQL implementation of EventStore
///
/// Uses a connection pool; apply the bundled migrations with [`migrate`](Self::migrate)
/// before first use.
///
/// # Example
///
/// ```ignore
/// use pulse_storage::PostgresEventStore;
///
/// let store = PostgresEventStore::connect("postgres://localhost/pulse").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `database_url`
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(|e| {
            error!("Failed to connect to database: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(Self { pool })
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })?;
        info!("Event store migrations applied");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// In-range events, optionally for one site, in insertion order
    async fn fetch_events(
        &self,
        range: &TimeRange,
        site_id: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM pulse_events
            WHERE event_ts >= $1 AND event_ts < $2
              AND ($3::TEXT IS NULL OR site_id = $3)
            ORDER BY seq
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(range.from)
            .bind(range.to)
            .bind(site_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to fetch events: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self))]
    async fn is_duplicate(&self, site_id: &str, idempotency_key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS found FROM pulse_events
            WHERE site_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(site_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to check idempotency key: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.is_some())
    }

    #[instrument(skip(self, event), fields(site_id = %event.site_id, event_name = %event.event_name))]
    async fn insert_event(&self, event: StoredEvent) -> Result<InsertOutcome, StoreError> {
        let properties = serde_json::Value::Object(event.properties.clone());

        let result = sqlx::query(
            r#"
            INSERT INTO pulse_events (
                event_id, site_id, event_name, event_ts, ingested_at, properties,
                consent_state, policy_template, denied_behavior, user_kind, user_id, session_id,
                stable_id_hash, idempotency_key, user_agent, asn, ip_masked, ip_hash,
                revenue_amount, revenue_currency, product, payment_provider
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            ON CONFLICT (site_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(&event.site_id)
        .bind(&event.event_name)
        .bind(event.event_ts)
        .bind(event.ingested_at)
        .bind(&properties)
        .bind(event.consent_state.as_str())
        .bind(event.policy_template.as_str())
        .bind(event.denied_behavior.as_str())
        .bind(event.user_kind.as_str())
        .bind(&event.user_id)
        .bind(&event.session_id)
        .bind(&event.stable_id_hash)
        .bind(&event.idempotency_key)
        .bind(&event.user_agent)
        .bind(event.asn.map(i64::from))
        .bind(&event.ip_masked)
        .bind(&event.ip_hash)
        .bind(event.revenue_amount)
        .bind(&event.revenue_currency)
        .bind(&event.product)
        .bind(&event.payment_provider)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert event: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            debug!(idempotency_key = %event.idempotency_key, "duplicate event rejected");
            return Ok(InsertOutcome::Duplicate);
        }

        debug!(event_id = %event.event_id, "inserted event");
        Ok(InsertOutcome::Inserted)
    }

    #[instrument(skip(self, rules))]
    async fn delete_expired(
        &self,
        rules: &[RetentionRule],
        default_retention_days: u32,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let per_site: HashMap<&str, u32> = rules
            .iter()
            .map(|r| (r.site_id.as_str(), r.retention_days))
            .collect();
        let ruled_sites: Vec<String> = per_site.keys().map(|s| s.to_string()).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut deleted = 0u64;
        for (site_id, days) in &per_site {
            let cutoff = now - Duration::days(i64::from(*days));
            let result = sqlx::query(
                r#"
                DELETE FROM pulse_events
                WHERE site_id = $1 AND ingested_at < $2
                "#,
            )
            .bind(*site_id)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to delete expired events: {}", e);
                StoreError::Database(e.to_string())
            })?;
            deleted += result.rows_affected();
        }

        let default_cutoff = now - Duration::days(i64::from(default_retention_days));
        let result = sqlx::query(
            r#"
            DELETE FROM pulse_events
            WHERE site_id <> ALL($1) AND ingested_at < $2
            "#,
        )
        .bind(&ruled_sites)
        .bind(default_cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to delete expired events: {}", e);
            StoreError::Database(e.to_string())
        })?;
        deleted += result.rows_affected();

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(deleted, "deleted expired events");
        Ok(deleted)
    }

    #[instrument(skip(self, query))]
    async fn query_page_metrics(
        &self,
        query: &PageMetricsQuery,
    ) -> Result<Vec<PageMetricsAggregate>, StoreError> {
        let events = self
            .fetch_events(&query.range, query.site_id.as_deref())
            .await?;
        Ok(aggregate_page_metrics(&events, query))
    }

    #[instrument(skip(self, input), fields(site_id = %input.site_id))]
    async fn upsert_funnel_definition(
        &self,
        input: FunnelDefinitionInput,
    ) -> Result<FunnelDefinition, StoreError> {
        let funnel_id = FunnelDefinition::resolve_id(&input);
        let window = i32::try_from(input.conversion_window_minutes)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let sql = format!(
            r#"
            INSERT INTO pulse_funnel_definitions ({FUNNEL_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (site_id, funnel_id) DO UPDATE
            SET name = EXCLUDED.name,
                steps = EXCLUDED.steps,
                conversion_window_minutes = EXCLUDED.conversion_window_minutes,
                updated_at = EXCLUDED.updated_at
            RETURNING {FUNNEL_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&input.site_id)
            .bind(&funnel_id)
            .bind(&input.name)
            .bind(&input.steps)
            .bind(window)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to upsert funnel definition: {}", e);
                StoreError::Database(e.to_string())
            })?;

        debug!(%funnel_id, "upserted funnel definition");
        funnel_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_funnel_definitions(
        &self,
        site_id: Option<&str>,
    ) -> Result<Vec<FunnelDefinition>, StoreError> {
        let sql = format!(
            r#"
            SELECT {FUNNEL_COLUMNS}
            FROM pulse_funnel_definitions
            WHERE ($1::TEXT IS NULL OR site_id = $1)
            ORDER BY updated_at DESC, site_id COLLATE "C", funnel_id COLLATE "C"
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(site_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list funnel definitions: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(funnel_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_funnel_definition(
        &self,
        funnel_id: &str,
        site_id: Option<&str>,
    ) -> Result<Option<FunnelDefinition>, StoreError> {
        let sql = format!(
            r#"
            SELECT {FUNNEL_COLUMNS}
            FROM pulse_funnel_definitions
            WHERE funnel_id = $1 AND ($2::TEXT IS NULL OR site_id = $2)
            ORDER BY updated_at DESC, site_id COLLATE "C"
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(funnel_id)
            .bind(site_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get funnel definition: {}", e);
                StoreError::Database(e.to_string())
            })?;

        row.as_ref().map(funnel_from_row).transpose()
    }

    #[instrument(skip(self, query), fields(funnel_id = %query.funnel.funnel_id))]
    async fn query_funnel_aggregate(
        &self,
        query: &FunnelAggregateQuery,
    ) -> Result<FunnelAggregate, StoreError> {
        let events = self
            .fetch_events(&query.range, Some(query.site_id()))
            .await?;
        Ok(aggregate_funnel(&events, query))
    }

    #[instrument(skip(self, input), fields(site_id = %input.site_id))]
    async fn upsert_cohort_definition(
        &self,
        input: CohortDefinitionInput,
    ) -> Result<CohortDefinition, StoreError> {
        let cohort_id = CohortDefinition::resolve_id(&input);
        let dsl =
            serde_json::to_value(&input.dsl).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let sql = format!(
            r#"
            INSERT INTO pulse_cohort_definitions ({COHORT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (site_id, cohort_id) DO UPDATE
            SET name = EXCLUDED.name,
                dsl = EXCLUDED.dsl,
                updated_at = EXCLUDED.updated_at
            RETURNING {COHORT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&input.site_id)
            .bind(&cohort_id)
            .bind(&input.name)
            .bind(&dsl)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to upsert cohort definition: {}", e);
                StoreError::Database(e.to_string())
            })?;

        debug!(%cohort_id, "upserted cohort definition");
        cohort_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_cohort_definitions(
        &self,
        site_id: Option<&str>,
    ) -> Result<Vec<CohortDefinition>, StoreError> {
        let sql = format!(
            r#"
            SELECT {COHORT_COLUMNS}
            FROM pulse_cohort_definitions
            WHERE ($1::TEXT IS NULL OR site_id = $1)
            ORDER BY updated_at DESC, site_id COLLATE "C", cohort_id COLLATE "C"
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(site_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list cohort definitions: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(cohort_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_cohort_definition(
        &self,
        cohort_id: &str,
        site_id: Option<&str>,
    ) -> Result<Option<CohortDefinition>, StoreError> {
        let sql = format!(
            r#"
            SELECT {COHORT_COLUMNS}
            FROM pulse_cohort_definitions
            WHERE cohort_id = $1 AND ($2::TEXT IS NULL OR site_id = $2)
            ORDER BY updated_at DESC, site_id COLLATE "C"
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(cohort_id)
            .bind(site_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get cohort definition: {}", e);
                StoreError::Database(e.to_string())
            })?;

        row.as_ref().map(cohort_from_row).transpose()
    }

    #[instrument(skip(self, query), fields(cohort_id = %query.cohort.cohort_id))]
    async fn refresh_cohort_snapshot(
        &self,
        query: &CohortRefreshQuery,
    ) -> Result<CohortRefreshResult, StoreError> {
        let events = self
            .fetch_events(&query.range, Some(&query.cohort.site_id))
            .await?;
        let members = evaluate_cohort_members(&events, query);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        // Released on commit or rollback
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&query.cohort.cohort_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to lock cohort: {}", e);
                StoreError::Database(e.to_string())
            })?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(snapshot_version), 0) + 1 AS next_version
            FROM pulse_cohort_snapshots
            WHERE cohort_id = $1
            "#,
        )
        .bind(&query.cohort.cohort_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        let version: i64 = row.get("next_version");

        let result = CohortRefreshResult::new(query, version, members);
        let snapshot = &result.snapshot;

        sqlx::query(
            r#"
            INSERT INTO pulse_cohort_snapshots (
                cohort_id, site_id, snapshot_version, range_from, range_to,
                built_at, member_count, session_ids
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&snapshot.cohort_id)
        .bind(&snapshot.site_id)
        .bind(snapshot.snapshot_version)
        .bind(snapshot.from)
        .bind(snapshot.to)
        .bind(snapshot.built_at)
        .bind(snapshot.member_count as i64)
        .bind(&result.session_ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to insert cohort snapshot: {}", e);
            StoreError::Database(e.to_string())
        })?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(version, members = snapshot.member_count, "stored cohort snapshot");
        Ok(result)
    }

    #[instrument(skip(self, query), fields(site_id = %query.site_id))]
    async fn query_top_paths(&self, query: &PathQuery) -> Result<Vec<PathReportRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT session_id
            FROM pulse_events
            WHERE site_id = $1 AND event_ts >= $2 AND event_ts < $3
            "#,
        )
        .bind(&query.site_id)
        .bind(query.range.from)
        .bind(query.range.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list path sessions: {}", e);
            StoreError::Database(e.to_string())
        })?;

        // FNV sampling has no SQL equivalent; select the sampled sessions here
        let sampled: Vec<String> = rows
            .iter()
            .map(|row| row.get::<String, _>("session_id"))
            .filter(|id| is_sampled(id, query.sample_rate))
            .collect();
        if sampled.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM pulse_events
            WHERE site_id = $1 AND event_ts >= $2 AND event_ts < $3
              AND session_id = ANY($4)
            ORDER BY session_id COLLATE "C", event_ts, seq
            LIMIT $5
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&query.site_id)
            .bind(query.range.from)
            .bind(query.range.to)
            .bind(&sampled)
            .bind(query.event_fetch_limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to fetch path events: {}", e);
                StoreError::Database(e.to_string())
            })?;

        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mine_top_paths(&events, query))
    }
}

fn event_from_row(row: &PgRow) -> Result<StoredEvent, StoreError> {
    let properties = match row.get::<serde_json::Value, _>("properties") {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    let asn: Option<i64> = row.get("asn");

    Ok(StoredEvent {
        event_id: row.get("event_id"),
        site_id: row.get("site_id"),
        event_name: row.get("event_name"),
        event_ts: row.get("event_ts"),
        ingested_at: row.get("ingested_at"),
        properties,
        consent_state: parse_column(row, "consent_state", ConsentState::parse)?,
        policy_template: parse_column(row, "policy_template", PolicyTemplate::parse)?,
        denied_behavior: parse_column(row, "denied_behavior", DeniedBehavior::parse)?,
        user_kind: parse_column(row, "user_kind", UserKind::parse)?,
        user_id: row.get("user_id"),
        session_id: row.get("session_id"),
        stable_id_hash: row.get("stable_id_hash"),
        idempotency_key: row.get("idempotency_key"),
        user_agent: row.get("user_agent"),
        asn: asn.and_then(|v| u32::try_from(v).ok()),
        ip_masked: row.get("ip_masked"),
        ip_hash: row.get("ip_hash"),
        revenue_amount: row.get("revenue_amount"),
        revenue_currency: row.get("revenue_currency"),
        product: row.get("product"),
        payment_provider: row.get("payment_provider"),
    })
}

fn funnel_from_row(row: &PgRow) -> Result<FunnelDefinition, StoreError> {
    let window: i32 = row.get("conversion_window_minutes");
    Ok(FunnelDefinition {
        funnel_id: row.get("funnel_id"),
        site_id: row.get("site_id"),
        name: row.get("name"),
        steps: row.get("steps"),
        conversion_window_minutes: u32::try_from(window)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn cohort_from_row(row: &PgRow) -> Result<CohortDefinition, StoreError> {
    let dsl: CohortDsl = serde_json::from_value(row.get("dsl"))
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(CohortDefinition {
        cohort_id: row.get("cohort_id"),
        site_id: row.get("site_id"),
        name: row.get("name"),
        dsl,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_column<T>(
    row: &PgRow,
    column: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<T, StoreError> {
    let value: String = row.get(column);
    parse(&value).ok_or_else(|| StoreError::Database(format!("Unknown {}: {}", column, value)))
}
