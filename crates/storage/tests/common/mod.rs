//! Conformance suite shared by every EventStore backend
//!
//! Each check takes the site id to write under so backends on a shared
//! database stay isolated between runs.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::join_all;
use pulse_core::revenue::parse_revenue_fields;
use pulse_core::{
    CohortCondition, CohortDefinitionInput, CohortDsl, CohortMetricsConfig, CohortRefreshQuery,
    ConsentState, DeniedBehavior, EqsWeights, FunnelAggregateQuery, FunnelDefinitionInput,
    PageMetricsAggregate, PageMetricsQuery, PathQuery, PolicyTemplate, StoredEvent, TimeRange,
    UserKind,
};
use pulse_storage::{EventStore, InsertOutcome, RetentionRule};
use serde_json::{json, Value};
use uuid::Uuid;

pub fn unique_site(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::now_v7())
}

pub fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 14, 0, 0, 0).unwrap()
}

pub fn at(minutes: i64) -> DateTime<Utc> {
    base() + Duration::minutes(minutes)
}

pub fn range() -> TimeRange {
    TimeRange::new(at(-60), at(180))
}

pub fn event(site: &str, session: &str, name: &str, minutes: i64, properties: Value) -> StoredEvent {
    let properties = properties.as_object().cloned().unwrap_or_default();
    let revenue = parse_revenue_fields(name, &properties);
    StoredEvent {
        event_id: Uuid::now_v7(),
        site_id: site.to_string(),
        event_name: name.to_string(),
        event_ts: at(minutes),
        ingested_at: Utc::now(),
        properties,
        consent_state: ConsentState::Granted,
        policy_template: PolicyTemplate::Balanced,
        denied_behavior: DeniedBehavior::Minimal,
        user_kind: UserKind::Anonymous,
        user_id: format!("anon:{session}"),
        session_id: session.to_string(),
        stable_id_hash: None,
        idempotency_key: Uuid::now_v7().to_string(),
        user_agent: None,
        asn: None,
        ip_masked: None,
        ip_hash: None,
        revenue_amount: revenue.amount,
        revenue_currency: revenue.currency,
        product: revenue.product,
        payment_provider: revenue.payment_provider,
    }
}

fn usd(amount: i64) -> Value {
    json!({"amount": amount, "currency": "USD"})
}

async fn insert_all<S: EventStore>(store: &S, events: Vec<StoredEvent>) {
    for event in events {
        assert_eq!(
            store.insert_event(event).await.unwrap(),
            InsertOutcome::Inserted
        );
    }
}

pub async fn check_deduplication<S: EventStore>(store: &S, site: &str) {
    let mut original = event(site, "s1", "page_view", 0, json!({"path": "/"}));
    original.idempotency_key = "key-1".to_string();

    let attempts = (0..8).map(|_| {
        let mut copy = original.clone();
        copy.event_id = Uuid::now_v7();
        store.insert_event(copy)
    });
    let outcomes: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let inserted = outcomes
        .iter()
        .filter(|o| **o == InsertOutcome::Inserted)
        .count();
    assert_eq!(inserted, 1);
    assert!(store.is_duplicate(site, "key-1").await.unwrap());
    assert!(!store.is_duplicate(site, "key-2").await.unwrap());
}

pub async fn check_page_metrics<S: EventStore>(store: &S, site: &str) {
    insert_all(
        store,
        vec![
            event(site, "u1", "page_view", 0, json!({"path": "/a"})),
            event(site, "u1", "active_attention_ms", 1, json!({"path": "/a"})),
            event(site, "u1", "scroll_depth_100", 2, json!({"path": "/a"})),
            event(site, "u1", "page_view", 40, json!({"path": "/a"})),
            event(site, "u2", "page_view", 5, json!({"path": "/b"})),
            event(site, "u2", "outbound_click", 6, json!({"path": "/b"})),
            // outside the range
            event(site, "u2", "page_view", 600, json!({"path": "/b"})),
        ],
    )
    .await;

    let query = PageMetricsQuery {
        range: range(),
        site_id: Some(site.to_string()),
        session_inactivity_minutes: 30,
        attention_heartbeat_ms: 5000,
        bot_user_agent_pattern: pulse_core::analytics::page_metrics::DEFAULT_BOT_UA_PATTERN
            .to_string(),
    };
    let rows = store.query_page_metrics(&query).await.unwrap();

    assert_eq!(
        rows,
        vec![
            PageMetricsAggregate {
                page_path: "/a".into(),
                page_views: 2,
                bot_page_views: 0,
                sessions: 2,
                active_attention_ms_total: 5000,
                scroll_read_events: 1,
                scroll_base_events: 2,
                micro_conversions: 0,
            },
            PageMetricsAggregate {
                page_path: "/b".into(),
                page_views: 1,
                bot_page_views: 0,
                sessions: 1,
                active_attention_ms_total: 0,
                scroll_read_events: 0,
                scroll_base_events: 1,
                micro_conversions: 1,
            },
        ]
    );
}

pub async fn check_funnel_fixture<S: EventStore>(store: &S, site: &str) {
    insert_all(
        store,
        vec![
            event(site, "s1", "page_view", 0, json!({})),
            event(site, "s1", "form_submit", 2, json!({})),
            event(site, "s1", "purchase", 5, usd(100)),
            event(site, "s2", "page_view", 10, json!({})),
            event(site, "s2", "form_submit", 12, json!({})),
            event(site, "s3", "page_view", 20, json!({})),
            event(site, "s3", "form_submit", 25, json!({})),
            event(site, "s3", "purchase", 80, usd(90)),
            event(site, "s4", "page_view", 30, json!({})),
            event(site, "s4", "form_submit", 31, json!({})),
            event(site, "s4", "purchase", 32, usd(120)),
            event(site, "s4", "refund", 35, usd(20)),
        ],
    )
    .await;

    let funnel = store
        .upsert_funnel_definition(FunnelDefinitionInput {
            funnel_id: Some("  checkout  ".into()),
            site_id: site.to_string(),
            name: "Checkout".into(),
            steps: vec!["page_view".into(), "form_submit".into(), "purchase".into()],
            conversion_window_minutes: 30,
        })
        .await
        .unwrap();
    assert_eq!(funnel.funnel_id, "checkout");

    let aggregate = store
        .query_funnel_aggregate(&FunnelAggregateQuery {
            funnel,
            range: range(),
            site_id: None,
        })
        .await
        .unwrap();

    assert_eq!(aggregate.step_sessions, vec![4, 4, 2]);
    assert_eq!(aggregate.base_sessions, 4);
    assert_eq!(aggregate.converted_sessions, 2);
    assert_eq!(aggregate.revenue_total, 200.0);
    assert_eq!(aggregate.revenue_avg, 100.0);
}

fn funnel_input(site: &str, funnel_id: Option<&str>, name: &str) -> FunnelDefinitionInput {
    FunnelDefinitionInput {
        funnel_id: funnel_id.map(str::to_string),
        site_id: site.to_string(),
        name: name.to_string(),
        steps: vec!["page_view".into(), "signup".into()],
        conversion_window_minutes: 60,
    }
}

pub async fn check_definition_upserts<S: EventStore>(store: &S, site: &str) {
    let pause = || tokio::time::sleep(StdDuration::from_millis(20));
    let signup_id = format!("{site}-signup");

    let generated = store
        .upsert_funnel_definition(funnel_input(site, None, "Generated"))
        .await
        .unwrap();
    assert!(generated.funnel_id.starts_with("funnel_"));
    pause().await;

    let first = store
        .upsert_funnel_definition(funnel_input(site, Some(&signup_id), "Signup"))
        .await
        .unwrap();
    pause().await;
    let second = store
        .upsert_funnel_definition(funnel_input(site, Some(&signup_id), "Signup v2"))
        .await
        .unwrap();
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at > first.updated_at);
    assert_eq!(second.name, "Signup v2");
    pause().await;

    let pricing = store
        .upsert_funnel_definition(funnel_input(site, Some("pricing"), "Pricing"))
        .await
        .unwrap();

    let listed: Vec<String> = store
        .list_funnel_definitions(Some(site))
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.funnel_id)
        .collect();
    assert_eq!(
        listed,
        vec![pricing.funnel_id, signup_id.clone(), generated.funnel_id]
    );

    let by_site = store
        .get_funnel_definition(&signup_id, Some(site))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_site, second);
    let any_site = store
        .get_funnel_definition(&signup_id, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(any_site, second);
    assert!(store
        .get_funnel_definition("missing", Some(site))
        .await
        .unwrap()
        .is_none());

    let cohort_id = format!("{site}-buyers");
    let cohort = store
        .upsert_cohort_definition(CohortDefinitionInput {
            cohort_id: Some(cohort_id.clone()),
            site_id: site.to_string(),
            name: "Buyers".into(),
            dsl: CohortDsl {
                all: vec![CohortCondition::HasEvent {
                    event_name: "purchase".into(),
                }],
            },
        })
        .await
        .unwrap();
    let fetched = store
        .get_cohort_definition(&cohort_id, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched, cohort);
    assert_eq!(
        store.list_cohort_definitions(Some(site)).await.unwrap(),
        vec![cohort]
    );
}

pub async fn check_cohort_versions<S: EventStore>(store: &S, site: &str) {
    insert_all(
        store,
        vec![
            event(site, "c1", "page_view", 0, json!({})),
            event(site, "c1", "page_view", 1, json!({})),
            event(site, "c1", "purchase", 2, usd(10)),
            event(site, "c2", "page_view", 0, json!({})),
        ],
    )
    .await;

    let cohort = store
        .upsert_cohort_definition(CohortDefinitionInput {
            cohort_id: None,
            site_id: site.to_string(),
            name: "Returning".into(),
            dsl: CohortDsl {
                all: vec![CohortCondition::VisitCountGte { value: 2 }],
            },
        })
        .await
        .unwrap();
    assert!(cohort.cohort_id.starts_with("cohort_"));

    let query = CohortRefreshQuery {
        cohort,
        range: range(),
        metrics: CohortMetricsConfig {
            eqs_weights: EqsWeights::default(),
            attention_heartbeat_ms: 5000,
        },
    };

    let first = store.refresh_cohort_snapshot(&query).await.unwrap();
    let second = store.refresh_cohort_snapshot(&query).await.unwrap();
    assert_eq!(first.snapshot.snapshot_version, 1);
    assert_eq!(second.snapshot.snapshot_version, 2);
    assert_eq!(first.session_ids, vec!["c1"]);
    assert_eq!(second.session_ids, first.session_ids);
    assert_eq!(second.snapshot.member_count, 1);

    // racing refreshes still get distinct versions
    let racing = join_all((0..4).map(|_| store.refresh_cohort_snapshot(&query))).await;
    let versions: BTreeSet<i64> = racing
        .into_iter()
        .map(|r| r.unwrap().snapshot.snapshot_version)
        .collect();
    assert_eq!(versions, BTreeSet::from([3, 4, 5, 6]));
}

pub async fn check_top_paths<S: EventStore>(store: &S, site: &str) {
    insert_all(
        store,
        vec![
            event(site, "p1", "page_view", 0, json!({})),
            event(site, "p1", "product_view", 1, json!({})),
            event(site, "p1", "purchase", 2, usd(50)),
            event(site, "p2", "page_view", 0, json!({})),
            event(site, "p2", "product_view", 1, json!({})),
            event(site, "p2", "purchase", 2, usd(30)),
            event(site, "p3", "page_view", 0, json!({})),
            event(site, "p3", "signup", 1, json!({})),
            event(site, "p3", "purchase", 2, usd(70)),
        ],
    )
    .await;

    let query = PathQuery::new(site, range(), "page_view", "purchase").with_top_n(2);
    let rows = store.query_top_paths(&query).await.unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].path, "page_view > product_view > purchase");
    assert_eq!(rows[0].sessions, 2);
    assert_eq!(rows[0].revenue_total, 80.0);
    assert_eq!(rows[0].conversion_contribution, 0.6667);
    assert_eq!(rows[1].path, "page_view > signup > purchase");
    assert_eq!(rows[1].revenue_avg, 70.0);

    // only p1's events fit under the limit
    let capped = store
        .query_top_paths(&query.clone().with_event_fetch_limit(3))
        .await
        .unwrap();
    assert_eq!(capped.len(), 1);
    assert_eq!(capped[0].sessions, 1);
}

pub async fn check_retention<S: EventStore>(store: &S, site: &str) {
    let mut old = event(site, "r1", "page_view", 0, json!({}));
    old.idempotency_key = "old".into();
    old.ingested_at = Utc::now() - Duration::days(40);
    let mut recent = event(site, "r1", "page_view", 1, json!({}));
    recent.idempotency_key = "recent".into();
    recent.ingested_at = Utc::now() - Duration::days(1);
    insert_all(store, vec![old, recent]).await;

    let deleted = store
        .delete_expired(&[RetentionRule::new(site, 30)], 36_500)
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert!(!store.is_duplicate(site, "old").await.unwrap());
    assert!(store.is_duplicate(site, "recent").await.unwrap());
}
