//! Scheduled background jobs
//!
//! Each job runs on a fixed interval and never overlaps itself: a tick that
//! arrives while the previous run is still active is skipped and logged.
//! Failures are logged and the loop keeps ticking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pulse_core::TimeRange;
use pulse_storage::{EventStore, RetentionRule};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MIN_JOB_INTERVAL;
use crate::policy_store::PolicyStore;
use crate::services::CohortService;

#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    /// Name used in log messages, e.g. "Retention job"
    fn name(&self) -> &'static str;

    /// Run once; returns the number of affected items
    async fn run(&self) -> anyhow::Result<u64>;
}

/// Deletes events older than their site's retention
pub struct RetentionJob {
    store: Arc<dyn EventStore>,
    policies: Arc<dyn PolicyStore>,
    default_retention_days: u32,
}

impl RetentionJob {
    pub fn new(
        store: Arc<dyn EventStore>,
        policies: Arc<dyn PolicyStore>,
        default_retention_days: u32,
    ) -> Self {
        Self {
            store,
            policies,
            default_retention_days,
        }
    }
}

#[async_trait]
impl ScheduledJob for RetentionJob {
    fn name(&self) -> &'static str {
        "Retention job"
    }

    async fn run(&self) -> anyhow::Result<u64> {
        let rules: Vec<RetentionRule> = self
            .policies
            .list_policies()
            .into_iter()
            .map(|policy| RetentionRule::new(policy.site_id, policy.retention_days))
            .collect();

        Ok(self
            .store
            .delete_expired(&rules, self.default_retention_days)
            .await?)
    }
}

/// Rebuilds every cohort snapshot over a trailing window
pub struct CohortRefreshJob {
    cohorts: Arc<CohortService>,
    lookback_days: u32,
    site_id: Option<String>,
}

impl CohortRefreshJob {
    pub fn new(cohorts: Arc<CohortService>, lookback_days: u32) -> Self {
        Self {
            cohorts,
            lookback_days,
            site_id: None,
        }
    }

    /// Only refresh cohorts of one site
    pub fn with_site(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }

    fn window(&self) -> TimeRange {
        let to = Utc::now();
        let from = to - chrono::Duration::days(i64::from(self.lookback_days.max(1)));
        TimeRange::new(from, to)
    }
}

#[async_trait]
impl ScheduledJob for CohortRefreshJob {
    fn name(&self) -> &'static str {
        "Cohort refresh"
    }

    async fn run(&self) -> anyhow::Result<u64> {
        let refreshed = self
            .cohorts
            .refresh_all(self.site_id.as_deref(), self.window())
            .await?;
        Ok(refreshed.len() as u64)
    }
}

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(u64),
    /// The previous run was still active
    Skipped,
    Failed,
}

/// Clears the running flag when dropped, including on panic
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Single-flight runner for a [`ScheduledJob`]
pub struct JobRunner<J: ScheduledJob> {
    job: J,
    running: AtomicBool,
}

impl<J: ScheduledJob> JobRunner<J> {
    pub fn new(job: J) -> Self {
        Self {
            job,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn tick(&self) -> TickOutcome {
        let name = self.job.name();
        let Some(_guard) = RunningGuard::try_acquire(&self.running) else {
            warn!("{} skipped: previous run still active", name);
            return TickOutcome::Skipped;
        };

        match self.job.run().await {
            Ok(affected) => {
                info!(affected, "{} completed", name);
                TickOutcome::Completed(affected)
            }
            Err(e) => {
                error!("{} failed: {:#}", name, e);
                TickOutcome::Failed
            }
        }
    }

    /// Tick every `interval` until shutdown is signalled.
    ///
    /// The first tick fires one interval after the call. Each tick runs in its
    /// own task so a slow run cannot delay the schedule. Intervals shorter than
    /// [`MIN_JOB_INTERVAL`] are raised to it.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let name = self.job.name();
        let interval = if interval < MIN_JOB_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                "{} interval below minimum, using {}s",
                name,
                MIN_JOB_INTERVAL.as_secs()
            );
            MIN_JOB_INTERVAL
        } else {
            interval
        };

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let runner = Arc::clone(&self);
                        tokio::spawn(async move {
                            runner.tick().await;
                        });
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("{}: shutdown requested", name);
                        break;
                    }
                }
            }

            debug!("{} loop exited", name);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy_store::InMemoryPolicyStore;
    use chrono::Duration as ChronoDuration;
    use pulse_core::{
        ConsentState, DeniedBehavior, PolicyTemplate, SitePolicyOverride, StoredEvent, UserKind,
    };
    use pulse_storage::InMemoryEventStore;
    use std::sync::atomic::AtomicU64;
    use uuid::Uuid;

    struct SlowJob {
        runs: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl ScheduledJob for SlowJob {
        fn name(&self) -> &'static str {
            "Slow job"
        }

        async fn run(&self) -> anyhow::Result<u64> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(runs)
        }
    }

    fn slow_job(fail: bool) -> JobRunner<SlowJob> {
        JobRunner::new(SlowJob {
            runs: AtomicU64::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let runner = slow_job(false);

        let (first, second) = tokio::join!(runner.tick(), runner.tick());
        assert_eq!(first, TickOutcome::Completed(1));
        assert_eq!(second, TickOutcome::Skipped);
        assert!(!runner.is_running());

        assert_eq!(runner.tick().await, TickOutcome::Completed(2));
    }

    #[tokio::test]
    async fn test_failure_releases_guard() {
        let runner = slow_job(true);

        assert_eq!(runner.tick().await, TickOutcome::Failed);
        assert!(!runner.is_running());
        assert_eq!(runner.tick().await, TickOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_stops_on_shutdown() {
        let runner = Arc::new(slow_job(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = Arc::clone(&runner).spawn(Duration::from_secs(1), shutdown_rx);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(runner.job.runs.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_intervals_from_config_keep_ticking() {
        let config = crate::config::CollectorConfig::from_lookup(|name| match name {
            "RETENTION_INTERVAL_SECS" | "COHORT_REFRESH_INTERVAL_SECS" => Some("0".to_string()),
            _ => None,
        });

        for interval in [config.retention.interval, config.cohort_refresh.interval] {
            let runner = Arc::new(slow_job(false));
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let handle = Arc::clone(&runner).spawn(interval, shutdown_rx);
            tokio::time::sleep(Duration::from_millis(1500)).await;
            shutdown_tx.send(true).unwrap();
            handle.await.unwrap();

            assert!(runner.job.runs.load(Ordering::SeqCst) >= 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_raised_to_minimum() {
        let runner = Arc::new(slow_job(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = Arc::clone(&runner).spawn(Duration::ZERO, shutdown_rx);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runner.job.runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(runner.job.runs.load(Ordering::SeqCst) >= 1);
    }

    fn stored(site_id: &str, key: &str, age_days: i64) -> StoredEvent {
        let ingested_at = Utc::now() - ChronoDuration::days(age_days);
        StoredEvent {
            event_id: Uuid::now_v7(),
            site_id: site_id.to_string(),
            event_name: "page_view".to_string(),
            event_ts: ingested_at,
            ingested_at,
            properties: Default::default(),
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
    async fn test_retention_job_uses_site_policies() {
        let store = Arc::new(InMemoryEventStore::new());
        for event in [
            stored("short", "a", 10),
            stored("short", "b", 1),
            stored("other", "c", 10),
            stored("other", "d", 200),
        ] {
            store.insert_event(event).await.unwrap();
        }
        let policies = InMemoryPolicyStore::new([(
            "short".to_string(),
            SitePolicyOverride {
                retention_days: Some(7),
                ..Default::default()
            },
        )]);

        let runner = JobRunner::new(RetentionJob::new(store.clone(), Arc::new(policies), 180));

        assert_eq!(runner.tick().await, TickOutcome::Completed(2));
        assert_eq!(store.event_count(), 2);
        assert!(!store.is_duplicate("short", "a").await.unwrap());
        assert!(store.is_duplicate("other", "c").await.unwrap());
    }
}
