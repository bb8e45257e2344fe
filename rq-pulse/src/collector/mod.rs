//! Background sampler and retention sweeper.
//!
//! The [`Collector`] owns two periodic loops per run: a sampling loop that reads
//! the live queue system and appends one batch per table, and a retention loop
//! that prunes rows past the retention window. Both loops share one
//! cancellation token; `stop` cancels it and joins both before returning.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::models::CleanupStats;
use crate::database::repositories::SnapshotRepository;
use crate::source::{SnapshotSource, validate_queues, validate_workers};
use crate::{Error, Result};

/// Configuration for the collector loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Rows older than this many days are removed by the retention loop.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Seconds between retention passes. The first pass runs one full
    /// interval after `start`.
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,
}

fn default_retention_days() -> u32 {
    7
}

fn default_retention_interval_secs() -> u64 {
    86_400 // 24 hours
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            retention_interval_secs: default_retention_interval_secs(),
        }
    }
}

impl CollectorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_retention_interval(mut self, interval: Duration) -> Self {
        self.retention_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CollectorState {
    Stopped,
    Running,
}

/// Rows written by one successful sampling tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickOutcome {
    pub worker_rows: u64,
    pub queue_rows: u64,
}

/// Counters accumulated across runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    pub ticks_succeeded: u64,
    pub ticks_failed: u64,
    pub worker_rows_written: u64,
    pub queue_rows_written: u64,
    pub retention_runs: u64,
    pub rows_purged: u64,
}

#[derive(Default)]
struct StatsCounters {
    ticks_succeeded: AtomicU64,
    ticks_failed: AtomicU64,
    worker_rows_written: AtomicU64,
    queue_rows_written: AtomicU64,
    retention_runs: AtomicU64,
    rows_purged: AtomicU64,
}

struct CollectorInner {
    source: Arc<dyn SnapshotSource>,
    repo: Arc<dyn SnapshotRepository>,
    config: CollectorConfig,
    stats: StatsCounters,
}

impl CollectorInner {
    async fn collect_once(&self) -> Result<TickOutcome> {
        let workers = self.source.get_workers_snapshot().await?;
        let queues = self.source.get_all_queues_snapshot().await?;
        validate_workers(&workers)?;
        validate_queues(&queues)?;

        let sampled_at = Utc::now();
        let worker_result = self.repo.store_worker_snapshot(sampled_at, &workers).await;
        let queue_result = self.repo.store_queue_snapshot(sampled_at, &queues).await;

        let worker_rows = worker_result?;
        let queue_rows = queue_result?;
        Ok(TickOutcome {
            worker_rows,
            queue_rows,
        })
    }

    fn record_tick(&self, result: Result<TickOutcome>) {
        match result {
            Ok(outcome) => {
                self.stats.ticks_succeeded.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .worker_rows_written
                    .fetch_add(outcome.worker_rows, Ordering::Relaxed);
                self.stats
                    .queue_rows_written
                    .fetch_add(outcome.queue_rows, Ordering::Relaxed);
                debug!(
                    worker_rows = outcome.worker_rows,
                    queue_rows = outcome.queue_rows,
                    "Snapshot tick stored"
                );
            }
            Err(e) => {
                self.stats.ticks_failed.fetch_add(1, Ordering::Relaxed);
                if e.is_source_error() {
                    warn!(error = %e, "Snapshot tick skipped");
                } else {
                    error!(error = %e, "Snapshot tick failed");
                }
            }
        }
    }

    async fn run_retention_once(&self) -> Result<CleanupStats> {
        let stats = self.repo.cleanup_old_data(self.config.retention_days).await?;
        self.stats.retention_runs.fetch_add(1, Ordering::Relaxed);
        self.stats
            .rows_purged
            .fetch_add(stats.total_deleted, Ordering::Relaxed);
        Ok(stats)
    }

    async fn sampling_loop(self: Arc<Self>, period: Duration, token: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval = ?period, "Sampling loop started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        result = self.collect_once() => self.record_tick(result),
                    }
                }
            }
        }

        debug!("Sampling loop stopped");
    }

    async fn retention_loop(self: Arc<Self>, token: CancellationToken) {
        let period = self.config.retention_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(
            retention_days = self.config.retention_days,
            interval = ?period,
            "Retention loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        result = self.run_retention_once() => match result {
                            Ok(stats) => debug!(
                                deleted = stats.total_deleted,
                                mismatch = stats.mismatch,
                                "Retention pass completed"
                            ),
                            Err(e) => error!(error = %e, "Retention pass failed"),
                        },
                    }
                }
            }
        }

        debug!("Retention loop stopped");
    }
}

struct RunHandle {
    token: CancellationToken,
    tasks: JoinSet<()>,
}

/// Periodic sampler with a `Stopped`/`Running` lifecycle.
pub struct Collector {
    inner: Arc<CollectorInner>,
    run: parking_lot::Mutex<Option<RunHandle>>,
}

impl Collector {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        repo: Arc<dyn SnapshotRepository>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                source,
                repo,
                config,
                stats: StatsCounters::default(),
            }),
            run: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.inner.config
    }

    /// Spawn the sampling and retention loops.
    ///
    /// Fails with `InvalidStateTransition` when already running; nothing is
    /// spawned in that case. The first sample is taken immediately.
    pub fn start(&self, sample_interval: Duration) -> Result<()> {
        if sample_interval.is_zero() {
            return Err(Error::validation("sampling interval must be positive"));
        }

        let mut run = self.run.lock();
        if run.is_some() {
            return Err(Error::InvalidStateTransition {
                from: CollectorState::Running.to_string(),
                to: CollectorState::Running.to_string(),
            });
        }

        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(
            self.inner
                .clone()
                .sampling_loop(sample_interval, token.clone()),
        );
        tasks.spawn(self.inner.clone().retention_loop(token.clone()));
        *run = Some(RunHandle { token, tasks });

        info!(
            "Collector started (interval: {:?}, retention: {} days)",
            sample_interval, self.inner.config.retention_days
        );
        Ok(())
    }

    /// Cancel both loops and wait until they have fully unwound.
    ///
    /// Stopping a stopped collector is a no-op.
    pub async fn stop(&self) {
        // Take the handle out of the mutex before awaiting
        let handle = self.run.lock().take();
        let Some(RunHandle { token, mut tasks }) = handle else {
            debug!("Collector already stopped");
            return;
        };

        info!("Stopping collector");
        token.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Collector task ended abnormally");
            }
        }
        info!("Collector stopped");
    }

    pub fn state(&self) -> CollectorState {
        if self.run.lock().is_some() {
            CollectorState::Running
        } else {
            CollectorState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == CollectorState::Running
    }

    /// Take one sample outside the loop. Errors are returned, not swallowed.
    pub async fn collect_once(&self) -> Result<TickOutcome> {
        self.inner.collect_once().await
    }

    /// Run one retention pass outside the loop.
    pub async fn run_retention_once(&self) -> Result<CleanupStats> {
        self.inner.run_retention_once().await
    }

    pub fn stats(&self) -> CollectorStats {
        let s = &self.inner.stats;
        CollectorStats {
            ticks_succeeded: s.ticks_succeeded.load(Ordering::Relaxed),
            ticks_failed: s.ticks_failed.load(Ordering::Relaxed),
            worker_rows_written: s.worker_rows_written.load(Ordering::Relaxed),
            queue_rows_written: s.queue_rows_written.load(Ordering::Relaxed),
            retention_runs: s.retention_runs.load(Ordering::Relaxed),
            rows_purged: s.rows_purged.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::period::TimeWindow;
    use crate::database::models::{
        QueueSnapshotDbModel, QueueStat, SnapshotCounts, WorkerSnapshotDbModel, WorkerStat,
    };
    use crate::source::{QueueCounts, QueuesSnapshot, WorkerDescriptor};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicUsize;

    struct StaticSource {
        calls: AtomicUsize,
        fail_every_other: bool,
    }

    #[async_trait]
    impl SnapshotSource for StaticSource {
        async fn get_workers_snapshot(&self) -> Result<Vec<WorkerDescriptor>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_every_other && n % 2 == 1 {
                return Err(Error::source_unavailable("connection refused"));
            }
            Ok(vec![
                WorkerDescriptor::new("w1", vec!["default".into()]).with_counts(n as i64, 0),
                WorkerDescriptor::new("w2", vec!["default".into()]),
            ])
        }

        async fn get_all_queues_snapshot(&self) -> Result<QueuesSnapshot> {
            let mut queues = QueuesSnapshot::new();
            queues.insert("default".into(), QueueCounts::default());
            Ok(queues)
        }
    }

    #[derive(Default)]
    struct CountingRepo {
        worker_batches: AtomicUsize,
        queue_batches: AtomicUsize,
        cleanups: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotRepository for CountingRepo {
        async fn store_worker_snapshot(
            &self,
            _: DateTime<Utc>,
            workers: &[WorkerDescriptor],
        ) -> Result<u64> {
            self.worker_batches.fetch_add(1, Ordering::SeqCst);
            Ok(workers.len() as u64)
        }
        async fn store_queue_snapshot(&self, _: DateTime<Utc>, queues: &QueuesSnapshot) -> Result<u64> {
            self.queue_batches.fetch_add(1, Ordering::SeqCst);
            Ok(queues.len() as u64)
        }
        async fn get_queue_stats(&self, _: &TimeWindow) -> Result<Vec<QueueStat>> {
            Ok(Vec::new())
        }
        async fn get_worker_stats(&self, _: &TimeWindow) -> Result<Vec<WorkerStat>> {
            Ok(Vec::new())
        }
        async fn list_worker_snapshots(&self, _: &TimeWindow) -> Result<Vec<WorkerSnapshotDbModel>> {
            Ok(Vec::new())
        }
        async fn list_queue_snapshots(&self, _: &TimeWindow) -> Result<Vec<QueueSnapshotDbModel>> {
            Ok(Vec::new())
        }
        async fn cleanup_old_data(&self, _: u32) -> Result<CleanupStats> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(CleanupStats::default())
        }
        async fn delete_before(&self, _: DateTime<Utc>) -> Result<CleanupStats> {
            Ok(CleanupStats::default())
        }
        async fn count_snapshots(&self) -> Result<SnapshotCounts> {
            Ok(SnapshotCounts::default())
        }
    }

    fn collector(fail_every_other: bool, config: CollectorConfig) -> (Collector, Arc<CountingRepo>) {
        let source = Arc::new(StaticSource {
            calls: AtomicUsize::new(0),
            fail_every_other,
        });
        let repo = Arc::new(CountingRepo::default());
        (Collector::new(source, repo.clone(), config), repo)
    }

    #[tokio::test]
    async fn test_collect_once_counts_rows() {
        let (collector, repo) = collector(false, CollectorConfig::default());
        let outcome = collector.collect_once().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome {
                worker_rows: 2,
                queue_rows: 1
            }
        );
        assert_eq!(repo.worker_batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let (collector, _repo) = collector(false, CollectorConfig::default());
        collector.start(Duration::from_secs(60)).unwrap();
        assert!(collector.is_running());

        let err = collector.start(Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        collector.stop().await;
        assert_eq!(collector.state(), CollectorState::Stopped);

        // Restart after stop is allowed.
        collector.start(Duration::from_secs(60)).unwrap();
        collector.stop().await;
        assert!(!collector.is_running());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let (collector, _repo) = collector(false, CollectorConfig::default());
        collector.stop().await;
        assert!(!collector.is_running());
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let (collector, _repo) = collector(false, CollectorConfig::default());
        assert!(collector.start(Duration::ZERO).is_err());
        assert!(!collector.is_running());
    }

    #[tokio::test]
    async fn test_failed_ticks_do_not_stop_the_loop() {
        let (collector, repo) = collector(true, CollectorConfig::default());
        collector.start(Duration::from_millis(50)).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        collector.stop().await;

        let stats = collector.stats();
        assert!(stats.ticks_failed >= 1);
        assert!(stats.ticks_succeeded >= 2);
        assert_eq!(
            repo.worker_batches.load(Ordering::SeqCst) as u64,
            stats.ticks_succeeded
        );
    }

    #[tokio::test]
    async fn test_retention_loop_runs_on_its_own_schedule() {
        let config = CollectorConfig::new()
            .with_retention_days(3)
            .with_retention_interval(Duration::from_secs(1));
        let (collector, repo) = collector(false, config);
        collector.start(Duration::from_secs(60)).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(repo.cleanups.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        collector.stop().await;
        assert!(repo.cleanups.load(Ordering::SeqCst) >= 1);
        assert_eq!(collector.stats().retention_runs, repo.cleanups.load(Ordering::SeqCst) as u64);
    }
}
