//! Integration tests for the rq-pulse store, collector and query engine.
//!
//! These tests use a real SQLite database (temp file) so the write pool,
//! migrations and retention queries run exactly as they do in production.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use rq_pulse::analytics::{AnalyticsService, Granularity, TimePeriod, TimeWindow};
use rq_pulse::collector::{Collector, CollectorConfig, CollectorState};
use rq_pulse::database::Database;
use rq_pulse::database::repositories::{SnapshotRepository, SqlxSnapshotRepository};
use rq_pulse::source::{QueueCounts, QueuesSnapshot, SnapshotSource, WorkerDescriptor};
use rq_pulse::{Error, Result};

/// Helper to open a migrated database in a fresh temp directory.
async fn setup_test_db() -> (TempDir, Database, Arc<SqlxSnapshotRepository>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open_path(dir.path().join("analytics.db"))
        .await
        .expect("Failed to open test database");
    let repo = Arc::new(SqlxSnapshotRepository::from_database(&db));
    (dir, db, repo)
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
}

fn worker(name: &str, successful: i64) -> WorkerDescriptor {
    WorkerDescriptor::new(name, vec!["default".to_string()]).with_counts(successful, 0)
}

fn queues(entries: &[(&str, i64)]) -> QueuesSnapshot {
    entries
        .iter()
        .map(|(name, queued)| {
            (
                name.to_string(),
                QueueCounts {
                    queued: *queued,
                    ..Default::default()
                },
            )
        })
        .collect()
}

/// Source returning one worker with an ever-growing counter and two queues.
/// With `fail_every_other`, every second worker call errors.
struct FakeSource {
    calls: AtomicU64,
    fail_every_other: bool,
}

impl FakeSource {
    fn new(fail_every_other: bool) -> Self {
        Self {
            calls: AtomicU64::new(0),
            fail_every_other,
        }
    }
}

#[async_trait]
impl SnapshotSource for FakeSource {
    async fn get_workers_snapshot(&self) -> Result<Vec<WorkerDescriptor>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_every_other && n % 2 == 1 {
            return Err(Error::source_unavailable("connection reset"));
        }
        Ok(vec![worker("worker-1", n as i64 * 3)])
    }

    async fn get_all_queues_snapshot(&self) -> Result<QueuesSnapshot> {
        Ok(queues(&[("default", 4), ("high", 1)]))
    }
}

mod store_tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_tables_exist() {
        let (_dir, db, _repo) = setup_test_db().await;

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&db.pool)
                .await
                .expect("Failed to query tables");
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();

        assert!(names.contains(&"rq_workers_snapshots"));
        assert!(names.contains(&"rq_queues_snapshots"));
        db.close().await;
    }

    #[tokio::test]
    async fn test_retention_removes_only_old_rows() {
        let (_dir, db, repo) = setup_test_db().await;
        let now = Utc::now();
        let old = now - Duration::days(10);
        let recent = now - Duration::days(1);

        repo.store_worker_snapshot(old, &[worker("a", 1), worker("b", 2)])
            .await
            .unwrap();
        repo.store_queue_snapshot(old, &queues(&[("default", 3)]))
            .await
            .unwrap();
        repo.store_worker_snapshot(recent, &[worker("a", 5)])
            .await
            .unwrap();
        repo.store_queue_snapshot(recent, &queues(&[("default", 1), ("high", 2)]))
            .await
            .unwrap();

        let stats = repo.cleanup_old_data(7).await.unwrap();
        assert_eq!(stats.worker_snapshots_deleted, 2);
        assert_eq!(stats.queue_snapshots_deleted, 1);
        assert_eq!(stats.total_deleted, 3);
        assert!(!stats.mismatch);

        let counts = repo.count_snapshots().await.unwrap();
        assert_eq!(counts.worker_snapshots, 1);
        assert_eq!(counts.queue_snapshots, 2);

        // Nothing left to remove the second time around
        let again = repo.cleanup_old_data(7).await.unwrap();
        assert_eq!(again.total_deleted, 0);
        assert_eq!(repo.count_snapshots().await.unwrap(), counts);

        db.close().await;
    }

    #[tokio::test]
    async fn test_stats_window_is_right_open() {
        let (_dir, db, repo) = setup_test_db().await;
        let t0 = base_time();

        for (offset, queued) in [(0, 2), (30, 4), (60, 100)] {
            repo.store_queue_snapshot(t0 + Duration::seconds(offset), &queues(&[("default", queued)]))
                .await
                .unwrap();
        }

        let window = TimeWindow::new(t0, t0 + Duration::seconds(60));
        let stats = repo.get_queue_stats(&window).await.unwrap();
        let queued = stats
            .iter()
            .find(|s| s.queue_name == "default" && s.status.to_string() == "queued")
            .expect("queued stat present");

        assert_eq!(queued.min_count, 2);
        assert_eq!(queued.max_count, 4);
        assert!((queued.avg_count - 3.0).abs() < f64::EPSILON);

        db.close().await;
    }
}

mod analytics_tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_throughput_over_store() {
        let (_dir, db, repo) = setup_test_db().await;
        let t0 = base_time();

        // 10 -> 15 -> 12 (restart) -> 20
        for (offset, count) in [(0, 10), (10, 15), (20, 12), (70, 20)] {
            repo.store_worker_snapshot(t0 + Duration::seconds(offset), &[worker("w1", count)])
                .await
                .unwrap();
        }

        let service = AnalyticsService::new(repo.clone());
        let period = TimePeriod::range(t0, t0 + Duration::minutes(5))
            .with_granularity(Granularity::OneMinute);
        let points = service.get_worker_throughput(&period).await;

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, t0);
        assert_eq!(points[0].worker_name, "w1");
        assert!((points[0].throughput - 2.5).abs() < f64::EPSILON);
        assert_eq!(points[1].timestamp, t0 + Duration::minutes(1));
        assert!((points[1].throughput - 8.0).abs() < f64::EPSILON);

        db.close().await;
    }

    #[tokio::test]
    async fn test_queue_depth_last_value_wins() {
        let (_dir, db, repo) = setup_test_db().await;
        let t0 = base_time();

        for (offset, queued) in [(0, 3), (30, 7), (70, 1)] {
            repo.store_queue_snapshot(t0 + Duration::seconds(offset), &queues(&[("default", queued)]))
                .await
                .unwrap();
        }

        let service = AnalyticsService::new(repo.clone());
        let period = TimePeriod::range(t0, t0 + Duration::minutes(5))
            .with_granularity(Granularity::OneMinute);
        let points = service.get_queue_depth(&period).await;

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, t0);
        assert_eq!(points[0].counts.queued, 7);
        assert_eq!(points[1].counts.queued, 1);

        // Row exactly at the end bound is excluded
        let clipped = TimePeriod::range(t0, t0 + Duration::seconds(70))
            .with_granularity(Granularity::OneMinute);
        let points = service.get_queue_depth(&clipped).await;
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].counts.queued, 7);

        db.close().await;
    }

    #[tokio::test]
    async fn test_closed_store_yields_empty_results() {
        let (_dir, db, repo) = setup_test_db().await;
        repo.store_worker_snapshot(Utc::now(), &[worker("w1", 1)])
            .await
            .unwrap();
        db.close().await;

        let service = AnalyticsService::new(repo.clone());
        let window = TimeWindow::last(Duration::hours(1));
        assert!(service.get_queue_stats(&window).await.is_empty());
        assert!(service.get_worker_stats(&window).await.is_empty());
        assert!(
            service
                .get_worker_throughput(&TimePeriod::default())
                .await
                .is_empty()
        );
    }
}

mod collector_tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_once_writes_one_row_per_entity() {
        let (_dir, db, repo) = setup_test_db().await;
        let collector = Collector::new(
            Arc::new(FakeSource::new(false)),
            repo.clone(),
            CollectorConfig::default(),
        );

        for _ in 0..3 {
            let outcome = collector.collect_once().await.unwrap();
            assert_eq!(outcome.worker_rows, 1);
            assert_eq!(outcome.queue_rows, 2);
        }

        let counts = repo.count_snapshots().await.unwrap();
        assert_eq!(counts.worker_snapshots, 3);
        assert_eq!(counts.queue_snapshots, 6);

        db.close().await;
    }

    #[tokio::test]
    async fn test_collector_runs_and_stops_cleanly() {
        let (_dir, db, repo) = setup_test_db().await;
        let collector = Collector::new(
            Arc::new(FakeSource::new(false)),
            repo.clone(),
            CollectorConfig::default(),
        );

        collector.start(StdDuration::from_secs(1)).unwrap();
        assert_eq!(collector.state(), CollectorState::Running);
        assert!(collector.start(StdDuration::from_secs(1)).is_err());

        tokio::time::sleep(StdDuration::from_millis(3_000)).await;
        collector.stop().await;
        assert_eq!(collector.state(), CollectorState::Stopped);

        let counts = repo.count_snapshots().await.unwrap();
        assert!(
            (2..=4).contains(&counts.worker_snapshots),
            "unexpected batch count {}",
            counts.worker_snapshots
        );
        assert_eq!(counts.queue_snapshots, counts.worker_snapshots * 2);

        // No writes after stop has returned
        tokio::time::sleep(StdDuration::from_millis(1_500)).await;
        assert_eq!(repo.count_snapshots().await.unwrap(), counts);

        db.close().await;
    }

    #[tokio::test]
    async fn test_failed_ticks_are_skipped_not_fatal() {
        let (_dir, db, repo) = setup_test_db().await;
        let collector = Collector::new(
            Arc::new(FakeSource::new(true)),
            repo.clone(),
            CollectorConfig::default(),
        );

        collector.start(StdDuration::from_millis(200)).unwrap();
        tokio::time::sleep(StdDuration::from_millis(1_100)).await;
        collector.stop().await;

        let stats = collector.stats();
        assert!(stats.ticks_failed >= 1);
        assert!(stats.ticks_succeeded >= 2);

        // Skipped ticks leave no partial rows behind
        let counts = repo.count_snapshots().await.unwrap();
        assert_eq!(counts.worker_snapshots as u64, stats.ticks_succeeded);
        assert_eq!(counts.queue_snapshots as u64, stats.ticks_succeeded * 2);

        db.close().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (_dir, db, repo) = setup_test_db().await;
        let collector = Collector::new(
            Arc::new(FakeSource::new(false)),
            repo.clone(),
            CollectorConfig::default(),
        );

        collector.start(StdDuration::from_secs(60)).unwrap();
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        collector.stop().await;
        collector.stop().await;

        collector.start(StdDuration::from_secs(60)).unwrap();
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        collector.stop().await;

        // One immediate tick per run
        assert_eq!(repo.count_snapshots().await.unwrap().worker_snapshots, 2);

        db.close().await;
    }

    #[tokio::test]
    async fn test_retention_runs_alongside_a_tick() {
        let (_dir, db, repo) = setup_test_db().await;
        let old = Utc::now() - Duration::days(10);
        for n in 0..5 {
            repo.store_worker_snapshot(old, &[worker("w1", n)])
                .await
                .unwrap();
            repo.store_queue_snapshot(old, &queues(&[("default", n)]))
                .await
                .unwrap();
        }

        let collector = Collector::new(
            Arc::new(FakeSource::new(false)),
            repo.clone(),
            CollectorConfig::default(),
        );
        let (tick, purge) = tokio::join!(collector.collect_once(), collector.run_retention_once());

        let tick = tick.unwrap();
        let purge = purge.unwrap();
        assert_eq!(tick.worker_rows, 1);
        assert_eq!(tick.queue_rows, 2);
        assert_eq!(purge.worker_snapshots_deleted, 5);
        assert_eq!(purge.queue_snapshots_deleted, 5);

        // Only the fresh tick survives
        let counts = repo.count_snapshots().await.unwrap();
        assert_eq!(counts.worker_snapshots, 1);
        assert_eq!(counts.queue_snapshots, 2);

        db.close().await;
    }
}
