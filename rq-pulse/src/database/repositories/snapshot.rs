//! Snapshot repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::analytics::period::TimeWindow;
use crate::database::models::{
    CleanupStats, QueueAggregateRow, QueueSnapshotDbModel, QueueStat, SnapshotCounts,
    WorkerSnapshotDbModel, WorkerStat,
};
use crate::database::retry::retry_on_busy;
use crate::database::time::{datetime_to_ms, ms_to_datetime, now_ms, retention_cutoff_ms};
use crate::database::{Database, DbPool, WritePool, begin_immediate};
use crate::source::{QueuesSnapshot, WorkerDescriptor};
use crate::{Error, Result};

pub const WORKERS_TABLE: &str = "rq_workers_snapshots";
pub const QUEUES_TABLE: &str = "rq_queues_snapshots";

/// Snapshot repository trait.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    // Writes
    async fn store_worker_snapshot(
        &self,
        sampled_at: DateTime<Utc>,
        workers: &[WorkerDescriptor],
    ) -> Result<u64>;
    async fn store_queue_snapshot(
        &self,
        sampled_at: DateTime<Utc>,
        queues: &QueuesSnapshot,
    ) -> Result<u64>;

    // Aggregates
    async fn get_queue_stats(&self, window: &TimeWindow) -> Result<Vec<QueueStat>>;
    async fn get_worker_stats(&self, window: &TimeWindow) -> Result<Vec<WorkerStat>>;

    // Raw rows, ascending by timestamp
    async fn list_worker_snapshots(&self, window: &TimeWindow) -> Result<Vec<WorkerSnapshotDbModel>>;
    async fn list_queue_snapshots(&self, window: &TimeWindow) -> Result<Vec<QueueSnapshotDbModel>>;

    // Retention
    async fn cleanup_old_data(&self, retention_days: u32) -> Result<CleanupStats>;
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupStats>;

    async fn count_snapshots(&self) -> Result<SnapshotCounts>;
}

/// SQLx implementation of SnapshotRepository.
pub struct SqlxSnapshotRepository {
    pool: DbPool,
    write_pool: WritePool,
}

impl SqlxSnapshotRepository {
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }

    pub fn from_database(db: &Database) -> Self {
        Self::new(db.pool.clone(), db.write_pool.clone())
    }
}

async fn insert_worker_rows(
    conn: &mut SqliteConnection,
    ts: i64,
    rows: &[(&WorkerDescriptor, String)],
) -> std::result::Result<(), sqlx::Error> {
    for (worker, queues) in rows {
        sqlx::query(
            r#"
            INSERT INTO rq_workers_snapshots
                (timestamp, worker_name, state, queues, successful_jobs, failed_jobs, working_time)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(&worker.name)
        .bind(worker.state.as_str())
        .bind(queues)
        .bind(worker.successful_job_count)
        .bind(worker.failed_job_count)
        .bind(worker.total_working_time)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_queue_rows(
    conn: &mut SqliteConnection,
    ts: i64,
    queues: &QueuesSnapshot,
) -> std::result::Result<(), sqlx::Error> {
    for (name, counts) in queues {
        sqlx::query(
            r#"
            INSERT INTO rq_queues_snapshots
                (timestamp, queue_name, queued_jobs, started_jobs, finished_jobs,
                 failed_jobs, deferred_jobs, scheduled_jobs)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(name)
        .bind(counts.queued)
        .bind(counts.started)
        .bind(counts.finished)
        .bind(counts.failed)
        .bind(counts.deferred)
        .bind(counts.scheduled)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Pre-delete counts followed by the deletes, as `(worker_count, queue_count, worker_deleted, queue_deleted)`.
async fn delete_rows_before(
    conn: &mut SqliteConnection,
    cutoff_ms: i64,
) -> std::result::Result<(i64, i64, u64, u64), sqlx::Error> {
    let worker_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM rq_workers_snapshots WHERE timestamp < ?")
            .bind(cutoff_ms)
            .fetch_one(&mut *conn)
            .await?;
    let queue_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM rq_queues_snapshots WHERE timestamp < ?")
            .bind(cutoff_ms)
            .fetch_one(&mut *conn)
            .await?;

    let worker_deleted = sqlx::query("DELETE FROM rq_workers_snapshots WHERE timestamp < ?")
        .bind(cutoff_ms)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    let queue_deleted = sqlx::query("DELETE FROM rq_queues_snapshots WHERE timestamp < ?")
        .bind(cutoff_ms)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    Ok((worker_count, queue_count, worker_deleted, queue_deleted))
}

fn query_error(op: &str, err: sqlx::Error) -> Error {
    Error::StoreQuery(format!("{}: {}", op, err))
}

#[async_trait]
impl SnapshotRepository for SqlxSnapshotRepository {
    async fn store_worker_snapshot(
        &self,
        sampled_at: DateTime<Utc>,
        workers: &[WorkerDescriptor],
    ) -> Result<u64> {
        if workers.is_empty() {
            return Ok(0);
        }

        let ts = datetime_to_ms(sampled_at);
        let rows = workers
            .iter()
            .map(|w| Ok((w, serde_json::to_string(&w.queues)?)))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::store_write(WORKERS_TABLE, e))?;

        let pool = &self.write_pool;
        let rows = &rows;
        retry_on_busy("store_worker_snapshot", move || async move {
            let mut tx = begin_immediate(pool).await?;
            if let Err(e) = insert_worker_rows(&mut tx, ts, rows).await {
                if let Err(rb) = tx.rollback().await {
                    warn!("Rollback of {} batch failed: {}", WORKERS_TABLE, rb);
                }
                return Err(e);
            }
            tx.commit().await?;
            Ok(rows.len() as u64)
        })
        .await
        .map_err(|e| Error::store_write(WORKERS_TABLE, e))
    }

    async fn store_queue_snapshot(
        &self,
        sampled_at: DateTime<Utc>,
        queues: &QueuesSnapshot,
    ) -> Result<u64> {
        if queues.is_empty() {
            return Ok(0);
        }

        let ts = datetime_to_ms(sampled_at);
        let pool = &self.write_pool;
        retry_on_busy("store_queue_snapshot", move || async move {
            let mut tx = begin_immediate(pool).await?;
            if let Err(e) = insert_queue_rows(&mut tx, ts, queues).await {
                if let Err(rb) = tx.rollback().await {
                    warn!("Rollback of {} batch failed: {}", QUEUES_TABLE, rb);
                }
                return Err(e);
            }
            tx.commit().await?;
            Ok(queues.len() as u64)
        })
        .await
        .map_err(|e| Error::store_write(QUEUES_TABLE, e))
    }

    async fn get_queue_stats(&self, window: &TimeWindow) -> Result<Vec<QueueStat>> {
        let rows = sqlx::query_as::<_, QueueAggregateRow>(
            r#"
            SELECT
                queue_name,
                AVG(queued_jobs) AS avg_queued, MIN(queued_jobs) AS min_queued, MAX(queued_jobs) AS max_queued,
                AVG(started_jobs) AS avg_started, MIN(started_jobs) AS min_started, MAX(started_jobs) AS max_started,
                AVG(finished_jobs) AS avg_finished, MIN(finished_jobs) AS min_finished, MAX(finished_jobs) AS max_finished,
                AVG(failed_jobs) AS avg_failed, MIN(failed_jobs) AS min_failed, MAX(failed_jobs) AS max_failed,
                AVG(deferred_jobs) AS avg_deferred, MIN(deferred_jobs) AS min_deferred, MAX(deferred_jobs) AS max_deferred,
                AVG(scheduled_jobs) AS avg_scheduled, MIN(scheduled_jobs) AS min_scheduled, MAX(scheduled_jobs) AS max_scheduled
            FROM rq_queues_snapshots
            WHERE timestamp >= ? AND timestamp < ?
            GROUP BY queue_name
            ORDER BY queue_name
            "#,
        )
        .bind(window.start_ms())
        .bind(window.end_ms())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("get_queue_stats", e))?;

        Ok(rows.into_iter().flat_map(QueueAggregateRow::into_stats).collect())
    }

    async fn get_worker_stats(&self, window: &TimeWindow) -> Result<Vec<WorkerStat>> {
        sqlx::query_as::<_, WorkerStat>(
            r#"
            SELECT
                worker_name,
                COUNT(*) AS data_points,
                AVG(successful_jobs) AS avg_successful,
                MIN(successful_jobs) AS min_successful,
                MAX(successful_jobs) AS max_successful,
                AVG(failed_jobs) AS avg_failed,
                MIN(failed_jobs) AS min_failed,
                MAX(failed_jobs) AS max_failed,
                AVG(working_time) AS avg_working_time,
                MAX(working_time) AS max_working_time
            FROM rq_workers_snapshots
            WHERE timestamp >= ? AND timestamp < ?
            GROUP BY worker_name
            ORDER BY worker_name
            "#,
        )
        .bind(window.start_ms())
        .bind(window.end_ms())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("get_worker_stats", e))
    }

    async fn list_worker_snapshots(&self, window: &TimeWindow) -> Result<Vec<WorkerSnapshotDbModel>> {
        sqlx::query_as::<_, WorkerSnapshotDbModel>(
            "SELECT * FROM rq_workers_snapshots WHERE timestamp >= ? AND timestamp < ? ORDER BY timestamp, id",
        )
        .bind(window.start_ms())
        .bind(window.end_ms())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("list_worker_snapshots", e))
    }

    async fn list_queue_snapshots(&self, window: &TimeWindow) -> Result<Vec<QueueSnapshotDbModel>> {
        sqlx::query_as::<_, QueueSnapshotDbModel>(
            "SELECT * FROM rq_queues_snapshots WHERE timestamp >= ? AND timestamp < ? ORDER BY timestamp, id",
        )
        .bind(window.start_ms())
        .bind(window.end_ms())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("list_queue_snapshots", e))
    }

    async fn cleanup_old_data(&self, retention_days: u32) -> Result<CleanupStats> {
        let cutoff = retention_cutoff_ms(now_ms(), retention_days);
        debug!(retention_days, cutoff_ms = cutoff, "Running snapshot retention");
        self.delete_before(ms_to_datetime(cutoff)).await
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupStats> {
        let cutoff_ms = datetime_to_ms(cutoff);
        let pool = &self.write_pool;

        let (worker_count, queue_count, worker_deleted, queue_deleted) =
            retry_on_busy("cleanup_old_data", move || async move {
                let mut tx = begin_immediate(pool).await?;
                match delete_rows_before(&mut tx, cutoff_ms).await {
                    Ok(counts) => {
                        tx.commit().await?;
                        Ok(counts)
                    }
                    Err(e) => {
                        if let Err(rb) = tx.rollback().await {
                            warn!("Rollback of retention delete failed: {}", rb);
                        }
                        Err(e)
                    }
                }
            })
            .await?;

        let mismatch = worker_count as u64 != worker_deleted || queue_count as u64 != queue_deleted;
        if mismatch {
            warn!(
                "Retention count mismatch: counted {} worker / {} queue rows, deleted {} / {}",
                worker_count, queue_count, worker_deleted, queue_deleted
            );
        }

        let stats = CleanupStats {
            worker_snapshots_deleted: worker_deleted,
            queue_snapshots_deleted: queue_deleted,
            total_deleted: worker_deleted + queue_deleted,
            mismatch,
        };
        if stats.total_deleted > 0 {
            info!(
                "Deleted {} worker and {} queue snapshots older than {}",
                stats.worker_snapshots_deleted, stats.queue_snapshots_deleted, cutoff
            );
        }
        Ok(stats)
    }

    async fn count_snapshots(&self) -> Result<SnapshotCounts> {
        let (worker_snapshots, queue_snapshots): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM rq_workers_snapshots),
                (SELECT COUNT(*) FROM rq_queues_snapshots)
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("count_snapshots", e))?;

        Ok(SnapshotCounts {
            worker_snapshots,
            queue_snapshots,
        })
    }
}
