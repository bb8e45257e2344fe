//! Snapshot row models and aggregate rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;
use crate::source::{JobStatus, QueueCounts};

/// One sampled worker row from `rq_workers_snapshots`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkerSnapshotDbModel {
    pub id: i64,
    /// Unix epoch milliseconds (UTC)
    pub timestamp: i64,
    pub worker_name: String,
    pub state: String,
    /// JSON array of queue names, in listening order
    pub queues: String,
    pub successful_jobs: i64,
    pub failed_jobs: i64,
    pub working_time: f64,
}

impl WorkerSnapshotDbModel {
    pub fn sampled_at(&self) -> DateTime<Utc> {
        ms_to_datetime(self.timestamp)
    }

    /// Decoded queue list. A malformed column yields an empty list.
    pub fn queue_list(&self) -> Vec<String> {
        serde_json::from_str(&self.queues).unwrap_or_default()
    }

    /// Cumulative completed jobs, successful or failed.
    pub fn jobs_done(&self) -> i64 {
        self.successful_jobs + self.failed_jobs
    }
}

/// One sampled queue row from `rq_queues_snapshots`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueSnapshotDbModel {
    pub id: i64,
    /// Unix epoch milliseconds (UTC)
    pub timestamp: i64,
    pub queue_name: String,
    pub queued_jobs: i64,
    pub started_jobs: i64,
    pub finished_jobs: i64,
    pub failed_jobs: i64,
    pub deferred_jobs: i64,
    pub scheduled_jobs: i64,
}

impl QueueSnapshotDbModel {
    pub fn sampled_at(&self) -> DateTime<Utc> {
        ms_to_datetime(self.timestamp)
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            queued: self.queued_jobs,
            started: self.started_jobs,
            finished: self.finished_jobs,
            failed: self.failed_jobs,
            deferred: self.deferred_jobs,
            scheduled: self.scheduled_jobs,
        }
    }
}

/// Per-queue, per-status aggregate over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStat {
    pub queue_name: String,
    pub status: JobStatus,
    pub avg_count: f64,
    pub min_count: i64,
    pub max_count: i64,
}

/// Raw per-queue aggregate row; expanded into one [`QueueStat`] per status.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct QueueAggregateRow {
    pub queue_name: String,
    pub avg_queued: f64,
    pub min_queued: i64,
    pub max_queued: i64,
    pub avg_started: f64,
    pub min_started: i64,
    pub max_started: i64,
    pub avg_finished: f64,
    pub min_finished: i64,
    pub max_finished: i64,
    pub avg_failed: f64,
    pub min_failed: i64,
    pub max_failed: i64,
    pub avg_deferred: f64,
    pub min_deferred: i64,
    pub max_deferred: i64,
    pub avg_scheduled: f64,
    pub min_scheduled: i64,
    pub max_scheduled: i64,
}

impl QueueAggregateRow {
    pub(crate) fn into_stats(self) -> Vec<QueueStat> {
        let per_status = [
            (JobStatus::Queued, self.avg_queued, self.min_queued, self.max_queued),
            (JobStatus::Started, self.avg_started, self.min_started, self.max_started),
            (JobStatus::Finished, self.avg_finished, self.min_finished, self.max_finished),
            (JobStatus::Failed, self.avg_failed, self.min_failed, self.max_failed),
            (JobStatus::Deferred, self.avg_deferred, self.min_deferred, self.max_deferred),
            (JobStatus::Scheduled, self.avg_scheduled, self.min_scheduled, self.max_scheduled),
        ];

        per_status
            .into_iter()
            .map(|(status, avg_count, min_count, max_count)| QueueStat {
                queue_name: self.queue_name.clone(),
                status,
                avg_count,
                min_count,
                max_count,
            })
            .collect()
    }
}

/// Per-worker aggregate over a window.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct WorkerStat {
    pub worker_name: String,
    pub data_points: i64,
    pub avg_successful: f64,
    pub min_successful: i64,
    pub max_successful: i64,
    pub avg_failed: f64,
    pub min_failed: i64,
    pub max_failed: i64,
    pub avg_working_time: f64,
    pub max_working_time: f64,
}

/// Rows removed by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    pub worker_snapshots_deleted: u64,
    pub queue_snapshots_deleted: u64,
    pub total_deleted: u64,
    /// Pre-delete count and delete count disagreed (concurrent writers).
    pub mismatch: bool,
}

/// Row totals per snapshot table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCounts {
    pub worker_snapshots: i64,
    pub queue_snapshots: i64,
}
