//! Series reconstruction over raw snapshot rows.
//!
//! Queue rows carry gauges, so a bucket keeps the latest row it saw. Worker
//! rows carry cumulative counters, so throughput comes from deltas between
//! consecutive samples of the same worker, with counter resets floored at zero.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::period::Granularity;
use crate::database::models::{QueueSnapshotDbModel, WorkerSnapshotDbModel};
use crate::database::time::ms_to_datetime;
use crate::source::{JobStatus, QueueCounts};

/// Last-value downsample of one queue within one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueDepthPoint {
    pub timestamp: DateTime<Utc>,
    pub queue_name: String,
    #[serde(flatten)]
    pub counts: QueueCounts,
}

/// Average per-interval completions of one worker within one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerThroughputPoint {
    pub timestamp: DateTime<Utc>,
    pub worker_name: String,
    pub throughput: f64,
    /// Deltas averaged into `throughput`.
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueJobsPoint {
    pub timestamp: DateTime<Utc>,
    pub queue_name: String,
    pub status: JobStatus,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerPerformancePoint {
    pub timestamp: DateTime<Utc>,
    pub worker_name: String,
    pub successful_jobs: i64,
    pub failed_jobs: i64,
    pub working_time: f64,
}

/// Raw chart series selectable by metric name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum MetricType {
    QueueJobs,
    WorkerPerformance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TimeSeriesPoint {
    QueueJobs(QueueJobsPoint),
    WorkerPerformance(WorkerPerformancePoint),
}

/// Downsample queue rows: within each `(queue, bucket)` the latest row wins.
///
/// Rows sharing a timestamp resolve to the one with the higher id.
pub fn bucket_queue_depth(
    rows: &[QueueSnapshotDbModel],
    granularity: Granularity,
) -> Vec<QueueDepthPoint> {
    let mut latest: BTreeMap<(i64, &str), &QueueSnapshotDbModel> = BTreeMap::new();

    for row in rows {
        let key = (granularity.truncate_ms(row.timestamp), row.queue_name.as_str());
        let newer = latest
            .get(&key)
            .is_none_or(|kept| (kept.timestamp, kept.id) < (row.timestamp, row.id));
        if newer {
            latest.insert(key, row);
        }
    }

    latest
        .into_iter()
        .map(|((bucket, queue_name), row)| QueueDepthPoint {
            timestamp: ms_to_datetime(bucket),
            queue_name: queue_name.to_string(),
            counts: row.counts(),
        })
        .collect()
}

/// Reconstruct per-worker throughput from cumulative counters.
///
/// Each row after a worker's first contributes `max(jobs_done - previous, 0)`
/// to the bucket it falls in. Every bucket that holds at least one of the
/// worker's rows is reported; one without deltas reports zero.
pub fn reconstruct_worker_throughput(
    rows: &[WorkerSnapshotDbModel],
    granularity: Granularity,
) -> Vec<WorkerThroughputPoint> {
    let mut per_worker: BTreeMap<&str, Vec<&WorkerSnapshotDbModel>> = BTreeMap::new();
    for row in rows {
        per_worker.entry(row.worker_name.as_str()).or_default().push(row);
    }

    let mut buckets: BTreeMap<(i64, &str), (i64, usize)> = BTreeMap::new();
    for (worker, mut series) in per_worker {
        series.sort_by_key(|r| (r.timestamp, r.id));

        let mut previous: Option<i64> = None;
        for row in series {
            let jobs_done = row.jobs_done();
            let slot = buckets
                .entry((granularity.truncate_ms(row.timestamp), worker))
                .or_insert((0, 0));
            if let Some(prev) = previous {
                slot.0 += (jobs_done - prev).max(0);
                slot.1 += 1;
            }
            previous = Some(jobs_done);
        }
    }

    buckets
        .into_iter()
        .map(|((bucket, worker), (sum, samples))| WorkerThroughputPoint {
            timestamp: ms_to_datetime(bucket),
            worker_name: worker.to_string(),
            throughput: if samples == 0 {
                0.0
            } else {
                sum as f64 / samples as f64
            },
            samples,
        })
        .collect()
}

/// One point per row and status, in row order.
pub fn queue_jobs_series(rows: &[QueueSnapshotDbModel]) -> Vec<TimeSeriesPoint> {
    rows.iter()
        .flat_map(|row| {
            let timestamp = row.sampled_at();
            let counts = row.counts();
            JobStatus::ALL.into_iter().map(move |status| {
                TimeSeriesPoint::QueueJobs(QueueJobsPoint {
                    timestamp,
                    queue_name: row.queue_name.clone(),
                    status,
                    count: counts.get(status),
                })
            })
        })
        .collect()
}

pub fn worker_performance_series(rows: &[WorkerSnapshotDbModel]) -> Vec<TimeSeriesPoint> {
    rows.iter()
        .map(|row| {
            TimeSeriesPoint::WorkerPerformance(WorkerPerformancePoint {
                timestamp: row.sampled_at(),
                worker_name: row.worker_name.clone(),
                successful_jobs: row.successful_jobs,
                failed_jobs: row.failed_jobs,
                working_time: row.working_time,
            })
        })
        .collect()
}
