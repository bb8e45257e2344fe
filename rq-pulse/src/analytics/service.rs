//! Query engine facade over the snapshot store.
//!
//! Read paths never fail outward: a store error is logged and the caller gets
//! an empty result. Retention is a write and propagates its error.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{error, warn};

use super::period::{TimePeriod, TimeWindow};
use super::series::{
    self, MetricType, QueueDepthPoint, TimeSeriesPoint, WorkerThroughputPoint,
};
use crate::Result;
use crate::database::models::{CleanupStats, QueueStat, WorkerStat};
use crate::database::repositories::SnapshotRepository;
use crate::source::JobStatus;

/// Lookback used by [`AnalyticsService::get_dashboard_summary`].
pub const DASHBOARD_LOOKBACK_HOURS: i64 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueSummary {
    pub total_queued: i64,
    pub total_failed: i64,
    pub total_finished: i64,
    pub unique_queues: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerSummary {
    pub active_workers: usize,
    pub total_successful_jobs: i64,
    pub total_failed_jobs: i64,
    pub avg_working_time: f64,
}

/// Last-hour rollup for the main dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub queues: QueueSummary,
    pub workers: WorkerSummary,
}

impl DashboardSummary {
    pub fn from_stats(queue_stats: &[QueueStat], worker_stats: &[WorkerStat]) -> Self {
        let sum_status = |status: JobStatus| -> i64 {
            queue_stats
                .iter()
                .filter(|q| q.status == status)
                .map(|q| q.avg_count)
                .sum::<f64>() as i64
        };

        let mut queue_names: Vec<&str> = queue_stats.iter().map(|q| q.queue_name.as_str()).collect();
        queue_names.sort_unstable();
        queue_names.dedup();

        let active_workers = worker_stats.len();
        let working_time: f64 = worker_stats.iter().map(|w| w.avg_working_time).sum();

        Self {
            queues: QueueSummary {
                total_queued: sum_status(JobStatus::Queued),
                total_failed: sum_status(JobStatus::Failed),
                total_finished: sum_status(JobStatus::Finished),
                unique_queues: queue_names.len(),
            },
            workers: WorkerSummary {
                active_workers,
                total_successful_jobs: worker_stats.iter().map(|w| w.avg_successful).sum::<f64>() as i64,
                total_failed_jobs: worker_stats.iter().map(|w| w.avg_failed).sum::<f64>() as i64,
                avg_working_time: working_time / active_workers.max(1) as f64,
            },
        }
    }
}

/// Query engine consumed by the API and exporter layers.
#[derive(Clone)]
pub struct AnalyticsService {
    repo: Arc<dyn SnapshotRepository>,
}

impl AnalyticsService {
    pub fn new(repo: Arc<dyn SnapshotRepository>) -> Self {
        Self { repo }
    }

    fn or_empty<T>(op: &str, result: Result<Vec<T>>) -> Vec<T> {
        result.unwrap_or_else(|e| {
            error!(error = %e, "Analytics query {} failed", op);
            Vec::new()
        })
    }

    pub async fn get_queue_stats(&self, window: &TimeWindow) -> Vec<QueueStat> {
        Self::or_empty("get_queue_stats", self.repo.get_queue_stats(window).await)
    }

    pub async fn get_worker_stats(&self, window: &TimeWindow) -> Vec<WorkerStat> {
        Self::or_empty("get_worker_stats", self.repo.get_worker_stats(window).await)
    }

    /// Raw chart series for `metric` (`queue_jobs` or `worker_performance`).
    pub async fn get_time_series(&self, metric: &str, period: &TimePeriod) -> Vec<TimeSeriesPoint> {
        let Ok(metric_type) = MetricType::from_str(metric) else {
            warn!(metric, "Unknown time series metric");
            return Vec::new();
        };

        let window = period.resolve();
        match metric_type {
            MetricType::QueueJobs => {
                let rows = Self::or_empty(
                    "get_time_series",
                    self.repo.list_queue_snapshots(&window).await,
                );
                series::queue_jobs_series(&rows)
            }
            MetricType::WorkerPerformance => {
                let rows = Self::or_empty(
                    "get_time_series",
                    self.repo.list_worker_snapshots(&window).await,
                );
                series::worker_performance_series(&rows)
            }
        }
    }

    pub async fn get_worker_throughput(&self, period: &TimePeriod) -> Vec<WorkerThroughputPoint> {
        let rows = Self::or_empty(
            "get_worker_throughput",
            self.repo.list_worker_snapshots(&period.resolve()).await,
        );
        series::reconstruct_worker_throughput(&rows, period.granularity)
    }

    pub async fn get_queue_depth(&self, period: &TimePeriod) -> Vec<QueueDepthPoint> {
        let rows = Self::or_empty(
            "get_queue_depth",
            self.repo.list_queue_snapshots(&period.resolve()).await,
        );
        series::bucket_queue_depth(&rows, period.granularity)
    }

    pub async fn get_dashboard_summary(&self) -> DashboardSummary {
        let window = TimeWindow::ending_at(Utc::now(), Duration::hours(DASHBOARD_LOOKBACK_HOURS));
        let queue_stats = self.get_queue_stats(&window).await;
        let worker_stats = self.get_worker_stats(&window).await;
        DashboardSummary::from_stats(&queue_stats, &worker_stats)
    }

    pub async fn cleanup_old_data(&self, retention_days: u32) -> Result<CleanupStats> {
        self.repo.cleanup_old_data(retention_days).await
    }
}
