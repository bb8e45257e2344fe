//! Snapshot accessor for the live job-queue system.
//!
//! A [`SnapshotSource`] answers two questions about the queue system right now:
//! which workers exist (with their cumulative counters) and how many jobs sit
//! in each status of each queue. Implementations either return a complete,
//! validated answer or fail the whole call; partial results are never returned.

pub mod rq;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use self::rq::{RedisSnapshotSource, RedisSourceConfig};

/// Job statuses tracked per queue.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
    Deferred,
    Scheduled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Started,
        JobStatus::Finished,
        JobStatus::Failed,
        JobStatus::Deferred,
        JobStatus::Scheduled,
    ];
}

/// Worker state as reported by RQ.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Started,
    Idle,
    Busy,
    Suspended,
    Unknown,
}

impl WorkerState {
    /// Parse a raw state string; anything unrecognised becomes `Unknown`.
    pub fn parse(s: &str) -> Self {
        s.trim().to_ascii_lowercase().parse().unwrap_or(Self::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        (*self).into()
    }
}

/// Point-in-time description of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub name: String,
    /// Queue names in the order the worker listens on them.
    pub queues: Vec<String>,
    pub state: WorkerState,
    /// Cumulative since worker start.
    pub successful_job_count: i64,
    /// Cumulative since worker start.
    pub failed_job_count: i64,
    /// Cumulative seconds spent executing jobs.
    pub total_working_time: f64,
}

impl WorkerDescriptor {
    pub fn new(name: impl Into<String>, queues: Vec<String>) -> Self {
        Self {
            name: name.into(),
            queues,
            state: WorkerState::Idle,
            successful_job_count: 0,
            failed_job_count: 0,
            total_working_time: 0.0,
        }
    }

    pub fn with_state(mut self, state: WorkerState) -> Self {
        self.state = state;
        self
    }

    pub fn with_counts(mut self, successful: i64, failed: i64) -> Self {
        self.successful_job_count = successful;
        self.failed_job_count = failed;
        self
    }

    pub fn with_working_time(mut self, seconds: f64) -> Self {
        self.total_working_time = seconds;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_snapshot("worker", "empty worker name"));
        }
        if self.successful_job_count < 0 || self.failed_job_count < 0 {
            return Err(Error::invalid_snapshot(
                "worker",
                format!("negative job counter for '{}'", self.name),
            ));
        }
        if !self.total_working_time.is_finite() || self.total_working_time < 0.0 {
            return Err(Error::invalid_snapshot(
                "worker",
                format!(
                    "invalid working time {} for '{}'",
                    self.total_working_time, self.name
                ),
            ));
        }
        Ok(())
    }
}

/// Job counts by status for a single queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: i64,
    pub started: i64,
    pub finished: i64,
    pub failed: i64,
    pub deferred: i64,
    pub scheduled: i64,
}

impl QueueCounts {
    pub fn get(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Started => self.started,
            JobStatus::Finished => self.finished,
            JobStatus::Failed => self.failed,
            JobStatus::Deferred => self.deferred,
            JobStatus::Scheduled => self.scheduled,
        }
    }

    pub fn set(&mut self, status: JobStatus, count: i64) {
        let slot = match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Started => &mut self.started,
            JobStatus::Finished => &mut self.finished,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Deferred => &mut self.deferred,
            JobStatus::Scheduled => &mut self.scheduled,
        };
        *slot = count;
    }

    /// Iterate `(status, count)` in the canonical status order.
    pub fn iter(&self) -> impl Iterator<Item = (JobStatus, i64)> + '_ {
        JobStatus::ALL.into_iter().map(|s| (s, self.get(s)))
    }

    pub fn validate(&self, queue_name: &str) -> Result<()> {
        if queue_name.trim().is_empty() {
            return Err(Error::invalid_snapshot("queue", "empty queue name"));
        }
        if let Some((status, count)) = self.iter().find(|(_, c)| *c < 0) {
            return Err(Error::invalid_snapshot(
                "queue",
                format!("negative {} count {} for '{}'", status, count, queue_name),
            ));
        }
        Ok(())
    }
}

/// Queue name to status counts. Ordered so snapshots are deterministic.
pub type QueuesSnapshot = BTreeMap<String, QueueCounts>;

/// Read-only view onto the live job-queue system.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Every registered worker with its cumulative counters.
    async fn get_workers_snapshot(&self) -> Result<Vec<WorkerDescriptor>>;

    /// Status counts for every known queue.
    async fn get_all_queues_snapshot(&self) -> Result<QueuesSnapshot>;
}

/// Validate a whole worker snapshot; the first bad record fails all of it.
pub fn validate_workers(workers: &[WorkerDescriptor]) -> Result<()> {
    workers.iter().try_for_each(WorkerDescriptor::validate)
}

/// Validate a whole queue snapshot; the first bad record fails all of it.
pub fn validate_queues(queues: &QueuesSnapshot) -> Result<()> {
    queues
        .iter()
        .try_for_each(|(name, counts)| counts.validate(name))
}
