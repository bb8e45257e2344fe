//! Snapshot source reading RQ's key layout straight out of Redis.
//!
//! Key layout:
//! - `rq:workers`: set of worker keys `rq:worker:<name>`, each a hash with
//!   `queues`, `state`, `successful_job_count`, `failed_job_count`, `total_working_time`.
//! - `rq:queues`: set of queue keys `rq:queue:<name>`, each a list of job ids.
//! - `rq:wip:<q>`, `rq:finished:<q>`, `rq:failed:<q>`, `rq:deferred:<q>`,
//!   `rq:scheduled:<q>`: sorted-set registries per queue.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisResult};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    JobStatus, QueueCounts, QueuesSnapshot, SnapshotSource, WorkerDescriptor, WorkerState,
    validate_queues, validate_workers,
};
use crate::{Error, Result};

pub const WORKERS_REGISTRY_KEY: &str = "rq:workers";
pub const WORKER_KEY_PREFIX: &str = "rq:worker:";
pub const QUEUES_REGISTRY_KEY: &str = "rq:queues";
pub const QUEUE_KEY_PREFIX: &str = "rq:queue:";

/// Connection settings for [`RedisSnapshotSource`].
#[derive(Debug, Clone)]
pub struct RedisSourceConfig {
    /// `redis://` or `rediss://` URL.
    pub url: String,
    /// Upper bound for connecting and for each snapshot round-trip.
    pub timeout: Duration,
}

impl Default for RedisSourceConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// [`SnapshotSource`] backed by a Redis instance that RQ workers report into.
pub struct RedisSnapshotSource {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisSnapshotSource {
    /// Connect to Redis. Fails with `SourceUnavailable` if the server cannot be reached in time.
    pub async fn connect(config: RedisSourceConfig) -> Result<Self> {
        let client = ::redis::Client::open(config.url.as_str())
            .map_err(|e| Error::config(format!("Invalid Redis URL: {}", e)))?;

        let conn = tokio::time::timeout(config.timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                Error::source_unavailable(format!(
                    "timed out connecting to Redis after {:?}",
                    config.timeout
                ))
            })?
            .map_err(|e| Error::source_unavailable(format!("Redis connection failed: {}", e)))?;

        info!(timeout = ?config.timeout, "Connected to Redis snapshot source");

        Ok(Self {
            conn,
            timeout: config.timeout,
        })
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::source_unavailable(format!("{}: {}", op, e))),
            Err(_) => Err(Error::source_unavailable(format!(
                "{}: timed out after {:?}",
                op, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl SnapshotSource for RedisSnapshotSource {
    async fn get_workers_snapshot(&self) -> Result<Vec<WorkerDescriptor>> {
        let mut conn = self.conn.clone();

        let mut keys: Vec<String> = self
            .bounded("SMEMBERS rq:workers", conn.smembers(WORKERS_REGISTRY_KEY))
            .await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        keys.sort();

        let mut pipe = ::redis::pipe();
        for key in &keys {
            pipe.hgetall(key);
        }
        let hashes: Vec<HashMap<String, String>> = self
            .bounded("HGETALL rq:worker:*", pipe.query_async(&mut conn))
            .await?;

        let mut workers = Vec::with_capacity(keys.len());
        for (key, hash) in keys.iter().zip(hashes) {
            // Registered but already gone: the worker died between the two reads.
            if hash.is_empty() {
                debug!(key = %key, "Skipping worker with no hash");
                continue;
            }
            workers.push(parse_worker_hash(strip_key(key, WORKER_KEY_PREFIX), &hash)?);
        }

        validate_workers(&workers)?;
        Ok(workers)
    }

    async fn get_all_queues_snapshot(&self) -> Result<QueuesSnapshot> {
        let mut conn = self.conn.clone();

        let keys: Vec<String> = self
            .bounded("SMEMBERS rq:queues", conn.smembers(QUEUES_REGISTRY_KEY))
            .await?;
        let mut names: Vec<&str> = keys
            .iter()
            .map(|k| strip_key(k, QUEUE_KEY_PREFIX))
            .collect();
        names.sort_unstable();
        names.dedup();
        if names.is_empty() {
            return Ok(QueuesSnapshot::new());
        }

        let mut pipe = ::redis::pipe();
        for name in &names {
            for status in JobStatus::ALL {
                let key = status_key(name, status);
                match status {
                    JobStatus::Queued => pipe.llen(key),
                    _ => pipe.zcard(key),
                };
            }
        }
        let counts: Vec<i64> = self
            .bounded("queue registry counts", pipe.query_async(&mut conn))
            .await?;

        let snapshot = assemble_queue_counts(&names, &counts)?;
        validate_queues(&snapshot)?;
        Ok(snapshot)
    }
}

fn strip_key<'a>(key: &'a str, prefix: &str) -> &'a str {
    key.strip_prefix(prefix).unwrap_or(key)
}

/// Redis key holding the jobs of `queue` in `status`.
pub fn status_key(queue: &str, status: JobStatus) -> String {
    match status {
        JobStatus::Queued => format!("{}{}", QUEUE_KEY_PREFIX, queue),
        JobStatus::Started => format!("rq:wip:{}", queue),
        JobStatus::Finished => format!("rq:finished:{}", queue),
        JobStatus::Failed => format!("rq:failed:{}", queue),
        JobStatus::Deferred => format!("rq:deferred:{}", queue),
        JobStatus::Scheduled => format!("rq:scheduled:{}", queue),
    }
}

fn assemble_queue_counts(names: &[&str], counts: &[i64]) -> Result<QueuesSnapshot> {
    let width = JobStatus::ALL.len();
    if counts.len() != names.len() * width {
        return Err(Error::invalid_snapshot(
            "queue",
            format!(
                "expected {} registry counts, got {}",
                names.len() * width,
                counts.len()
            ),
        ));
    }

    Ok(names
        .iter()
        .zip(counts.chunks(width))
        .map(|(name, row)| {
            let mut queue = QueueCounts::default();
            for (status, count) in JobStatus::ALL.into_iter().zip(row) {
                queue.set(status, *count);
            }
            (name.to_string(), queue)
        })
        .collect())
}

fn parse_i64_field(name: &str, hash: &HashMap<String, String>, field: &str) -> Result<i64> {
    match hash.get(field).map(|v| v.trim()) {
        None | Some("") => Ok(0),
        Some(raw) => raw.parse().map_err(|_| {
            Error::invalid_snapshot("worker", format!("{}: {} = {:?}", name, field, raw))
        }),
    }
}

fn parse_f64_field(name: &str, hash: &HashMap<String, String>, field: &str) -> Result<f64> {
    match hash.get(field).map(|v| v.trim()) {
        None | Some("") => Ok(0.0),
        Some(raw) => raw.parse().map_err(|_| {
            Error::invalid_snapshot("worker", format!("{}: {} = {:?}", name, field, raw))
        }),
    }
}

/// Build a typed worker record from an `rq:worker:<name>` hash.
///
/// Missing counters default to zero (a freshly registered worker has not
/// written them yet); present but unparsable ones fail the snapshot.
pub fn parse_worker_hash(name: &str, hash: &HashMap<String, String>) -> Result<WorkerDescriptor> {
    let queues = hash
        .get("queues")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let worker = WorkerDescriptor {
        name: name.to_string(),
        queues,
        state: WorkerState::parse(hash.get("state").map(String::as_str).unwrap_or("")),
        successful_job_count: parse_i64_field(name, hash, "successful_job_count")?,
        failed_job_count: parse_i64_field(name, hash, "failed_job_count")?,
        total_working_time: parse_f64_field(name, hash, "total_working_time")?,
    };
    worker.validate()?;
    Ok(worker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_worker_hash() {
        let h = hash(&[
            ("queues", "high,default, low"),
            ("state", "busy"),
            ("successful_job_count", "10"),
            ("failed_job_count", "2"),
            ("total_working_time", "12.5"),
        ]);

        let worker = parse_worker_hash("w1", &h).unwrap();
        assert_eq!(worker.name, "w1");
        assert_eq!(worker.queues, vec!["high", "default", "low"]);
        assert_eq!(worker.state, WorkerState::Busy);
        assert_eq!(worker.successful_job_count, 10);
        assert_eq!(worker.failed_job_count, 2);
        assert_eq!(worker.total_working_time, 12.5);
    }

    #[test]
    fn test_parse_worker_hash_defaults_missing_counters() {
        let worker = parse_worker_hash("fresh", &hash(&[("state", "started")])).unwrap();
        assert!(worker.queues.is_empty());
        assert_eq!(worker.successful_job_count, 0);
        assert_eq!(worker.failed_job_count, 0);
        assert_eq!(worker.total_working_time, 0.0);
    }

    #[test]
    fn test_parse_worker_hash_rejects_garbage() {
        let h = hash(&[("successful_job_count", "ten")]);
        let err = parse_worker_hash("w1", &h).unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshot { .. }));

        let h = hash(&[("failed_job_count", "-3")]);
        assert!(parse_worker_hash("w1", &h).is_err());
    }

    #[test]
    fn test_status_keys() {
        assert_eq!(status_key("default", JobStatus::Queued), "rq:queue:default");
        assert_eq!(status_key("default", JobStatus::Started), "rq:wip:default");
        assert_eq!(
            status_key("default", JobStatus::Scheduled),
            "rq:scheduled:default"
        );
    }

    #[test]
    fn test_strip_key() {
        assert_eq!(strip_key("rq:worker:w1", WORKER_KEY_PREFIX), "w1");
        assert_eq!(strip_key("odd", WORKER_KEY_PREFIX), "odd");
    }

    #[test]
    fn test_assemble_queue_counts() {
        let names = ["default", "high"];
        let counts = [1, 2, 3, 4, 5, 6, 10, 0, 0, 7, 0, 0];
        let snapshot = assemble_queue_counts(&names, &counts).unwrap();

        let default = snapshot["default"];
        assert_eq!(default.queued, 1);
        assert_eq!(default.scheduled, 6);
        assert_eq!(snapshot["high"].failed, 7);

        assert!(assemble_queue_counts(&names, &counts[..11]).is_err());
    }
}
