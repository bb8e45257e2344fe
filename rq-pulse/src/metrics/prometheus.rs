//! Prometheus metrics exporter.
//!
//! Renders the queue system's current state in Prometheus text format straight
//! from one accessor snapshot; nothing is read from the store.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::Result;
use crate::source::{QueuesSnapshot, SnapshotSource, WorkerDescriptor};

/// Prometheus metrics exporter.
pub struct PrometheusExporter {
    source: Arc<dyn SnapshotSource>,
    namespace: String,
}

impl PrometheusExporter {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self::with_namespace(source, "rq")
    }

    pub fn with_namespace(source: Arc<dyn SnapshotSource>, namespace: impl Into<String>) -> Self {
        Self {
            source,
            namespace: namespace.into(),
        }
    }

    /// Take a snapshot and render it. Accessor errors propagate.
    pub async fn export(&self) -> Result<String> {
        let workers = self.source.get_workers_snapshot().await?;
        let queues = self.source.get_all_queues_snapshot().await?;
        Ok(self.render(&workers, &queues))
    }

    /// Render an already-taken snapshot.
    pub fn render(&self, workers: &[WorkerDescriptor], queues: &QueuesSnapshot) -> String {
        let mut output = String::new();
        let worker_queues: Vec<String> = workers.iter().map(|w| w.queues.join(",")).collect();

        self.write_header(&mut output, "workers", "RQ workers", "gauge");
        for (worker, queues) in workers.iter().zip(&worker_queues) {
            self.write_sample(
                &mut output,
                "workers",
                1.0,
                &[
                    ("name", &worker.name),
                    ("state", worker.state.as_str()),
                    ("queues", queues),
                ],
            );
        }

        // Counter families carry the `_total` suffix on every line
        let counters: [(&str, &str, fn(&WorkerDescriptor) -> f64); 3] = [
            ("workers_success_total", "RQ workers success count", |w| {
                w.successful_job_count as f64
            }),
            ("workers_failed_total", "RQ workers fail count", |w| {
                w.failed_job_count as f64
            }),
            ("workers_working_time_total", "RQ workers spent seconds", |w| {
                w.total_working_time
            }),
        ];
        for (name, help, value) in counters {
            self.write_header(&mut output, name, help, "counter");
            for (worker, queues) in workers.iter().zip(&worker_queues) {
                self.write_sample(
                    &mut output,
                    name,
                    value(worker),
                    &[("name", &worker.name), ("queues", queues)],
                );
            }
        }

        self.write_header(&mut output, "jobs", "RQ jobs by state", "gauge");
        for (queue, counts) in queues {
            for (status, count) in counts.iter() {
                let status = status.to_string();
                self.write_sample(
                    &mut output,
                    "jobs",
                    count as f64,
                    &[("queue", queue), ("status", &status)],
                );
            }
        }

        output
    }

    fn write_header(&self, output: &mut String, name: &str, help: &str, kind: &str) {
        let full_name = format!("{}_{}", self.namespace, name);
        let _ = writeln!(output, "# HELP {} {}", full_name, help);
        let _ = writeln!(output, "# TYPE {} {}", full_name, kind);
    }

    fn write_sample(&self, output: &mut String, name: &str, value: f64, labels: &[(&str, &str)]) {
        let labels_str = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect::<Vec<_>>()
            .join(",");

        let _ = writeln!(
            output,
            "{}_{}{{{}}} {}",
            self.namespace, name, labels_str, value
        );
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::source::{JobStatus, QueueCounts, WorkerState};
    use async_trait::async_trait;

    struct FixedSource {
        reachable: bool,
    }

    #[async_trait]
    impl SnapshotSource for FixedSource {
        async fn get_workers_snapshot(&self) -> Result<Vec<WorkerDescriptor>> {
            if !self.reachable {
                return Err(Error::source_unavailable("connection refused"));
            }
            Ok(vec![
                WorkerDescriptor::new("w1", vec!["high".into(), "default".into()])
                    .with_state(WorkerState::Busy)
                    .with_counts(10, 2)
                    .with_working_time(4.5),
            ])
        }

        async fn get_all_queues_snapshot(&self) -> Result<QueuesSnapshot> {
            let mut counts = QueueCounts::default();
            counts.set(JobStatus::Queued, 3);
            let mut queues = QueuesSnapshot::new();
            queues.insert("default".into(), counts);
            Ok(queues)
        }
    }

    #[tokio::test]
    async fn test_export_renders_all_families() {
        let exporter = PrometheusExporter::new(Arc::new(FixedSource { reachable: true }));
        let output = exporter.export().await.unwrap();

        assert!(output.contains("# TYPE rq_workers gauge"));
        assert!(output.contains(r#"rq_workers{name="w1",state="busy",queues="high,default"} 1"#));
        assert!(output.contains(r#"rq_workers_success_total{name="w1",queues="high,default"} 10"#));
        assert!(output.contains(r#"rq_workers_failed_total{name="w1",queues="high,default"} 2"#));
        assert!(
            output.contains(r#"rq_workers_working_time_total{name="w1",queues="high,default"} 4.5"#)
        );
        assert!(output.contains(r#"rq_jobs{queue="default",status="queued"} 3"#));
        assert!(output.contains(r#"rq_jobs{queue="default",status="scheduled"} 0"#));
        assert_eq!(output.matches("# TYPE rq_jobs gauge").count(), 1);
    }

    #[test]
    fn test_counter_families_use_total_suffix() {
        let exporter = PrometheusExporter::new(Arc::new(FixedSource { reachable: true }));
        let workers = vec![WorkerDescriptor::new("w1", vec![]).with_counts(3, 1)];
        let output = exporter.render(&workers, &QueuesSnapshot::new());

        for family in ["rq_workers_success", "rq_workers_failed", "rq_workers_working_time"] {
            assert!(output.contains(&format!("# HELP {}_total ", family)));
            assert!(output.contains(&format!("# TYPE {}_total counter", family)));
            assert!(!output.contains(&format!("{}{{", family)));
        }
        assert!(output.contains(r#"rq_workers_success_total{name="w1",queues=""} 3"#));
        // Gauges keep their plain names
        assert!(output.contains("# TYPE rq_workers gauge"));
    }

    #[tokio::test]
    async fn test_export_propagates_source_errors() {
        let exporter = PrometheusExporter::new(Arc::new(FixedSource { reachable: false }));
        let err = exporter.export().await.unwrap_err();
        assert!(err.is_source_error());
    }

    #[test]
    fn test_custom_namespace_and_escaping() {
        let exporter =
            PrometheusExporter::with_namespace(Arc::new(FixedSource { reachable: true }), "jobs");
        let workers = vec![WorkerDescriptor::new("odd\"name", vec![])];
        let output = exporter.render(&workers, &QueuesSnapshot::new());

        assert!(output.contains(r#"jobs_workers{name="odd\"name",state="idle",queues=""} 1"#));
    }
}
