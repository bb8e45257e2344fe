use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use rq_pulse::analytics::{AnalyticsService, PeriodPreset, TimePeriod, TimeWindow};
use rq_pulse::collector::Collector;
use rq_pulse::config::AnalyticsConfig;
use rq_pulse::database::Database;
use rq_pulse::database::repositories::SqlxSnapshotRepository;
use rq_pulse::logging;
use rq_pulse::metrics::PrometheusExporter;
use rq_pulse::source::RedisSnapshotSource;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Analytics database path (overrides APP_ANALYTICS_DB_PATH)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sample for a bounded time, then stop
    Collect {
        /// Seconds between samples
        #[arg(long, default_value_t = 1)]
        interval: u64,
        /// Seconds to run before stopping
        #[arg(long, default_value_t = 60)]
        duration: u64,
    },
    /// Aggregate queue and worker statistics
    Stats {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Per-worker throughput reconstructed from counters
    Throughput {
        #[arg(long, default_value = "5m")]
        period: String,
        #[arg(long, default_value = "1s")]
        granularity: String,
        /// Explicit window start (RFC 3339), overrides --period
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },
    /// Bucketed queue depth, last value per bucket
    Depth {
        #[arg(long, default_value = "5m")]
        period: String,
        #[arg(long, default_value = "1s")]
        granularity: String,
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },
    /// Delete snapshots older than the retention window
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Print current queue state in Prometheus text format
    Export,
}

fn print_output<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

async fn open_service(config: &AnalyticsConfig) -> anyhow::Result<(Database, AnalyticsService)> {
    let db = Database::open_path(&config.db_path)
        .await
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;
    let repo = Arc::new(SqlxSnapshotRepository::from_database(&db));
    Ok((db, AnalyticsService::new(repo)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AnalyticsConfig::from_env().context("Failed to load configuration")?;
    if let Some(path) = args.db_path.clone() {
        config.db_path = path;
    }

    let level = if args.verbose { "debug" } else { "warn" };
    let (_logging, _guard) = logging::init_logging(level, None)?;

    match args.command {
        Commands::Collect { interval, duration } => {
            let db = Database::open_path(&config.db_path).await?;
            let source = RedisSnapshotSource::connect(config.redis_source_config())
                .await
                .context("Failed to connect to Redis")?;
            let collector = Collector::new(
                Arc::new(source),
                Arc::new(SqlxSnapshotRepository::from_database(&db)),
                config.collector_config(),
            );

            collector.start(Duration::from_secs(interval.max(1)))?;
            info!(interval, duration, "Collecting");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(duration)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
            collector.stop().await;
            db.close().await;

            print_output(args.json, &collector.stats(), |s| {
                println!(
                    "Collected {} ticks ({} failed): {} worker rows, {} queue rows",
                    s.ticks_succeeded, s.ticks_failed, s.worker_rows_written, s.queue_rows_written
                );
            })?;
        }

        Commands::Stats { hours } => {
            let (db, service) = open_service(&config).await?;
            let window = TimeWindow::last(chrono::Duration::hours(hours.max(1)));

            #[derive(Serialize)]
            struct StatsReport {
                queues: Vec<rq_pulse::database::models::QueueStat>,
                workers: Vec<rq_pulse::database::models::WorkerStat>,
            }
            let report = StatsReport {
                queues: service.get_queue_stats(&window).await,
                workers: service.get_worker_stats(&window).await,
            };
            db.close().await;

            print_output(args.json, &report, |r| {
                println!("Queues (last {}h):", hours);
                for q in &r.queues {
                    println!(
                        "  {:<20} {:<10} avg {:>10.2}  min {:>8}  max {:>8}",
                        q.queue_name, q.status, q.avg_count, q.min_count, q.max_count
                    );
                }
                println!("Workers (last {}h):", hours);
                for w in &r.workers {
                    println!(
                        "  {:<30} points {:>6}  successful {:>8}  failed {:>8}  working {:>10.1}s",
                        w.worker_name, w.data_points, w.max_successful, w.max_failed, w.max_working_time
                    );
                }
            })?;
        }

        Commands::Throughput {
            period,
            granularity,
            start,
            end,
        } => {
            let period = TimePeriod::from_tokens(
                Some(period.as_str()),
                PeriodPreset::FiveMinutes,
                start,
                end,
                Some(granularity.as_str()),
            );
            let (db, service) = open_service(&config).await?;
            let points = service.get_worker_throughput(&period).await;
            db.close().await;

            print_output(args.json, &points, |points| {
                for p in points {
                    println!(
                        "{}  {:<30} {:>8.2}",
                        p.timestamp.to_rfc3339(),
                        p.worker_name,
                        p.throughput
                    );
                }
            })?;
        }

        Commands::Depth {
            period,
            granularity,
            start,
            end,
        } => {
            let period = TimePeriod::from_tokens(
                Some(period.as_str()),
                PeriodPreset::FiveMinutes,
                start,
                end,
                Some(granularity.as_str()),
            );
            let (db, service) = open_service(&config).await?;
            let points = service.get_queue_depth(&period).await;
            db.close().await;

            print_output(args.json, &points, |points| {
                for p in points {
                    let c = p.counts;
                    println!(
                        "{}  {:<20} queued {:>6} started {:>6} finished {:>6} failed {:>6} deferred {:>6} scheduled {:>6}",
                        p.timestamp.to_rfc3339(),
                        p.queue_name,
                        c.queued,
                        c.started,
                        c.finished,
                        c.failed,
                        c.deferred,
                        c.scheduled
                    );
                }
            })?;
        }

        Commands::Cleanup { days } => {
            let days = days.unwrap_or(config.retention_days);
            let (db, service) = open_service(&config).await?;
            let stats = service.cleanup_old_data(days).await?;
            db.close().await;

            print_output(args.json, &stats, |s| {
                println!(
                    "Deleted {} rows older than {} days ({} worker, {} queue)",
                    s.total_deleted, days, s.worker_snapshots_deleted, s.queue_snapshots_deleted
                );
            })?;
        }

        Commands::Export => {
            let source = RedisSnapshotSource::connect(config.redis_source_config())
                .await
                .context("Failed to connect to Redis")?;
            let text = PrometheusExporter::new(Arc::new(source)).export().await?;
            print!("{}", text);
        }
    }

    Ok(())
}
