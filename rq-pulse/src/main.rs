use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rq_pulse::collector::Collector;
use rq_pulse::config::AnalyticsConfig;
use rq_pulse::database::Database;
use rq_pulse::database::repositories::SqlxSnapshotRepository;
use rq_pulse::logging;
use rq_pulse::source::RedisSnapshotSource;

#[global_allocator]
static GLOBAL_ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AnalyticsConfig::from_env().context("Failed to load configuration")?;

    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_level, config.log_dir.as_deref())?;
    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.clone());

    if !config.enabled {
        warn!("Analytics collection is disabled (APP_ANALYTICS_ENABLED=false)");
        return Ok(());
    }

    let db = Database::open_path(&config.db_path)
        .await
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;
    info!(path = %config.db_path.display(), "Analytics store ready");

    let source = RedisSnapshotSource::connect(config.redis_source_config())
        .await
        .context("Failed to connect to Redis")?;

    let collector = Collector::new(
        Arc::new(source),
        Arc::new(SqlxSnapshotRepository::from_database(&db)),
        config.collector_config(),
    );
    collector.start(config.collection_interval())?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    collector.stop().await;
    shutdown.cancel();
    db.close().await;

    let stats = collector.stats();
    info!(
        ticks = stats.ticks_succeeded,
        failed = stats.ticks_failed,
        "rq-pulse stopped"
    );
    Ok(())
}
