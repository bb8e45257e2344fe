//! Logging setup with a reloadable filter and optional rolling file output.
//!
//! - Runtime filter changes via `tracing_subscriber::reload`
//! - Console output with local timezone timestamps
//! - Daily-rotated log files when a log directory is configured, with old
//!   files pruned by a background task

use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "rq_pulse=info,sqlx=warn";

/// Rolling log file prefix; rotated files are `rq-pulse.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "rq-pulse.log";

/// Log retention period in days.
const LOG_RETENTION_DAYS: i64 = 7;

const LOG_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Timer that formats timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle onto the installed subscriber.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: Option<PathBuf>,
}

impl LoggingConfig {
    fn new(handle: FilterHandle, log_dir: Option<PathBuf>) -> Self {
        Self { handle, log_dir }
    }

    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the active filter, e.g. `"rq_pulse=debug,sqlx=warn"`.
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| crate::Error::config(format!("bad log filter '{}': {}", directive, e)))?;
        self.handle
            .reload(filter)
            .map_err(|e| crate::Error::Other(format!("log filter reload: {}", e)))?;

        info!(directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Prune rotated log files once a day until `cancel_token` fires.
    /// No-op without a log directory.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let Some(log_dir) = self.log_dir.clone() else {
            return;
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LOG_SWEEP_INTERVAL);
            // Skip the immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => match cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, dir = %log_dir.display(), "Pruned old log files"),
                        Err(e) => warn!(error = %e, "Log retention sweep failed"),
                    },
                }
            }
            debug!("Log retention sweep stopped");
        });
    }
}

/// Filter directive for an `APP_LOG_LEVEL`-style level name.
///
/// A bare level (`debug`) scopes to this crate; anything containing `=` or `,`
/// is taken as a full directive.
pub fn filter_directive(log_level: &str) -> String {
    let level = log_level.trim();
    if level.is_empty() {
        DEFAULT_LOG_FILTER.to_string()
    } else if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("rq_pulse={},sqlx=warn", level.to_ascii_lowercase())
    }
}

/// Whether a file name is a rotated log file dated before `cutoff_ts`.
fn is_expired_log(filename: &str, cutoff_ts: i64) -> bool {
    let Some(date_str) = filename
        .strip_prefix(LOG_FILE_PREFIX)
        .and_then(|rest| rest.strip_prefix('.'))
    else {
        return false;
    };

    chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp() < cutoff_ts)
        .unwrap_or(false)
}

/// Delete rotated log files older than `retention_days`, returning how many went.
async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff_ts = (Utc::now() - chrono::Duration::days(retention_days)).timestamp();
    let mut dir = tokio::fs::read_dir(log_dir).await?;
    let mut removed = 0;

    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        let expired = path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| is_expired_log(name, cutoff_ts));
        if !expired {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Could not remove log file"),
        }
    }

    Ok(removed)
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `log_level`. Keep the returned guard alive for the
/// process lifetime, or buffered file output is lost.
pub fn init_logging(
    log_level: &str,
    log_dir: Option<&Path>,
) -> crate::Result<(Arc<LoggingConfig>, Option<WorkerGuard>)> {
    let initial_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directive(log_level)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    let config = Arc::new(LoggingConfig::new(
        filter_handle,
        log_dir.map(Path::to_path_buf),
    ));

    Ok((config, guard))
}
