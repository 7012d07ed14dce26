use std::env;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_NAME: &str = "vs-presence-bridge.log";
const KEEP_LOG_DAYS: u64 = 7;

/// Console logs go to stderr; a daily file is added when the log directory
/// can be created. Keep the returned guard alive to flush the file writer.
pub fn init() -> Option<WorkerGuard> {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr);

    let log_dir = log_directory();
    let (file_layer, guard) = match &log_dir {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(file_writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "vs-presence-bridge starting");
    if let Some(log_dir) = log_dir {
        tracing::debug!(log_dir = %log_dir.display(), "File logging enabled");
        cleanup_old_logs(&log_dir, KEEP_LOG_DAYS);
    }

    guard
}

fn env_filter() -> EnvFilter {
    let debug_enabled = env::var("VS_PRESENCE_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn log_directory() -> Option<PathBuf> {
    let log_dir = dirs::data_local_dir()?.join("vs-presence").join("logs");
    match fs_err::create_dir_all(&log_dir) {
        Ok(()) => Some(log_dir),
        Err(err) => {
            eprintln!("Warning: {err}");
            None
        }
    }
}

fn cleanup_old_logs(log_dir: &Path, keep_days: u64) {
    let Some(cutoff) =
        SystemTime::now().checked_sub(Duration::from_secs(keep_days * 24 * 60 * 60))
    else {
        return;
    };

    let entries = match fs_err::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to read log directory for cleanup");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_rotated = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(LOG_FILE_NAME) && name != LOG_FILE_NAME)
            .unwrap_or(false);
        if !is_rotated {
            continue;
        }

        let modified = match entry.metadata().and_then(|metadata| metadata.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if modified < cutoff {
            match fs_err::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed old log file"),
                Err(err) => tracing::warn!(error = %err, "Failed to remove old log file"),
            }
        }
    }
}
