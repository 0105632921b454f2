//! # Process Logging
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` (a set `RUST_LOG`
//! overrides the configured level), a stdout layer and a daily-rolling file
//! layer written through a non-blocking worker.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Rolled files kept per prefix, the active one included.
pub const KEEP_LOG_FILES: usize = 7;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to prepare log directory {path}: {source}")]
    Directory { path: PathBuf, source: std::io::Error },

    #[error("invalid log level '{level}': {reason}")]
    Level { level: String, reason: String },

    #[error("failed to open log file: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

/// Sets up stdout and file logging for the process.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// in `main` for the lifetime of the process.
///
/// # Arguments
/// * `file_prefix` - File name prefix, e.g. "dispatcher" for `dispatcher.2024-05-01.log`.
/// * `log_dir` - Directory for log files, created when missing.
/// * `level` - Default filter directive (trace, debug, info, warn, error).
/// * `json` - Emit JSON lines instead of the human-readable format.
pub fn setup_logging(file_prefix: &str, log_dir: &Path, level: &str, json: bool) -> Result<WorkerGuard, LoggingError> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir).map_err(|source| LoggingError::Directory {
            path: log_dir.to_path_buf(),
            source,
        })?;
    }

    // Failing to prune is not a reason to run without logs.
    if let Err(e) = prune_old_logs(log_dir, file_prefix, KEEP_LOG_FILES) {
        eprintln!("failed to prune old log files in {}: {e}", log_dir.display());
    }

    let filter = build_filter(level)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_prefix)
        .filename_suffix("log")
        .build(log_dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stdout))
            .with(fmt::layer().json().with_ansi(false).with_writer(file_writer))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stdout))
            .with(fmt::layer().with_ansi(false).with_writer(file_writer))
            .try_init()?;
    }

    Ok(guard)
}

fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(from_env) = EnvFilter::try_from_default_env() {
        return Ok(from_env);
    }
    EnvFilter::try_new(level.to_ascii_lowercase()).map_err(|e| LoggingError::Level {
        level: level.to_string(),
        reason: e.to_string(),
    })
}

/// Deletes all but the `keep` most recently modified `<prefix>*.log` files.
///
/// Returns the number of files removed.
pub fn prune_old_logs(log_dir: &Path, prefix: &str, keep: usize) -> std::io::Result<usize> {
    let mut entries: Vec<(SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(prefix) && name.ends_with(".log")
        })
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Newest first.
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("failed to delete old log file {}: {e}", path.display()),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn touch(dir: &Path, name: &str, age_secs: u64) {
        let file = File::create(dir.join(name)).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs)).unwrap();
    }

    #[test]
    fn test_prune_keeps_newest_of_prefix() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "dispatcher.2024-05-01.log", 300);
        touch(dir.path(), "dispatcher.2024-05-02.log", 200);
        touch(dir.path(), "dispatcher.2024-05-03.log", 100);
        touch(dir.path(), "message_service.2024-05-01.log", 900);
        touch(dir.path(), "dispatcher.notes.txt", 900);

        let removed = prune_old_logs(dir.path(), "dispatcher", 2).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("dispatcher.2024-05-01.log").exists());
        assert!(dir.path().join("dispatcher.2024-05-02.log").exists());
        assert!(dir.path().join("dispatcher.2024-05-03.log").exists());
        assert!(dir.path().join("message_service.2024-05-01.log").exists());
        assert!(dir.path().join("dispatcher.notes.txt").exists());
    }

    #[test]
    fn test_prune_with_fewer_files_than_keep() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "dispatcher.2024-05-01.log", 10);
        assert_eq!(prune_old_logs(dir.path(), "dispatcher", KEEP_LOG_FILES).unwrap(), 0);
    }
}
