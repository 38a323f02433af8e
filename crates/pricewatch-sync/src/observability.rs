//! Process-wide logging: console narration plus size-capped activity/error files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const ACTIVITY_DIR: &str = "activity_logs";
pub const ERRORS_DIR: &str = "errors";
pub const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;

const FILE_DIRECTIVES: &str = "info,pricewatch_core=debug,pricewatch_render=debug,\
pricewatch_extract=debug,pricewatch_sheets=debug,pricewatch_sync=debug";

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub root: PathBuf,
    /// Rotated files kept per log before the oldest is deleted.
    pub backups: usize,
    /// Size at which the live file is rotated.
    pub max_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirs {
    pub activity: PathBuf,
    pub errors: PathBuf,
}

/// Create both log directories under `root` if they are missing.
pub fn ensure_log_dirs(root: &Path) -> Result<LogDirs> {
    let dirs = LogDirs {
        activity: root.join(ACTIVITY_DIR),
        errors: root.join(ERRORS_DIR),
    };
    for dir in [&dirs.activity, &dirs.errors] {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    Ok(dirs)
}

/// `<dir>/<name>.log`, rotated to `<name>.log.1`, `.2`, ... once it reaches `max_bytes`.
pub fn size_capped_file(dir: &Path, name: &str, max_bytes: u64, backups: usize) -> FileRotate<AppendCount> {
    FileRotate::new(
        dir.join(format!("{name}.log")),
        AppendCount::new(backups.max(1)),
        ContentLimit::Bytes(max_bytes.max(1) as usize),
        Compression::None,
        #[cfg(unix)]
        None,
    )
}

/// Keeps the non-blocking writers alive. Dropping it flushes pending lines.
#[must_use = "dropping the guard stops file logging"]
pub struct Observability {
    pub dirs: LogDirs,
    _guards: Vec<WorkerGuard>,
}

impl Observability {
    /// Install the global subscriber. Call once, before the first run.
    pub fn init(config: &LogConfig) -> Result<Self> {
        let dirs = ensure_log_dirs(&config.root)?;

        let (activity_writer, activity_guard) = tracing_appender::non_blocking(size_capped_file(
            &dirs.activity,
            "activity",
            config.max_bytes,
            config.backups,
        ));
        let (error_writer, error_guard) = tracing_appender::non_blocking(size_capped_file(
            &dirs.errors,
            "errors",
            config.max_bytes,
            config.backups,
        ));

        let console_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_filter(console_filter))
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(activity_writer)
                    .with_filter(EnvFilter::new(FILE_DIRECTIVES)),
            )
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(error_writer)
                    .with_filter(LevelFilter::WARN),
            )
            .try_init()
            .context("installing tracing subscriber")?;

        info!(
            activity = %dirs.activity.display(),
            errors = %dirs.errors.display(),
            "logging initialised"
        );
        Ok(Self {
            dirs,
            _guards: vec![activity_guard, error_guard],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn log_dirs_are_created_idempotently() {
        let root = tempdir().expect("tempdir");
        let first = ensure_log_dirs(root.path()).expect("first");
        let second = ensure_log_dirs(root.path()).expect("second");
        assert_eq!(first, second);
        assert!(first.activity.is_dir());
        assert!(first.errors.is_dir());
    }

    #[test]
    fn error_log_rotates_once_past_the_cap() {
        let root = tempdir().expect("tempdir");
        let dirs = ensure_log_dirs(root.path()).expect("dirs");
        let mut log = size_capped_file(&dirs.errors, "errors", 256, 2);

        let line = [b'x'; 63];
        for _ in 0..20 {
            log.write_all(&line).expect("write");
            log.write_all(b"\n").expect("newline");
        }
        log.flush().expect("flush");
        drop(log);

        let live = dirs.errors.join("errors.log");
        let first_backup = dirs.errors.join("errors.log.1");
        assert!(live.is_file());
        assert!(first_backup.is_file());
        assert!(std::fs::metadata(&first_backup).expect("meta").len() <= 256);
        assert!(!dirs.errors.join("errors.log.3").exists());
    }
}
