use crate::{config::LoggingConfig, paths::AppDirs};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable that overrides the configured filter, e.g.
/// `PIXWIRE_LOG=pixwire_host=trace`.
pub const LOG_ENV: &str = "PIXWIRE_LOG";

const DEFAULT_FILE_NAME: &str = "pixwire.log";

/// Keeps the background file writer alive. Drop it last.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Where formatted events go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    Stdout,
    File,
    StdoutAndFile,
    /// Nothing was asked for. Stdout may be a plug-in channel, so use stderr.
    Stderr,
}

impl Sink {
    fn select(config: &LoggingConfig) -> Self {
        match (config.stdout, config.max_log_files > 0) {
            (true, true) => Sink::StdoutAndFile,
            (true, false) => Sink::Stdout,
            (false, true) => Sink::File,
            (false, false) => Sink::Stderr,
        }
    }

    fn wants_file(self) -> bool {
        matches!(self, Sink::File | Sink::StdoutAndFile)
    }
}

pub fn init_logging(config: &LoggingConfig, dirs: &AppDirs) -> Result<LoggingGuard, LoggingError> {
    let filter = build_filter(config)?;
    let sink = Sink::select(config);

    let mut file_guard = None;
    let writer = if sink.wants_file() {
        let log_dir = dirs.log_dir();
        fs::create_dir_all(log_dir).map_err(|source| LoggingError::CreateDirectory {
            path: log_dir.to_path_buf(),
            source,
        })?;
        let file_name = config.file_name.as_deref().unwrap_or(DEFAULT_FILE_NAME);
        prune_logs(log_dir, file_name, config.max_log_files)?;

        let appender = tracing_appender::rolling::daily(log_dir, file_name);
        let (file, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        match sink {
            Sink::StdoutAndFile => BoxMakeWriter::new(std::io::stdout.and(file)),
            _ => BoxMakeWriter::new(file),
        }
    } else if sink == Sink::Stdout {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(sink == Sink::Stdout)
        .with_writer(writer)
        .try_init()
        .map_err(LoggingError::SubscriberInstall)?;

    tracing::debug!(?sink, level = config.level.as_filter_directive(), "logging initialised");
    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// `PIXWIRE_LOG` wins over the configured level when it is set and valid.
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        return Ok(filter);
    }
    let directive = config.level.as_filter_directive();
    EnvFilter::try_new(directive).map_err(|source| LoggingError::ParseLevel {
        level: directive.to_string(),
        source,
    })
}

/// Rolled files of `file_name` in `dir`, oldest first.
fn rolled_logs(dir: &Path, file_name: &str) -> Result<Vec<(PathBuf, SystemTime)>, LoggingError> {
    let entries = fs::read_dir(dir).map_err(|source| LoggingError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut logs: Vec<_> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(file_name))
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|meta| meta.modified()).ok()?;
            Some((entry.path(), modified))
        })
        .collect();
    logs.sort_by_key(|(_, modified)| *modified);
    Ok(logs)
}

/// Deletes the oldest rolled files so that at most `keep` remain.
fn prune_logs(dir: &Path, file_name: &str, keep: usize) -> Result<(), LoggingError> {
    let logs = rolled_logs(dir, file_name)?;
    let excess = logs.len().saturating_sub(keep.max(1));
    for (path, _) in logs.into_iter().take(excess) {
        fs::remove_file(&path).map_err(|source| LoggingError::Cleanup { path, source })?;
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log level {level}: {source}")]
    ParseLevel {
        level: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to install tracing subscriber: {0}")]
    SubscriberInstall(Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to list log directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove old log file {path}: {source}")]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
}
