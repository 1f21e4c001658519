//! Structured logging setup.
//!
//! `tracing` with an env-filter; pretty output for development, JSON for
//! production, optionally into daily-rotated files. Controlled by
//! `RUST_LOG`, `RECONCILE_LOG_FORMAT` and `RECONCILE_LOG_DIR`.

use anyhow::Result;
use std::env;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Directory for rotated log files; stderr when unset.
    pub log_dir: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        let format = match env::var("RECONCILE_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        let log_dir = env::var("RECONCILE_LOG_DIR").ok().map(PathBuf::from);
        LoggingConfig { format, log_dir }
    }
}

/// Initializes the global subscriber. The returned guard must stay alive
/// for the duration of the process when logging to files.
pub fn init_logging(config: LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,wikibase_reconcile=debug"));

    match config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "wikibase-reconcile.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            match config.format {
                LogFormat::Json => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json().with_writer(writer))
                    .init(),
                LogFormat::Pretty => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .init(),
            }
            Ok(Some(guard))
        }
        None => {
            match config.format {
                LogFormat::Json => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init(),
                LogFormat::Pretty => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .init(),
            }
            Ok(None)
        }
    }
}
