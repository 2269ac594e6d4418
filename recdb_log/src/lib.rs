//! Logging setup shared by the recdb binaries.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

/// Logging section of the server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `recdb_storage=debug`.
    pub level: String,
    /// Directory for hourly rolling JSON files; console output when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".into(), dir: None }
    }
}

/// Keeps the file writer alive and allows the level to change at runtime.
/// Dropping it flushes buffered file output.
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
    _writer: Option<WorkerGuard>,
}

impl LogHandle {
    /// Replace the active filter.
    pub fn set_level(&self, directive: &str) -> Result<()> {
        self.reload.reload(EnvFilter::try_new(directive)?)?;
        Ok(())
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over
/// `config.level`.
pub fn init(config: &LogConfig) -> Result<LogHandle> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;
    let (filter, reload) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter);
    let writer = match &config.dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::HOURLY, dir, "recdb.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_current_span(false)
                        .with_span_list(false),
                )
                .try_init()?;
            Some(guard)
        }
        None => {
            registry.with(fmt::layer().with_writer(std::io::stderr)).try_init()?;
            None
        }
    };
    Ok(LogHandle { reload, _writer: writer })
}
