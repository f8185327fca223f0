//! Log sinks and subscriber setup.
//!
//! Components never reach for a global logger directly. Each one is handed an
//! `Arc<dyn LogSink>` when it is built:
//!
//! - [`TracingSink`] forwards records to `tracing`, which the binary wires to stderr and an
//!   optional log file with [`init_tracing`].
//! - [`MemorySink`] keeps records in memory so tests (or an embedding host) can inspect them.

use crate::config::EmulatorConfig;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Accepts leveled text records.
pub trait LogSink: Send + Sync {
    /// Emit one record.
    fn record(&self, level: Level, message: &str);

    /// Shorthand for [`Level::DEBUG`].
    fn debug(&self, message: &str) {
        self.record(Level::DEBUG, message);
    }

    /// Shorthand for [`Level::INFO`].
    fn info(&self, message: &str) {
        self.record(Level::INFO, message);
    }

    /// Shorthand for [`Level::WARN`].
    fn warn(&self, message: &str) {
        self.record(Level::WARN, message);
    }

    /// Shorthand for [`Level::ERROR`].
    fn error(&self, message: &str) {
        self.record(Level::ERROR, message);
    }
}

/// Sink that emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!("{message}"),
            Level::WARN => tracing::warn!("{message}"),
            Level::INFO => tracing::info!("{message}"),
            Level::DEBUG => tracing::debug!("{message}"),
            _ => tracing::trace!("{message}"),
        }
    }
}

/// A captured record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity
    pub level: Level,
    /// Rendered text
    pub message: String,
}

/// Sink that keeps every record in memory.
///
/// Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.lock().clone()
    }

    /// Messages recorded at exactly `level`, oldest first.
    pub fn messages_at(&self, level: Level) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|r| r.level == level)
            .map(|r| r.message.clone())
            .collect()
    }

    /// Messages at any level that start with `prefix`.
    pub fn messages_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|r| r.message.starts_with(prefix))
            .map(|r| r.message.clone())
            .collect()
    }

    /// True if any record contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|r| r.message.contains(needle))
    }

    /// Drop everything captured so far.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LogSink for MemorySink {
    fn record(&self, level: Level, message: &str) {
        self.lock().push(LogRecord {
            level,
            message: message.to_string(),
        });
    }
}

/// Install the global subscriber: stderr always, plus the configured log file.
///
/// `RUST_LOG` takes precedence over the configured level. The returned guard must be kept
/// alive until exit, otherwise buffered file output is lost.
pub fn init_tracing(config: &EmulatorConfig) -> Result<Option<WorkerGuard>> {
    let default_level = config.log_level.as_tracing().to_string().to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn file_writer(
    path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .with_context(|| format!("Log file path '{}' has no file name", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory '{}'", dir.display()))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_memory_sink_captures_in_order() {
        let sink = MemorySink::new();
        sink.info("first");
        sink.debug("second");
        sink.warn("STATS tx_lines=1");

        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].message, "first");
        assert_eq!(records[1].level, Level::DEBUG);
        assert_eq!(sink.messages_at(Level::WARN), vec!["STATS tx_lines=1"]);
        assert_eq!(sink.messages_with_prefix("STATS").len(), 1);
        assert!(sink.contains("second"));
    }

    #[test]
    fn test_memory_sink_clones_share_buffer() {
        let sink = MemorySink::new();
        let shared: Arc<dyn LogSink> = Arc::new(sink.clone());
        shared.error("boom");
        assert!(sink.contains("boom"));

        sink.clear();
        assert!(sink.records().is_empty());
    }

    #[traced_test]
    #[test]
    fn test_tracing_sink_reaches_subscriber() {
        TracingSink.info("OPEN path=/dev/null baud=9600");
        TracingSink.warn("STATS tx_lines=0 rx_bytes=0 pending_buf=0");
        assert!(logs_contain("OPEN path=/dev/null baud=9600"));
        assert!(logs_contain("STATS tx_lines=0"));
    }
}
