//! Pipeline log levels and sinks.
//!
//! Policies never format a log line unless the sink's [`LogSink::should_log`]
//! accepts the level first. By default entries go to `tracing`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Severity of a pipeline log entry. Lower values are more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Never logged.
    None,
    Fatal,
    Panic,
    Error,
    Warning,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::None => "NONE",
            LogLevel::Fatal => "FATAL",
            LogLevel::Panic => "PANIC",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        };
        f.write_str(s)
    }
}

/// Destination for pipeline log entries.
pub trait LogSink: Send + Sync {
    fn should_log(&self, level: LogLevel) -> bool;
    fn log(&self, level: LogLevel, message: &str);
}

/// Forwards entries to `tracing` at the matching level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn should_log(&self, level: LogLevel) -> bool {
        match level {
            LogLevel::None => false,
            LogLevel::Fatal | LogLevel::Panic | LogLevel::Error => {
                tracing::enabled!(tracing::Level::ERROR)
            }
            LogLevel::Warning => tracing::enabled!(tracing::Level::WARN),
            LogLevel::Info => tracing::enabled!(tracing::Level::INFO),
            LogLevel::Debug => tracing::enabled!(tracing::Level::DEBUG),
        }
    }

    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::None => {}
            LogLevel::Fatal | LogLevel::Panic | LogLevel::Error => {
                tracing::error!(target: "queue_storage::pipeline", severity = %level, "{}", message)
            }
            LogLevel::Warning => tracing::warn!(target: "queue_storage::pipeline", "{}", message),
            LogLevel::Info => tracing::info!(target: "queue_storage::pipeline", "{}", message),
            LogLevel::Debug => tracing::debug!(target: "queue_storage::pipeline", "{}", message),
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl LogSink for NoopSink {
    fn should_log(&self, _level: LogLevel) -> bool {
        false
    }

    fn log(&self, _level: LogLevel, _message: &str) {}
}

type ShouldLogFn = dyn Fn(LogLevel) -> bool + Send + Sync;
type LogFn = dyn Fn(LogLevel, &str) + Send + Sync;

/// Sink built from a level predicate and a writer closure.
#[derive(Clone)]
pub struct FnSink {
    should_log: Arc<ShouldLogFn>,
    log: Arc<LogFn>,
}

impl FnSink {
    pub fn new<P, L>(should_log: P, log: L) -> Self
    where
        P: Fn(LogLevel) -> bool + Send + Sync + 'static,
        L: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        Self {
            should_log: Arc::new(should_log),
            log: Arc::new(log),
        }
    }

    /// Log everything at `max` severity or more severe.
    pub fn up_to<L>(max: LogLevel, log: L) -> Self
    where
        L: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        Self::new(move |level| level != LogLevel::None && level <= max, log)
    }
}

impl fmt::Debug for FnSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSink").finish_non_exhaustive()
    }
}

impl LogSink for FnSink {
    fn should_log(&self, level: LogLevel) -> bool {
        (self.should_log)(level)
    }

    fn log(&self, level: LogLevel, message: &str) {
        (self.log)(level, message)
    }
}

/// Where pipeline log entries go. `None` uses [`TracingSink`].
#[derive(Clone, Default)]
pub struct LogOptions {
    pub sink: Option<Arc<dyn LogSink>>,
}

impl LogOptions {
    pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Self::with_sink(Arc::new(NoopSink))
    }

    pub(crate) fn resolve(&self) -> Arc<dyn LogSink> {
        self.sink
            .clone()
            .unwrap_or_else(|| Arc::new(TracingSink))
    }
}

impl fmt::Debug for LogOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOptions")
            .field("sink", &self.sink.as_ref().map(|_| "<custom>").unwrap_or("<tracing>"))
            .finish()
    }
}
