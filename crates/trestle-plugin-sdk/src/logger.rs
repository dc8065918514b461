use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LogRecord<'a> {
    pub level: LogLevel,
    pub namespace: &'a str,
    pub message: &'a str,
    pub fields: &'a [(&'a str, String)],
}

/// Destination for plugin log records. Implementations must not block.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: &LogRecord<'_>);
}

/// Forwards records to `tracing` under the `trestle::plugin` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, record: &LogRecord<'_>) {
        let fields = render_fields(record.fields);
        let plugin = record.namespace;
        let message = record.message;
        match record.level {
            LogLevel::Trace => {
                tracing::trace!(target: "trestle::plugin", plugin, fields = %fields, "{message}")
            }
            LogLevel::Debug => {
                tracing::debug!(target: "trestle::plugin", plugin, fields = %fields, "{message}")
            }
            LogLevel::Info => {
                tracing::info!(target: "trestle::plugin", plugin, fields = %fields, "{message}")
            }
            LogLevel::Warn => {
                tracing::warn!(target: "trestle::plugin", plugin, fields = %fields, "{message}")
            }
            LogLevel::Error => {
                tracing::error!(target: "trestle::plugin", plugin, fields = %fields, "{message}")
            }
        }
    }
}

fn render_fields(fields: &[(&str, String)]) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{key}={value:?}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Owned copy of a record kept by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRecord {
    pub level: LogLevel,
    pub namespace: String,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl CapturedRecord {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Keeps every record in memory; used by diagnostics and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<CapturedRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CapturedRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn for_namespace(&self, namespace: &str) -> Vec<CapturedRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.namespace == namespace)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: &LogRecord<'_>) {
        let captured = CapturedRecord {
            level: record.level,
            namespace: record.namespace.to_string(),
            message: record.message.to_string(),
            fields: record
                .fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        };
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(captured);
    }
}

/// Logger bound to a single namespace, normally the owning plugin's name.
#[derive(Clone)]
pub struct PluginLogger {
    namespace: Arc<str>,
    sink: Arc<dyn LogSink>,
}

impl PluginLogger {
    pub fn new(namespace: &str, sink: Arc<dyn LogSink>) -> Self {
        Self {
            namespace: Arc::from(namespace),
            sink,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn log(&self, level: LogLevel, message: &str, fields: &[(&str, String)]) {
        self.sink.emit(&LogRecord {
            level,
            namespace: &self.namespace,
            message,
            fields,
        });
    }

    pub fn trace(&self, message: &str, fields: &[(&str, String)]) {
        self.log(LogLevel::Trace, message, fields);
    }

    pub fn debug(&self, message: &str, fields: &[(&str, String)]) {
        self.log(LogLevel::Debug, message, fields);
    }

    pub fn info(&self, message: &str, fields: &[(&str, String)]) {
        self.log(LogLevel::Info, message, fields);
    }

    pub fn warn(&self, message: &str, fields: &[(&str, String)]) {
        self.log(LogLevel::Warn, message, fields);
    }

    pub fn error(&self, message: &str, fields: &[(&str, String)]) {
        self.log(LogLevel::Error, message, fields);
    }
}

impl fmt::Debug for PluginLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLogger")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
