//! Telemetry sink
//!
//! `filament/core/log` payloads are validated against the log record
//! shape and forwarded to the host's sink at commit. The kernel itself
//! stays silent: observability is an outbound capability like any other.

use std::sync::{Arc, Mutex};

use core_types::{KernelError, ProcessId, VirtualTime};
use value::Value;

/// Severity of a log record, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    pub fn from_u64(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(LogLevel::Trace),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Warn),
            4 => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// One validated log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub pid: ProcessId,
    pub virt_time: VirtualTime,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

impl LogRecord {
    /// Validates a `filament/core/log` payload value.
    ///
    /// Shape: a map with `level` (u64 0..=4) and `message` (string);
    /// `target` (string) is optional.
    pub fn from_value(pid: ProcessId, virt_time: VirtualTime, payload: &Value) -> Result<Self, KernelError> {
        let pairs = match payload {
            Value::Map(pairs) => pairs,
            other => {
                return Err(KernelError::Invalid(format!(
                    "log record must be a map, got {:?}",
                    other.tag()
                )))
            }
        };
        let mut level = None;
        let mut message = None;
        let mut target = String::new();
        for (key, val) in pairs {
            match (key.as_str(), val) {
                ("level", Value::U64(raw)) => {
                    level = Some(LogLevel::from_u64(*raw).ok_or_else(|| {
                        KernelError::Invalid(format!("log level {} out of range", raw))
                    })?)
                }
                ("message", Value::String(text)) => message = Some(text.clone()),
                ("target", Value::String(text)) => target = text.clone(),
                ("level" | "message" | "target", other) => {
                    return Err(KernelError::Invalid(format!(
                        "log field '{}' has wrong type {:?}",
                        key,
                        other.tag()
                    )))
                }
                _ => {}
            }
        }
        Ok(Self {
            pid,
            virt_time,
            level: level.ok_or_else(|| KernelError::Invalid("log record missing level".to_string()))?,
            target,
            message: message
                .ok_or_else(|| KernelError::Invalid("log record missing message".to_string()))?,
        })
    }
}

/// Host-side consumer of committed log records.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, record: &LogRecord);
}

impl<T: TelemetrySink> TelemetrySink for Arc<T> {
    fn emit(&self, record: &LogRecord) {
        (**self).emit(record)
    }
}

/// Forwards records to the `tracing` subscriber of the host process.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, record: &LogRecord) {
        let pid = record.pid.as_u64();
        let vt = record.virt_time.as_nanos();
        let module = record.target.as_str();
        match record.level {
            LogLevel::Trace => tracing::trace!(pid, vt, module, "{}", record.message),
            LogLevel::Debug => tracing::debug!(pid, vt, module, "{}", record.message),
            LogLevel::Info => tracing::info!(pid, vt, module, "{}", record.message),
            LogLevel::Warn => tracing::warn!(pid, vt, module, "{}", record.message),
            LogLevel::Error => tracing::error!(pid, vt, module, "{}", record.message),
        }
    }
}

/// Buffering sink for tests.
#[derive(Debug, Default)]
pub struct TestSink {
    records: Mutex<Vec<LogRecord>>,
}

impl TestSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().expect("telemetry lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("telemetry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TelemetrySink for TestSink {
    fn emit(&self, record: &LogRecord) {
        self.records.lock().expect("telemetry lock poisoned").push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(level: u64, message: &str) -> Value {
        Value::Map(vec![
            ("level".to_string(), Value::U64(level)),
            ("message".to_string(), Value::String(message.to_string())),
        ])
    }

    #[test]
    fn test_valid_record() {
        let record = LogRecord::from_value(
            ProcessId::from_raw(1),
            VirtualTime::from_nanos(10),
            &payload(2, "hello"),
        )
        .unwrap();
        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.message, "hello");
        assert_eq!(record.target, "");
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let pid = ProcessId::from_raw(1);
        let vt = VirtualTime::ZERO;
        assert!(LogRecord::from_value(pid, vt, &Value::U64(1)).is_err());
        assert!(LogRecord::from_value(pid, vt, &payload(9, "x")).is_err());
        assert!(LogRecord::from_value(
            pid,
            vt,
            &Value::Map(vec![("message".to_string(), Value::String("x".to_string()))])
        )
        .is_err());
        assert!(LogRecord::from_value(
            pid,
            vt,
            &Value::Map(vec![
                ("level".to_string(), Value::U64(1)),
                ("message".to_string(), Value::U64(3)),
            ])
        )
        .is_err());
    }

    #[test]
    fn test_test_sink_buffers() {
        let sink = TestSink::new();
        let record = LogRecord::from_value(
            ProcessId::from_raw(1),
            VirtualTime::ZERO,
            &payload(4, "boom"),
        )
        .unwrap();
        sink.emit(&record);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records()[0].level, LogLevel::Error);
    }
}
