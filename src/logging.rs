//! Logging
//!
//! Process-wide `tracing` setup plus the pieces needed to ship a slave's own
//! diagnostics to the master: a severity scale shared by both sides of the wire,
//! a bounded record buffer and a `tracing_subscriber::Layer` that fills it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

pub const DEFAULT_LOG_BUFFER_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Severe,
}

impl Severity {
    /// Numeric code used on the wire.
    pub fn code(self) -> i32 {
        match self {
            Severity::Debug => -1,
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Error => 2,
            Severity::Severe => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Severity::Debug),
            0 => Some(Severity::Info),
            1 => Some(Severity::Warning),
            2 => Some(Severity::Error),
            3 => Some(Severity::Severe),
            _ => None,
        }
    }

    pub fn level_filter(self) -> LevelFilter {
        match self {
            Severity::Debug => LevelFilter::DEBUG,
            Severity::Info => LevelFilter::INFO,
            Severity::Warning => LevelFilter::WARN,
            Severity::Error | Severity::Severe => LevelFilter::ERROR,
        }
    }
}

impl From<Level> for Severity {
    fn from(level: Level) -> Self {
        match level {
            Level::TRACE | Level::DEBUG => Severity::Debug,
            Level::INFO => Severity::Info,
            Level::WARN => Severity::Warning,
            Level::ERROR => Severity::Error,
        }
    }
}

/// One diagnostic message as buffered by a slave and pulled by the master.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub severity: Severity,
    pub code: i32,
    pub message: String,
}

impl LogRecord {
    /// `"<severity> <code> <message>"`, without the line terminator.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {}",
            self.severity.code(),
            self.code,
            self.message.replace(['\r', '\n'], " ")
        )
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.splitn(3, ' ');
        let severity = Severity::from_code(parts.next()?.parse().ok()?)?;
        let code = parts.next()?.parse().ok()?;
        let message = parts.next().unwrap_or_default().to_string();
        Some(Self {
            severity,
            code,
            message,
        })
    }

    /// Re-emits a record received from `origin` through the local subscriber.
    pub fn emit(&self, origin: &str) {
        let code = self.code;
        match self.severity {
            Severity::Debug => tracing::debug!(code, "[{}] {}", origin, self.message),
            Severity::Info => tracing::info!(code, "[{}] {}", origin, self.message),
            Severity::Warning => tracing::warn!(code, "[{}] {}", origin, self.message),
            Severity::Error => tracing::error!(code, "[{}] {}", origin, self.message),
            Severity::Severe => {
                tracing::error!(code, severe = true, "[{}] {}", origin, self.message)
            }
        }
    }
}

/// Bounded FIFO of log records shared between the capture layer and the listener.
/// The oldest record is dropped once `capacity` is reached.
#[derive(Clone)]
pub struct LogBuffer {
    records: Arc<Mutex<VecDeque<LogRecord>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BUFFER_CAPACITY)
    }
}

impl fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, record: LogRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Removes and returns everything buffered so far.
    pub fn drain(&self) -> Vec<LogRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Layer copying every event at or above `min_severity` into a `LogBuffer`.
///
/// The numeric code is taken from a `code` field when present, and an event
/// carrying `severe = true` is recorded as `Severity::Severe`.
pub struct LogCapture {
    buffer: LogBuffer,
    min_severity: Severity,
}

impl LogCapture {
    pub fn new(buffer: LogBuffer, min_severity: Severity) -> Self {
        Self {
            buffer,
            min_severity,
        }
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let severity = if visitor.severe {
            Severity::Severe
        } else {
            Severity::from(*event.metadata().level())
        };
        if severity < self.min_severity {
            return;
        }

        self.buffer.push(LogRecord {
            severity,
            code: visitor.code.unwrap_or(0),
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    code: Option<i32>,
    severe: bool,
}

impl Visit for RecordVisitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "code" {
            self.code = i32::try_from(value).ok();
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "severe" {
            self.severe = value;
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

/// Installs the global subscriber: a `fmt` layer at `level`, plus the optional
/// capture layer. Calling it twice is harmless.
pub fn init(level: Severity, capture: Option<LogCapture>) {
    let result = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(level.level_filter()))
        .with(capture)
        .try_init();
    if let Err(e) = result {
        tracing::debug!("Logging already initialised: {}", e);
    }
}
