//! Recent-log capture for the `daemon logs` command.
//!
//! [`LogCollector`] is a `tracing` layer that keeps the most recent events
//! in a bounded ring buffer; [`LogReader`] reads them back and renders
//! them as `log` messages for clients.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::ipc::message::{Message, sanitize_field};

/// Default number of entries kept by the daemon.
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// One captured event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Seconds since the collector was created.
    pub elapsed_secs: f64,
    pub level: Level,
    pub target: String,
    /// The event message followed by its other fields as `key=value`.
    pub message: String,
}

impl LogEntry {
    /// Render as a `log` message: value is the text, complement is
    /// `[level, target, elapsed seconds]`.
    pub fn to_message(&self) -> Message {
        Message::new("log", sanitize_field(&self.message)).with_complement([
            self.level.to_string(),
            sanitize_field(&self.target),
            format!("{:.3}", self.elapsed_secs),
        ])
    }
}

#[derive(Debug)]
struct Ring {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    started: Instant,
}

impl Ring {
    fn push(&mut self, level: Level, target: String, message: String) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            level,
            target,
            message,
        });
    }
}

/// A `tracing` layer capturing events into a shared ring buffer.
#[derive(Debug, Clone)]
pub struct LogCollector {
    ring: Arc<Mutex<Ring>>,
}

impl LogCollector {
    /// Create a collector keeping at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Arc::new(Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                started: Instant::now(),
            })),
        }
    }

    pub fn reader(&self) -> LogReader {
        LogReader {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl Default for LogCollector {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl<S: Subscriber> Layer<S> for LogCollector {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*metadata.level(), metadata.target().to_string(), visitor.finish());
    }
}

/// Read handle over a collector's buffer.
#[derive(Debug, Clone)]
pub struct LogReader {
    ring: Arc<Mutex<Ring>>,
}

impl LogReader {
    /// Snapshot of the captured entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: String,
}

impl EventVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }

    fn record_field(&mut self, field: &Field, value: fmt::Arguments<'_>) {
        if field.name() == "message" {
            let _ = self.message.write_fmt(value);
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", field.name(), value);
    }
}

impl Visit for EventVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_field(field, format_args!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_field(field, format_args!("{value}"));
    }
}
