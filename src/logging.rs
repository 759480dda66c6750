//! In-memory log capture for the `/api/v1/logs` endpoint.
//!
//! A `tracing` layer tees every event into a bounded ring buffer alongside
//! the normal fmt output.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Bounded ring of recent log entries.
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        })
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        entries
            .iter()
            .skip(entries.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    /// All entries matching one of the given levels (case-insensitive),
    /// oldest first.
    pub fn by_levels(&self, levels: &[String]) -> Vec<LogEntry> {
        let wanted: Vec<String> = levels.iter().map(|l| l.trim().to_uppercase()).collect();
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|e| wanted.iter().any(|w| *w == e.level))
            .cloned()
            .collect()
    }
}

/// Layer that copies events into a `LogBuffer`.
pub struct RingLayer {
    buffer: Arc<LogBuffer>,
}

impl RingLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S: tracing::Subscriber> Layer<S> for RingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.buffer.push(LogEntry {
            timestamp: Utc::now(),
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: &str, message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            target: "test".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_ring_capacity() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(entry("INFO", &format!("msg {}", i)));
        }
        let tail = buffer.tail(10);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].message, "msg 2");
        assert_eq!(tail[2].message, "msg 4");
    }

    #[test]
    fn test_tail_limit() {
        let buffer = LogBuffer::new(10);
        for i in 0..6 {
            buffer.push(entry("INFO", &format!("msg {}", i)));
        }
        let tail = buffer.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "msg 4");
    }

    #[test]
    fn test_level_filter() {
        let buffer = LogBuffer::new(10);
        buffer.push(entry("INFO", "a"));
        buffer.push(entry("ERROR", "b"));
        buffer.push(entry("WARN", "c"));
        buffer.push(entry("ERROR", "d"));

        let errors = buffer.by_levels(&["error".to_string()]);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].message, "d");

        let both = buffer.by_levels(&["WARN".to_string(), "ERROR".to_string()]);
        assert_eq!(both.len(), 3);
    }
}
