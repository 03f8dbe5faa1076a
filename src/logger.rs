//! Logging setup
//!
//! Installs a `tracing` subscriber with an env filter, a compact console
//! layer and a [`LogBuffer`] layer that keeps recent lines for `/api/logs`.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Bounded ring of formatted log lines, oldest first
#[derive(Debug, Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(4096)))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Up to `limit` most recent lines, most recent last
    pub fn recent(&self, limit: usize) -> Vec<String> {
        let lines = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Layer that appends every enabled event to this buffer
    pub fn layer(&self) -> LogBufferLayer {
        LogBufferLayer {
            buffer: self.clone(),
        }
    }
}

/// Collects the message and structured fields of one event
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

fn level_label(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARN",
        Level::ERROR => "ERROR",
    }
}

/// `tracing` layer feeding a [`LogBuffer`]
pub struct LogBufferLayer {
    buffer: LogBuffer,
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let line = format!(
            "{} [{}] {}{}",
            humantime::format_rfc3339_seconds(SystemTime::now()),
            level_label(event.metadata().level()),
            visitor.message,
            visitor.fields
        );
        self.buffer.push(line);
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `log_mode`.
pub fn init_logger(log_mode: &str, buffer: &LogBuffer) -> anyhow::Result<()> {
    let level = LogLevel::parse(log_mode).unwrap_or_default();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("socks5_server_r={}", level.as_str())));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .with(buffer.layer())
        .try_init()?;
    Ok(())
}

pub mod log {
    pub use tracing::{debug, error, info, trace, warn};

    /// Connection lifecycle event
    pub fn connection(peer: &str, event: &str) {
        debug!(peer = peer, event = event, "Connection");
    }

    /// Authentication outcome
    pub fn authentication(peer: &str, success: bool) {
        if success {
            debug!(peer = peer, "Authentication successful");
        } else {
            warn!(peer = peer, "Authentication failed");
        }
    }

    /// Session lifecycle event
    pub fn session(id: u64, target: &str, event: &str) {
        info!(session = id, target = target, event = event, "Session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("verbose"), None);
        assert_eq!(LogLevel::default().as_str(), "info");
    }

    #[test]
    fn test_log_buffer_evicts_oldest() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {}", i));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.recent(10), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_log_buffer_recent_limit() {
        let buffer = LogBuffer::new(100);
        for i in 0..10 {
            buffer.push(format!("line {}", i));
        }
        assert_eq!(buffer.recent(2), vec!["line 8", "line 9"]);
        assert!(buffer.recent(0).is_empty());
    }

    #[test]
    fn test_log_buffer_zero_capacity_clamped() {
        let buffer = LogBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.push("a".into());
        buffer.push("b".into());
        assert_eq!(buffer.recent(5), vec!["b"]);
    }

    #[test]
    fn test_layer_captures_events() {
        let buffer = LogBuffer::new(10);
        let subscriber = tracing_subscriber::registry().with(buffer.layer());

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(peer = "127.0.0.1:5000", "Connection accepted");
            tracing::warn!("Something odd");
        });

        let lines = buffer.recent(10);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[INFO] Connection accepted"));
        assert!(lines[0].contains("peer=127.0.0.1:5000"));
        assert!(lines[1].contains("[WARN] Something odd"));
        // Leading timestamp parses as RFC 3339
        let stamp = lines[0].split(' ').next().unwrap();
        assert!(humantime::parse_rfc3339(stamp).is_ok());
    }
}
