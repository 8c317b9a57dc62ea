use chrono::{DateTime, Local};
use flume::{Receiver, Sender};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARNING",
            LogLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// One line of the activity stream shown by the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub timestamp: DateTime<Local>,
    pub message: String,
}

impl LogEvent {
    /// `2026-01-02 03:04:05 - INFO - message`
    pub fn render(&self) -> String {
        format!(
            "{} - {} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// Events held for a slow or absent reader before new ones are dropped.
pub const EVENT_BACKLOG: usize = 1024;

/// Mirrors pipeline activity to `tracing` and to the control surface's event stream.
#[derive(Clone)]
pub struct EventLog {
    tx: Sender<LogEvent>,
}

impl EventLog {
    pub fn new(tx: Sender<LogEvent>) -> Self {
        Self { tx }
    }

    /// Bounded to [`EVENT_BACKLOG`] so an unread stream cannot grow without limit.
    pub fn channel() -> (Self, Receiver<LogEvent>) {
        let (tx, rx) = flume::bounded(EVENT_BACKLOG);
        (Self::new(tx), rx)
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("{}", message);
        self.push(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.push(LogLevel::Error, message);
    }

    fn push(&self, level: LogLevel, message: String) {
        // A full or closed stream drops the event; the tracing copy still lands.
        let _ = self.tx.try_send(LogEvent {
            level,
            timestamp: Local::now(),
            message,
        });
    }
}
