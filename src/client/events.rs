// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Streams derived from the transport's raw event, response and error
//! streams.
//!
//! Every derivation holds its own broadcast receiver, so consumers never
//! steal items from each other and a slow consumer only loses its own
//! backlog.

use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::transport::{ResponseRecord, ServerEvent, TransportError};

/// Severity of a log record, as named by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogLevel {
    /// `TRACE`
    Trace,
    /// `DEBUG`
    Debug,
    /// `INFORMATION`
    Information,
    /// `WARNING`
    Warning,
    /// `ERROR`
    Error,
    /// `CRITICAL`
    Critical,
    /// Any other spelling the server sends, kept verbatim.
    Other(String),
}

impl LogLevel {
    /// Parses a level name. Only the upper-case names map to the named
    /// variants, so every level is re-emitted exactly as the server sent it.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "TRACE" => Self::Trace,
            "DEBUG" => Self::Debug,
            "INFORMATION" => Self::Information,
            "WARNING" => Self::Warning,
            "ERROR" => Self::Error,
            "CRITICAL" => Self::Critical,
            _ => Self::Other(name.to_string()),
        }
    }

    /// The named severity this level stands for, ignoring case
    /// (`warning` is [`LogLevel::Warning`]). Unknown names stay `Other`.
    #[must_use]
    pub fn severity(&self) -> Self {
        match self {
            Self::Other(name) => Self::parse(&name.to_ascii_uppercase()),
            known => known.clone(),
        }
    }

    /// The level name as the server spelled it.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Information => "INFORMATION",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LogLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One line of the derived log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    /// Human-readable text.
    pub message: String,
    /// Severity.
    pub level: LogLevel,
}

/// Projects a raw event into a log record.
///
/// The message is the body's `Message`, else the event name, else empty.
/// The level is the body's `LogLevel`, else `ERROR` for error-typed events,
/// else `INFORMATION`. Missing or oddly shaped bodies fall through to the
/// defaults.
#[must_use]
pub fn derive_log(event: &ServerEvent) -> LogRecord {
    let message = event
        .body_str("Message")
        .filter(|m| !m.is_empty())
        .or_else(|| event.name.as_deref().filter(|n| !n.is_empty()))
        .unwrap_or_default()
        .to_string();

    let level = match event.body_str("LogLevel").filter(|l| !l.is_empty()) {
        Some(level) => LogLevel::parse(level),
        None if event.is_error() => LogLevel::Error,
        None => LogLevel::Information,
    };

    LogRecord { message, level }
}

/// A subscriber's view of the log stream.
#[derive(Debug)]
pub struct LogStream {
    events: broadcast::Receiver<ServerEvent>,
}

impl LogStream {
    pub(crate) const fn new(events: broadcast::Receiver<ServerEvent>) -> Self {
        Self { events }
    }

    /// Next record, in transport order. `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<LogRecord> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(derive_log(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Log subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next record if one is already queued.
    pub fn try_recv(&mut self) -> Option<LogRecord> {
        loop {
            match self.events.try_recv() {
                Ok(event) => return Some(derive_log(&event)),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Log subscriber lagged, skipped {} events", skipped);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

/// Where transport errors and developer traces end up.
pub trait DiagnosticSink: Send + Sync {
    /// Reports a transport failure.
    fn transport_error(&self, error: &TransportError);

    /// Reports a completed exchange for `command`.
    fn exchange(&self, command: &str, record: &ResponseRecord);
}

/// Sink that writes through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn transport_error(&self, error: &TransportError) {
        error!("{}", error);
    }

    fn exchange(&self, command: &str, record: &ResponseRecord) {
        info!(
            request = %record.request,
            response = %record.response,
            "omni:{}", command
        );
    }
}

/// Shared switch for the developer trace.
#[derive(Debug, Clone, Default)]
pub struct DeveloperMode(Arc<AtomicBool>);

impl DeveloperMode {
    /// A switch starting at `enabled`.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    /// Current value.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Flips the switch for every holder.
    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }
}

/// Reports every transport error to `sink` until the error stream closes.
pub fn spawn_error_reporter(
    mut errors: broadcast::Receiver<TransportError>,
    sink: Arc<dyn DiagnosticSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(error) => sink.transport_error(&error),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Error reporter lagged, skipped {} errors", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Reports every completed exchange to `sink` while `mode` is enabled.
pub fn spawn_developer_trace(
    mut responses: broadcast::Receiver<ResponseRecord>,
    sink: Arc<dyn DiagnosticSink>,
    mode: DeveloperMode,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match responses.recv().await {
                Ok(record) if mode.is_enabled() => sink.exchange(&record.command, &record),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Developer trace lagged, skipped {} responses", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        errors: Mutex<Vec<TransportError>>,
        exchanges: Mutex<Vec<String>>,
    }

    impl DiagnosticSink for RecordingSink {
        fn transport_error(&self, error: &TransportError) {
            self.errors.lock().unwrap().push(error.clone());
        }

        fn exchange(&self, command: &str, _record: &ResponseRecord) {
            self.exchanges.lock().unwrap().push(command.to_string());
        }
    }

    fn event(value: serde_json::Value) -> ServerEvent {
        serde_json::from_value(value).unwrap()
    }

    fn record(command: &str) -> ResponseRecord {
        ResponseRecord {
            command: command.to_string(),
            request: json!({}),
            response: json!(true),
        }
    }

    #[test]
    fn test_error_without_body() {
        let log = derive_log(&event(json!({"Type": "error"})));
        assert_eq!(log.message, "");
        assert_eq!(log.level, LogLevel::Error);
    }

    #[test]
    fn test_body_message_and_level() {
        let log = derive_log(&event(
            json!({"Type": "event", "Body": {"Message": "ok", "LogLevel": "INFORMATION"}}),
        ));
        assert_eq!(log.message, "ok");
        assert_eq!(log.level, LogLevel::Information);
    }

    #[test]
    fn test_event_name_fallback() {
        let log = derive_log(&event(json!({"Type": "event", "Event": "ProjectAdded"})));
        assert_eq!(log.message, "ProjectAdded");
        assert_eq!(log.level, LogLevel::Information);
    }

    #[test]
    fn test_explicit_level_beats_error_type() {
        let log = derive_log(&event(
            json!({"Type": "error", "Body": {"Message": "m", "LogLevel": "WARNING"}}),
        ));
        assert_eq!(log.level, LogLevel::Warning);
    }

    #[test]
    fn test_level_spelling_passes_through() {
        let log = derive_log(&event(
            json!({"Type": "event", "Body": {"Message": "m", "LogLevel": "warning"}}),
        ));
        assert_eq!(log.level.to_string(), "warning");
        assert_eq!(serde_json::to_value(&log.level).unwrap(), json!("warning"));
        assert_eq!(log.level.severity(), LogLevel::Warning);
        assert_eq!(
            LogLevel::parse("Verbose").severity(),
            LogLevel::Other("VERBOSE".to_string())
        );
    }

    #[test]
    fn test_unknown_level_is_kept() {
        assert_eq!(LogLevel::parse("VERBOSE"), LogLevel::Other("VERBOSE".to_string()));
        assert_eq!(LogLevel::parse("VERBOSE").to_string(), "VERBOSE");
        assert_eq!(
            serde_json::to_value(LogLevel::Critical).unwrap(),
            json!("CRITICAL")
        );
    }

    #[tokio::test]
    async fn test_log_streams_are_independent_and_ordered() {
        let (sender, _) = broadcast::channel(16);
        let mut first = LogStream::new(sender.subscribe());
        let mut second = LogStream::new(sender.subscribe());

        for message in ["one", "two", "three"] {
            sender.send(ServerEvent::log(message, "DEBUG")).unwrap();
        }
        drop(sender);

        for stream in [&mut first, &mut second] {
            let mut seen = Vec::new();
            while let Some(record) = stream.recv().await {
                seen.push(record.message);
            }
            assert_eq!(seen, vec!["one", "two", "three"]);
        }
    }

    #[test]
    fn test_lagging_stream_recovers() {
        let (sender, _) = broadcast::channel(2);
        let mut stream = LogStream::new(sender.subscribe());

        for message in ["a", "b", "c", "d"] {
            sender.send(ServerEvent::log(message, "DEBUG")).unwrap();
        }

        assert_eq!(stream.try_recv().unwrap().message, "c");
        assert_eq!(stream.try_recv().unwrap().message, "d");
        assert_eq!(stream.try_recv(), None);
    }

    #[tokio::test]
    async fn test_error_reporter_forwards_everything() {
        let (sender, _) = broadcast::channel(8);
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn_error_reporter(sender.subscribe(), sink.clone());

        sender.send(TransportError::NotConnected).unwrap();
        sender.send(TransportError::Exited(Some(1))).unwrap();
        drop(sender);
        handle.await.unwrap();

        assert_eq!(
            *sink.errors.lock().unwrap(),
            vec![TransportError::NotConnected, TransportError::Exited(Some(1))]
        );
    }

    #[tokio::test]
    async fn test_developer_trace_respects_mode() {
        let (sender, _) = broadcast::channel(8);
        let sink = Arc::new(RecordingSink::default());
        let mode = DeveloperMode::new(false);
        let handle = spawn_developer_trace(sender.subscribe(), sink.clone(), mode.clone());

        sender.send(record("/quiet")).unwrap();
        tokio::task::yield_now().await;
        mode.set(true);
        sender.send(record("/loud")).unwrap();
        drop(sender);
        handle.await.unwrap();

        assert_eq!(*sink.exchanges.lock().unwrap(), vec!["/loud".to_string()]);
    }
}
