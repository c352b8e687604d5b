// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

use super::protocol::normalize_command;
use super::state::AtomicDriverState;
use super::{
    ConnectOptions, DEFAULT_EVENT_CAPACITY, DriverState, RequestOptions, ResponseRecord,
    ServerEvent, Transport, TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A request as the transport received it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// Normalized command.
    pub command: String,
    /// Arguments as sent.
    pub arguments: Value,
}

/// Transport that never leaves the process.
///
/// Every call is recorded; replies, events, errors and state changes are
/// scripted by the owner. Useful for exercising client logic without a
/// server binary.
pub struct MemoryTransport {
    server_path: PathBuf,
    pid: Option<u32>,
    state: AtomicDriverState,
    connect_target: DriverState,
    connects: Mutex<Vec<ConnectOptions>>,
    disconnects: AtomicUsize,
    disposals: AtomicUsize,
    disposed: AtomicBool,
    requests: Mutex<Vec<RecordedRequest>>,
    replies: Mutex<HashMap<String, Result<Value, TransportError>>>,
    events: broadcast::Sender<ServerEvent>,
    responses: broadcast::Sender<ResponseRecord>,
    errors: broadcast::Sender<TransportError>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// A disconnected transport. `connect` moves it to `Connecting`.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        let (responses, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        let (errors, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);

        Self {
            server_path: PathBuf::from("omnisharp"),
            pid: None,
            state: AtomicDriverState::default(),
            connect_target: DriverState::Connecting,
            connects: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
            disposals: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            events,
            responses,
            errors,
        }
    }

    /// Reports `pid` as the server process id while connected.
    #[must_use]
    pub const fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Reports `path` as the server executable.
    #[must_use]
    pub fn with_server_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_path = path.into();
        self
    }

    /// State `connect` lands in (default `Connecting`).
    #[must_use]
    pub const fn connect_lands_in(mut self, state: DriverState) -> Self {
        self.connect_target = state;
        self
    }

    /// Shorthand for landing directly in `Connected`.
    #[must_use]
    pub const fn completing_connections(self) -> Self {
        self.connect_lands_in(DriverState::Connected)
    }

    /// Answers `command` with `body`.
    #[must_use]
    pub fn reply(self, command: &str, body: Value) -> Self {
        lock(&self.replies).insert(normalize_command(command), Ok(body));
        self
    }

    /// Fails `command` with `error`.
    #[must_use]
    pub fn reply_error(self, command: &str, error: TransportError) -> Self {
        lock(&self.replies).insert(normalize_command(command), Err(error));
        self
    }

    /// Forces the lifecycle state.
    pub fn set_state(&self, state: DriverState) {
        self.state.store(state);
    }

    /// Delivers `event` to every event subscriber.
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Delivers `error` to every error subscriber.
    pub fn fail(&self, error: TransportError) {
        let _ = self.errors.send(error);
    }

    /// Options of every `connect` call that reached the transport.
    pub fn connects(&self) -> Vec<ConnectOptions> {
        lock(&self.connects).clone()
    }

    /// Number of `disconnect` calls.
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Number of `dispose` calls, including repeated ones.
    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, options: ConnectOptions) {
        lock(&self.connects).push(options);
        self.state.store(self.connect_target);
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.store(DriverState::Disconnected);
    }

    fn state(&self) -> DriverState {
        self.state.load()
    }

    fn id(&self) -> Option<u32> {
        self.state.load().is_on().then_some(self.pid).flatten()
    }

    fn server_path(&self) -> &Path {
        &self.server_path
    }

    fn project_path(&self) -> Option<PathBuf> {
        lock(&self.connects)
            .last()
            .and_then(|options| options.project_path.clone())
    }

    fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn responses(&self) -> broadcast::Receiver<ResponseRecord> {
        self.responses.subscribe()
    }

    fn errors(&self) -> broadcast::Receiver<TransportError> {
        self.errors.subscribe()
    }

    fn log(&self, message: &str) {
        self.emit(ServerEvent::log(message, "INFORMATION"));
    }

    async fn request(
        &self,
        command: &str,
        arguments: Value,
        _options: RequestOptions,
    ) -> Result<Value, TransportError> {
        let command = normalize_command(command);
        lock(&self.requests).push(RecordedRequest {
            command: command.clone(),
            arguments: arguments.clone(),
        });

        let reply = lock(&self.replies).get(&command).cloned();
        let result = reply.unwrap_or_else(|| Ok(arguments.clone()));

        match &result {
            Ok(body) => {
                let _ = self.responses.send(ResponseRecord {
                    command,
                    request: arguments,
                    response: body.clone(),
                });
            }
            Err(e) => self.fail(e.clone()),
        }
        result
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!("Memory transport already disposed");
            return;
        }
        self.state.store(DriverState::Disconnected);
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unscripted_request_echoes_arguments() {
        let transport = MemoryTransport::new();
        let mut responses = transport.responses();

        let body = transport
            .request("codecheck", json!({"FileName": "a.cs"}), RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(body, json!({"FileName": "a.cs"}));
        assert_eq!(transport.requests()[0].command, "/codecheck");
        assert_eq!(responses.try_recv().unwrap().command, "/codecheck");
    }

    #[tokio::test]
    async fn test_scripted_error_is_published() {
        let transport = MemoryTransport::new().reply_error("/hang", TransportError::NotConnected);
        let mut errors = transport.errors();

        let result = transport
            .request("hang", Value::Null, RequestOptions::default())
            .await;

        assert_eq!(result, Err(TransportError::NotConnected));
        assert_eq!(errors.try_recv().unwrap(), TransportError::NotConnected);
    }

    #[test]
    fn test_connect_records_and_reports_pid() {
        let transport = MemoryTransport::new().with_pid(42).completing_connections();
        assert_eq!(transport.id(), None);

        transport.connect(ConnectOptions::for_project("/src/app"));
        assert_eq!(transport.state(), DriverState::Connected);
        assert_eq!(transport.id(), Some(42));
        assert_eq!(transport.project_path(), Some(PathBuf::from("/src/app")));

        transport.disconnect();
        assert_eq!(transport.id(), None);
        assert_eq!(transport.disconnects(), 1);
    }
}
