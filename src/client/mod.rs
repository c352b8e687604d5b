// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The analysis-server client.
//!
//! [`Client`] layers connection gating, request shaping and derived streams
//! over any [`Transport`]. It owns every background task it starts and
//! releases them on [`Client::dispose`].

/// Derived log, error and trace streams.
pub mod events;
/// Branch-change restart trigger.
pub mod repository;
/// Request construction from editor state.
pub mod request;

use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::disposable::SubscriptionSet;
use crate::editor::{Document, EditorEnvironment, TextBuffer};
use crate::transport::{ConnectOptions, DriverState, RequestOptions, Transport, TransportError};
use events::{DeveloperMode, DiagnosticSink, LogStream, TracingSink};
use repository::RepositorySource;
use request::{EditorContext, Request, RequestError};

pub use events::{LogLevel, LogRecord};
pub use repository::RESTART_COMMAND;

/// Collaborators and flags for a new [`Client`].
pub struct ClientOptions {
    environment: Arc<dyn EditorEnvironment>,
    repository: Option<Arc<dyn RepositorySource>>,
    sink: Arc<dyn DiagnosticSink>,
    developer_mode: DeveloperMode,
    temporary: bool,
    index: usize,
}

impl ClientOptions {
    /// Options for a client hosted by `environment`, with no repository
    /// watch, a `tracing` sink and developer mode off.
    #[must_use]
    pub fn new(environment: Arc<dyn EditorEnvironment>) -> Self {
        Self {
            environment,
            repository: None,
            sink: Arc::new(TracingSink),
            developer_mode: DeveloperMode::default(),
            temporary: false,
            index: 0,
        }
    }

    /// Restarts the server when `repository` switches branches.
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn RepositorySource>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Routes transport errors and developer traces to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Shares `mode` as the developer trace switch.
    #[must_use]
    pub fn with_developer_mode(mut self, mode: DeveloperMode) -> Self {
        self.developer_mode = mode;
        self
    }

    /// Marks the client as serving a loose file rather than a project.
    #[must_use]
    pub const fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    /// Position of the client among its siblings.
    #[must_use]
    pub const fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }
}

/// Client for one analysis-server connection.
pub struct Client<T: Transport> {
    transport: Arc<T>,
    environment: Arc<dyn EditorEnvironment>,
    transcript: Vec<String>,
    pending: Option<DriverState>,
    developer_mode: DeveloperMode,
    subscriptions: SubscriptionSet,
    temporary: bool,
    index: usize,
    disposed: bool,
}

impl<T: Transport> Client<T> {
    /// Wraps `transport` and starts the error reporter, the developer trace
    /// and, when a repository is given, the branch watch.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(transport: T, options: ClientOptions) -> Self {
        let transport = Arc::new(transport);
        let mut subscriptions = SubscriptionSet::new();

        subscriptions.add(events::spawn_error_reporter(
            transport.errors(),
            Arc::clone(&options.sink),
        ));
        subscriptions.add(events::spawn_developer_trace(
            transport.responses(),
            options.sink,
            options.developer_mode.clone(),
        ));
        if let Some(repository) = options.repository {
            subscriptions.add(repository::watch_repository(
                repository,
                Arc::clone(&options.environment),
            ));
        }

        Self {
            transport,
            environment: options.environment,
            transcript: Vec::new(),
            pending: None,
            developer_mode: options.developer_mode,
            subscriptions,
            temporary: options.temporary,
            index: options.index,
            disposed: false,
        }
    }

    /// Connects when disconnected, disconnects otherwise.
    ///
    /// A toggle that would repeat a transition still in flight is ignored.
    pub fn toggle(&mut self) {
        let state = self.transport.state();
        if self
            .pending
            .is_some_and(|target| state == target || state == DriverState::Error)
        {
            self.pending = None;
        }

        let target = if state == DriverState::Disconnected {
            DriverState::Connected
        } else {
            DriverState::Disconnected
        };
        if self.pending == Some(target) {
            debug!("toggle ignored: already moving to {}", target);
            return;
        }

        if target == DriverState::Connected {
            let project_path = self.environment.project_paths().into_iter().next();
            self.connect(ConnectOptions { project_path });
        } else {
            self.disconnect();
        }
    }

    /// Starts the server unless it is already up, starting, or failed.
    pub fn connect(&mut self, options: ConnectOptions) {
        let state = self.transport.state();
        if matches!(
            state,
            DriverState::Connected | DriverState::Connecting | DriverState::Error
        ) {
            debug!("connect ignored in state {}", state);
            return;
        }

        self.pending = Some(DriverState::Connected);
        self.transport.connect(options);

        let pid = self
            .transport
            .id()
            .map_or_else(|| "unknown".to_string(), |id| id.to_string());
        let location = self.transport.server_path().display().to_string();
        let project = self
            .transport
            .project_path()
            .map_or_else(|| "(none)".to_string(), |p| p.display().to_string());

        self.status(&format!("Starting OmniSharp server (pid: {pid})"));
        self.status(&format!("OmniSharp location: {location}"));
        self.status(
            "Change the location OmniSharp is loaded from by setting the OMNISHARP environment variable",
        );
        self.status(&format!("Project path: {project}"));
    }

    /// Stops the server.
    pub fn disconnect(&mut self) {
        self.pending = Some(DriverState::Disconnected);
        self.transport.disconnect();
        self.status("OmniSharp server stopped");
    }

    /// Stops the server and starts it again on the same project.
    pub fn restart(&mut self) {
        let project_path = self
            .transport
            .project_path()
            .or_else(|| self.environment.project_paths().into_iter().next());
        self.disconnect();
        self.connect(ConnectOptions { project_path });
    }

    /// Tears down the transport, then every subscription the client owns.
    pub fn dispose(&mut self) {
        if self.disposed {
            debug!("Client already disposed");
            return;
        }
        self.disposed = true;
        self.transport.dispose();
        self.subscriptions.dispose();
    }

    fn status(&mut self, line: &str) {
        debug!("{}", line);
        self.transport.log(line);
        self.transcript.push(line.to_string());
    }

    /// Sends `request` as `action`.
    ///
    /// Aborted requests resolve to `Ok(None)` without reaching the
    /// transport. Requests for `.json` files are sent with a `null` buffer.
    ///
    /// # Errors
    ///
    /// Returns the transport's error when the exchange fails.
    pub async fn send(
        &self,
        action: &str,
        mut request: Request,
        options: RequestOptions,
    ) -> Result<Option<Value>, TransportError> {
        if request.is_aborted() {
            debug!("Request {} aborted before sending", action);
            return Ok(None);
        }
        if request.targets_config_file() {
            request.clear_buffer();
        }

        self.transport
            .request(action, request.into_value(), options)
            .await
            .map(Some)
    }

    /// Snapshot of `document`, or of the focused document.
    #[must_use]
    pub fn editor_context(&self, document: Option<Arc<dyn Document>>) -> Option<EditorContext> {
        request::editor_context(self.environment.as_ref(), document)
    }

    /// The standard request for `document`, or for the focused document.
    #[must_use]
    pub fn make_request(
        &self,
        document: Option<Arc<dyn Document>>,
        buffer: Option<&dyn TextBuffer>,
    ) -> Option<Request> {
        request::make_request(self.environment.as_ref(), document, buffer)
    }

    /// A request built from `data` with editor context underneath it.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` does not serialize to a JSON object.
    pub fn make_data_request<D: Serialize + ?Sized>(
        &self,
        data: &D,
        document: Option<Arc<dyn Document>>,
        buffer: Option<&dyn TextBuffer>,
    ) -> Result<Request, RequestError> {
        request::make_data_request(self.environment.as_ref(), data, document, buffer)
    }

    /// A fresh subscription to the derived log stream.
    #[must_use]
    pub fn logs(&self) -> LogStream {
        LogStream::new(self.transport.events())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DriverState {
        self.transport.state()
    }

    /// Server process id, once started.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.transport.id()
    }

    /// Server executable.
    #[must_use]
    pub fn server_path(&self) -> &Path {
        self.transport.server_path()
    }

    /// Project of the current (or last) connection.
    #[must_use]
    pub fn project_path(&self) -> Option<PathBuf> {
        self.transport.project_path()
    }

    /// Lifecycle messages emitted so far, oldest first.
    #[must_use]
    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    /// Whether the client serves a loose file.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Position among sibling clients.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// The developer trace switch.
    #[must_use]
    pub const fn developer_mode(&self) -> &DeveloperMode {
        &self.developer_mode
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use crate::editor::{CursorPosition, FileDocument, HostEnvironment};
    use crate::transport::{MemoryTransport, ResponseRecord, ServerEvent};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

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

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn environment() -> Arc<HostEnvironment> {
        let (environment, _commands) = HostEnvironment::new(vec![
            PathBuf::from("/src/app"),
            PathBuf::from("/src/lib"),
        ]);
        Arc::new(environment)
    }

    fn client(transport: MemoryTransport) -> (Client<MemoryTransport>, Arc<HostEnvironment>) {
        let environment = environment();
        let client = Client::new(transport, ClientOptions::new(environment.clone()));
        (client, environment)
    }

    fn document(uri: &str, text: &str) -> Arc<dyn Document> {
        Arc::new(FileDocument::from_text(uri, text).with_cursor(CursorPosition::new(2, 4)))
    }

    #[tokio::test]
    async fn test_connect_is_gated_by_state() {
        for state in [
            DriverState::Connected,
            DriverState::Connecting,
            DriverState::Error,
        ] {
            let transport = MemoryTransport::new();
            transport.set_state(state);
            let (mut client, _) = client(transport);

            client.connect(ConnectOptions::for_project("/src/app"));
            client.connect(ConnectOptions::for_project("/src/app"));

            assert!(client.transport().connects().is_empty(), "state {state}");
            assert!(client.transcript().is_empty());
        }
    }

    #[tokio::test]
    async fn test_toggle_connects_to_first_project() {
        let transport = MemoryTransport::new()
            .with_pid(4242)
            .with_server_path("/opt/omnisharp/run");
        let (mut client, _) = client(transport);
        let mut logs = client.logs();

        client.toggle();

        assert_eq!(
            client.transport().connects(),
            vec![ConnectOptions::for_project("/src/app")]
        );
        assert_eq!(
            client.transcript(),
            [
                "Starting OmniSharp server (pid: 4242)",
                "OmniSharp location: /opt/omnisharp/run",
                "Change the location OmniSharp is loaded from by setting the OMNISHARP environment variable",
                "Project path: /src/app",
            ]
        );

        let first = logs.try_recv().unwrap();
        assert_eq!(first.message, "Starting OmniSharp server (pid: 4242)");
        assert_eq!(first.level, LogLevel::Information);
    }

    #[tokio::test]
    async fn test_toggle_disconnects_when_on() {
        let (mut client, _) = client(MemoryTransport::new().completing_connections());

        client.toggle();
        assert_eq!(client.state(), DriverState::Connected);
        client.toggle();

        assert_eq!(client.state(), DriverState::Disconnected);
        assert_eq!(client.transport().disconnects(), 1);
        assert_eq!(client.transcript().last().unwrap(), "OmniSharp server stopped");
    }

    #[tokio::test]
    async fn test_toggle_does_not_repeat_pending_connect() {
        // A transport that has not left Disconnected yet.
        let (mut client, _) =
            client(MemoryTransport::new().connect_lands_in(DriverState::Disconnected));

        client.toggle();
        client.toggle();
        client.toggle();

        assert_eq!(client.transport().connects().len(), 1);
        assert_eq!(client.transport().disconnects(), 0);

        // Once the target is reached the next toggle goes the other way.
        client.transport().set_state(DriverState::Connected);
        client.toggle();
        assert_eq!(client.transport().disconnects(), 1);
    }

    #[tokio::test]
    async fn test_toggle_after_error_disconnects() {
        let (mut client, _) = client(MemoryTransport::new().connect_lands_in(DriverState::Error));

        client.toggle();
        assert_eq!(client.state(), DriverState::Error);
        client.toggle();
        assert_eq!(client.state(), DriverState::Disconnected);
        client.toggle();
        assert_eq!(client.transport().connects().len(), 2);
    }

    #[tokio::test]
    async fn test_restart_reuses_project() {
        let (mut client, _) = client(MemoryTransport::new().completing_connections());
        client.connect(ConnectOptions::for_project("/src/lib"));

        client.restart();

        assert_eq!(client.transport().disconnects(), 1);
        assert_eq!(
            client.transport().connects(),
            vec![
                ConnectOptions::for_project("/src/lib"),
                ConnectOptions::for_project("/src/lib"),
            ]
        );
        assert_eq!(client.state(), DriverState::Connected);
    }

    #[tokio::test]
    async fn test_aborted_request_never_reaches_transport() {
        let (client, _) = client(MemoryTransport::new());

        let result = client
            .send("/gotodefinition", Request::abort(), RequestOptions::default())
            .await;

        assert_eq!(result, Ok(None));
        assert!(client.transport().requests().is_empty());
    }

    #[tokio::test]
    async fn test_json_file_sends_null_buffer() {
        let (client, _) = client(MemoryTransport::new());
        let request = client
            .make_request(Some(document("/src/app/project.json", "{\"a\": 1}")), None)
            .unwrap();

        client
            .send("updatebuffer", request, RequestOptions::default())
            .await
            .unwrap();

        let sent = &client.transport().requests()[0];
        assert_eq!(sent.command, "/updatebuffer");
        assert_eq!(sent.arguments["Buffer"], Value::Null);
        assert_eq!(sent.arguments["FileName"], "/src/app/project.json");
    }

    #[tokio::test]
    async fn test_source_file_keeps_buffer() {
        let (client, environment) =
            client(MemoryTransport::new().reply("/codecheck", json!({"QuickFixes": []})));
        environment.focus(Some(document("/src/app/a.cs", "class A {}")));

        let request = client.make_request(None, None).unwrap();
        let body = client
            .send("codecheck", request, RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(body, Some(json!({"QuickFixes": []})));
        let sent = &client.transport().requests()[0];
        assert_eq!(sent.arguments["Buffer"], "class A {}");
        assert_eq!(sent.arguments["Line"], 2);
        assert_eq!(sent.arguments["Column"], 4);
    }

    #[tokio::test]
    async fn test_transport_errors_reach_sink() {
        let environment = environment();
        let sink = Arc::new(RecordingSink::default());
        let client = Client::new(
            MemoryTransport::new(),
            ClientOptions::new(environment).with_sink(sink.clone()),
        );

        client.transport().fail(TransportError::Exited(Some(134)));

        wait_for(|| !sink.errors.lock().unwrap().is_empty()).await;
        assert_eq!(
            *sink.errors.lock().unwrap(),
            vec![TransportError::Exited(Some(134))]
        );
    }

    #[tokio::test]
    async fn test_dispose_stops_background_tasks() {
        let sink = Arc::new(RecordingSink::default());
        let mode = DeveloperMode::new(true);
        let mut client = Client::new(
            MemoryTransport::new(),
            ClientOptions::new(environment())
                .with_sink(sink.clone())
                .with_developer_mode(mode),
        );

        client.transport().fail(TransportError::NotConnected);
        wait_for(|| !sink.errors.lock().unwrap().is_empty()).await;
        assert_eq!(sink.errors.lock().unwrap().len(), 1);

        client.dispose();
        client.transport().fail(TransportError::Exited(Some(1)));
        client
            .transport()
            .request("/codecheck", json!({}), RequestOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *sink.errors.lock().unwrap(),
            vec![TransportError::NotConnected]
        );
        assert!(sink.exchanges.lock().unwrap().is_empty());
    }

    /// Runs a fixed exchange of events and requests and returns what a log
    /// subscriber saw, plus the sink the client reported to.
    async fn log_with_developer_mode(enabled: bool) -> (Vec<LogRecord>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let client = Client::new(
            MemoryTransport::new(),
            ClientOptions::new(environment())
                .with_sink(sink.clone())
                .with_developer_mode(DeveloperMode::new(enabled)),
        );
        let mut logs = client.logs();
        let mut errors = client.transport().errors();

        client.transport().emit(ServerEvent::log("loading", "DEBUG"));
        for action in ["codecheck", "typelookup"] {
            let request = client
                .make_data_request(&json!({ "Line": 1 }), None, None)
                .unwrap();
            client
                .send(action, request, RequestOptions::default())
                .await
                .unwrap();
            client.transport().emit(ServerEvent::log(action, "INFORMATION"));
        }
        if enabled {
            wait_for(|| sink.exchanges.lock().unwrap().len() == 2).await;
        } else {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut records = Vec::new();
        while let Some(record) = logs.try_recv() {
            records.push(record);
        }
        assert!(errors.try_recv().is_err());
        (records, sink)
    }

    #[tokio::test]
    async fn test_developer_trace_leaves_log_stream_untouched() {
        let (quiet, quiet_sink) = log_with_developer_mode(false).await;
        let (traced, traced_sink) = log_with_developer_mode(true).await;

        assert!(quiet_sink.exchanges.lock().unwrap().is_empty());
        assert_eq!(
            *traced_sink.exchanges.lock().unwrap(),
            vec!["/codecheck".to_string(), "/typelookup".to_string()]
        );

        let messages: Vec<&str> = traced.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["loading", "codecheck", "typelookup"]);
        assert_eq!(traced, quiet);
        assert!(traced_sink.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_runs_once() {
        let (mut client, _) = client(MemoryTransport::new());

        client.dispose();
        client.dispose();

        assert_eq!(client.transport().disposals(), 1);
    }

    #[tokio::test]
    async fn test_options_are_exposed() {
        let environment = environment();
        let mode = DeveloperMode::new(true);
        let client = Client::new(
            MemoryTransport::new(),
            ClientOptions::new(environment)
                .temporary(true)
                .with_index(3)
                .with_developer_mode(mode.clone()),
        );

        assert!(client.is_temporary());
        assert_eq!(client.index(), 3);
        mode.set(false);
        assert!(!client.developer_mode().is_enabled());
    }
}
