/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use bytes::BytesMut;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::protocol::{self, RequestPacket, ResponsePacket, STARTED_EVENT, ServerPacket};
use super::state::AtomicDriverState;
use super::{
    ConnectOptions, DEFAULT_EVENT_CAPACITY, DriverState, RequestOptions, ResponseRecord,
    ServerEvent, Transport, TransportError,
};
use crate::config::Config;

/// Default timeout for server requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for an exit status after the server closes stdout.
const EXIT_GRACE: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type PendingMap = HashMap<i64, oneshot::Sender<ResponsePacket>>;

/// A spawned server process and the tasks reading from it.
struct Running {
    pid: Option<u32>,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    reader: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
    child: Child,
}

/// State shared between the transport and its reader tasks.
struct Shared {
    state: AtomicDriverState,
    /// Bumped on every connect and disconnect. Tasks belonging to an older
    /// connection compare against it and stand down.
    generation: AtomicU64,
    pending: Mutex<PendingMap>,
    events: broadcast::Sender<ServerEvent>,
    responses: broadcast::Sender<ResponseRecord>,
    errors: broadcast::Sender<TransportError>,
    running: Mutex<Option<Running>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn publish_error(&self, error: TransportError) {
        // No subscribers is fine; the caller still gets the error.
        let _ = self.errors.send(error);
    }

    fn handle_line(&self, line: &str, generation: u64) {
        if line.trim().is_empty() || !self.is_current(generation) {
            return;
        }
        trace!("Received packet: {}", line);

        match protocol::decode_packet(line) {
            Ok(ServerPacket::Response(response)) => {
                let sender = lock(&self.pending).remove(&response.request_seq);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(response);
                    }
                    None => warn!(
                        "Received response for unknown request seq: {}",
                        response.request_seq
                    ),
                }
            }
            Ok(ServerPacket::Event(event)) => {
                if event.name.as_deref() == Some(STARTED_EVENT)
                    && self
                        .state
                        .compare_and_set(DriverState::Connecting, DriverState::Connected)
                {
                    info!("Analysis server ready");
                }
                let _ = self.events.send(event);
            }
            Err(e) => {
                // Servers print banners and build output before speaking the
                // protocol; surface those lines as plain log events.
                debug!("Non-packet output ({:#}): {}", e, line);
                let _ = self.events.send(ServerEvent::log(line, "INFORMATION"));
            }
        }
    }

    async fn connection_lost(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }

        let running = lock(&self.running).take();
        let mut code = None;
        if let Some(mut running) = running {
            if let Ok(Ok(status)) = tokio::time::timeout(EXIT_GRACE, running.child.wait()).await {
                code = status.code();
            }
        }

        // Dropping the senders fails every outstanding request with `Closed`.
        lock(&self.pending).clear();

        if self.state.transition(DriverState::Error).is_some() {
            warn!("Analysis server connection lost (exit code: {:?})", code);
            self.publish_error(TransportError::Exited(code));
        }
    }
}

/// Background task that reads stdout packets and routes them.
async fn reader_task(shared: Arc<Shared>, stdout: ChildStdout, generation: u64) {
    let mut reader = BufReader::new(stdout);
    let mut buffer = BytesMut::with_capacity(8192);

    loop {
        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                debug!("Server stdout closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Error reading from server stdout: {}", e);
                break;
            }
        }

        loop {
            match protocol::try_parse_line(&mut buffer) {
                Ok(Some(line)) => shared.handle_line(&line, generation),
                Ok(None) => break,
                Err(e) => warn!("Dropping unreadable line: {:#}", e),
            }
        }
    }

    shared.connection_lost(generation).await;
}

/// Background task that turns stderr lines into error events.
async fn stderr_task(shared: Arc<Shared>, stderr: ChildStderr, generation: u64) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !shared.is_current(generation) {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let _ = shared.events.send(ServerEvent::error("stderr", &line));
    }
}

/// Transport that runs the analysis server as a child process and speaks
/// the line-delimited packet protocol over its stdio.
pub struct StdioTransport {
    program: PathBuf,
    args: Vec<String>,
    request_timeout: Duration,
    next_seq: AtomicI64,
    shared: Arc<Shared>,
    project_path: Mutex<Option<PathBuf>>,
    disposed: AtomicBool,
}

impl StdioTransport {
    /// Transport launching `program` with `args` appended after the
    /// project selection.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self::with_capacity(program, args, DEFAULT_EVENT_CAPACITY)
    }

    /// Like [`Self::new`] with a custom broadcast channel capacity.
    pub fn with_capacity(program: impl Into<PathBuf>, args: Vec<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        let (responses, _) = broadcast::channel(capacity);
        let (errors, _) = broadcast::channel(capacity);

        Self {
            program: program.into(),
            args,
            request_timeout: REQUEST_TIMEOUT,
            next_seq: AtomicI64::new(1),
            shared: Arc::new(Shared {
                state: AtomicDriverState::default(),
                generation: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                events,
                responses,
                errors,
                running: Mutex::new(None),
            }),
            project_path: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Builds a transport from the `server` section of `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::with_capacity(
            config.server.command.clone(),
            config.server.args.clone(),
            config.event_capacity,
        )
        .with_request_timeout(config.request_timeout())
    }

    /// Overrides the default request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn spawn(&self, project: Option<&Path>, generation: u64) -> Result<Running, TransportError> {
        let mut command = Command::new(&self.program);
        if let Some(project) = project {
            command.arg("-s").arg(project);
            if project.is_dir() {
                command.current_dir(project);
            } else if let Some(parent) = project.parent().filter(|p| p.is_dir()) {
                command.current_dir(parent);
            }
        }
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| TransportError::Spawn {
            program: self.program.display().to_string(),
            message: e.to_string(),
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("server stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("server stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        let reader = tokio::spawn(reader_task(Arc::clone(&self.shared), stdout, generation));
        let stderr = stderr
            .map(|stderr| tokio::spawn(stderr_task(Arc::clone(&self.shared), stderr, generation)));

        Ok(Running {
            pid: child.id(),
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            reader,
            stderr,
            child,
        })
    }

    async fn exchange(
        &self,
        command: &str,
        arguments: Value,
        options: RequestOptions,
    ) -> Result<Value, TransportError> {
        let stdin = lock(&self.shared.running)
            .as_ref()
            .map(|running| Arc::clone(&running.stdin));
        let Some(stdin) = stdin else {
            return Err(TransportError::NotConnected);
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let packet = RequestPacket::new(seq, command, arguments);
        let line =
            protocol::encode_packet(&packet).map_err(|e| TransportError::Encode(format!("{e:#}")))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(seq, tx);

        trace!("Sending packet: {}", line.trim_end());
        let written = async {
            let mut stdin = stdin.lock().await;
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            lock(&self.shared.pending).remove(&seq);
            return Err(TransportError::Io(e.to_string()));
        }

        let timeout = options.timeout.unwrap_or(self.request_timeout);
        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(TransportError::Closed(command.to_string())),
            Err(_) => {
                lock(&self.shared.pending).remove(&seq);
                return Err(TransportError::Timeout {
                    command: command.to_string(),
                    after: timeout,
                });
            }
        };

        if !response.success {
            return Err(TransportError::Server {
                command: command.to_string(),
                message: response
                    .message
                    .unwrap_or_else(|| "request failed".to_string()),
            });
        }

        Ok(response.body.unwrap_or(Value::Null))
    }
}

impl Transport for StdioTransport {
    fn connect(&self, options: ConnectOptions) {
        if self.disposed.load(Ordering::SeqCst) {
            debug!("connect ignored: transport disposed");
            return;
        }
        if self.shared.state.transition(DriverState::Connecting).is_none() {
            debug!("connect ignored in state {}", self.shared.state.load());
            return;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.project_path).clone_from(&options.project_path);

        // Hold the slot while spawning so an immediate exit observed by the
        // reader cannot race the store below.
        let mut running = lock(&self.shared.running);
        match self.spawn(options.project_path.as_deref(), generation) {
            Ok(spawned) => {
                info!(
                    "Started analysis server {} (pid: {:?})",
                    self.program.display(),
                    spawned.pid
                );
                *running = Some(spawned);
            }
            Err(e) => {
                drop(running);
                warn!("{}", e);
                self.shared.state.transition(DriverState::Error);
                self.shared.publish_error(e);
            }
        }
    }

    fn disconnect(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let running = lock(&self.shared.running).take();
        if let Some(mut running) = running {
            running.reader.abort();
            if let Some(stderr) = running.stderr.take() {
                stderr.abort();
            }
            if let Err(e) = running.child.start_kill() {
                debug!("Failed to signal server process: {}", e);
            }
            info!("Stopped analysis server (pid: {:?})", running.pid);
        }

        lock(&self.shared.pending).clear();
        let previous = self.shared.state.store(DriverState::Disconnected);
        debug!("Transport {} -> disconnected", previous);
    }

    fn state(&self) -> DriverState {
        self.shared.state.load()
    }

    fn id(&self) -> Option<u32> {
        lock(&self.shared.running).as_ref().and_then(|r| r.pid)
    }

    fn server_path(&self) -> &Path {
        &self.program
    }

    fn project_path(&self) -> Option<PathBuf> {
        lock(&self.project_path).clone()
    }

    fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    fn responses(&self) -> broadcast::Receiver<ResponseRecord> {
        self.shared.responses.subscribe()
    }

    fn errors(&self) -> broadcast::Receiver<TransportError> {
        self.shared.errors.subscribe()
    }

    fn log(&self, message: &str) {
        let _ = self
            .shared
            .events
            .send(ServerEvent::log(message, "INFORMATION"));
    }

    async fn request(
        &self,
        command: &str,
        arguments: Value,
        options: RequestOptions,
    ) -> Result<Value, TransportError> {
        let command = protocol::normalize_command(command);
        let result = self.exchange(&command, arguments.clone(), options).await;

        match &result {
            Ok(body) => {
                let _ = self.shared.responses.send(ResponseRecord {
                    command,
                    request: arguments,
                    response: body.clone(),
                });
            }
            Err(e) => {
                debug!("Request {} failed: {}", command, e);
                self.shared.publish_error(e.clone());
            }
        }

        result
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect();
    }
}

impl Drop for StdioTransport {
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

    #[tokio::test]
    async fn test_spawn_failure_lands_in_error() {
        let transport = StdioTransport::new("/nonexistent/omnisharp-binary", vec![]);
        let mut errors = transport.errors();

        transport.connect(ConnectOptions::for_project("/tmp"));

        assert_eq!(transport.state(), DriverState::Error);
        assert_eq!(transport.id(), None);
        assert_eq!(transport.project_path(), Some(PathBuf::from("/tmp")));
        assert!(matches!(
            errors.try_recv().unwrap(),
            TransportError::Spawn { .. }
        ));

        // Error blocks reconnecting until an explicit disconnect.
        transport.connect(ConnectOptions::default());
        assert_eq!(transport.state(), DriverState::Error);
        transport.disconnect();
        assert_eq!(transport.state(), DriverState::Disconnected);
    }

    #[tokio::test]
    async fn test_request_without_server() {
        let transport = StdioTransport::new("omnisharp", vec!["--stdio".to_string()]);
        let mut errors = transport.errors();

        let result = transport
            .request("checkalivestatus", Value::Null, RequestOptions::default())
            .await;

        assert_eq!(result, Err(TransportError::NotConnected));
        assert_eq!(errors.try_recv().unwrap(), TransportError::NotConnected);
    }

    #[tokio::test]
    async fn test_log_publishes_information_event() {
        let transport = StdioTransport::new("omnisharp", vec![]);
        let mut events = transport.events();

        transport.log("hello");

        let event = events.try_recv().unwrap();
        assert_eq!(event.body_str("Message"), Some("hello"));
        assert_eq!(event.body_str("LogLevel"), Some("INFORMATION"));
        assert_eq!(transport.server_path(), Path::new("omnisharp"));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let transport = StdioTransport::new("omnisharp", vec![]);
        transport.dispose();
        transport.dispose();
        transport.connect(ConnectOptions::default());
        assert_eq!(transport.state(), DriverState::Disconnected);
    }
}
