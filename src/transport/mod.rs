// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The request/response channel to an analysis server.
//!
//! [`Transport`] is the capability set the client is written against. Two
//! implementations ship with the crate: [`StdioTransport`] drives a real
//! server process, [`MemoryTransport`] is an in-process stand-in that records
//! everything it is asked to do.

use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// In-process transport for tests and embedding.
pub mod memory;
/// Packet types and line framing.
pub mod protocol;
/// Connection lifecycle state.
pub mod state;
/// Transport backed by a child process speaking the packet protocol.
pub mod stdio;

pub use memory::MemoryTransport;
pub use protocol::ServerEvent;
pub use state::DriverState;
pub use stdio::StdioTransport;

/// Default capacity of the broadcast channels a transport publishes on.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Options for [`Transport::connect`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Directory (or solution file) the server should load.
    pub project_path: Option<PathBuf>,
}

impl ConnectOptions {
    /// Options targeting `project_path`.
    #[must_use]
    pub fn for_project(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: Some(project_path.into()),
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Overrides the transport's default request timeout.
    pub timeout: Option<Duration>,
}

/// A completed exchange, published on [`Transport::responses`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRecord {
    /// Normalized command name, e.g. `/gotodefinition`.
    pub command: String,
    /// Arguments that were sent.
    pub request: Value,
    /// Response body (`null` when the server sent none).
    pub response: Value,
}

/// Failures surfaced by a transport.
///
/// Cloneable so the same value can be returned to the caller and broadcast on
/// the error stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server executable could not be started.
    #[error("failed to start analysis server `{program}`: {message}")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// Underlying OS error.
        message: String,
    },
    /// Reading from or writing to the server failed.
    #[error("I/O error talking to analysis server: {0}")]
    Io(String),
    /// The server exited without being asked to.
    #[error("analysis server exited unexpectedly (status: {})", exit_status(.0))]
    Exited(Option<i32>),
    /// No response arrived in time.
    #[error("request '{command}' timed out after {after:?}")]
    Timeout {
        /// Command that timed out.
        command: String,
        /// Timeout that elapsed.
        after: Duration,
    },
    /// The server answered with `Success: false`.
    #[error("request '{command}' failed: {message}")]
    Server {
        /// Command that failed.
        command: String,
        /// Server-provided message.
        message: String,
    },
    /// The connection closed while a request was outstanding.
    #[error("connection closed before '{0}' completed")]
    Closed(String),
    /// A request was made with no running server.
    #[error("analysis server is not running")]
    NotConnected,
    /// Request arguments could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(String),
}

fn exit_status(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

/// Capabilities the client needs from a transport.
///
/// Methods take `&self`; implementations keep their mutable state behind
/// atomics or locks so reader tasks can share it.
pub trait Transport: Send + Sync + 'static {
    /// Starts the server. Failures are reported through [`Self::errors`] and
    /// the `Error` state rather than returned.
    fn connect(&self, options: ConnectOptions);

    /// Stops the server, failing any outstanding requests.
    fn disconnect(&self);

    /// Current lifecycle state.
    fn state(&self) -> DriverState;

    /// Process id of the running server, if any.
    fn id(&self) -> Option<u32>;

    /// Executable the transport launches.
    fn server_path(&self) -> &Path;

    /// Project path of the current (or last) connection.
    fn project_path(&self) -> Option<PathBuf>;

    /// Subscribes to every event, in arrival order.
    fn events(&self) -> broadcast::Receiver<ServerEvent>;

    /// Subscribes to completed exchanges.
    fn responses(&self) -> broadcast::Receiver<ResponseRecord>;

    /// Subscribes to transport failures.
    fn errors(&self) -> broadcast::Receiver<TransportError>;

    /// Publishes a client-originated informational line on the event stream.
    fn log(&self, message: &str);

    /// Sends `command` with `arguments` and resolves with the response body.
    fn request(
        &self,
        command: &str,
        arguments: Value,
        options: RequestOptions,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send;

    /// Releases every resource. Idempotent.
    fn dispose(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            TransportError::Exited(Some(3)).to_string(),
            "analysis server exited unexpectedly (status: 3)"
        );
        assert_eq!(
            TransportError::Exited(None).to_string(),
            "analysis server exited unexpectedly (status: unknown)"
        );
        assert_eq!(
            TransportError::Server {
                command: "/codecheck".to_string(),
                message: "boom".to_string(),
            }
            .to_string(),
            "request '/codecheck' failed: boom"
        );
    }

    #[test]
    fn test_connect_options_for_project() {
        let options = ConnectOptions::for_project("/src/app");
        assert_eq!(options.project_path, Some(PathBuf::from("/src/app")));
        assert_eq!(ConnectOptions::default().project_path, None);
    }
}
