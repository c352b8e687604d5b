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

//! Packet types for the stdio server protocol.
//!
//! Every packet is a single JSON object terminated by a newline. The client
//! sends `request` packets; the server answers with `response` packets that
//! echo the request's sequence number, and emits `event` packets on its own.

use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `Type` of packets the client sends.
pub const REQUEST_TYPE: &str = "request";
/// `Type` of packets answering a request.
pub const RESPONSE_TYPE: &str = "response";
/// `Type` of server-initiated packets.
pub const EVENT_TYPE: &str = "event";
/// `Type` of error events.
pub const ERROR_TYPE: &str = "error";
/// `Type` of events the client publishes about itself.
pub const LOG_TYPE: &str = "log";
/// Name of the event a server emits once it is ready for requests.
pub const STARTED_EVENT: &str = "started";

/// A client-to-server request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RequestPacket {
    /// Always [`REQUEST_TYPE`].
    #[serde(rename = "Type")]
    pub kind: String,
    /// Sequence number the response echoes as `Request_seq`.
    pub seq: i64,
    /// Command path, e.g. `/codecheck`.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub arguments: Value,
}

impl RequestPacket {
    /// Builds a request packet, normalizing `command` to its `/name` form.
    #[must_use]
    pub fn new(seq: i64, command: &str, arguments: Value) -> Self {
        Self {
            kind: REQUEST_TYPE.to_string(),
            seq,
            command: normalize_command(command),
            arguments,
        }
    }
}

/// The server's answer to one request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ResponsePacket {
    /// The server's own sequence number.
    #[serde(default)]
    pub seq: Option<i64>,
    /// `Seq` of the request being answered.
    #[serde(rename = "Request_seq")]
    pub request_seq: i64,
    /// Command that was requested.
    #[serde(default)]
    pub command: String,
    /// Whether the server is still running.
    #[serde(default)]
    pub running: bool,
    /// False when the request failed (default: true).
    #[serde(default = "default_success")]
    pub success: bool,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

const fn default_success() -> bool {
    true
}

/// A raw event as delivered by the server (or synthesized by a transport).
///
/// The body is kept as untyped JSON so that events with unexpected shapes
/// still decode.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ServerEvent {
    /// Packet type: `event`, `error` or `log`.
    #[serde(rename = "Type", default)]
    pub kind: String,
    /// Event name, e.g. `started` or `ProjectAdded`.
    #[serde(rename = "Event", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Sequence number, if the server sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ServerEvent {
    /// An informational log event carrying `message` at `level`.
    #[must_use]
    pub fn log(message: &str, level: &str) -> Self {
        Self {
            kind: LOG_TYPE.to_string(),
            name: Some("log".to_string()),
            seq: None,
            body: Some(serde_json::json!({ "Message": message, "LogLevel": level })),
        }
    }

    /// An error-typed event whose body carries `message` and no level.
    #[must_use]
    pub fn error(name: &str, message: &str) -> Self {
        Self {
            kind: ERROR_TYPE.to_string(),
            name: Some(name.to_string()),
            seq: None,
            body: Some(serde_json::json!({ "Message": message })),
        }
    }

    /// True when the packet's `Type` marks it as an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind == ERROR_TYPE
    }

    /// Reads a string field out of the body, if the body is an object.
    #[must_use]
    pub fn body_str(&self, field: &str) -> Option<&str> {
        self.body.as_ref()?.get(field)?.as_str()
    }
}

/// A decoded server-to-client packet.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    /// Answer to a pending request.
    Response(ResponsePacket),
    /// Anything else the server sends.
    Event(ServerEvent),
}

/// Decodes one packet line. Anything that is not a response is an event.
///
/// # Errors
///
/// Returns an error if the line is not a JSON object of either shape.
pub fn decode_packet(line: &str) -> Result<ServerPacket> {
    let value: Value = serde_json::from_str(line).context("Packet is not valid JSON")?;

    if value.get("Type").and_then(Value::as_str) == Some(RESPONSE_TYPE) {
        let response = serde_json::from_value(value).context("Malformed response packet")?;
        return Ok(ServerPacket::Response(response));
    }

    let event = serde_json::from_value(value).context("Malformed event packet")?;
    Ok(ServerPacket::Event(event))
}

/// Serializes a packet as a single newline-terminated line.
///
/// # Errors
///
/// Returns an error if the packet cannot be serialized.
pub fn encode_packet<T: Serialize>(packet: &T) -> Result<String> {
    let mut line = serde_json::to_string(packet).context("Failed to encode packet")?;
    line.push('\n');
    Ok(line)
}

/// Server commands are paths; accept `gotodefinition` as `/gotodefinition`.
#[must_use]
pub fn normalize_command(command: &str) -> String {
    if command.starts_with('/') {
        command.to_string()
    } else {
        format!("/{command}")
    }
}

/// Splits one complete line off the front of `buffer`.
///
/// Returns `None` until a newline has arrived. A trailing `\r` is dropped so
/// servers writing CRLF work unchanged.
///
/// # Errors
///
/// Returns an error if the line is not valid UTF-8.
pub fn try_parse_line(buffer: &mut BytesMut) -> Result<Option<String>> {
    let Some(newline) = buffer.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };

    let mut line = buffer.split_to(newline);
    buffer.advance(1);

    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }

    let line = String::from_utf8(line.to_vec()).context("Packet is not valid UTF-8")?;
    Ok(Some(line))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    reason = "Tests use unwrap/panic for clear failure messages"
)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_line() {
        let mut buffer = BytesMut::from("{\"Type\":\"event\"}\n");
        let line = try_parse_line(&mut buffer).unwrap();
        assert_eq!(line.as_deref(), Some("{\"Type\":\"event\"}"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_incomplete_line() {
        let mut buffer = BytesMut::from("{\"Type\":\"ev");
        assert_eq!(try_parse_line(&mut buffer).unwrap(), None);
        assert_eq!(buffer.len(), 11);
    }

    #[test]
    fn test_parse_multiple_lines_and_crlf() {
        let mut buffer = BytesMut::from("first\r\nsecond\nthi");
        assert_eq!(try_parse_line(&mut buffer).unwrap().as_deref(), Some("first"));
        assert_eq!(try_parse_line(&mut buffer).unwrap().as_deref(), Some("second"));
        assert_eq!(try_parse_line(&mut buffer).unwrap(), None);
        assert_eq!(&buffer[..], b"thi");
    }

    #[test]
    fn test_decode_response() {
        let line = r#"{"Type":"response","Seq":9,"Request_seq":4,"Command":"/checkalivestatus","Running":true,"Success":true,"Body":true}"#;
        let ServerPacket::Response(response) = decode_packet(line).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.request_seq, 4);
        assert_eq!(response.command, "/checkalivestatus");
        assert!(response.success);
        assert_eq!(response.body, Some(Value::Bool(true)));
    }

    #[test]
    fn test_decode_response_defaults_success() {
        let line = r#"{"Type":"response","Request_seq":1}"#;
        let ServerPacket::Response(response) = decode_packet(line).unwrap() else {
            panic!("expected response");
        };
        assert!(response.success);
        assert!(response.body.is_none());
    }

    #[test]
    fn test_decode_event_with_log_body() {
        let line = r#"{"Type":"event","Seq":2,"Event":"log","Body":{"LogLevel":"WARNING","Message":"slow"}}"#;
        let ServerPacket::Event(event) = decode_packet(line).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.name.as_deref(), Some("log"));
        assert_eq!(event.body_str("LogLevel"), Some("WARNING"));
        assert_eq!(event.body_str("Message"), Some("slow"));
        assert!(!event.is_error());
    }

    #[test]
    fn test_decode_event_with_odd_body() {
        let ServerPacket::Event(event) = decode_packet(r#"{"Type":"error","Body":[1,2]}"#).unwrap()
        else {
            panic!("expected event");
        };
        assert!(event.is_error());
        assert_eq!(event.body_str("Message"), None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_packet("Starting OmniSharp on ubuntu").is_err());
    }

    #[test]
    fn test_encode_request() {
        let packet = RequestPacket::new(3, "gotodefinition", serde_json::json!({"Line": 1}));
        let line = encode_packet(&packet).unwrap();
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["Type"], "request");
        assert_eq!(value["Seq"], 3);
        assert_eq!(value["Command"], "/gotodefinition");
        assert_eq!(value["Arguments"]["Line"], 1);
    }

    #[test]
    fn test_normalize_command() {
        assert_eq!(normalize_command("/codecheck"), "/codecheck");
        assert_eq!(normalize_command("codecheck"), "/codecheck");
    }
}
