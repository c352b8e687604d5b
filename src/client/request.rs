// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Request construction from editor state.
//!
//! A request is a snapshot: cursor, file and buffer text are copied out of
//! the document when the request is built, so later edits never leak into a
//! request already in flight.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::editor::{Document, EditorEnvironment, TextBuffer};

/// Field carrying the zero-based cursor line.
pub const LINE: &str = "Line";
/// Field carrying the zero-based cursor column.
pub const COLUMN: &str = "Column";
/// Field carrying the document identifier.
pub const FILE_NAME: &str = "FileName";
/// Field carrying the full buffer text.
pub const BUFFER: &str = "Buffer";

/// Errors building a request from caller data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// Request data must serialize to a JSON object.
    #[error("request data must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    /// Request data could not be serialized.
    #[error("failed to serialize request data: {0}")]
    Serialize(String),
}

/// Cursor, file and text of a document at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EditorContext {
    /// Cursor row.
    pub line: u32,
    /// Cursor column.
    pub column: u32,
    /// Document identifier.
    pub file_name: String,
    /// Buffer lines joined with `\n`.
    pub buffer: String,
}

impl EditorContext {
    /// Captures `document`, reading text from `buffer` when given instead of
    /// the document's own buffer.
    #[must_use]
    pub fn capture(document: &dyn Document, buffer: Option<&dyn TextBuffer>) -> Self {
        let cursor = document.cursor();
        let text = match buffer {
            Some(buffer) => buffer.text(),
            None => document.buffer().text(),
        };

        Self {
            line: cursor.row,
            column: cursor.column,
            file_name: document.uri(),
            buffer: text,
        }
    }
}

/// Payload for one server request.
///
/// Holds arbitrary PascalCase fields plus the abort marker. An aborted
/// request is never forwarded to the transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    fields: Map<String, Value>,
    abort: bool,
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Request {
    /// The "do not send" sentinel.
    #[must_use]
    pub fn abort() -> Self {
        Self {
            fields: Map::new(),
            abort: true,
        }
    }

    /// A request carrying exactly the context fields.
    #[must_use]
    pub fn from_context(context: &EditorContext) -> Self {
        let mut fields = Map::new();
        fields.insert(LINE.to_string(), Value::from(context.line));
        fields.insert(COLUMN.to_string(), Value::from(context.column));
        fields.insert(FILE_NAME.to_string(), Value::from(context.file_name.clone()));
        fields.insert(BUFFER.to_string(), Value::from(context.buffer.clone()));
        Self {
            fields,
            abort: false,
        }
    }

    /// A request whose fields are the serialized form of `data`. `null`
    /// (e.g. `()` or `None`) yields an empty request.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` fails to serialize or is not an object.
    pub fn from_data<T: Serialize + ?Sized>(data: &T) -> Result<Self, RequestError> {
        match serde_json::to_value(data).map_err(|e| RequestError::Serialize(e.to_string()))? {
            Value::Object(fields) => Ok(Self {
                fields,
                abort: false,
            }),
            Value::Null => Ok(Self::default()),
            other => Err(RequestError::NotAnObject(kind_of(&other))),
        }
    }

    /// Adds every field of `context` this request does not already have.
    /// Fields already present are kept. An aborted context aborts the result.
    #[must_use]
    pub fn merge_context(mut self, context: Self) -> Self {
        for (key, value) in context.fields {
            self.fields.entry(key).or_insert(value);
        }
        self.abort |= context.abort;
        self
    }

    /// Whether this request must not be sent.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        self.abort
    }

    /// The `FileName` field, if it is a string.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.fields.get(FILE_NAME).and_then(Value::as_str)
    }

    /// The `Buffer` field.
    #[must_use]
    pub fn buffer(&self) -> Option<&Value> {
        self.fields.get(BUFFER)
    }

    /// Any field by name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// True for JSON configuration files, whose contents the server reads
    /// from disk rather than from the request.
    #[must_use]
    pub fn targets_config_file(&self) -> bool {
        self.file_name().is_some_and(|name| name.ends_with(".json"))
    }

    /// Replaces the buffer with `null`.
    pub fn clear_buffer(&mut self) {
        self.fields.insert(BUFFER.to_string(), Value::Null);
    }

    /// The wire arguments.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

fn resolve(
    environment: &dyn EditorEnvironment,
    document: Option<Arc<dyn Document>>,
) -> Option<Arc<dyn Document>> {
    document.or_else(|| environment.active_document())
}

/// Snapshot of `document`, or of the focused document when `None`.
/// Returns `None` when there is nothing to capture.
#[must_use]
pub fn editor_context(
    environment: &dyn EditorEnvironment,
    document: Option<Arc<dyn Document>>,
) -> Option<EditorContext> {
    let document = resolve(environment, document)?;
    Some(EditorContext::capture(document.as_ref(), None))
}

/// Builds the standard request for `document` (or the focused one).
///
/// A closed document yields [`Request::abort`]. `buffer` overrides the
/// document's own buffer as the text source.
#[must_use]
pub fn make_request(
    environment: &dyn EditorEnvironment,
    document: Option<Arc<dyn Document>>,
    buffer: Option<&dyn TextBuffer>,
) -> Option<Request> {
    let document = resolve(environment, document)?;
    if !document.is_alive() {
        return Some(Request::abort());
    }
    let context = EditorContext::capture(document.as_ref(), buffer);
    Some(Request::from_context(&context))
}

/// Builds a request from caller `data` with the editor context filled in
/// underneath it. Fields `data` already sets are left untouched. With no
/// document to capture, the request carries `data` alone.
///
/// # Errors
///
/// Returns an error if `data` does not serialize to a JSON object.
pub fn make_data_request<T: Serialize + ?Sized>(
    environment: &dyn EditorEnvironment,
    data: &T,
    document: Option<Arc<dyn Document>>,
    buffer: Option<&dyn TextBuffer>,
) -> Result<Request, RequestError> {
    let request = Request::from_data(data)?;
    Ok(match make_request(environment, document, buffer) {
        Some(context) => request.merge_context(context),
        None => request,
    })
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use crate::editor::{CursorPosition, FileDocument, HostEnvironment, StringBuffer};
    use serde_json::json;

    fn document(uri: &str, text: &str, row: u32, column: u32) -> Arc<FileDocument> {
        Arc::new(FileDocument::from_text(uri, text).with_cursor(CursorPosition::new(row, column)))
    }

    #[test]
    fn test_context_snapshot_fields() {
        let (environment, _commands) = HostEnvironment::new(vec![]);
        environment.focus(Some(document("/src/a.cs", "a\nb\nc\nd", 3, 7)));

        let request = make_request(&environment, None, None).unwrap();

        assert_eq!(
            request.into_value(),
            json!({"Line": 3, "Column": 7, "Buffer": "a\nb\nc\nd", "FileName": "/src/a.cs"})
        );
    }

    #[test]
    fn test_no_document_yields_nothing() {
        let (environment, _commands) = HostEnvironment::new(vec![]);
        assert!(editor_context(&environment, None).is_none());
        assert!(make_request(&environment, None, None).is_none());
    }

    #[test]
    fn test_explicit_document_beats_focus() {
        let (environment, _commands) = HostEnvironment::new(vec![]);
        environment.focus(Some(document("/src/focused.cs", "", 0, 0)));

        let context =
            editor_context(&environment, Some(document("/src/other.cs", "x", 1, 2))).unwrap();
        assert_eq!(context.file_name, "/src/other.cs");
        assert_eq!((context.line, context.column), (1, 2));
    }

    #[test]
    fn test_dead_document_aborts() {
        let (environment, _commands) = HostEnvironment::new(vec![]);
        let closed = document("/src/a.cs", "text", 0, 0);
        closed.close();

        let request = make_request(&environment, Some(closed), None).unwrap();
        assert!(request.is_aborted());
        assert_eq!(request.file_name(), None);
    }

    #[test]
    fn test_buffer_override() {
        let (environment, _commands) = HostEnvironment::new(vec![]);
        let replacement = StringBuffer::new("edited\ntext");

        let request = make_request(
            &environment,
            Some(document("/src/a.cs", "original", 0, 0)),
            Some(&replacement),
        )
        .unwrap();

        assert_eq!(request.buffer(), Some(&json!("edited\ntext")));
    }

    #[test]
    fn test_data_request_keeps_caller_fields() {
        let (environment, _commands) = HostEnvironment::new(vec![]);
        environment.focus(Some(document("/src/a.cs", "body", 4, 1)));

        let request = make_data_request(
            &environment,
            &json!({"Line": 10, "Identifier": "x"}),
            None,
            None,
        )
        .unwrap();

        assert_eq!(request.get(LINE), Some(&json!(10)));
        assert_eq!(request.get(COLUMN), Some(&json!(1)));
        assert_eq!(request.get("Identifier"), Some(&json!("x")));
        assert_eq!(request.file_name(), Some("/src/a.cs"));
    }

    #[test]
    fn test_merge_precedence_holds_for_every_field() {
        let context = Request::from_context(&EditorContext {
            line: 1,
            column: 2,
            file_name: "/ctx.cs".to_string(),
            buffer: "ctx".to_string(),
        });

        for key in [LINE, COLUMN, FILE_NAME, BUFFER] {
            let mut data = Map::new();
            data.insert(key.to_string(), json!("caller"));
            let merged = Request::from_data(&data).unwrap().merge_context(context.clone());

            assert_eq!(merged.get(key), Some(&json!("caller")), "field {key}");
            for other in [LINE, COLUMN, FILE_NAME, BUFFER].into_iter().filter(|k| *k != key) {
                assert_eq!(merged.get(other), context.get(other), "field {other}");
            }
        }
    }

    #[test]
    fn test_data_request_inherits_abort() {
        let (environment, _commands) = HostEnvironment::new(vec![]);
        let closed = document("/src/a.cs", "", 0, 0);
        closed.close();

        let request =
            make_data_request(&environment, &json!({"WantSnippet": true}), Some(closed), None)
                .unwrap();
        assert!(request.is_aborted());
        assert_eq!(request.get("WantSnippet"), Some(&json!(true)));
    }

    #[test]
    fn test_data_must_be_an_object() {
        assert_eq!(
            Request::from_data(&json!([1, 2])),
            Err(RequestError::NotAnObject("an array"))
        );
        assert_eq!(Request::from_data(&()), Ok(Request::default()));
    }

    #[test]
    fn test_config_file_detection() {
        let mut request =
            Request::from_data(&json!({"FileName": "/src/project.json", "Buffer": "{}"})).unwrap();
        assert!(request.targets_config_file());
        request.clear_buffer();
        assert_eq!(request.buffer(), Some(&Value::Null));

        let source = Request::from_data(&json!({"FileName": "/src/a.cs"})).unwrap();
        assert!(!source.targets_config_file());
    }
}
