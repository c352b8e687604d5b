// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The host editor as seen by the client.
//!
//! The client never reaches into global UI state; everything it needs from the
//! editor (the focused document, its cursor and text, project roots, and a way
//! to run commands) comes through [`EditorEnvironment`].

use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

/// Resolves a document argument that may be a plain path or a `file://` URI.
///
/// # Errors
///
/// Returns an error for URIs with another scheme or that do not map to a
/// local path.
pub fn document_path(input: &str) -> Result<PathBuf> {
    if !input.contains("://") {
        return Ok(PathBuf::from(input));
    }
    let url = Url::parse(input).with_context(|| format!("Invalid document URI: {input}"))?;
    if url.scheme() != "file" {
        return Err(anyhow!("Unsupported document URI scheme: {}", url.scheme()));
    }
    url.to_file_path()
        .map_err(|()| anyhow!("Document URI has no local path: {input}"))
}

/// Zero-based cursor position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorPosition {
    /// Line index.
    pub row: u32,
    /// Column index within the line.
    pub column: u32,
}

impl CursorPosition {
    /// Position at `row`, `column`.
    #[must_use]
    pub const fn new(row: u32, column: u32) -> Self {
        Self { row, column }
    }
}

/// Text content of a document.
pub trait TextBuffer: Send + Sync {
    /// Lines of the buffer without their terminators.
    fn lines(&self) -> Vec<String>;

    /// Full text, lines joined with `\n`.
    fn text(&self) -> String {
        self.lines().join("\n")
    }
}

/// An open document.
pub trait Document: Send + Sync {
    /// Identifier the server knows the document by. File-backed documents
    /// use their filesystem path.
    fn uri(&self) -> String;

    /// Current cursor position.
    fn cursor(&self) -> CursorPosition;

    /// The document's own buffer.
    fn buffer(&self) -> &dyn TextBuffer;

    /// False once the document has been closed or destroyed.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Everything the client needs from the hosting editor.
pub trait EditorEnvironment: Send + Sync {
    /// The document that currently has focus.
    fn active_document(&self) -> Option<Arc<dyn Document>>;

    /// Known project roots, most relevant first.
    fn project_paths(&self) -> Vec<PathBuf>;

    /// Runs a named editor command.
    fn dispatch(&self, command: &str);
}

/// A buffer holding a fixed string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringBuffer {
    text: String,
}

impl StringBuffer {
    /// Buffer containing `text`.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl TextBuffer for StringBuffer {
    fn lines(&self) -> Vec<String> {
        self.text.split('\n').map(str::to_string).collect()
    }
}

/// A document whose content was read from disk.
#[derive(Debug)]
pub struct FileDocument {
    uri: String,
    cursor: CursorPosition,
    buffer: StringBuffer,
    alive: AtomicBool,
}

impl FileDocument {
    /// Reads `path` and opens it with the cursor at the origin.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be resolved or read.
    pub fn open(path: &Path) -> Result<Self> {
        let path = path
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", path.display()))?;
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        debug!("Opened document {}", path.display());
        Ok(Self::from_text(path.to_string_lossy(), text))
    }

    /// A document identified by `uri` holding `text`.
    pub fn from_text(uri: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            cursor: CursorPosition::default(),
            buffer: StringBuffer::new(text),
            alive: AtomicBool::new(true),
        }
    }

    /// Moves the cursor.
    #[must_use]
    pub const fn with_cursor(mut self, cursor: CursorPosition) -> Self {
        self.cursor = cursor;
        self
    }

    /// Marks the document as closed; requests built from it abort.
    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl Document for FileDocument {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn cursor(&self) -> CursorPosition {
        self.cursor
    }

    fn buffer(&self) -> &dyn TextBuffer {
        &self.buffer
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// A minimal editor: fixed project roots, one focusable document, and
/// commands delivered over a channel to whoever drives the event loop.
pub struct HostEnvironment {
    roots: Vec<PathBuf>,
    active: Mutex<Option<Arc<dyn Document>>>,
    commands: mpsc::UnboundedSender<String>,
}

impl HostEnvironment {
    /// Creates the environment and the receiving end of its command channel.
    #[must_use]
    pub fn new(roots: Vec<PathBuf>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let environment = Self {
            roots,
            active: Mutex::new(None),
            commands,
        };
        (environment, receiver)
    }

    /// Changes (or clears) the focused document.
    pub fn focus(&self, document: Option<Arc<dyn Document>>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = document;
    }
}

impl EditorEnvironment for HostEnvironment {
    fn active_document(&self) -> Option<Arc<dyn Document>> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn project_paths(&self) -> Vec<PathBuf> {
        self.roots.clone()
    }

    fn dispatch(&self, command: &str) {
        debug!("Dispatching command {}", command);
        // The receiver is gone only during shutdown.
        let _ = self.commands.send(command.to_string());
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_document_path_accepts_paths_and_file_uris() {
        assert_eq!(
            document_path("/src/app/a.cs").unwrap(),
            PathBuf::from("/src/app/a.cs")
        );
        assert_eq!(
            document_path("file:///src/app/My%20File.cs").unwrap(),
            PathBuf::from("/src/app/My File.cs")
        );
        assert!(document_path("https://example.com/a.cs").is_err());
    }

    #[test]
    fn test_string_buffer_lines_round_trip() {
        let buffer = StringBuffer::new("a\nb\n\nc\n");
        assert_eq!(buffer.lines(), vec!["a", "b", "", "c", ""]);
        assert_eq!(buffer.text(), "a\nb\n\nc\n");
    }

    #[test]
    fn test_file_document_open() {
        let mut file = NamedTempFile::with_suffix(".cs").unwrap();
        write!(file, "class A {{}}\nclass B {{}}").unwrap();

        let document = FileDocument::open(file.path())
            .unwrap()
            .with_cursor(CursorPosition::new(1, 6));

        let canonical = file.path().canonicalize().unwrap();
        assert_eq!(document.uri(), canonical.to_string_lossy());
        assert_eq!(document.cursor(), CursorPosition::new(1, 6));
        assert_eq!(document.buffer().lines(), vec!["class A {}", "class B {}"]);
        assert!(document.is_alive());
    }

    #[test]
    fn test_file_document_missing_file() {
        let result = FileDocument::open(Path::new("/definitely/not/here.cs"));
        assert!(result.is_err());
    }

    #[test]
    fn test_close_marks_document_dead() {
        let document = FileDocument::from_text("/tmp/a.cs", "");
        document.close();
        assert!(!document.is_alive());
    }

    #[test]
    fn test_host_environment_focus_and_dispatch() {
        let (environment, mut commands) = HostEnvironment::new(vec![PathBuf::from("/src/app")]);
        assert!(environment.active_document().is_none());

        let document: Arc<dyn Document> = Arc::new(FileDocument::from_text("/src/app/a.cs", "x"));
        environment.focus(Some(document));
        assert_eq!(
            environment.active_document().map(|d| d.uri()).as_deref(),
            Some("/src/app/a.cs")
        );

        environment.dispatch("omnisharp-atom:restart-server");
        assert_eq!(commands.try_recv().unwrap(), "omnisharp-atom:restart-server");
        assert_eq!(environment.project_paths(), vec![PathBuf::from("/src/app")]);
    }
}
