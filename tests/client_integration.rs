// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Tests use unwrap/expect/panic for clear failure messages"
)]
//! End-to-end tests of the client driving the mock server through the
//! stdio transport.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use omnibridge::client::{Client, ClientOptions, LogLevel, RESTART_COMMAND};
use omnibridge::editor::{CursorPosition, Document, FileDocument, HostEnvironment};
use omnibridge::git::{GitRepository, RepositoryWatch};
use omnibridge::transport::{DriverState, RequestOptions, StdioTransport, Transport};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    client: Client<StdioTransport>,
    environment: Arc<HostEnvironment>,
    commands: mpsc::UnboundedReceiver<String>,
    project: TempDir,
    _watch: Option<RepositoryWatch>,
}

fn harness(args: &[&str], with_repository: bool) -> Harness {
    let project = tempfile::tempdir().unwrap();
    let (environment, commands) = HostEnvironment::new(vec![project.path().to_path_buf()]);
    let environment = Arc::new(environment);

    let mut options = ClientOptions::new(environment.clone());
    let mut watch = None;
    if with_repository {
        let git_dir = project.path().join(".git");
        std::fs::create_dir_all(&git_dir).unwrap();
        std::fs::write(git_dir.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        let repository = Arc::new(GitRepository::open(git_dir));
        watch = Some(repository.watch().unwrap());
        options = options.with_repository(repository);
    }

    let mut argv = vec!["--stdio".to_string()];
    argv.extend(args.iter().map(|a| (*a).to_string()));
    let transport = StdioTransport::new(env!("CARGO_BIN_EXE_mockomni"), argv);

    Harness {
        client: Client::new(transport, options),
        environment,
        commands,
        project,
        _watch: watch,
    }
}

async fn wait_for_state(client: &Client<StdioTransport>, state: DriverState) {
    tokio::time::timeout(WAIT, async {
        while client.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never became {state}, stuck at {}", client.state()));
}

fn open_document(dir: &Path, name: &str, text: &str, cursor: CursorPosition) -> Arc<FileDocument> {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    Arc::new(FileDocument::open(&path).unwrap().with_cursor(cursor))
}

#[tokio::test]
async fn test_toggle_connects_and_logs_status() {
    let mut h = harness(&["--log-events", "1"], false);
    let mut logs = h.client.logs();

    h.client.toggle();
    wait_for_state(&h.client, DriverState::Connected).await;

    let pid = h.client.id().unwrap();
    let transcript = h.client.transcript().to_vec();
    assert_eq!(transcript[0], format!("Starting OmniSharp server (pid: {pid})"));
    assert_eq!(
        transcript[1],
        format!("OmniSharp location: {}", env!("CARGO_BIN_EXE_mockomni"))
    );
    assert_eq!(
        transcript[3],
        format!("Project path: {}", h.project.path().display())
    );

    let mut seen = Vec::new();
    while seen.len() < 5 {
        let record = tokio::time::timeout(WAIT, logs.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(record);
    }
    assert_eq!(seen[0].message, transcript[0]);
    assert_eq!(seen[0].level, LogLevel::Information);
    assert!(seen.iter().any(|r| r.message == "mock log 1"));

    h.client.toggle();
    assert_eq!(h.client.state(), DriverState::Disconnected);
    assert_eq!(
        h.client.transcript().last().map(String::as_str),
        Some("OmniSharp server stopped")
    );

    h.client.dispose();
}

#[tokio::test]
async fn test_send_builds_request_from_focused_document() {
    let mut h = harness(&[], false);
    let document = open_document(
        h.project.path(),
        "Program.cs",
        "class Program\n{\n}",
        CursorPosition::new(1, 0),
    );
    h.environment.focus(Some(document.clone()));

    h.client.toggle();
    wait_for_state(&h.client, DriverState::Connected).await;

    let request = h.client.make_request(None, None).unwrap();
    let body = h
        .client
        .send("typelookup", request, RequestOptions::default())
        .await
        .unwrap()
        .unwrap();

    let arguments = &body["Arguments"];
    assert_eq!(arguments["Line"], 1);
    assert_eq!(arguments["Column"], 0);
    assert_eq!(arguments["FileName"], Value::from(document.uri()));
    assert_eq!(arguments["Buffer"], "class Program\n{\n}");

    h.client.dispose();
}

#[tokio::test]
async fn test_caller_data_wins_over_context() {
    let mut h = harness(&[], false);
    let document = open_document(
        h.project.path(),
        "Program.cs",
        "var x = 1;",
        CursorPosition::new(0, 4),
    );
    h.environment.focus(Some(document));

    h.client.toggle();
    wait_for_state(&h.client, DriverState::Connected).await;

    let request = h
        .client
        .make_data_request(&json!({ "Line": 9, "WantDocumentation": true }), None, None)
        .unwrap();
    let body = h
        .client
        .send("/typelookup", request, RequestOptions::default())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(body["Arguments"]["Line"], 9);
    assert_eq!(body["Arguments"]["Column"], 4);
    assert_eq!(body["Arguments"]["WantDocumentation"], true);

    h.client.dispose();
}

#[tokio::test]
async fn test_json_documents_send_null_buffer() {
    let mut h = harness(&[], false);
    let document = open_document(
        h.project.path(),
        "project.json",
        "{ \"version\": \"1.0.0\" }",
        CursorPosition::new(0, 0),
    );

    h.client.toggle();
    wait_for_state(&h.client, DriverState::Connected).await;

    let request = h.client.make_request(Some(document), None).unwrap();
    let body = h
        .client
        .send("/updatebuffer", request, RequestOptions::default())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(body["Arguments"]["Buffer"], Value::Null);
    assert!(body["Arguments"]["FileName"]
        .as_str()
        .unwrap()
        .ends_with("project.json"));

    h.client.dispose();
}

#[tokio::test]
async fn test_closed_document_is_not_sent() {
    let mut h = harness(&[], false);
    let document = open_document(
        h.project.path(),
        "Gone.cs",
        "",
        CursorPosition::new(0, 0),
    );
    document.close();

    h.client.toggle();
    wait_for_state(&h.client, DriverState::Connected).await;
    let mut responses = h.client.transport().responses();

    let request = h.client.make_request(Some(document), None).unwrap();
    assert!(request.is_aborted());
    let result = h
        .client
        .send("/codecheck", request, RequestOptions::default())
        .await;

    assert_eq!(result, Ok(None));
    assert!(responses.try_recv().is_err());

    h.client.dispose();
}

#[tokio::test]
async fn test_branch_change_restarts_server() {
    let mut h = harness(&[], true);

    h.client.toggle();
    wait_for_state(&h.client, DriverState::Connected).await;
    let first = h.client.id().unwrap();

    std::fs::write(h.project.path().join(".git").join("index"), "staged").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        h.commands.try_recv().is_err(),
        "index write on the same branch restarted the server"
    );

    std::fs::write(
        h.project.path().join(".git").join("HEAD"),
        "ref: refs/heads/feature\n",
    )
    .unwrap();

    let command = tokio::time::timeout(WAIT, h.commands.recv())
        .await
        .expect("no restart dispatched")
        .unwrap();
    assert_eq!(command, RESTART_COMMAND);

    h.client.restart();
    wait_for_state(&h.client, DriverState::Connected).await;
    assert_ne!(h.client.id().unwrap(), first);
    assert_eq!(h.client.project_path().as_deref(), Some(h.project.path()));

    h.client.dispose();
    assert_eq!(h.client.state(), DriverState::Disconnected);
}

#[tokio::test]
async fn test_failed_start_is_not_retried_by_connect() {
    let project = tempfile::tempdir().unwrap();
    let (environment, _commands) = HostEnvironment::new(vec![project.path().to_path_buf()]);
    let transport = StdioTransport::new(project.path().join("no-such-server"), vec![]);
    let mut client = Client::new(transport, ClientOptions::new(Arc::new(environment)));

    client.toggle();
    assert_eq!(client.state(), DriverState::Error);
    let attempts = client.transcript().len();

    client.connect(omnibridge::transport::ConnectOptions::default());
    assert_eq!(client.state(), DriverState::Error);
    assert_eq!(client.transcript().len(), attempts);

    client.dispose();
}
