// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Tests use unwrap/expect/panic for clear failure messages"
)]
//! Integration tests for the stdio transport against the mock server.

use std::time::Duration;

use omnibridge::transport::{
    ConnectOptions, DriverState, RequestOptions, ServerEvent, StdioTransport, Transport,
    TransportError,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

fn mock(args: &[&str]) -> StdioTransport {
    let mut argv = vec!["--stdio".to_string()];
    argv.extend(args.iter().map(|a| (*a).to_string()));
    StdioTransport::new(env!("CARGO_BIN_EXE_mockomni"), argv)
}

async fn wait_for_state(transport: &StdioTransport, state: DriverState) {
    tokio::time::timeout(WAIT, async {
        while transport.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never became {state}, stuck at {}", transport.state()));
}

async fn next_event(events: &mut broadcast::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

async fn connected(args: &[&str]) -> (StdioTransport, TempDir) {
    let project = tempfile::tempdir().unwrap();
    let transport = mock(args);
    transport.connect(ConnectOptions::for_project(project.path()));
    wait_for_state(&transport, DriverState::Connected).await;
    (transport, project)
}

#[tokio::test]
async fn test_connect_reaches_connected_on_started() {
    let project = tempfile::tempdir().unwrap();
    let transport = mock(&["--started-delay", "100"]);
    let mut events = transport.events();

    transport.connect(ConnectOptions::for_project(project.path()));
    assert_eq!(transport.state(), DriverState::Connecting);
    assert!(transport.id().is_some());
    assert_eq!(transport.project_path().as_deref(), Some(project.path()));

    let started = next_event(&mut events).await;
    assert_eq!(started.name.as_deref(), Some("started"));
    wait_for_state(&transport, DriverState::Connected).await;

    transport.dispose();
    assert_eq!(transport.state(), DriverState::Disconnected);
}

#[tokio::test]
async fn test_without_started_stays_connecting() {
    let project = tempfile::tempdir().unwrap();
    let transport = mock(&["--no-started"]);

    transport.connect(ConnectOptions::for_project(project.path()));
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(transport.state(), DriverState::Connecting);
    transport.dispose();
}

#[tokio::test]
async fn test_request_resolves_with_body_and_records_exchange() {
    let (transport, project) = connected(&[]).await;
    let mut responses = transport.responses();

    let body = transport
        .request(
            "typelookup",
            json!({ "Line": 4, "Column": 2 }),
            RequestOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(body["Command"], "/typelookup");
    assert_eq!(body["Arguments"], json!({ "Line": 4, "Column": 2 }));
    assert_eq!(body["Project"], project.path().display().to_string());

    let record = tokio::time::timeout(WAIT, responses.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.command, "/typelookup");
    assert_eq!(record.request, json!({ "Line": 4, "Column": 2 }));
    assert_eq!(record.response, body);

    transport.dispose();
}

#[tokio::test]
async fn test_concurrent_requests_matched_by_sequence() {
    let (transport, _project) = connected(&["--response-delay", "20"]).await;

    let (a, b) = tokio::join!(
        transport.request("/a", json!({ "n": 1 }), RequestOptions::default()),
        transport.request("/b", json!({ "n": 2 }), RequestOptions::default()),
    );

    assert_eq!(a.unwrap()["Arguments"]["n"], 1);
    assert_eq!(b.unwrap()["Arguments"]["n"], 2);
    transport.dispose();
}

#[tokio::test]
async fn test_failed_request_reaches_caller_and_error_stream() {
    let (transport, _project) = connected(&["--fail-on", "codecheck"]).await;
    let mut errors = transport.errors();

    let result = transport
        .request("/codecheck", json!({}), RequestOptions::default())
        .await;

    let expected = TransportError::Server {
        command: "/codecheck".to_string(),
        message: "mockomni: configured to fail on codecheck".to_string(),
    };
    assert_eq!(result, Err(expected.clone()));
    assert_eq!(
        tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap(),
        expected
    );
    assert_eq!(transport.state(), DriverState::Connected);

    transport.dispose();
}

#[tokio::test]
async fn test_log_events_arrive_in_order() {
    let project = tempfile::tempdir().unwrap();
    let transport = mock(&["--log-events", "3", "--raw", "MSBuild banner"]);
    let mut events = transport.events();

    transport.connect(ConnectOptions::for_project(project.path()));

    let banner = next_event(&mut events).await;
    assert_eq!(banner.body_str("Message"), Some("MSBuild banner"));
    assert_eq!(banner.body_str("LogLevel"), Some("INFORMATION"));

    for i in 1..=3 {
        let event = next_event(&mut events).await;
        assert_eq!(event.name.as_deref(), Some("log"));
        assert_eq!(event.body_str("Message"), Some(format!("mock log {i}").as_str()));
    }
    assert_eq!(next_event(&mut events).await.name.as_deref(), Some("started"));

    transport.dispose();
}

#[tokio::test]
async fn test_stderr_becomes_error_event() {
    let project = tempfile::tempdir().unwrap();
    let transport = mock(&["--no-started", "--stderr", "Unhandled exception"]);
    let mut events = transport.events();

    transport.connect(ConnectOptions::for_project(project.path()));

    let event = next_event(&mut events).await;
    assert!(event.is_error());
    assert_eq!(event.body_str("Message"), Some("Unhandled exception"));

    transport.dispose();
}

#[tokio::test]
async fn test_server_exit_moves_to_error() {
    let (transport, _project) = connected(&["--exit-after", "1"]).await;
    let mut errors = transport.errors();

    transport
        .request("/a", json!({}), RequestOptions::default())
        .await
        .unwrap();
    wait_for_state(&transport, DriverState::Error).await;

    let error = tokio::time::timeout(WAIT, errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(error, TransportError::Exited(Some(3)));
    assert_eq!(transport.id(), None);

    let after = transport
        .request("/b", json!({}), RequestOptions::default())
        .await;
    assert_eq!(after, Err(TransportError::NotConnected));

    transport.dispose();
}

#[tokio::test]
async fn test_request_times_out() {
    let (transport, _project) = connected(&["--hang-on", "findusages"]).await;

    let result = transport
        .request(
            "findusages",
            json!({}),
            RequestOptions {
                timeout: Some(Duration::from_millis(200)),
            },
        )
        .await;

    assert!(matches!(
        result,
        Err(TransportError::Timeout { ref command, .. }) if command == "/findusages"
    ));
    assert_eq!(transport.state(), DriverState::Connected);

    transport.dispose();
}

#[tokio::test]
async fn test_disconnect_fails_outstanding_requests() {
    let (transport, _project) = connected(&["--hang-on", "findusages"]).await;

    let (result, ()) = tokio::join!(
        transport.request("findusages", json!({}), RequestOptions::default()),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            transport.disconnect();
        },
    );

    assert!(matches!(result, Err(TransportError::Closed(_))));
    assert_eq!(transport.state(), DriverState::Disconnected);
    assert_eq!(
        transport
            .request("/a", json!({}), RequestOptions::default())
            .await,
        Err(TransportError::NotConnected)
    );

    transport.dispose();
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let (transport, project) = connected(&[]).await;
    let first = transport.id();

    transport.disconnect();
    transport.connect(ConnectOptions::for_project(project.path()));
    wait_for_state(&transport, DriverState::Connected).await;

    assert!(transport.id().is_some());
    assert_ne!(transport.id(), first);
    let body = transport
        .request("/checkalivestatus", json!({}), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(body, json!(true));

    transport.dispose();
}
