// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests use unwrap/expect for clear failure messages"
)]
//! Integration tests for the omnibridge command line.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use serde_json::Value;

fn omnibridge(config_home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_omnibridge"));
    // Isolate from user-level config and server overrides
    cmd.env("XDG_CONFIG_HOME", config_home);
    cmd.env_remove("OMNISHARP");
    cmd
}

fn mock_server(extra: &str) -> String {
    format!("{} --stdio {extra}", env!("CARGO_BIN_EXE_mockomni"))
}

#[test]
fn test_projects_lists_discovered_roots() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("Web")).unwrap();
    std::fs::write(dir.path().join("Web/Web.csproj"), "").unwrap();
    std::fs::create_dir_all(dir.path().join("Lib")).unwrap();
    std::fs::write(dir.path().join("Lib/Lib.csproj"), "").unwrap();

    let output = omnibridge(dir.path())
        .arg("projects")
        .arg("--root")
        .arg(dir.path())
        .output()
        .expect("Failed to run projects command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("PROJECT"), "missing header: {stdout}");

    let lib = stdout.find("Lib").expect("Lib not listed");
    let web = stdout.find("Web").expect("Web not listed");
    assert!(lib < web, "projects should be sorted: {stdout}");
}

#[test]
fn test_projects_empty() {
    let dir = tempfile::tempdir().unwrap();

    let output = omnibridge(dir.path())
        .arg("projects")
        .arg("--root")
        .arg(dir.path())
        .output()
        .expect("Failed to run projects command");

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No projects found"));
}

#[test]
fn test_request_prints_response_body() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("Program.cs");
    std::fs::write(&file, "class Program {}\n").unwrap();

    let output = omnibridge(dir.path())
        .args(["request", "typelookup", "--line", "0", "--column", "6"])
        .arg("--file")
        .arg(&file)
        .arg("--data")
        .arg(r#"{"IncludeDocumentation": true}"#)
        .arg("--server")
        .arg(mock_server(""))
        .arg("--root")
        .arg(dir.path())
        .output()
        .expect("Failed to run request command");

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let body: Value = serde_json::from_slice(&output.stdout).expect("stdout is not JSON");
    assert_eq!(body["Command"], "/typelookup");
    assert_eq!(body["Arguments"]["Column"], 6);
    assert_eq!(body["Arguments"]["IncludeDocumentation"], true);
    assert_eq!(body["Arguments"]["Buffer"], "class Program {}\n");
    assert_eq!(body["Project"], dir.path().display().to_string());
}

#[test]
fn test_request_fails_when_server_never_starts() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("Program.cs");
    std::fs::write(&file, "").unwrap();

    let output = omnibridge(dir.path())
        .args(["request", "codecheck", "--wait", "1"])
        .arg("--file")
        .arg(&file)
        .arg("--server")
        .arg(mock_server("--no-started"))
        .output()
        .expect("Failed to run request command");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Timed out"));
}

#[test]
fn test_request_rejects_non_object_data() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("Program.cs");
    std::fs::write(&file, "").unwrap();

    let output = omnibridge(dir.path())
        .args(["request", "codecheck", "--data", "[1, 2]"])
        .arg("--file")
        .arg(&file)
        .arg("--server")
        .arg(mock_server(""))
        .output()
        .expect("Failed to run request command");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("JSON object"));
}

#[test]
fn test_run_streams_server_log() {
    let dir = tempfile::tempdir().unwrap();

    let mut child = omnibridge(dir.path())
        .args(["run", "--nocolor", "--filter", "mock log|Starting OmniSharp"])
        .arg("--server")
        .arg(mock_server("--log-events 2"))
        .arg("--root")
        .arg(dir.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn run");

    let stdout = child.stdout.take().expect("Failed to get stdout");
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut lines = Vec::new();
    while let Ok(line) = rx.recv_timeout(Duration::from_secs(10)) {
        let done = line.contains("mock log 2");
        lines.push(line);
        if done {
            break;
        }
    }
    let _ = child.kill();
    let _ = child.wait();

    let logged: Vec<&String> = lines.iter().filter(|l| l.starts_with("INFORMATION")).collect();
    assert!(
        logged
            .first()
            .is_some_and(|l| l.contains("Starting OmniSharp server (pid: ")),
        "unexpected output: {lines:?}"
    );
    assert!(lines.iter().any(|l| l.contains("mock log 1")), "{lines:?}");
    assert!(
        lines.iter().any(|l| l.starts_with("DEBUG") && l.contains("mock log 2")),
        "{lines:?}"
    );
    assert!(
        !lines.iter().any(|l| l.contains("OmniSharp location")),
        "filter not applied: {lines:?}"
    );
}
