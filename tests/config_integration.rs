// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for configuration loading and merging.
//!
//! Verifies that omnibridge loads settings from files, environment
//! variables, and CLI arguments in the correct priority order.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new(config: &str) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("config.toml"), config)?;
        std::fs::write(dir.path().join("Program.cs"), "class Program {}")?;
        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn request(&self, configure: impl FnOnce(&mut Command)) -> Result<Output> {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_omnibridge"));
        cmd.arg("--config").arg(self.path().join("config.toml"));
        cmd.arg("--root").arg(self.path());
        cmd.args(["request", "codecheck", "--wait", "5"]);
        cmd.arg("--file").arg(self.path().join("Program.cs"));
        // Isolate from user-level config
        cmd.env("XDG_CONFIG_HOME", self.path());
        cmd.env_remove("OMNISHARP");
        cmd.env_remove("OMNIBRIDGE_REQUEST_TIMEOUT");
        configure(&mut cmd);
        cmd.output().context("Failed to run omnibridge")
    }
}

fn mock_config(args: &str, extra: &str) -> String {
    format!(
        "{extra}\n[server]\ncommand = {:?}\nargs = [{args}]\n",
        env!("CARGO_BIN_EXE_mockomni")
    )
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_server_from_config_file() -> Result<()> {
    let workspace = Workspace::new(&mock_config("\"--stdio\"", ""))?;

    let output = workspace.request(|_| {})?;

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let body: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(body["Command"], "/codecheck");
    assert_eq!(body["Project"], workspace.path().display().to_string());
    Ok(())
}

#[test]
fn test_omnisharp_variable_overrides_file() -> Result<()> {
    let workspace = Workspace::new(&mock_config("\"--stdio\"", ""))?;
    let missing = workspace.path().join("not-a-server");

    let output = workspace.request(|cmd| {
        cmd.env("OMNISHARP", &missing);
    })?;

    assert!(!output.status.success());
    assert!(
        stderr(&output).contains("failed to start"),
        "stderr: {}",
        stderr(&output)
    );
    Ok(())
}

#[test]
fn test_cli_server_overrides_variable() -> Result<()> {
    let workspace = Workspace::new("")?;

    let output = workspace.request(|cmd| {
        cmd.env("OMNISHARP", "/nonexistent/omnisharp");
        cmd.arg("--server")
            .arg(format!("{} --stdio", env!("CARGO_BIN_EXE_mockomni")));
    })?;

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    Ok(())
}

#[test]
fn test_environment_overrides_file_timeout() -> Result<()> {
    let workspace = Workspace::new(&mock_config(
        "\"--stdio\", \"--hang-on\", \"codecheck\"",
        "request_timeout = 120",
    ))?;

    let output = workspace.request(|cmd| {
        cmd.env("OMNIBRIDGE_REQUEST_TIMEOUT", "1");
    })?;

    assert!(!output.status.success());
    assert!(
        stderr(&output).contains("timed out after 1s"),
        "stderr: {}",
        stderr(&output)
    );
    Ok(())
}

#[test]
fn test_cli_timeout_overrides_environment() -> Result<()> {
    let workspace = Workspace::new(&mock_config(
        "\"--stdio\", \"--response-delay\", \"1500\"",
        "",
    ))?;

    let output = workspace.request(|cmd| {
        cmd.env("OMNIBRIDGE_REQUEST_TIMEOUT", "1");
        cmd.arg("--timeout").arg("10");
    })?;

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    Ok(())
}
