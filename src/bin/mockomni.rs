// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A configurable mock analysis server for testing.
//!
//! Speaks the line-delimited JSON packet protocol over stdin/stdout. CLI
//! flags control startup, timing, and failure modes. No tokio.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mock analysis server for integration testing.
#[derive(Parser, Debug)]
#[command(name = "mockomni")]
struct Args {
    /// Project the server was asked to load.
    #[arg(short = 's', long = "source")]
    project: Option<PathBuf>,

    /// Accepted for command-line compatibility; stdio is the only mode.
    #[arg(long)]
    #[allow(dead_code, reason = "Accepted so real server command lines parse")]
    stdio: bool,

    /// Never announce readiness.
    #[arg(long)]
    no_started: bool,

    /// Wait before announcing readiness (milliseconds).
    #[arg(long, default_value_t = 0)]
    started_delay: u64,

    /// Emit this many log events before announcing readiness.
    #[arg(long, default_value_t = 0)]
    log_events: u64,

    /// Write this line to stdout verbatim at startup (repeatable).
    #[arg(long)]
    raw: Vec<String>,

    /// Write this line to stderr at startup (repeatable).
    #[arg(long)]
    stderr: Vec<String>,

    /// Sleep before every response (milliseconds).
    #[arg(long, default_value_t = 0)]
    response_delay: u64,

    /// Never respond to this command (repeatable).
    #[arg(long)]
    hang_on: Vec<String>,

    /// Answer this command with `Success: false` (repeatable).
    #[arg(long)]
    fail_on: Vec<String>,

    /// Exit with status 3 after n responses (simulate crash).
    #[arg(long)]
    exit_after: Option<u64>,
}

/// A request packet from the client.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Request {
    seq: i64,
    command: String,
    #[serde(default)]
    arguments: Value,
}

/// A response packet to the client.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Response {
    #[serde(rename = "Type")]
    kind: &'static str,
    seq: i64,
    #[serde(rename = "Request_seq")]
    request_seq: i64,
    command: String,
    running: bool,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    body: Value,
}

/// Why the read loop stopped.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    /// Stdin closed.
    EndOfInput,
    /// `/stopserver` was requested.
    Stopped,
    /// The configured response budget ran out.
    Crashed,
}

struct MockServer<W: Write> {
    args: Args,
    writer: W,
    next_seq: i64,
    response_count: u64,
}

impl<W: Write> MockServer<W> {
    const fn new(args: Args, writer: W) -> Self {
        Self {
            args,
            writer,
            next_seq: 1,
            response_count: 0,
        }
    }

    fn seq(&mut self) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn send(&mut self, value: &impl Serialize) {
        let Ok(line) = serde_json::to_string(value) else {
            return;
        };
        let _ = writeln!(self.writer, "{line}");
        let _ = self.writer.flush();
    }

    fn send_event(&mut self, name: &str, body: Value) {
        let seq = self.seq();
        self.send(&serde_json::json!({
            "Type": "event",
            "Event": name,
            "Seq": seq,
            "Body": body,
        }));
    }

    /// Startup chatter, then the readiness event.
    fn start(&mut self) {
        for line in self.args.raw.clone() {
            let _ = writeln!(self.writer, "{line}");
        }
        for i in 1..=self.args.log_events {
            self.send_event(
                "log",
                serde_json::json!({
                    "LogLevel": if i % 2 == 0 { "DEBUG" } else { "INFORMATION" },
                    "Name": "mockomni",
                    "Message": format!("mock log {i}"),
                }),
            );
        }
        if self.args.started_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.args.started_delay));
        }
        if !self.args.no_started {
            self.send_event("started", Value::Null);
        }
        let _ = self.writer.flush();
    }

    /// Run the server, reading packets from `reader` until it closes.
    fn run(&mut self, reader: &mut dyn BufRead) -> Exit {
        self.start();

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => return Exit::EndOfInput,
                Ok(_) => {}
            }
            let Ok(request) = serde_json::from_str::<Request>(line.trim()) else {
                continue;
            };
            if let Some(exit) = self.handle_request(request) {
                return exit;
            }
        }
    }

    fn handle_request(&mut self, request: Request) -> Option<Exit> {
        let command = request.command.trim_start_matches('/').to_string();

        if self.args.hang_on.iter().any(|c| c.trim_start_matches('/') == command) {
            return None;
        }

        if self.args.response_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.args.response_delay));
        }

        let failing = self.args.fail_on.iter().any(|c| c.trim_start_matches('/') == command);
        let body = match command.as_str() {
            "checkalivestatus" => Value::Bool(true),
            _ if failing => Value::Null,
            _ => serde_json::json!({
                "Command": request.command,
                "Arguments": request.arguments,
                "Project": self.args.project.as_ref().map(|p| p.display().to_string()),
            }),
        };
        let response = Response {
            kind: "response",
            seq: self.seq(),
            request_seq: request.seq,
            command: request.command,
            running: true,
            success: !failing,
            message: failing.then(|| format!("mockomni: configured to fail on {command}")),
            body,
        };
        self.send(&response);
        self.response_count += 1;

        if command == "stopserver" {
            return Some(Exit::Stopped);
        }
        if self
            .args
            .exit_after
            .is_some_and(|limit| self.response_count >= limit)
        {
            return Some(Exit::Crashed);
        }
        None
    }
}

fn main() {
    let args = Args::parse();
    {
        let mut stderr = std::io::stderr().lock();
        for line in &args.stderr {
            let _ = writeln!(stderr, "{line}");
        }
    }

    let stdout = std::io::stdout().lock();
    let mut server = MockServer::new(args, stdout);
    let mut stdin = std::io::stdin().lock();
    if server.run(&mut stdin) == Exit::Crashed {
        std::process::exit(3);
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["mockomni", "-s", "/work/App", "--stdio"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    fn request(seq: i64, command: &str, arguments: &Value) -> String {
        let packet = serde_json::json!({
            "Type": "request",
            "Seq": seq,
            "Command": command,
            "Arguments": arguments,
        });
        format!("{packet}\n")
    }

    fn run_server_with(args: Args, input: &str) -> (Exit, Vec<Value>) {
        let mut output = Vec::new();
        let exit = {
            let mut server = MockServer::new(args, &mut output);
            server.run(&mut Cursor::new(input.as_bytes().to_vec()))
        };
        let packets = String::from_utf8(output)
            .unwrap()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        (exit, packets)
    }

    #[test]
    fn test_started_then_echo() {
        let input = request(1, "/typelookup", &serde_json::json!({ "Line": 3 }));
        let (exit, packets) = run_server_with(args(&[]), &input);

        assert_eq!(exit, Exit::EndOfInput);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0]["Event"], "started");

        let response = &packets[1];
        assert_eq!(response["Type"], "response");
        assert_eq!(response["Request_seq"], 1);
        assert_eq!(response["Success"], true);
        assert_eq!(response["Body"]["Command"], "/typelookup");
        assert_eq!(response["Body"]["Arguments"]["Line"], 3);
        assert_eq!(response["Body"]["Project"], "/work/App");
    }

    #[test]
    fn test_log_events_precede_started() {
        let (_, packets) = run_server_with(args(&["--log-events", "2"]), "");

        let names: Vec<&str> = packets
            .iter()
            .map(|p| p["Event"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["log", "log", "started"]);
        assert_eq!(packets[0]["Body"]["Message"], "mock log 1");
        assert_eq!(packets[1]["Body"]["LogLevel"], "DEBUG");
    }

    #[test]
    fn test_no_started() {
        let (_, packets) = run_server_with(args(&["--no-started"]), "");
        assert!(packets.is_empty());
    }

    #[test]
    fn test_fail_on() {
        let mut input = request(1, "/codecheck", &Value::Null);
        input.push_str(&request(2, "/typelookup", &Value::Null));
        let (_, packets) = run_server_with(args(&["--fail-on", "codecheck"]), &input);

        assert_eq!(packets[1]["Success"], false);
        assert_eq!(
            packets[1]["Message"],
            "mockomni: configured to fail on codecheck"
        );
        assert_eq!(packets[2]["Success"], true);
    }

    #[test]
    fn test_hang_on_skips_response() {
        let mut input = request(1, "/findusages", &Value::Null);
        input.push_str(&request(2, "/checkalivestatus", &Value::Null));
        let (_, packets) = run_server_with(args(&["--hang-on", "/findusages"]), &input);

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1]["Request_seq"], 2);
        assert_eq!(packets[1]["Body"], true);
    }

    #[test]
    fn test_exit_after() {
        let mut input = request(1, "/a", &Value::Null);
        input.push_str(&request(2, "/b", &Value::Null));
        let (exit, packets) = run_server_with(args(&["--exit-after", "1"]), &input);

        assert_eq!(exit, Exit::Crashed);
        assert_eq!(packets.len(), 2);
    }

    #[test]
    fn test_stopserver() {
        let mut input = request(1, "/stopserver", &Value::Null);
        input.push_str(&request(2, "/b", &Value::Null));
        let (exit, packets) = run_server_with(args(&[]), &input);

        assert_eq!(exit, Exit::Stopped);
        assert_eq!(packets.len(), 2);
    }

    #[test]
    fn test_garbage_lines_ignored() {
        let input = format!("not json\n{}", request(7, "/x", &Value::Null));
        let (_, packets) = run_server_with(args(&[]), &input);
        assert_eq!(packets[1]["Request_seq"], 7);
    }
}
