// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Omnibridge CLI.
//!
//! Runs an analysis server for the current workspace and streams its log,
//! sends one-off requests built from a file, or lists the projects it would
//! load.

#![allow(clippy::print_stdout, reason = "CLI tool needs to output to stdout")]

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use clap::{Parser, Subcommand};
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use omnibridge::cli::{self, ColorConfig};
use omnibridge::client::events::DeveloperMode;
use omnibridge::client::{Client, ClientOptions, LogRecord, RESTART_COMMAND};
use omnibridge::config::Config;
use omnibridge::disposable::SubscriptionSet;
use omnibridge::editor::{self, CursorPosition, Document, FileDocument, HostEnvironment};
use omnibridge::git::{self, GitRepository};
use omnibridge::project;
use omnibridge::transport::{DriverState, RequestOptions, StdioTransport, Transport};

/// How often `request` checks whether the server is ready.
const READY_POLL: Duration = Duration::from_millis(50);

/// Command-line arguments for Omnibridge.
#[derive(Parser, Debug)]
#[command(name = "omnibridge")]
#[command(about = "Editor-side client for OmniSharp-style code-analysis servers")]
#[command(version = env!("OMNIBRIDGE_VERSION"))]
struct Args {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project roots. Can be specified multiple times; the first one is
    /// loaded. Defaults to the projects found under the current directory.
    #[arg(short, long, global = true)]
    root: Vec<PathBuf>,

    /// Server command line (e.g., "/opt/omnisharp/run --stdio").
    /// Overrides the config file and the OMNISHARP variable.
    #[arg(long, global = true)]
    server: Option<String>,

    /// Trace every request and response.
    #[arg(long, global = true)]
    developer_mode: bool,

    /// Request timeout in seconds. Overrides the config file.
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

/// Subcommands supported by Omnibridge.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server and stream its log until Ctrl+C.
    Run {
        /// Disable colored output.
        #[arg(long)]
        nocolor: bool,

        /// Only show log lines matching this regex.
        #[arg(long, short)]
        filter: Option<String>,

        /// Prefix each line with the local time.
        #[arg(long)]
        timestamps: bool,
    },

    /// Send one request built from a file and print the response.
    Request {
        /// Server action, e.g. "typelookup" or "/gotodefinition".
        action: String,

        /// File the request is about (path or file:// URI).
        #[arg(long)]
        file: String,

        /// Zero-based cursor line.
        #[arg(long, default_value_t = 0)]
        line: u32,

        /// Zero-based cursor column.
        #[arg(long, default_value_t = 0)]
        column: u32,

        /// Extra request fields as a JSON object. Fields set here win over
        /// the ones taken from the file.
        #[arg(long)]
        data: Option<String>,

        /// Seconds to wait for the server to become ready.
        #[arg(long, default_value_t = 60)]
        wait: u64,
    },

    /// List the project roots that would be loaded.
    Projects,
}

/// Entry point.
///
/// # Errors
///
/// Returns an error if the subcommand fails.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let directive = if config.developer_mode {
        "omnibridge=debug"
    } else {
        "omnibridge=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr)
        .init();

    match &args.command {
        Command::Run {
            nocolor,
            filter,
            timestamps,
        } => run_client(&args, &config, *nocolor, filter.as_deref(), *timestamps).await,
        Command::Request {
            action,
            file,
            line,
            column,
            data,
            wait,
        } => {
            let document = RequestDocument {
                file,
                cursor: CursorPosition::new(*line, *column),
                data: data.as_deref(),
            };
            run_request(&args, &config, action, &document, Duration::from_secs(*wait)).await
        }
        Command::Projects => run_projects(&args),
    }
}

/// Loads the configuration and applies command-line overrides.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.clone())?;

    if let Some(server) = &args.server {
        let (command, server_args) = parse_server_spec(server)?;
        config.server.command = command;
        if !server_args.is_empty() {
            config.server.args = server_args;
        }
    }
    if args.developer_mode {
        config.developer_mode = true;
    }
    if let Some(timeout) = args.timeout {
        config.request_timeout = timeout;
    }

    Ok(config)
}

/// Splits a server command line into program and arguments.
fn parse_server_spec(spec: &str) -> Result<(String, Vec<String>)> {
    let mut parts = spec.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| anyhow!("server command cannot be empty"))?
        .to_string();
    let args = parts.map(std::string::ToString::to_string).collect();
    Ok((program, args))
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("Failed to read current directory")
}

fn matches_filter(filter: Option<&Regex>, record: &LogRecord) -> bool {
    filter.is_none_or(|re| re.is_match(&format!("{} {}", record.level, record.message)))
}

/// Runs the log streaming command.
///
/// # Errors
///
/// Returns an error if the filter is invalid or the working directory cannot
/// be read.
async fn run_client(
    args: &Args,
    config: &Config,
    nocolor: bool,
    filter: Option<&str>,
    timestamps: bool,
) -> Result<()> {
    let colors = ColorConfig::new(nocolor);
    let filter_regex = filter
        .map(Regex::new)
        .transpose()
        .map_err(|e| anyhow!("Invalid filter regex: {e}"))?;

    let roots = project::project_roots(&args.root, &current_dir()?);
    let (environment, mut commands) = HostEnvironment::new(roots.clone());
    let environment = Arc::new(environment);

    let mut tasks = SubscriptionSet::new();
    let mut options = ClientOptions::new(environment)
        .with_developer_mode(DeveloperMode::new(config.developer_mode));
    if config.restart_on_branch_change
        && let Some(repository) = roots.first().and_then(|root| GitRepository::discover(root))
    {
        let repository = Arc::new(repository);
        match repository.watch() {
            Ok(watch) => tasks.add(watch),
            Err(e) => warn!("Branch changes will not restart the server: {}", e),
        }
        options = options.with_repository(repository);
    }

    let mut client = Client::new(StdioTransport::from_config(config), options);
    let mut logs = client.logs();

    println!(
        "Starting {} for {} (Ctrl+C to stop)\n",
        colors.cyan(&client.server_path().display().to_string()),
        colors.cyan(
            &roots
                .first()
                .map_or_else(|| "-".to_string(), |r| r.display().to_string())
        ),
    );
    client.toggle();

    loop {
        tokio::select! {
            record = logs.recv() => {
                let Some(record) = record else {
                    println!("\nServer stream closed");
                    break;
                };
                if matches_filter(filter_regex.as_ref(), &record) {
                    let time = timestamps.then(Local::now);
                    println!("{}", cli::format_record(&record, &colors, time));
                }
            }
            Some(command) = commands.recv() => {
                if command == RESTART_COMMAND {
                    info!("Restarting analysis server");
                    client.restart();
                } else {
                    debug!("Ignoring editor command {}", command);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    tasks.dispose();
    client.dispose();
    Ok(())
}

/// The file a one-off request is built from.
struct RequestDocument<'a> {
    file: &'a str,
    cursor: CursorPosition,
    data: Option<&'a str>,
}

async fn wait_until_connected<T: Transport>(client: &Client<T>, limit: Duration) -> Result<()> {
    let deadline = Instant::now() + limit;
    loop {
        match client.state() {
            DriverState::Connected => return Ok(()),
            DriverState::Connecting => {}
            DriverState::Error => return Err(anyhow!("Analysis server failed to start")),
            DriverState::Disconnected => return Err(anyhow!("Analysis server is not running")),
        }
        if Instant::now() >= deadline {
            return Err(anyhow!(
                "Timed out after {limit:?} waiting for the analysis server"
            ));
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

/// Runs the one-off request command.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the server does not become
/// ready, or the request fails.
async fn run_request(
    args: &Args,
    config: &Config,
    action: &str,
    target: &RequestDocument<'_>,
    wait: Duration,
) -> Result<()> {
    let path = editor::document_path(target.file)?;
    let document: Arc<dyn Document> =
        Arc::new(FileDocument::open(&path)?.with_cursor(target.cursor));

    let search_from = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(current_dir, |p| Ok(p.to_path_buf()))?;
    let roots = project::project_roots(&args.root, &search_from);
    let (environment, _commands) = HostEnvironment::new(roots);
    environment.focus(Some(document));

    let options = ClientOptions::new(Arc::new(environment))
        .with_developer_mode(DeveloperMode::new(config.developer_mode));
    let mut client = Client::new(StdioTransport::from_config(config), options);

    client.toggle();
    wait_until_connected(&client, wait).await?;

    let request = match target.data {
        Some(data) => {
            let data: Value = serde_json::from_str(data).context("--data must be valid JSON")?;
            client.make_data_request(&data, None, None)?
        }
        None => client
            .make_request(None, None)
            .ok_or_else(|| anyhow!("No document to build a request from"))?,
    };

    let response = client.send(action, request, RequestOptions::default()).await;
    client.dispose();

    match response? {
        Some(body) => println!("{}", serde_json::to_string_pretty(&body)?),
        None => println!("Request not sent: document closed"),
    }
    Ok(())
}

/// Runs the project listing command.
///
/// # Errors
///
/// Returns an error if the working directory cannot be read.
fn run_projects(args: &Args) -> Result<()> {
    let roots = if args.root.is_empty() {
        vec![current_dir()?]
    } else {
        args.root.clone()
    };

    let projects: Vec<PathBuf> = roots
        .iter()
        .flat_map(|root| project::discover_projects(root))
        .collect();
    if projects.is_empty() {
        println!("No projects found");
        return Ok(());
    }

    let width = cli::terminal_width().saturating_sub(24).max(20);
    println!("{:>3} {:<width$} BRANCH", "#", "PROJECT");
    for (idx, project) in projects.iter().enumerate() {
        println!(
            "{:>3} {:<width$} {}",
            idx + 1,
            cli::truncate(&project.display().to_string(), width),
            branch_of(project)
        );
    }
    Ok(())
}

fn branch_of(path: &Path) -> String {
    git::find_git_dir(path)
        .and_then(|git_dir| git::read_branch(&git_dir))
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use omnibridge::client::LogLevel;

    #[test]
    fn test_parse_server_spec() -> Result<()> {
        let (program, args) = parse_server_spec("/opt/omnisharp/run --stdio -v")?;
        assert_eq!(program, "/opt/omnisharp/run");
        assert_eq!(args, vec!["--stdio", "-v"]);

        let (program, args) = parse_server_spec("omnisharp")?;
        assert_eq!(program, "omnisharp");
        assert!(args.is_empty());

        assert!(parse_server_spec("   ").is_err());
        Ok(())
    }

    #[test]
    fn test_filter_matches_level_and_message() {
        let record = LogRecord {
            message: "Project loaded".to_string(),
            level: LogLevel::Warning,
        };
        assert!(matches_filter(None, &record));
        assert!(matches_filter(Some(&Regex::new("^WARNING").unwrap()), &record));
        assert!(matches_filter(Some(&Regex::new("loaded$").unwrap()), &record));
        assert!(!matches_filter(Some(&Regex::new("ERROR").unwrap()), &record));
    }
}
