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

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides the server executable.
pub const SERVER_ENV: &str = "OMNISHARP";

/// Prefix of environment variables read into the configuration.
const ENV_PREFIX: &str = "OMNIBRIDGE";

/// Runtime configuration.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    /// How to launch the analysis server
    #[serde(default)]
    pub server: ServerConfig,

    /// Trace every request/response exchange (default: false)
    #[serde(default)]
    pub developer_mode: bool,

    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Restart the server when the git branch changes (default: true)
    #[serde(default = "default_true")]
    pub restart_on_branch_change: bool,

    /// Capacity of the event, response and error channels (default: 256)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Analysis server launch settings.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// The command to execute (e.g., "omnisharp")
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments appended after the project selection
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            developer_mode: false,
            request_timeout: default_request_timeout(),
            restart_on_branch_change: true,
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_command() -> String {
    "omnisharp".to_string()
}

fn default_args() -> Vec<String> {
    vec!["--stdio".to_string()]
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_true() -> bool {
    true
}

const fn default_event_capacity() -> usize {
    crate::transport::DEFAULT_EVENT_CAPACITY
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source cannot be read or parsed.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        // 2. User config directory (~/.config/omnibridge/config.toml)
        let user_file = dirs::config_dir()
            .map(|dir| dir.join("omnibridge").join("config.toml"))
            .filter(|path| path.exists());

        let mut config = Self::build(user_file, explicit_file, Some(Self::environment()))?;

        // 5. OMNISHARP points at a specific server build
        if let Ok(command) = std::env::var(SERVER_ENV)
            && !command.trim().is_empty()
        {
            config.server.command = command;
        }

        Ok(config)
    }

    /// `OMNIBRIDGE_REQUEST_TIMEOUT` sets `request_timeout`; nested keys use a
    /// double underscore (`OMNIBRIDGE_SERVER__COMMAND`).
    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn build(
        user_file: Option<PathBuf>,
        explicit_file: Option<PathBuf>,
        environment: Option<config::Environment>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();

        // 1. Start with defaults
        builder = builder
            .set_default("server.command", default_command())?
            .set_default("server.args", default_args())?
            .set_default("developer_mode", false)?
            .set_default("request_timeout", default_request_timeout())?
            .set_default("restart_on_branch_change", true)?
            .set_default("event_capacity", 256)?;

        if let Some(path) = user_file {
            builder = builder.add_source(config::File::from(path));
        }

        // 3. Load from explicit file if provided
        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // 4. Environment variables (OMNIBRIDGE_REQUEST_TIMEOUT,
        //    OMNIBRIDGE_SERVER__COMMAND, ...)
        if let Some(environment) = environment {
            builder = builder.add_source(environment);
        }

        let config = builder
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
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

    fn toml_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::build(None, None, None).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.command, "omnisharp");
        assert_eq!(config.server.args, vec!["--stdio"]);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_explicit_file_overrides_user_file() {
        let user = toml_file("request_timeout = 10\ndeveloper_mode = true\n");
        let explicit = toml_file(
            "request_timeout = 5\n\n[server]\ncommand = \"/opt/omnisharp/run\"\nargs = [\"--stdio\", \"--verbose\"]\n",
        );

        let config = Config::build(
            Some(user.path().to_path_buf()),
            Some(explicit.path().to_path_buf()),
            None,
        )
        .unwrap();

        assert_eq!(config.request_timeout, 5);
        assert!(config.developer_mode);
        assert_eq!(config.server.command, "/opt/omnisharp/run");
        assert_eq!(config.server.args, vec!["--stdio", "--verbose"]);
        assert!(config.restart_on_branch_change);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let broken = toml_file("request_timeout = \"soon\"\n");
        assert!(Config::build(None, Some(broken.path().to_path_buf()), None).is_err());
    }

    fn environment(vars: &[(&str, &str)]) -> config::Environment {
        let source = vars
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        Config::environment().source(Some(source))
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = toml_file("request_timeout = 120
");
        let config = Config::build(
            None,
            Some(file.path().to_path_buf()),
            Some(environment(&[
                ("OMNIBRIDGE_REQUEST_TIMEOUT", "7"),
                ("OMNIBRIDGE_DEVELOPER_MODE", "true"),
                ("OMNIBRIDGE_SERVER__COMMAND", "/opt/omnisharp/run"),
            ])),
        )
        .unwrap();

        assert_eq!(config.request_timeout(), Duration::from_secs(7));
        assert!(config.developer_mode);
        assert_eq!(config.server.command, "/opt/omnisharp/run");
    }

    #[test]
    fn test_environment_ignores_other_prefixes() {
        let config = Config::build(
            None,
            None,
            Some(environment(&[
                ("OMNIBRIDGEX_REQUEST_TIMEOUT", "7"),
                ("OTHER_REQUEST_TIMEOUT", "8"),
            ])),
        )
        .unwrap();

        assert_eq!(config.request_timeout, 30);
    }
}
