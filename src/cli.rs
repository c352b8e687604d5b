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

//! CLI utilities for terminal output formatting and colors.

use chrono::{DateTime, Local};
use crossterm::tty::IsTty;
use std::io::stdout;

use crate::client::{LogLevel, LogRecord};

/// Configuration for color output
#[derive(Debug, Clone)]
pub struct ColorConfig {
    /// Whether escape codes are emitted.
    pub enabled: bool,
}

impl ColorConfig {
    /// Create a new `ColorConfig`, auto-detecting TTY unless nocolor is true
    #[must_use]
    pub fn new(nocolor: bool) -> Self {
        Self {
            enabled: !nocolor && stdout().is_tty(),
        }
    }

    fn paint(&self, code: &str, s: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{s}\x1b[0m")
        } else {
            s.to_string()
        }
    }

    /// Green (informational)
    #[must_use]
    pub fn green(&self, s: &str) -> String {
        self.paint("32", s)
    }

    /// Yellow (warnings)
    #[must_use]
    pub fn yellow(&self, s: &str) -> String {
        self.paint("33", s)
    }

    /// Red (errors)
    #[must_use]
    pub fn red(&self, s: &str) -> String {
        self.paint("31", s)
    }

    /// Cyan (paths)
    #[must_use]
    pub fn cyan(&self, s: &str) -> String {
        self.paint("36", s)
    }

    /// Dim text
    #[must_use]
    pub fn dim(&self, s: &str) -> String {
        self.paint("2", s)
    }

    /// Colors `s` according to `level`.
    #[must_use]
    pub fn level(&self, level: &LogLevel, s: &str) -> String {
        match level.severity() {
            LogLevel::Trace | LogLevel::Debug => self.dim(s),
            LogLevel::Information => self.green(s),
            LogLevel::Warning => self.yellow(s),
            LogLevel::Error | LogLevel::Critical => self.red(s),
            LogLevel::Other(_) => s.to_string(),
        }
    }
}

/// Renders one log record as a terminal line: optional timestamp, padded
/// level, message.
#[must_use]
pub fn format_record(
    record: &LogRecord,
    colors: &ColorConfig,
    time: Option<DateTime<Local>>,
) -> String {
    let level = colors.level(&record.level, &format!("{:<11}", record.level.as_str()));
    match time {
        Some(time) => format!(
            "{} {} {}",
            colors.dim(&time.format("%H:%M:%S%.3f").to_string()),
            level,
            record.message
        ),
        None => format!("{} {}", level, record.message),
    }
}

/// Get the terminal width, defaulting to 80 if unable to detect
#[must_use]
pub fn terminal_width() -> usize {
    crossterm::terminal::size()
        .map(|(w, _)| usize::from(w))
        .unwrap_or(80)
}

/// Truncate a string to `max_len` characters, adding "..." if truncated
#[must_use]
pub fn truncate(s: &str, max_len: usize) -> String {
    if max_len <= 3 {
        return ".".repeat(max_len.min(3));
    }
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(message: &str, level: LogLevel) -> LogRecord {
        LogRecord {
            message: message.to_string(),
            level,
        }
    }

    #[test]
    fn test_truncate_short_string() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("test", 4), "test");
    }

    #[test]
    fn test_truncate_long_string() {
        assert_eq!(truncate("/src/App/App.csproj", 10), "/src/Ap...");
        assert_eq!(truncate("żółć-gęślą", 7), "żółć...");
    }

    #[test]
    fn test_truncate_edge_cases() {
        assert_eq!(truncate("hello", 3), "...");
        assert_eq!(truncate("hello", 0), "");
    }

    #[test]
    fn test_color_config_disabled() {
        let config = ColorConfig::new(true);
        assert!(!config.enabled);
        assert_eq!(config.green("test"), "test");
        assert_eq!(config.level(&LogLevel::Error, "test"), "test");
    }

    #[test]
    fn test_level_colors_when_enabled() {
        let config = ColorConfig { enabled: true };
        assert_eq!(config.level(&LogLevel::Warning, "w"), "\x1b[33mw\x1b[0m");
        assert_eq!(config.level(&LogLevel::Critical, "c"), "\x1b[31mc\x1b[0m");
        assert_eq!(config.level(&LogLevel::parse("warning"), "w"), "\x1b[33mw\x1b[0m");
        assert_eq!(config.level(&LogLevel::Other("X".into()), "x"), "x");
    }

    #[test]
    fn test_format_record() {
        let colors = ColorConfig { enabled: false };
        assert_eq!(
            format_record(&record("Project loaded", LogLevel::Information), &colors, None),
            "INFORMATION Project loaded"
        );

        let time = Local.with_ymd_and_hms(2026, 3, 1, 9, 5, 7).unwrap();
        assert_eq!(
            format_record(&record("slow", LogLevel::Warning), &colors, Some(time)),
            "09:05:07.000 WARNING     slow"
        );
    }
}
