//! Structured logging configuration.

use serde::Deserialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parses a format name, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when neither `CAPGRAPH_LOG` nor `RUST_LOG` is set.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Append log output to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Sets the output format.
    #[must_use]
    pub const fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the log file.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `CAPGRAPH_LOG_FORMAT` | `pretty` or `json` |
    /// | `CAPGRAPH_LOG_FILE` | Append-mode log file |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CAPGRAPH_LOG_FORMAT")
            && let Some(format) = LogFormat::parse(&v)
        {
            self.format = format;
        }
        if let Ok(v) = std::env::var("CAPGRAPH_LOG_FILE")
            && !v.trim().is_empty()
        {
            self.file = Some(PathBuf::from(v));
        }
        self
    }

    /// Builds the event filter: `CAPGRAPH_LOG`, then `RUST_LOG`, then `level`.
    #[must_use]
    pub fn filter(&self) -> EnvFilter {
        std::env::var("CAPGRAPH_LOG")
            .ok()
            .and_then(|v| EnvFilter::try_new(v).ok())
            .or_else(|| EnvFilter::try_from_default_env().ok())
            .or_else(|| EnvFilter::try_new(&self.level).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("json", Some(LogFormat::Json) ; "json")]
    #[test_case("PRETTY", Some(LogFormat::Pretty) ; "uppercase pretty")]
    #[test_case("text", Some(LogFormat::Pretty) ; "text alias")]
    #[test_case("xml", None ; "unknown")]
    fn test_log_format_parse(input: &str, expected: Option<LogFormat>) {
        assert_eq!(LogFormat::parse(input), expected);
    }

    #[test]
    fn test_default_is_pretty_info() {
        let config = LoggingConfig::default();
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.level, "info");
        assert!(config.file.is_none());
    }
}
