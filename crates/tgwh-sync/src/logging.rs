//! Tracing subscriber setup shared by the CLI and the API server.

use std::str::FromStr;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default directive when `RUST_LOG` is unset, e.g. `info` or `tgwh_sync=debug`.
    pub level: String,
    pub format: LogFormat,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            include_targets: true,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.level = level.to_lowercase();
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.format = format.parse()?;
        }
        Ok(config)
    }

    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

/// Installs the global subscriber. Calling it twice is an error.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.include_targets);

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(config.filter())
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(config.filter())
                .with(fmt_layer.json())
                .try_init()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
