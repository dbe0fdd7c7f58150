//! Environment-driven pipeline configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CHANNELS: [&str; 3] = ["chemed_et", "lobelia4cosmetics", "tikvahpharma"];
pub const MIN_TRIGGER_POLL: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelBackend {
    Web,
    Fixtures,
}

impl FromStr for ChannelBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" | "preview" => Ok(ChannelBackend::Web),
            "fixtures" | "fixture" => Ok(ChannelBackend::Fixtures),
            other => Err(format!("unknown backend {other}; expected web or fixtures")),
        }
    }
}

/// Pacing and bounds for one scrape run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapePacing {
    pub limit_per_channel: usize,
    pub days_back: i64,
    /// Pause after every N messages; 0 disables the pause.
    pub pause_every: usize,
    pub pause_duration: Duration,
    pub channel_pause: Duration,
    pub max_rate_limit_waits: usize,
}

impl Default for ScrapePacing {
    fn default() -> Self {
        Self {
            limit_per_channel: 200,
            days_back: 7,
            pause_every: 50,
            pause_duration: Duration::from_secs(1),
            channel_pause: Duration::from_secs(5),
            max_rate_limit_waits: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
    pub port: u16,
    pub url_override: Option<String>,
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        if let Some(url) = &self.url_override {
            return url.clone();
        }
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.user,
            self.password.as_deref().unwrap_or_default(),
            self.host,
            self.port,
            self.name
        )
    }

    /// Connection url with the password masked, for logs.
    pub fn redacted_url(&self) -> String {
        match &self.url_override {
            Some(url) => match (url.find("://"), url.rfind('@')) {
                (Some(scheme), Some(at)) if at > scheme => {
                    format!("{}://***@{}", &url[..scheme], &url[at + 1..])
                }
                _ => url.clone(),
            },
            None => format!(
                "postgresql://{}:***@{}:{}/{}",
                self.user, self.host, self.port, self.name
            ),
        }
    }
}

/// Platform API credentials. Reserved for a signed-in backend; the web
/// preview and fixture backends never read them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramCredentials {
    pub api_id: Option<String>,
    pub api_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub credentials: TelegramCredentials,
    pub channels: Vec<String>,
    pub backend: ChannelBackend,
    pub fixtures_dir: PathBuf,
    pub data_lake_path: PathBuf,
    pub reports_dir: PathBuf,
    pub state_dir: PathBuf,
    pub pacing: ScrapePacing,
    pub load_batch_size: usize,
    pub trigger_poll: Duration,
    pub http_timeout: Duration,
    pub http_user_agent: String,
    pub api_host: String,
    pub api_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRegistry {
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl ChannelRegistry {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.name.clone())
            .collect()
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            name: name.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn split_channels(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|c| c.trim().trim_start_matches('@').to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

impl PipelineConfig {
    /// Reads the process environment, after loading `.env` when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database = DatabaseConfig {
            host: lookup("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string()),
            name: lookup("POSTGRES_DB").unwrap_or_else(|| "telegram_warehouse".to_string()),
            user: lookup("POSTGRES_USER").unwrap_or_else(|| "postgres".to_string()),
            password: lookup("POSTGRES_PASSWORD"),
            port: parse_or(&lookup, "POSTGRES_PORT", 5432u16)?,
            url_override: lookup("DATABASE_URL"),
        };

        let channels_file = lookup("CHANNELS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("channels.yaml"));
        let channels = match lookup("TELEGRAM_CHANNELS") {
            Some(raw) => split_channels(&raw),
            None if channels_file.is_file() => ChannelRegistry::load(&channels_file)
                .map_err(|e| ConfigError::Invalid {
                    name: "CHANNELS_FILE".into(),
                    value: channels_file.display().to_string(),
                    reason: format!("{e:#}"),
                })?
                .enabled_channels(),
            None => DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect(),
        };

        let backend: ChannelBackend = match lookup("TELEGRAM_BACKEND") {
            Some(raw) => raw.parse::<ChannelBackend>().map_err(|reason| ConfigError::Invalid {
                name: "TELEGRAM_BACKEND".into(),
                value: raw.clone(),
                reason,
            })?,
            None => ChannelBackend::Web,
        };

        let defaults = ScrapePacing::default();
        let pacing = ScrapePacing {
            limit_per_channel: parse_or(&lookup, "SCRAPE_LIMIT_PER_CHANNEL", defaults.limit_per_channel)?,
            days_back: parse_or(&lookup, "SCRAPE_DAYS_BACK", defaults.days_back)?,
            pause_every: parse_or(&lookup, "SCRAPE_PAUSE_EVERY", defaults.pause_every)?,
            pause_duration: Duration::from_millis(parse_or(&lookup, "SCRAPE_PAUSE_MS", 1000u64)?),
            channel_pause: Duration::from_millis(parse_or(&lookup, "SCRAPE_CHANNEL_PAUSE_MS", 5000u64)?),
            max_rate_limit_waits: parse_or(
                &lookup,
                "SCRAPE_MAX_RATE_LIMIT_WAITS",
                defaults.max_rate_limit_waits,
            )?,
        };

        let load_batch_size = parse_or(&lookup, "LOAD_BATCH_SIZE", 1000usize)?;
        if load_batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "LOAD_BATCH_SIZE".into(),
                value: "0".into(),
                reason: "batch size must be positive".into(),
            });
        }

        let trigger_poll =
            Duration::from_secs(parse_or(&lookup, "TRIGGER_POLL_SECS", 60u64)?).max(MIN_TRIGGER_POLL);

        Ok(Self {
            database,
            credentials: TelegramCredentials {
                api_id: lookup("TELEGRAM_API_ID"),
                api_hash: lookup("TELEGRAM_API_HASH"),
            },
            channels,
            backend,
            fixtures_dir: lookup("TELEGRAM_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures/channels")),
            data_lake_path: lookup("DATA_LAKE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/raw")),
            reports_dir: lookup("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            state_dir: lookup("STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/state")),
            pacing,
            load_batch_size,
            trigger_poll,
            http_timeout: Duration::from_secs(parse_or(&lookup, "HTTP_TIMEOUT_SECS", 20u64)?),
            http_user_agent: lookup("HTTP_USER_AGENT")
                .unwrap_or_else(|| format!("tgwh-bot/{}", env!("CARGO_PKG_VERSION"))),
            api_host: lookup("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port: parse_or(&lookup, "API_PORT", 8000u16)?,
        })
    }

    /// Checks everything a run needs before any network or database work.
    pub fn validate(&self, scrape: bool, database: bool) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        // Credentials are optional; a half-set pair is reported.
        if scrape {
            match (&self.credentials.api_id, &self.credentials.api_hash) {
                (Some(_), None) => missing.push("TELEGRAM_API_HASH".to_string()),
                (None, Some(_)) => missing.push("TELEGRAM_API_ID".to_string()),
                _ => {}
            }
        }
        if database && self.database.password.is_none() && self.database.url_override.is_none() {
            missing.push("POSTGRES_PASSWORD".to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        if let Some(api_id) = self.credentials.api_id.as_deref().filter(|_| scrape) {
            if api_id.trim().parse::<i64>().is_err() {
                return Err(ConfigError::Invalid {
                    name: "TELEGRAM_API_ID".into(),
                    value: api_id.to_string(),
                    reason: "expected an integer".into(),
                });
            }
        }
        if scrape && self.channels.is_empty() {
            return Err(ConfigError::Invalid {
                name: "TELEGRAM_CHANNELS".into(),
                value: String::new(),
                reason: "no channels configured".into(),
            });
        }
        Ok(())
    }

    pub fn validate_database(&self) -> Result<(), ConfigError> {
        self.validate(false, true)
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.data_lake_path.join(tgwh_core::MESSAGES_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_preserve_pacing_and_paths() {
        let config = PipelineConfig::from_lookup(lookup(&[("TELEGRAM_CHANNELS", "a")])).unwrap();
        assert_eq!(config.pacing, ScrapePacing::default());
        assert_eq!(config.pacing.pause_every, 50);
        assert_eq!(config.pacing.pause_duration, Duration::from_secs(1));
        assert_eq!(config.pacing.channel_pause, Duration::from_secs(5));
        assert_eq!(config.load_batch_size, 1000);
        assert_eq!(config.data_lake_path, PathBuf::from("./data/raw"));
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.api_port, 8000);
        assert_eq!(config.backend, ChannelBackend::Web);
    }

    #[test]
    fn scraping_runs_without_credentials() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("TELEGRAM_CHANNELS", "a"),
            ("TELEGRAM_BACKEND", "fixtures"),
        ]))
        .unwrap();
        assert_eq!(config.validate(true, false), Ok(()));
        assert_eq!(
            config.validate(true, true),
            Err(ConfigError::Missing(vec!["POSTGRES_PASSWORD".into()]))
        );
        assert!(config.validate(false, false).is_ok());
    }

    #[test]
    fn half_set_credentials_are_listed_with_other_missing_values() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("TELEGRAM_API_ID", "12345"),
            ("TELEGRAM_CHANNELS", "a"),
        ]))
        .unwrap();
        assert_eq!(
            config.validate(true, true),
            Err(ConfigError::Missing(vec![
                "TELEGRAM_API_HASH".into(),
                "POSTGRES_PASSWORD".into(),
            ]))
        );
    }

    #[test]
    fn database_url_override_satisfies_password_requirement() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://u:secret@db:5433/wh"),
            ("TELEGRAM_CHANNELS", "a"),
        ]))
        .unwrap();
        assert!(config.validate_database().is_ok());
        assert_eq!(config.database.url(), "postgres://u:secret@db:5433/wh");
        assert_eq!(config.database.redacted_url(), "postgres://***@db:5433/wh");
    }

    #[test]
    fn composed_url_uses_postgres_settings() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("POSTGRES_PASSWORD", "pw"),
            ("POSTGRES_HOST", "warehouse"),
            ("POSTGRES_PORT", "6543"),
        ]))
        .unwrap();
        assert_eq!(
            config.database.url(),
            "postgresql://postgres:pw@warehouse:6543/telegram_warehouse"
        );
        assert!(!config.database.redacted_url().contains("pw@"));
    }

    #[test]
    fn channels_are_split_and_trimmed() {
        let config = PipelineConfig::from_lookup(lookup(&[(
            "TELEGRAM_CHANNELS",
            " @chemed_et, tikvahpharma ,,",
        )]))
        .unwrap();
        assert_eq!(config.channels, vec!["chemed_et", "tikvahpharma"]);
    }

    #[test]
    fn registry_file_supplies_enabled_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.yaml");
        std::fs::write(
            &path,
            "channels:\n  - name: chemed_et\n  - name: old_channel\n    enabled: false\n",
        )
        .unwrap();
        let config = PipelineConfig::from_lookup(lookup(&[(
            "CHANNELS_FILE",
            path.to_str().unwrap(),
        )]))
        .unwrap();
        assert_eq!(config.channels, vec!["chemed_et"]);
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let err = PipelineConfig::from_lookup(lookup(&[("SCRAPE_PAUSE_EVERY", "often")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref name, .. } if name == "SCRAPE_PAUSE_EVERY"));
    }

    #[test]
    fn trigger_poll_is_clamped_to_one_minute() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("TRIGGER_POLL_SECS", "5"),
            ("TELEGRAM_CHANNELS", "a"),
        ]))
        .unwrap();
        assert_eq!(config.trigger_poll, MIN_TRIGGER_POLL);
    }

    #[test]
    fn non_numeric_api_id_is_rejected() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("TELEGRAM_API_ID", "abc"),
            ("TELEGRAM_API_HASH", "hash"),
            ("TELEGRAM_CHANNELS", "a"),
        ]))
        .unwrap();
        assert!(matches!(
            config.validate(true, false),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
