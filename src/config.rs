use crate::history::MAX_HISTORY_CAPACITY;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Daemon and client configuration, read from `~/.printf-relay/config.yaml`.
///
/// Every field has a default so a partial (or missing) file is valid.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Session lifetime in seconds. Default: 900
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// How long a finished upload stays visible to consumers. Default: 5000
    #[serde(default = "default_progress_linger_ms")]
    pub progress_linger_ms: u64,
    /// Entries kept in the local transfer history. Default: 50
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Largest file eligible for inline preview. Default: 50 MiB
    #[serde(default = "default_preview_max_bytes")]
    pub preview_max_bytes: u64,
    /// Validity of a download link. Default: 60
    #[serde(default = "default_download_link_ttl_secs")]
    pub download_link_ttl_secs: u64,
    /// Validity of a preview link. Default: 300
    #[serde(default = "default_preview_link_ttl_secs")]
    pub preview_link_ttl_secs: u64,
    /// Broadcast buffer per topic before slow subscribers lag. Default: 256
    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,
    /// Cuts off blob writes that take longer than this. Off by default.
    #[serde(default)]
    pub upload_watchdog_secs: Option<u64>,
    /// Removes devices not seen for this long. Off by default.
    #[serde(default)]
    pub presence_idle_timeout_secs: Option<u64>,
    /// Base URL used for share links and signed blob links.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_session_ttl_secs() -> u64 {
    crate::session::DEFAULT_SESSION_TTL_SECS
}

fn default_progress_linger_ms() -> u64 {
    5000
}

fn default_history_capacity() -> usize {
    crate::history::DEFAULT_HISTORY_CAPACITY
}

fn default_preview_max_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_download_link_ttl_secs() -> u64 {
    60
}

fn default_preview_link_ttl_secs() -> u64 {
    300
}

fn default_topic_capacity() -> usize {
    256
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:7878".to_string()
}

/// Transport retry policy for callback delivery and client connects.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempts before giving up. Default: 5
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay, doubled per attempt. Default: 100
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

/// RPC listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Main service port. 0 picks a free port.
    #[serde(default)]
    pub port: u16,
    /// Subscriber callback port. 0 picks a free port.
    #[serde(default)]
    pub subscriber_port: u16,
    /// Largest RPC frame accepted. Default: 64 MiB
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: 0,
            subscriber_port: 0,
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter directive used when `PRINTF_RELAY_LOG` is unset. Default: info
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Also write to `~/.printf-relay/logs/relay.log`.
    #[serde(default)]
    pub to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            to_file: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            progress_linger_ms: default_progress_linger_ms(),
            history_capacity: default_history_capacity(),
            preview_max_bytes: default_preview_max_bytes(),
            download_link_ttl_secs: default_download_link_ttl_secs(),
            preview_link_ttl_secs: default_preview_link_ttl_secs(),
            topic_capacity: default_topic_capacity(),
            upload_watchdog_secs: None,
            presence_idle_timeout_secs: None,
            public_base_url: default_public_base_url(),
            retry: RetryConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Loads `path` if it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).context("Failed to parse config as YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.session_ttl_secs == 0 {
            anyhow::bail!("session_ttl_secs must be greater than zero");
        }
        if self.history_capacity == 0 || self.history_capacity > MAX_HISTORY_CAPACITY {
            anyhow::bail!(
                "history_capacity must be between 1 and {}",
                MAX_HISTORY_CAPACITY
            );
        }
        if self.topic_capacity == 0 {
            anyhow::bail!("topic_capacity must be greater than zero");
        }
        if self.download_link_ttl_secs == 0 || self.preview_link_ttl_secs == 0 {
            anyhow::bail!("signed link TTLs must be greater than zero");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.upload_watchdog_secs == Some(0) {
            anyhow::bail!("upload_watchdog_secs must be greater than zero when set");
        }
        if self.presence_idle_timeout_secs == Some(0) {
            anyhow::bail!("presence_idle_timeout_secs must be greater than zero when set");
        }
        if !self.public_base_url.starts_with("http://")
            && !self.public_base_url.starts_with("https://")
        {
            anyhow::bail!(
                "public_base_url '{}' must start with http:// or https://",
                self.public_base_url
            );
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.session_ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn progress_linger(&self) -> Duration {
        Duration::from_millis(self.progress_linger_ms)
    }

    pub fn download_link_ttl(&self) -> Duration {
        Duration::from_secs(self.download_link_ttl_secs)
    }

    pub fn preview_link_ttl(&self) -> Duration {
        Duration::from_secs(self.preview_link_ttl_secs)
    }

    pub fn upload_watchdog(&self) -> Option<Duration> {
        self.upload_watchdog_secs.map(Duration::from_secs)
    }

    pub fn presence_idle_timeout(&self) -> Option<chrono::Duration> {
        self.presence_idle_timeout_secs
            .map(|secs| chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)))
    }

    /// Settings for the session registry.
    pub fn registry_settings(&self) -> crate::session::RegistrySettings {
        crate::session::RegistrySettings {
            ttl: self.session_ttl(),
            topic_capacity: self.topic_capacity,
            progress_retention: self.progress_linger(),
        }
    }
}
