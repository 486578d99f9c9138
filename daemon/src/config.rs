use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const MIN_WITHIN_SECS: u32 = 1;
pub const MAX_WITHIN_SECS: u32 = 60;
pub const DEFAULT_WITHIN_SECS: u32 = 1;
pub const MIN_SHUTDOWN_POLL_MS: u64 = 10;
pub const MAX_SHUTDOWN_POLL_MS: u64 = 1000;
pub const DEFAULT_SHUTDOWN_POLL_MS: u64 = 100;
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Root configuration structure. Deserialized from `procwatch.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Which producer of creation notifications to subscribe to.
#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// WMI on Windows, process-table polling everywhere else.
    #[default]
    Auto,
    /// `__InstanceCreationEvent` subscription through WMI. Windows only.
    Wmi,
    /// Periodic diff of the process table.
    Poll,
}

#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    /// Requested delivery granularity of creation events, in seconds.
    /// Clamped to [1, 60].
    #[serde(default = "default_within_secs")]
    pub within_secs: u32,
    /// Interval at which the main loop checks for a shutdown request.
    /// Clamped to [10, 1000] milliseconds.
    #[serde(default = "default_shutdown_poll_ms")]
    pub shutdown_poll_ms: u64,
    #[serde(default)]
    pub source: SourceKind,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            within_secs: DEFAULT_WITHIN_SECS,
            shutdown_poll_ms: DEFAULT_SHUTDOWN_POLL_MS,
            source: SourceKind::Auto,
        }
    }
}

impl MonitorConfig {
    pub fn within(&self) -> Duration {
        let secs = self.within_secs.clamp(MIN_WITHIN_SECS, MAX_WITHIN_SECS);
        Duration::from_secs(u64::from(secs))
    }

    pub fn shutdown_poll_interval(&self) -> Duration {
        let ms = self
            .shutdown_poll_ms
            .clamp(MIN_SHUTDOWN_POLL_MS, MAX_SHUTDOWN_POLL_MS);
        Duration::from_millis(ms)
    }

    /// Resolves [`SourceKind::Auto`] for the platform this binary was built for.
    pub fn effective_source(&self) -> SourceKind {
        match self.source {
            SourceKind::Auto if cfg!(windows) => SourceKind::Wmi,
            SourceKind::Auto => SourceKind::Poll,
            other => other,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Default tracing directive; `PROCWATCH_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_within_secs() -> u32 {
    DEFAULT_WITHIN_SECS
}

fn default_shutdown_poll_ms() -> u64 {
    DEFAULT_SHUTDOWN_POLL_MS
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
