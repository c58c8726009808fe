//! EventSync configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runner::RunnerConfig;
use crate::signal::DEFAULT_SIGNAL_CAPACITY;

/// Main EventSync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Event dispatcher settings
    pub dispatcher: DispatcherConfig,

    /// Collector services to run
    pub collectors: Vec<CollectorConfig>,

    /// Event handlers to load
    #[serde(rename = "event-handlers")]
    pub event_handlers: Vec<HandlerConfig>,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        let mut models = HashSet::new();
        for collector in &self.collectors {
            if collector.model.trim().is_empty() {
                return Err(eyre::eyre!(
                    "Collector {}/{} has an empty model name",
                    collector.plugin,
                    collector.collector
                ));
            }
            if !models.insert(collector.model.as_str()) {
                return Err(eyre::eyre!("Model '{}' is collected more than once", collector.model));
            }
        }
        for handler in &self.event_handlers {
            if handler.handler.trim().is_empty() {
                return Err(eyre::eyre!("Event handler from plugin '{}' has an empty name", handler.plugin));
            }
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .eventsync.yml
        let local_config = PathBuf::from(".eventsync.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/eventsync/eventsync.yml
        if let Some(user_config) = Self::user_config_path() {
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed; the full load reports them once logging works.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => {
                let mut paths = vec![PathBuf::from(".eventsync.yml")];
                paths.extend(Self::user_config_path());
                paths
            }
        };
        candidates
            .iter()
            .find(|p| p.exists())
            .and_then(|p| Self::load_from_file(p).ok())
            .and_then(|c| c.log_level)
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("eventsync").join("eventsync.yml"))
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Event dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Report an error signal when an event matches no handler
    #[serde(rename = "error-on-unhandled-events")]
    pub error_on_unhandled_events: bool,

    /// Minimum time between queue drains in milliseconds
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Signal channel capacity
    #[serde(rename = "signal-capacity")]
    pub signal_capacity: usize,

    /// Longest a one-shot or shutdown drain waits on deferred handlers
    #[serde(rename = "drain-timeout-ms")]
    pub drain_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            error_on_unhandled_events: false,
            poll_interval_ms: 100,
            signal_capacity: DEFAULT_SIGNAL_CAPACITY,
            drain_timeout_ms: 5000,
        }
    }
}

impl DispatcherConfig {
    /// Cadence of the dispatcher service, as runner config
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            run_min_time_between_ms: self.poll_interval_ms,
            ..Default::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// A collector instance to create from a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Plugin providing the collector
    pub plugin: String,

    /// Collector name within the plugin
    pub collector: String,

    /// Model name; events are named `<model>.create|update|remove`
    pub model: String,

    /// Semver requirement on the plugin version
    #[serde(default)]
    pub version: Option<String>,

    /// Cadence and retry settings for the collector service
    #[serde(flatten)]
    pub service: RunnerConfig,

    /// Collector-specific configuration
    #[serde(default)]
    pub config: Value,
}

/// An event handler instance to create from a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Plugin providing the handler
    pub plugin: String,

    /// Handler name within the plugin
    pub handler: String,

    /// Semver requirement on the plugin version
    #[serde(default)]
    pub version: Option<String>,

    /// Handler-specific configuration
    #[serde(default)]
    pub config: Value,
}
