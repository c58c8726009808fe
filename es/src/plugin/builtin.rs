//! Built-in `core` plugin: a logging handler and a JSON-lines collector

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::collector::{ChangeKind, ChangeSink, Collector};
use super::registry::{Plugin, RegistryError};
use crate::events::EventHandler;

pub const CORE_PLUGIN: &str = "core";

/// The plugin shipped with the binary, versioned with the crate
pub fn core_plugin() -> Result<Plugin, RegistryError> {
    Ok(Plugin::new(CORE_PLUGIN, env!("CARGO_PKG_VERSION"))?
        .with_description("Built-in collectors and event handlers")
        .with_author(env!("CARGO_PKG_AUTHORS"))
        .with_license(env!("CARGO_PKG_LICENSE"))
        .with_collector("jsonl", |config| {
            Ok(Arc::new(JsonlCollector::from_config(config)?) as Arc<dyn Collector>)
        })
        .with_event_handler("log", |config| {
            Ok(Arc::new(LogHandler::from_config(config)?) as Arc<dyn EventHandler>)
        }))
}

#[derive(Debug, Deserialize)]
struct LogHandlerConfig {
    event: String,
    #[serde(default)]
    complete: bool,
}

/// Logs every event it receives and passes the payload through
#[derive(Debug)]
pub struct LogHandler {
    event: String,
    complete: bool,
}

impl LogHandler {
    pub fn new(event: impl Into<String>, complete: bool) -> Self {
        Self {
            event: event.into(),
            complete,
        }
    }

    pub fn from_config(config: &Value) -> Result<Self> {
        let config: LogHandlerConfig =
            serde_json::from_value(config.clone()).context("Invalid log handler config")?;
        Ok(Self::new(config.event, config.complete))
    }
}

#[async_trait]
impl EventHandler for LogHandler {
    fn event_name(&self) -> &str {
        &self.event
    }

    fn enqueue_complete_event(&self) -> bool {
        self.complete
    }

    async fn dispatch(&self, data: &Value) -> Result<Value> {
        info!(event = %self.event, %data, "Event received");
        Ok(data.clone())
    }
}

#[derive(Debug, Deserialize)]
struct JsonlCollectorConfig {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ChangeRecord {
    action: ChangeKind,
    #[serde(default)]
    data: Value,
}

/// Tails a JSON-lines file of `{"action": ..., "data": ...}` change records
///
/// Only newline-terminated lines are consumed; a partial last line waits for
/// the next poll. A file shorter than the consumed offset is read from the
/// start again.
#[derive(Debug)]
pub struct JsonlCollector {
    path: PathBuf,
    offset: Mutex<usize>,
}

impl JsonlCollector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: Mutex::new(0),
        }
    }

    pub fn from_config(config: &Value) -> Result<Self> {
        let config: JsonlCollectorConfig =
            serde_json::from_value(config.clone()).context("Invalid jsonl collector config")?;
        Ok(Self::new(config.path))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn offset(&self) -> MutexGuard<'_, usize> {
        self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Collector for JsonlCollector {
    async fn run(&self, changes: &ChangeSink) -> Result<()> {
        debug!(path = %self.path.display(), "JsonlCollector::run: called");
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "JsonlCollector::run: file missing, nothing to collect");
                return Ok(());
            }
            Err(e) => return Err(e).context(format!("Failed to read {}", self.path.display())),
        };

        let start = {
            let mut offset = self.offset();
            if *offset > content.len() {
                warn!(path = %self.path.display(), "File shrank, reading from the start");
                *offset = 0;
            }
            *offset
        };

        let mut consumed = 0;
        let mut result = Ok(());
        for line in content[start..].split_inclusive(|b| *b == b'\n') {
            if !line.ends_with(b"\n") {
                break;
            }
            consumed += line.len();
            let record = line.trim_ascii();
            if record.is_empty() {
                continue;
            }
            match serde_json::from_slice::<ChangeRecord>(record) {
                Ok(record) => {
                    changes.emit(record.action, record.data);
                }
                Err(e) => {
                    result = Err(eyre!("Malformed change record in {}: {}", self.path.display(), e));
                    break;
                }
            }
        }

        *self.offset() = start + consumed;
        result
    }
}
