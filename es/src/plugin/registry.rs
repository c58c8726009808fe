//! Plugin registry - named component factories with version requirements

use std::collections::HashMap;
use std::sync::Arc;

use semver::{Version, VersionReq};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use super::collector::Collector;
use crate::config::{CollectorConfig, HandlerConfig};
use crate::events::EventHandler;

/// Builds a collector from its configuration
pub type CollectorFactory = Arc<dyn Fn(&Value) -> eyre::Result<Arc<dyn Collector>> + Send + Sync>;

/// Builds an event handler from its configuration
pub type HandlerFactory = Arc<dyn Fn(&Value) -> eyre::Result<Arc<dyn EventHandler>> + Send + Sync>;

/// Errors raised while registering plugins or creating their components
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("A valid name is required for a plugin")]
    MissingName,

    #[error("Invalid version '{version}' for plugin {plugin}: {source}")]
    InvalidVersion {
        plugin: String,
        version: String,
        #[source]
        source: semver::Error,
    },

    #[error("Plugin already registered: {0}")]
    DuplicatePlugin(String),

    #[error("Plugin not loaded: {0}")]
    PluginNotLoaded(String),

    #[error("{plugin} does not have {kind} component: {name}")]
    ComponentNotFound { plugin: String, kind: &'static str, name: String },

    #[error("Invalid version requirement '{requirement}': {source}")]
    InvalidVersionRequirement {
        requirement: String,
        #[source]
        source: semver::Error,
    },

    #[error("Version requirements not met. Plugin version: {version} Semver requirement: {requirement}.")]
    VersionMismatch { version: Version, requirement: String },

    #[error("Failed to create {plugin}/{name}: {culprit}")]
    Component {
        plugin: String,
        name: String,
        culprit: eyre::Report,
    },
}

/// A named, versioned bundle of collector and handler factories
pub struct Plugin {
    pub name: String,
    pub version: Version,
    pub enabled: bool,
    pub description: String,
    pub author: String,
    pub license: String,
    collectors: HashMap<String, CollectorFactory>,
    event_handlers: HashMap<String, HandlerFactory>,
}

impl Plugin {
    /// Create an enabled plugin with no components
    pub fn new(name: impl Into<String>, version: &str) -> Result<Self, RegistryError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistryError::MissingName);
        }
        let version = Version::parse(version).map_err(|source| RegistryError::InvalidVersion {
            plugin: name.clone(),
            version: version.to_string(),
            source,
        })?;
        Ok(Self {
            name,
            version,
            enabled: true,
            description: String::new(),
            author: String::new(),
            license: String::new(),
            collectors: HashMap::new(),
            event_handlers: HashMap::new(),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = license.into();
        self
    }

    /// Add a collector factory
    pub fn with_collector<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Value) -> eyre::Result<Arc<dyn Collector>> + Send + Sync + 'static,
    {
        self.collectors.insert(name.into(), Arc::new(factory));
        self
    }

    /// Add an event handler factory
    pub fn with_event_handler<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Value) -> eyre::Result<Arc<dyn EventHandler>> + Send + Sync + 'static,
    {
        self.event_handlers.insert(name.into(), Arc::new(factory));
        self
    }

    /// Collector names, sorted
    pub fn collector_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.collectors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Event handler names, sorted
    pub fn event_handler_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.event_handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn check_version(&self, requirement: Option<&str>) -> Result<(), RegistryError> {
        let Some(requirement) = requirement.filter(|r| !r.trim().is_empty()) else {
            return Ok(());
        };
        let req = VersionReq::parse(requirement).map_err(|source| RegistryError::InvalidVersionRequirement {
            requirement: requirement.to_string(),
            source,
        })?;
        if !req.matches(&self.version) {
            return Err(RegistryError::VersionMismatch {
                version: self.version.clone(),
                requirement: requirement.to_string(),
            });
        }
        Ok(())
    }

    /// Create a collector by name
    pub fn create_collector(
        &self,
        name: &str,
        config: &Value,
        requirement: Option<&str>,
    ) -> Result<Arc<dyn Collector>, RegistryError> {
        let factory = self.collectors.get(name).ok_or_else(|| RegistryError::ComponentNotFound {
            plugin: self.name.clone(),
            kind: "collector",
            name: name.to_string(),
        })?;
        self.check_version(requirement)?;
        factory(config).map_err(|culprit| RegistryError::Component {
            plugin: self.name.clone(),
            name: name.to_string(),
            culprit,
        })
    }

    /// Create an event handler by name
    pub fn create_event_handler(
        &self,
        name: &str,
        config: &Value,
        requirement: Option<&str>,
    ) -> Result<Arc<dyn EventHandler>, RegistryError> {
        let factory = self
            .event_handlers
            .get(name)
            .ok_or_else(|| RegistryError::ComponentNotFound {
                plugin: self.name.clone(),
                kind: "event handler",
                name: name.to_string(),
            })?;
        self.check_version(requirement)?;
        factory(config).map_err(|culprit| RegistryError::Component {
            plugin: self.name.clone(),
            name: name.to_string(),
            culprit,
        })
    }
}

/// Explicitly owned set of loaded plugins
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Plugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin; names must be unique
    pub fn register(&mut self, plugin: Plugin) -> Result<(), RegistryError> {
        debug!(name = %plugin.name, version = %plugin.version, "PluginRegistry::register: called");
        if self.plugins.iter().any(|p| p.name == plugin.name) {
            return Err(RegistryError::DuplicatePlugin(plugin.name));
        }
        info!(
            name = %plugin.name,
            version = %plugin.version,
            collectors = plugin.collectors.len(),
            handlers = plugin.event_handlers.len(),
            "Plugin loaded"
        );
        self.plugins.push(plugin);
        Ok(())
    }

    /// Look up a plugin by name
    pub fn get_plugin(&self, name: &str, include_disabled: bool) -> Result<&Plugin, RegistryError> {
        self.plugins
            .iter()
            .find(|p| p.name == name && (include_disabled || p.enabled))
            .ok_or_else(|| RegistryError::PluginNotLoaded(name.to_string()))
    }

    /// Enable or disable a plugin
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        let plugin = self
            .plugins
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| RegistryError::PluginNotLoaded(name.to_string()))?;
        plugin.enabled = enabled;
        Ok(())
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    /// Create the collector a config entry names
    pub fn create_collector(&self, config: &CollectorConfig) -> Result<Arc<dyn Collector>, RegistryError> {
        debug!(plugin = %config.plugin, collector = %config.collector, "PluginRegistry::create_collector: called");
        self.get_plugin(&config.plugin, false)?
            .create_collector(&config.collector, &config.config, config.version.as_deref())
    }

    /// Create the event handler a config entry names
    pub fn create_event_handler(&self, config: &HandlerConfig) -> Result<Arc<dyn EventHandler>, RegistryError> {
        debug!(plugin = %config.plugin, handler = %config.handler, "PluginRegistry::create_event_handler: called");
        self.get_plugin(&config.plugin, false)?
            .create_event_handler(&config.handler, &config.config, config.version.as_deref())
    }
}
