//! Plugins - collectors, event handlers and the registry that builds them
//!
//! A plugin bundles named factories. Configuration entries name a plugin, a
//! component and an optional semver requirement; the registry turns each
//! entry into a live `Collector` or `EventHandler`.

mod builtin;
mod collector;
mod registry;

pub use builtin::{CORE_PLUGIN, JsonlCollector, LogHandler, core_plugin};
pub use collector::{ChangeKind, ChangeSink, Collector, CollectorService, collected_signal, notify_collected};
pub use registry::{CollectorFactory, HandlerFactory, Plugin, PluginRegistry, RegistryError};
