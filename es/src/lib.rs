//! EventSync - collector-driven event dispatch with recurring task runners
//!
//! Collectors poll external sources and turn what they find into
//! `<model>.create|update|remove` events. The [`events::EventDispatcher`]
//! queues those events and fans each one out to every matching
//! [`events::EventHandler`], isolating failures and optionally chaining
//! completion events. [`runner::TaskRunner`]s drive both sides on a cadence.

pub mod app;
pub mod cli;
pub mod config;
pub mod events;
pub mod plugin;
pub mod runner;
pub mod signal;

pub use app::App;
pub use config::{CollectorConfig, Config, DispatcherConfig, HandlerConfig};
pub use events::{DispatchError, DispatcherSignal, Event, EventDispatcher, EventHandler};
pub use plugin::{Collector, Plugin, PluginRegistry, core_plugin};
pub use runner::{RunCallback, StopCallback, TaskRunner};
