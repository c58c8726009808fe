//! Dispatcher signal vocabulary

use std::sync::Arc;

use serde_json::Value;

use super::error::DispatchError;
use super::event::Event;
use super::handler::LoadedHandler;

/// Everything an `EventDispatcher` reports on its signal bus
#[derive(Clone, Debug)]
pub enum DispatcherSignal {
    /// A handler finished dispatching an event
    Dispatched { event: Event, handler: LoadedHandler },
    /// A handler finished reverting an event
    Reverted { event: Event, handler: LoadedHandler },
    /// An isolated failure; never aborts sibling handlers
    Error(Arc<DispatchError>),
    /// An external condition was raised; deferred handlers wait on these
    Notify { name: String, payload: Value },
}

impl DispatcherSignal {
    /// Short name of the signal kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            DispatcherSignal::Dispatched { .. } => "dispatch",
            DispatcherSignal::Reverted { .. } => "reverted",
            DispatcherSignal::Error(_) => "error",
            DispatcherSignal::Notify { .. } => "notify",
        }
    }
}
