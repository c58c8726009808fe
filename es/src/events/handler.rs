//! EventHandler trait definition

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::defer::DeferDispatch;
use super::dispatcher::EventSink;
use super::event::Event;

/// Id assigned to a handler when it is loaded into a dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work bound to one event name
///
/// Only `event_name` and `dispatch` are required. Every other capability has
/// a default that opts out of it.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Exact event name this handler reacts to
    fn event_name(&self) -> &str;

    /// Whether `revert` is implemented
    fn supports_revert(&self) -> bool {
        false
    }

    /// Extra predicate evaluated after the name matched
    fn should_handle(&self, _event: &Event) -> bool {
        true
    }

    /// Condition that must be signaled before `dispatch` runs
    fn defer_dispatch(&self) -> Option<DeferDispatch> {
        None
    }

    /// Enqueue a completion event carrying the dispatch result
    fn enqueue_complete_event(&self) -> bool {
        false
    }

    /// Applied to the dispatch result before it is chained
    fn transform(&self, result: Value) -> Result<Value> {
        Ok(result)
    }

    /// Called once when loaded, with a handle for enqueueing new events
    fn on_load(&self, _sink: EventSink) {}

    /// React to an event payload
    async fn dispatch(&self, data: &Value) -> Result<Value>;

    /// Undo the reaction to an event payload
    async fn revert(&self, _data: &Value) -> Result<()> {
        Ok(())
    }
}

/// A handler together with the id its dispatcher assigned
#[derive(Clone)]
pub struct LoadedHandler {
    pub instance_id: HandlerId,
    pub handler: Arc<dyn EventHandler>,
}

impl LoadedHandler {
    pub fn event_name(&self) -> &str {
        self.handler.event_name()
    }

    /// True if this handler should receive `event`
    pub(crate) fn matches(&self, event: &Event, instance_id: Option<HandlerId>) -> bool {
        if self.handler.event_name() != event.name() {
            return false;
        }
        if instance_id.is_some_and(|id| id != self.instance_id) {
            return false;
        }
        self.handler.should_handle(event)
    }
}

impl fmt::Debug for LoadedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedHandler")
            .field("instance_id", &self.instance_id)
            .field("event_name", &self.handler.event_name())
            .finish()
    }
}

impl fmt::Display for LoadedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler {} ({})", self.instance_id, self.handler.event_name())
    }
}
