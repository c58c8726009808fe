//! Event value types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Suffix appended to an event name to form its completion event name
pub const COMPLETE_SUFFIX: &str = "complete";

/// Sequence id assigned to an event when it enters a dispatcher queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueId(pub u64);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named occurrence with an opaque payload
///
/// Names are dot-namespaced (`orders.create`). The `queue_id` is assigned by
/// the owning dispatcher at enqueue time and cannot be set by producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    name: String,
    data: Value,
    queue_id: Option<QueueId>,
    created_at: DateTime<Utc>,
    /// Name of the event this one reports the dispatch result of
    completion_of: Option<String>,
}

impl Event {
    /// Create a new event
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            queue_id: None,
            created_at: Utc::now(),
            completion_of: None,
        }
    }

    /// Create the completion event carrying the dispatch result of `source`
    pub fn completion(source: &Event, result: Value) -> Self {
        Self {
            name: format!("{}.{}", source.name, COMPLETE_SUFFIX),
            data: result,
            queue_id: None,
            created_at: Utc::now(),
            completion_of: Some(source.name.clone()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Sequence id, once the event has been enqueued
    pub fn queue_id(&self) -> Option<QueueId> {
        self.queue_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True if this is a completion event
    pub fn is_completion(&self) -> bool {
        self.completion_of.is_some()
    }

    /// Name of the source event, for completion events
    pub fn completion_of(&self) -> Option<&str> {
        self.completion_of.as_deref()
    }

    pub(crate) fn assign_queue_id(&mut self, id: QueueId) {
        self.queue_id = Some(id);
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.queue_id {
            Some(id) => write!(f, "{}#{}", self.name, id),
            None => write!(f, "{}", self.name),
        }
    }
}
