//! Collector trait and its service adapter

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::events::{Event, EventDispatcher, EventSink, QueueId};
use crate::runner::{RunCallback, StopCallback};

/// Kind of change a collector observed on a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Remove,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Remove => "remove",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turns a collector's model changes into `<model>.<kind>` events
#[derive(Clone)]
pub struct ChangeSink {
    model: String,
    sink: EventSink,
}

impl ChangeSink {
    pub fn new(model: impl Into<String>, sink: EventSink) -> Self {
        Self {
            model: model.into(),
            sink,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Enqueue a change event; `None` if the dispatcher is gone
    pub fn emit(&self, kind: ChangeKind, data: Value) -> Option<QueueId> {
        debug!(model = %self.model, %kind, "ChangeSink::emit: called");
        self.sink.enqueue(Event::new(format!("{}.{}", self.model, kind), data))
    }

    pub fn create(&self, data: Value) -> Option<QueueId> {
        self.emit(ChangeKind::Create, data)
    }

    pub fn update(&self, data: Value) -> Option<QueueId> {
        self.emit(ChangeKind::Update, data)
    }

    pub fn remove(&self, data: Value) -> Option<QueueId> {
        self.emit(ChangeKind::Remove, data)
    }
}

/// A pluggable data source polled by a task runner
#[async_trait]
pub trait Collector: Send + Sync {
    /// Perform one polling/sync pass, reporting changes to `changes`
    async fn run(&self, changes: &ChangeSink) -> Result<()>;

    /// Release resources when the service stops
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Name of the signal raised after each completed poll of `model`
pub fn collected_signal(model: &str) -> String {
    format!("complete.{}", model)
}

/// Raise the completed-poll signal for `model`
pub fn notify_collected(dispatcher: &EventDispatcher, model: &str) {
    dispatcher.notify(collected_signal(model), json!({ "model": model }));
}

/// Adapts a collector to the task runner's run/stop callbacks
pub struct CollectorService {
    collector: Arc<dyn Collector>,
    changes: ChangeSink,
    dispatcher: EventDispatcher,
}

impl CollectorService {
    pub fn new(model: impl Into<String>, collector: Arc<dyn Collector>, dispatcher: EventDispatcher) -> Self {
        let changes = ChangeSink::new(model, dispatcher.sink());
        Self {
            collector,
            changes,
            dispatcher,
        }
    }

    pub fn model(&self) -> &str {
        self.changes.model()
    }
}

#[async_trait]
impl RunCallback for CollectorService {
    async fn run(&self) -> Result<()> {
        self.collector.run(&self.changes).await?;
        notify_collected(&self.dispatcher, self.changes.model());
        Ok(())
    }
}

#[async_trait]
impl StopCallback for CollectorService {
    async fn stop(&self) -> Result<()> {
        debug!(model = %self.changes.model(), "CollectorService::stop: called");
        self.collector.stop().await
    }
}
