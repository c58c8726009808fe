//! EventDispatcher - handler registry, event queue and dispatch engine

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use eyre::Result;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::defer::defer_on_signal;
use super::error::{DeferralError, DispatchError, HandlerPhase};
use super::event::{Event, QueueId};
use super::handler::{EventHandler, HandlerId, LoadedHandler};
use super::signals::DispatcherSignal;
use crate::config::DispatcherConfig;
use crate::runner::RunCallback;
use crate::signal::SignalBus;

/// Registry and queue, mutated only through short synchronous sections
#[derive(Default)]
struct DispatcherState {
    handlers: Vec<LoadedHandler>,
    queue: VecDeque<Event>,
    handler_count: u64,
    event_count: u64,
}

struct DispatcherShared {
    config: DispatcherConfig,
    state: Mutex<DispatcherState>,
    signals: SignalBus<DispatcherSignal>,
}

impl DispatcherShared {
    fn state(&self) -> MutexGuard<'_, DispatcherState> {
        // Critical sections never panic midway, so a poisoned lock is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, mut event: Event) -> QueueId {
        let mut state = self.state();
        let id = QueueId(state.event_count);
        state.event_count += 1;
        event.assign_queue_id(id);
        debug!(%event, "EventDispatcher::enqueue_event: queued");
        state.queue.push_back(event);
        id
    }
}

/// Central event bus: handler registry, FIFO queue, dispatch/revert engine
///
/// Cloning yields another handle to the same dispatcher. `dispatch_event`,
/// `revert_event` and `run` spawn their per-handler work on the current tokio
/// runtime at call time and return a future that resolves once every selected
/// handler has settled. Handler failures never reject that future; they are
/// reported as [`DispatcherSignal::Error`].
#[derive(Clone)]
pub struct EventDispatcher {
    shared: Arc<DispatcherShared>,
}

/// Handle given to handlers for enqueueing new events
///
/// Holds the dispatcher weakly so a handler storing its sink does not keep
/// the dispatcher alive.
#[derive(Clone)]
pub struct EventSink {
    shared: Weak<DispatcherShared>,
}

impl EventSink {
    /// Enqueue an event; `None` if the dispatcher has been dropped
    pub fn enqueue(&self, event: Event) -> Option<QueueId> {
        self.shared.upgrade().map(|shared| shared.enqueue(event))
    }
}

impl EventDispatcher {
    /// Create a new dispatcher
    pub fn new(config: DispatcherConfig) -> Self {
        debug!(?config, "EventDispatcher::new: called");
        let signals = SignalBus::new(config.signal_capacity);
        Self {
            shared: Arc::new(DispatcherShared {
                config,
                state: Mutex::new(DispatcherState::default()),
                signals,
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Register a handler, returning its instance id
    pub fn load_event_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let instance_id = {
            let mut state = self.shared.state();
            let instance_id = HandlerId(state.handler_count);
            state.handler_count += 1;
            state.handlers.push(LoadedHandler {
                instance_id,
                handler: handler.clone(),
            });
            instance_id
        };
        debug!(%instance_id, event_name = handler.event_name(), "EventDispatcher::load_event_handler: loaded");

        // Outside the lock: the handler may enqueue from on_load
        handler.on_load(self.sink());
        instance_id
    }

    /// Remove a handler by instance id, returning it if it was loaded
    pub fn remove_event_handler(&self, instance_id: HandlerId) -> Option<LoadedHandler> {
        debug!(%instance_id, "EventDispatcher::remove_event_handler: called");
        let mut state = self.shared.state();
        let index = state.handlers.iter().position(|h| h.instance_id == instance_id)?;
        Some(state.handlers.remove(index))
    }

    /// Look up a handler by instance id
    pub fn get_event_handler(&self, instance_id: HandlerId) -> Option<LoadedHandler> {
        self.shared
            .state()
            .handlers
            .iter()
            .find(|h| h.instance_id == instance_id)
            .cloned()
    }

    /// Number of loaded handlers
    pub fn handler_count(&self) -> usize {
        self.shared.state().handlers.len()
    }

    /// Append an event to the queue, returning its assigned sequence id
    pub fn enqueue_event(&self, event: Event) -> QueueId {
        self.shared.enqueue(event)
    }

    /// Remove and return the oldest queued event
    pub fn shift_event(&self) -> Option<Event> {
        self.shared.state().queue.pop_front()
    }

    /// Number of events waiting in the queue
    pub fn event_queue_count(&self) -> usize {
        self.shared.state().queue.len()
    }

    /// Handle for enqueueing events into this dispatcher
    pub fn sink(&self) -> EventSink {
        EventSink {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Raise a named external condition; deferred handlers wait on these
    pub fn notify(&self, name: impl Into<String>, payload: Value) {
        let name = name.into();
        debug!(%name, "EventDispatcher::notify: called");
        self.shared.signals.emit(DispatcherSignal::Notify { name, payload });
    }

    /// Subscribe to dispatch, revert, error and notify signals
    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherSignal> {
        self.shared.signals.subscribe()
    }

    /// Handlers whose name matches, optionally narrowed to one instance id,
    /// and whose predicate accepts the event
    fn select(&self, event: &Event, instance_id: Option<HandlerId>) -> Vec<LoadedHandler> {
        let candidates: Vec<LoadedHandler> = self
            .shared
            .state()
            .handlers
            .iter()
            .filter(|h| h.event_name() == event.name())
            .cloned()
            .collect();

        // Predicates are user code; never run them under the lock
        candidates
            .into_iter()
            .filter(|h| h.matches(event, instance_id))
            .collect()
    }

    fn report(&self, err: DispatchError) {
        match err.culprit() {
            Some(culprit) => warn!(error = %err, culprit = ?culprit, "EventDispatcher: handler error"),
            None => warn!(error = %err, "EventDispatcher: handler error"),
        }
        self.shared.signals.emit(DispatcherSignal::Error(Arc::new(err)));
    }

    /// Dispatch an event to every matching handler concurrently
    pub fn dispatch_event(
        &self,
        event: Event,
        instance_id: Option<HandlerId>,
    ) -> impl Future<Output = ()> + Send + 'static {
        debug!(%event, ?instance_id, "EventDispatcher::dispatch_event: called");
        let selected = self.select(&event, instance_id);

        if selected.is_empty() {
            if self.shared.config.error_on_unhandled_events {
                self.report(DispatchError::Unhandled { event: event.clone() });
            } else {
                debug!(%event, "EventDispatcher::dispatch_event: no handlers, dropping event");
            }
        }

        let tasks: Vec<(LoadedHandler, JoinHandle<()>)> = selected
            .into_iter()
            .map(|loaded| {
                // Subscribe now so conditions raised before the task first runs are seen
                let deferral = loaded
                    .handler
                    .defer_dispatch()
                    .map(|defer| defer_on_signal(&defer, &self.shared.signals).boxed());
                let dispatcher = self.clone();
                let task_event = event.clone();
                let task_handler = loaded.clone();
                let task = tokio::spawn(async move {
                    match dispatcher.dispatch_to(&task_event, &task_handler, deferral).await {
                        Ok(()) => {
                            debug!(event = %task_event, handler = %task_handler, "EventDispatcher: dispatched");
                            dispatcher.shared.signals.emit(DispatcherSignal::Dispatched {
                                event: task_event,
                                handler: task_handler,
                            });
                        }
                        Err(err) => dispatcher.report(err),
                    }
                });
                (loaded, task)
            })
            .collect();

        self.settle(event, tasks)
    }

    async fn dispatch_to(
        &self,
        event: &Event,
        loaded: &LoadedHandler,
        deferral: Option<BoxFuture<'static, Result<(), DeferralError>>>,
    ) -> Result<(), DispatchError> {
        if let Some(wait) = deferral {
            debug!(%event, handler = %loaded, "EventDispatcher: waiting on deferral");
            wait.await.map_err(|source| DispatchError::Deferral {
                event: event.clone(),
                handler: loaded.clone(),
                source,
            })?;
        }

        let handler_error = |phase, culprit| DispatchError::Handler {
            phase,
            event: event.clone(),
            handler: loaded.clone(),
            culprit,
        };

        let result = loaded
            .handler
            .dispatch(event.data())
            .await
            .map_err(|e| handler_error(HandlerPhase::Dispatch, e))?;
        let result = loaded
            .handler
            .transform(result)
            .map_err(|e| handler_error(HandlerPhase::Transform, e))?;

        // Completion events never chain another completion event
        if loaded.handler.enqueue_complete_event() && !event.is_completion() {
            self.enqueue_event(Event::completion(event, result));
        }
        Ok(())
    }

    /// Revert an event through every matching handler concurrently
    pub fn revert_event(
        &self,
        event: Event,
        instance_id: Option<HandlerId>,
    ) -> impl Future<Output = ()> + Send + 'static {
        debug!(%event, ?instance_id, "EventDispatcher::revert_event: called");
        let tasks: Vec<(LoadedHandler, JoinHandle<()>)> = self
            .select(&event, instance_id)
            .into_iter()
            .map(|loaded| {
                let dispatcher = self.clone();
                let task_event = event.clone();
                let task_handler = loaded.clone();
                let task = tokio::spawn(async move {
                    match dispatcher.revert_with(&task_event, &task_handler).await {
                        Ok(()) => {
                            debug!(event = %task_event, handler = %task_handler, "EventDispatcher: reverted");
                            dispatcher.shared.signals.emit(DispatcherSignal::Reverted {
                                event: task_event,
                                handler: task_handler,
                            });
                        }
                        Err(err) => dispatcher.report(err),
                    }
                });
                (loaded, task)
            })
            .collect();

        self.settle(event, tasks)
    }

    async fn revert_with(&self, event: &Event, loaded: &LoadedHandler) -> Result<(), DispatchError> {
        if !loaded.handler.supports_revert() {
            return Err(DispatchError::RevertUnsupported {
                event: event.clone(),
                handler: loaded.clone(),
            });
        }
        loaded
            .handler
            .revert(event.data())
            .await
            .map_err(|culprit| DispatchError::Handler {
                phase: HandlerPhase::Revert,
                event: event.clone(),
                handler: loaded.clone(),
                culprit,
            })
    }

    /// Await every spawned handler task; a panicked task becomes an isolated error
    fn settle(
        &self,
        event: Event,
        tasks: Vec<(LoadedHandler, JoinHandle<()>)>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let dispatcher = self.clone();
        async move {
            let settled = join_all(tasks.into_iter().map(|(loaded, task)| async move { (loaded, task.await) })).await;
            for (handler, outcome) in settled {
                match outcome {
                    Err(join_err) if join_err.is_panic() => dispatcher.report(DispatchError::Panicked {
                        event: event.clone(),
                        handler,
                    }),
                    _ => {}
                }
            }
        }
    }

    /// Shift and dispatch every queued event concurrently
    ///
    /// The queue is taken in one critical section when called, so events
    /// enqueued by handlers while these dispatches run are left for the next
    /// call, whichever runtime flavor the handlers run on.
    pub fn run(&self) -> impl Future<Output = ()> + Send + 'static {
        let events = std::mem::take(&mut self.shared.state().queue);
        debug!(count = events.len(), "EventDispatcher::run: draining");
        let pending: Vec<_> = events
            .into_iter()
            .map(|event| self.dispatch_event(event, None))
            .collect();
        async move {
            join_all(pending).await;
        }
    }
}

#[async_trait]
impl RunCallback for EventDispatcher {
    async fn run(&self) -> Result<()> {
        EventDispatcher::run(self).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeferDispatch;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Configurable handler that records what it was called with
    #[derive(Default)]
    struct Recording {
        name: String,
        dispatched: Mutex<Vec<Value>>,
        reverted: Mutex<Vec<Value>>,
        fail: bool,
        panic: bool,
        complete: bool,
        revert: bool,
        double: bool,
        only_positive: bool,
        defer: Option<DeferDispatch>,
        sink: Mutex<Option<EventSink>>,
        follow_up: Option<String>,
    }

    impl Recording {
        fn named(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Default::default()
            }
        }

        fn dispatched(&self) -> Vec<Value> {
            self.dispatched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for Recording {
        fn event_name(&self) -> &str {
            &self.name
        }

        fn supports_revert(&self) -> bool {
            self.revert
        }

        fn should_handle(&self, event: &Event) -> bool {
            !self.only_positive || event.data().as_i64().is_some_and(|n| n > 0)
        }

        fn defer_dispatch(&self) -> Option<DeferDispatch> {
            self.defer.clone()
        }

        fn enqueue_complete_event(&self) -> bool {
            self.complete
        }

        fn transform(&self, result: Value) -> Result<Value> {
            if self.double {
                let n = result.as_i64().ok_or_else(|| eyre::eyre!("not a number"))?;
                return Ok(json!(n * 2));
            }
            Ok(result)
        }

        fn on_load(&self, sink: EventSink) {
            *self.sink.lock().unwrap() = Some(sink);
        }

        async fn dispatch(&self, data: &Value) -> Result<Value> {
            self.dispatched.lock().unwrap().push(data.clone());
            if self.panic {
                panic!("handler panicked");
            }
            if self.fail {
                return Err(eyre::eyre!("handler failed"));
            }
            if let Some(name) = &self.follow_up {
                let sink = self.sink.lock().unwrap().clone();
                if let Some(sink) = sink {
                    sink.enqueue(Event::new(name.clone(), data.clone()));
                }
            }
            Ok(data.clone())
        }

        async fn revert(&self, data: &Value) -> Result<()> {
            self.reverted.lock().unwrap().push(data.clone());
            if self.fail {
                return Err(eyre::eyre!("revert failed"));
            }
            Ok(())
        }
    }

    fn dispatcher() -> EventDispatcher {
        EventDispatcher::new(DispatcherConfig::default())
    }

    fn strict_dispatcher() -> EventDispatcher {
        EventDispatcher::new(DispatcherConfig {
            error_on_unhandled_events: true,
            ..Default::default()
        })
    }

    fn drain(rx: &mut broadcast::Receiver<DispatcherSignal>) -> Vec<DispatcherSignal> {
        let mut signals = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            signals.push(signal);
        }
        signals
    }

    fn errors(signals: &[DispatcherSignal]) -> Vec<Arc<DispatchError>> {
        signals
            .iter()
            .filter_map(|s| match s {
                DispatcherSignal::Error(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_load_assigns_unique_ids() {
        let dispatcher = dispatcher();
        let ids: Vec<HandlerId> = (0..4)
            .map(|_| dispatcher.load_event_handler(Arc::new(Recording::named("test.event"))))
            .collect();

        assert_eq!(ids, vec![HandlerId(0), HandlerId(1), HandlerId(2), HandlerId(3)]);
        assert_eq!(dispatcher.handler_count(), 4);
    }

    #[test]
    fn test_remove_and_get_handler() {
        let dispatcher = dispatcher();
        let first = dispatcher.load_event_handler(Arc::new(Recording::named("test.a")));
        let second = dispatcher.load_event_handler(Arc::new(Recording::named("test.b")));

        let removed = dispatcher.remove_event_handler(second).unwrap();
        assert_eq!(removed.instance_id, second);
        assert_eq!(removed.event_name(), "test.b");
        assert!(dispatcher.get_event_handler(second).is_none());

        // Removing again, or an unknown id, is not found rather than an error
        assert!(dispatcher.remove_event_handler(second).is_none());
        assert!(dispatcher.remove_event_handler(HandlerId(99)).is_none());

        assert_eq!(dispatcher.get_event_handler(first).unwrap().event_name(), "test.a");
    }

    #[test]
    fn test_ids_not_reused_after_remove() {
        let dispatcher = dispatcher();
        let first = dispatcher.load_event_handler(Arc::new(Recording::named("test.a")));
        dispatcher.remove_event_handler(first);
        let second = dispatcher.load_event_handler(Arc::new(Recording::named("test.a")));
        assert!(second > first);
    }

    #[test]
    fn test_enqueue_and_shift_fifo() {
        let dispatcher = dispatcher();
        let a = dispatcher.enqueue_event(Event::new("test.a", json!(1)));
        let b = dispatcher.enqueue_event(Event::new("test.b", json!(2)));
        assert!(b > a);
        assert_eq!(dispatcher.event_queue_count(), 2);

        let first = dispatcher.shift_event().unwrap();
        assert_eq!(first.name(), "test.a");
        assert_eq!(first.queue_id(), Some(a));
        assert_eq!(dispatcher.shift_event().unwrap().queue_id(), Some(b));
        assert!(dispatcher.shift_event().is_none());
        assert_eq!(dispatcher.event_queue_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_to_matching_handlers() {
        let dispatcher = dispatcher();
        let one = Arc::new(Recording::named("test.event_2"));
        let two = Arc::new(Recording::named("test.event_2"));
        let other = Arc::new(Recording::named("test.event_1"));
        dispatcher.load_event_handler(one.clone());
        dispatcher.load_event_handler(two.clone());
        dispatcher.load_event_handler(other.clone());

        let mut rx = dispatcher.subscribe();
        dispatcher.dispatch_event(Event::new("test.event_2", json!(0.5)), None).await;

        assert_eq!(one.dispatched(), vec![json!(0.5)]);
        assert_eq!(two.dispatched(), vec![json!(0.5)]);
        assert!(other.dispatched().is_empty());

        let signals = drain(&mut rx);
        let dispatched = signals
            .iter()
            .filter(|s| matches!(s, DispatcherSignal::Dispatched { .. }))
            .count();
        assert_eq!(dispatched, 2);
    }

    #[tokio::test]
    async fn test_dispatch_to_single_instance() {
        let dispatcher = dispatcher();
        let one = Arc::new(Recording::named("test.event"));
        let two = Arc::new(Recording::named("test.event"));
        dispatcher.load_event_handler(one.clone());
        let two_id = dispatcher.load_event_handler(two.clone());

        dispatcher
            .dispatch_event(Event::new("test.event", json!("x")), Some(two_id))
            .await;

        assert!(one.dispatched().is_empty());
        assert_eq!(two.dispatched(), vec![json!("x")]);
    }

    #[tokio::test]
    async fn test_should_handle_filters_handlers() {
        let dispatcher = dispatcher();
        let picky = Arc::new(Recording {
            only_positive: true,
            ..Recording::named("test.number")
        });
        dispatcher.load_event_handler(picky.clone());

        dispatcher.dispatch_event(Event::new("test.number", json!(-1)), None).await;
        assert!(picky.dispatched().is_empty());

        dispatcher.dispatch_event(Event::new("test.number", json!(3)), None).await;
        assert_eq!(picky.dispatched(), vec![json!(3)]);
    }

    #[tokio::test]
    async fn test_unhandled_event_non_strict_is_silent() {
        let dispatcher = dispatcher();
        let mut rx = dispatcher.subscribe();

        dispatcher.dispatch_event(Event::new("test.nobody", Value::Null), None).await;

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_unhandled_event_strict_reports_once() {
        let dispatcher = strict_dispatcher();
        let mut rx = dispatcher.subscribe();

        dispatcher.dispatch_event(Event::new("test.nobody", Value::Null), None).await;

        let errs = errors(&drain(&mut rx));
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0].as_ref(), DispatchError::Unhandled { .. }));
        assert!(errs[0].to_string().contains("test.nobody"));
    }

    #[tokio::test]
    async fn test_failing_handler_is_isolated() {
        let dispatcher = dispatcher();
        let failing = Arc::new(Recording {
            fail: true,
            ..Recording::named("test.event")
        });
        let healthy = Arc::new(Recording::named("test.event"));
        let failing_id = dispatcher.load_event_handler(failing.clone());
        let healthy_id = dispatcher.load_event_handler(healthy.clone());

        let mut rx = dispatcher.subscribe();
        dispatcher.dispatch_event(Event::new("test.event", json!(7)), None).await;

        assert_eq!(healthy.dispatched(), vec![json!(7)]);

        let signals = drain(&mut rx);
        let errs = errors(&signals);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].handler().unwrap().instance_id, failing_id);
        assert_eq!(errs[0].event().name(), "test.event");
        assert_eq!(errs[0].culprit().unwrap().to_string(), "handler failed");

        let dispatched: Vec<HandlerId> = signals
            .iter()
            .filter_map(|s| match s {
                DispatcherSignal::Dispatched { handler, .. } => Some(handler.instance_id),
                _ => None,
            })
            .collect();
        assert_eq!(dispatched, vec![healthy_id]);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let dispatcher = dispatcher();
        let panicking = Arc::new(Recording {
            panic: true,
            ..Recording::named("test.event")
        });
        let healthy = Arc::new(Recording::named("test.event"));
        dispatcher.load_event_handler(panicking);
        dispatcher.load_event_handler(healthy.clone());

        let mut rx = dispatcher.subscribe();
        dispatcher.dispatch_event(Event::new("test.event", json!(1)), None).await;

        assert_eq!(healthy.dispatched(), vec![json!(1)]);
        let errs = errors(&drain(&mut rx));
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0].as_ref(), DispatchError::Panicked { .. }));
    }

    #[tokio::test]
    async fn test_completion_event_enqueued_once() {
        let dispatcher = dispatcher();
        let chaining = Arc::new(Recording {
            complete: true,
            ..Recording::named("test.event_1")
        });
        dispatcher.load_event_handler(chaining.clone());
        // Same handler type subscribed to the completion name, still chaining
        dispatcher.load_event_handler(Arc::new(Recording {
            complete: true,
            ..Recording::named("test.event_1.complete")
        }));

        dispatcher.enqueue_event(Event::new("test.event_1", json!(42)));
        dispatcher.run().await;

        let complete = dispatcher.shift_event().unwrap();
        assert!(complete.is_completion());
        assert_eq!(complete.name(), "test.event_1.complete");
        assert_eq!(complete.data(), &json!(42));
        assert!(dispatcher.shift_event().is_none());

        dispatcher.enqueue_event(complete);
        dispatcher.run().await;
        assert!(dispatcher.shift_event().is_none());
    }

    #[tokio::test]
    async fn test_transform_applied_before_chaining() {
        let dispatcher = dispatcher();
        dispatcher.load_event_handler(Arc::new(Recording {
            complete: true,
            double: true,
            ..Recording::named("test.number")
        }));

        dispatcher.dispatch_event(Event::new("test.number", json!(21)), None).await;

        let complete = dispatcher.shift_event().unwrap();
        assert_eq!(complete.data(), &json!(42));
    }

    #[tokio::test]
    async fn test_transform_error_is_isolated() {
        let dispatcher = dispatcher();
        dispatcher.load_event_handler(Arc::new(Recording {
            complete: true,
            double: true,
            ..Recording::named("test.number")
        }));
        let mut rx = dispatcher.subscribe();

        dispatcher.dispatch_event(Event::new("test.number", json!("nan")), None).await;

        let errs = errors(&drain(&mut rx));
        assert_eq!(errs.len(), 1);
        assert!(matches!(
            errs[0].as_ref(),
            DispatchError::Handler {
                phase: HandlerPhase::Transform,
                ..
            }
        ));
        assert_eq!(dispatcher.event_queue_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_enqueues_while_dispatching() {
        let dispatcher = dispatcher();
        let handler = Arc::new(Recording {
            follow_up: Some("test.follow_up".to_string()),
            ..Recording::named("test.start")
        });
        let follower = Arc::new(Recording::named("test.follow_up"));
        dispatcher.load_event_handler(handler.clone());
        dispatcher.load_event_handler(follower.clone());

        dispatcher.enqueue_event(Event::new("test.start", json!("payload")));
        dispatcher.run().await;

        // Enqueued mid-drain, so left for the next run
        assert!(follower.dispatched().is_empty());
        assert_eq!(dispatcher.event_queue_count(), 1);

        dispatcher.run().await;
        assert_eq!(follower.dispatched(), vec![json!("payload")]);
        assert_eq!(dispatcher.event_queue_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_follow_ups_wait_for_next_run_on_worker_threads() {
        let dispatcher = dispatcher();
        let handler = Arc::new(Recording {
            follow_up: Some("test.follow_up".to_string()),
            ..Recording::named("test.start")
        });
        let follower = Arc::new(Recording::named("test.follow_up"));
        dispatcher.load_event_handler(handler.clone());
        dispatcher.load_event_handler(follower.clone());

        for n in 0..200 {
            dispatcher.enqueue_event(Event::new("test.start", json!(n)));
        }
        dispatcher.run().await;

        assert_eq!(handler.dispatched().len(), 200);
        assert!(follower.dispatched().is_empty());
        assert_eq!(dispatcher.event_queue_count(), 200);

        dispatcher.run().await;
        assert_eq!(follower.dispatched().len(), 200);
        assert_eq!(dispatcher.event_queue_count(), 0);
    }

    #[tokio::test]
    async fn test_run_drains_queue() {
        let dispatcher = dispatcher();
        let one = Arc::new(Recording::named("test.event_1"));
        let two = Arc::new(Recording::named("test.event_2"));
        dispatcher.load_event_handler(one.clone());
        dispatcher.load_event_handler(two.clone());

        dispatcher.enqueue_event(Event::new("test.to_remove_event", json!(0)));
        dispatcher.enqueue_event(Event::new("test.event_1", json!(1)));
        dispatcher.enqueue_event(Event::new("test.event_2", json!(2)));

        dispatcher.run().await;

        assert_eq!(dispatcher.event_queue_count(), 0);
        assert_eq!(one.dispatched(), vec![json!(1)]);
        assert_eq!(two.dispatched(), vec![json!(2)]);
    }

    #[tokio::test]
    async fn test_revert_calls_revert() {
        let dispatcher = dispatcher();
        let handler = Arc::new(Recording {
            revert: true,
            ..Recording::named("test.event")
        });
        dispatcher.load_event_handler(handler.clone());
        let mut rx = dispatcher.subscribe();

        dispatcher.revert_event(Event::new("test.event", json!(5)), None).await;

        assert_eq!(*handler.reverted.lock().unwrap(), vec![json!(5)]);
        assert!(handler.dispatched().is_empty());
        let signals = drain(&mut rx);
        assert!(matches!(signals.as_slice(), [DispatcherSignal::Reverted { .. }]));
    }

    #[tokio::test]
    async fn test_revert_unsupported_is_isolated() {
        let dispatcher = dispatcher();
        let no_revert = Arc::new(Recording::named("test.event"));
        let with_revert = Arc::new(Recording {
            revert: true,
            ..Recording::named("test.event")
        });
        dispatcher.load_event_handler(no_revert.clone());
        dispatcher.load_event_handler(with_revert.clone());
        let mut rx = dispatcher.subscribe();

        dispatcher.revert_event(Event::new("test.event", json!(1)), None).await;

        assert!(no_revert.reverted.lock().unwrap().is_empty());
        assert_eq!(with_revert.reverted.lock().unwrap().len(), 1);
        let errs = errors(&drain(&mut rx));
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0].as_ref(), DispatchError::RevertUnsupported { .. }));
    }

    #[tokio::test]
    async fn test_revert_does_not_chain_or_defer() {
        let dispatcher = dispatcher();
        dispatcher.load_event_handler(Arc::new(Recording {
            revert: true,
            complete: true,
            defer: Some(DeferDispatch::on_signal("never")),
            ..Recording::named("test.event")
        }));

        tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.revert_event(Event::new("test.event", json!(1)), None),
        )
        .await
        .expect("revert should not wait on the deferral");
        assert_eq!(dispatcher.event_queue_count(), 0);
    }

    #[tokio::test]
    async fn test_deferred_dispatch_waits_for_signal() {
        let dispatcher = dispatcher();
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = checks.clone();
        let deferred = Arc::new(Recording {
            defer: Some(DeferDispatch::new("test_defer", move |payload| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(payload == &json!("go"))
            })),
            ..Recording::named("test.deferred")
        });
        let immediate = Arc::new(Recording::named("test.deferred"));
        dispatcher.load_event_handler(deferred.clone());
        dispatcher.load_event_handler(immediate.clone());

        let pending = dispatcher.dispatch_event(Event::new("test.deferred", json!(9)), None);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(deferred.dispatched().is_empty());
        assert_eq!(immediate.dispatched(), vec![json!(9)]);

        dispatcher.notify("test_defer", json!("wait"));
        dispatcher.notify("test_defer", json!("wait"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(deferred.dispatched().is_empty());
        assert_eq!(checks.load(Ordering::SeqCst), 2);

        dispatcher.notify("test_defer", json!("go"));
        pending.await;

        assert_eq!(deferred.dispatched(), vec![json!(9)]);
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deferral_check_error_is_isolated() {
        let dispatcher = dispatcher();
        let deferred = Arc::new(Recording {
            defer: Some(DeferDispatch::new("test_defer", |_| Err(eyre::eyre!("defer check fail")))),
            ..Recording::named("test.deferred")
        });
        let sibling = Arc::new(Recording::named("test.deferred"));
        let deferred_id = dispatcher.load_event_handler(deferred.clone());
        dispatcher.load_event_handler(sibling.clone());
        let mut rx = dispatcher.subscribe();

        let pending = dispatcher.dispatch_event(Event::new("test.deferred", json!(1)), None);
        dispatcher.notify("test_defer", Value::Null);
        pending.await;

        assert!(deferred.dispatched().is_empty());
        assert_eq!(sibling.dispatched(), vec![json!(1)]);

        let errs = errors(&drain(&mut rx));
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0].as_ref(), DispatchError::Deferral { .. }));
        assert_eq!(errs[0].handler().unwrap().instance_id, deferred_id);
        assert_eq!(errs[0].culprit().unwrap().to_string(), "defer check fail");
    }

    #[tokio::test]
    async fn test_deferral_timeout_is_isolated() {
        let dispatcher = dispatcher();
        dispatcher.load_event_handler(Arc::new(Recording {
            defer: Some(DeferDispatch::on_signal("never").with_timeout(Duration::from_millis(10))),
            ..Recording::named("test.deferred")
        }));
        let mut rx = dispatcher.subscribe();

        dispatcher.dispatch_event(Event::new("test.deferred", Value::Null), None).await;

        let errs = errors(&drain(&mut rx));
        assert_eq!(errs.len(), 1);
        assert!(matches!(
            errs[0].as_ref(),
            DispatchError::Deferral {
                source: DeferralError::TimedOut { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_sink_outlives_dispatcher_safely() {
        let dispatcher = dispatcher();
        let sink = dispatcher.sink();
        assert!(sink.enqueue(Event::new("test.a", Value::Null)).is_some());
        drop(dispatcher);
        assert!(sink.enqueue(Event::new("test.a", Value::Null)).is_none());
    }

    #[tokio::test]
    async fn test_dispatcher_as_run_callback() {
        let dispatcher = dispatcher();
        let handler = Arc::new(Recording::named("test.event"));
        dispatcher.load_event_handler(handler.clone());
        dispatcher.enqueue_event(Event::new("test.event", json!(1)));

        let callback: &dyn RunCallback = &dispatcher;
        callback.run().await.unwrap();

        assert_eq!(handler.dispatched(), vec![json!(1)]);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn queue_ids_strictly_increase(names in proptest::collection::vec("[a-z]{1,8}\\.[a-z]{1,8}", 1..50)) {
                let dispatcher = dispatcher();
                let ids: Vec<QueueId> = names
                    .iter()
                    .map(|name| dispatcher.enqueue_event(Event::new(name.clone(), Value::Null)))
                    .collect();
                prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
            }

            #[test]
            fn shift_preserves_enqueue_order(names in proptest::collection::vec("[a-z]{1,8}", 0..50)) {
                let dispatcher = dispatcher();
                for name in &names {
                    dispatcher.enqueue_event(Event::new(name.clone(), Value::Null));
                }
                let mut shifted = Vec::new();
                while let Some(event) = dispatcher.shift_event() {
                    shifted.push(event.name().to_string());
                }
                prop_assert_eq!(shifted, names);
                prop_assert!(dispatcher.shift_event().is_none());
            }
        }
    }
}
