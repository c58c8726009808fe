//! Application context - wires config, plugins, dispatcher and services

use std::sync::Arc;

use eyre::{Result, eyre};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{CollectorConfig, Config, HandlerConfig};
use crate::events::{DispatcherSignal, EventDispatcher, EventHandler, HandlerId};
use crate::plugin::{Collector, CollectorService, PluginRegistry, notify_collected};
use crate::runner::{Retry, RunCallback, RunHandle, RunnerConfig, RunnerSignal, TaskRunner};

/// Name of the task runner draining the dispatcher queue
pub const DISPATCHER_SERVICE: &str = "dispatcher";

/// Upper bound on drains in `run_once`, in case handlers keep enqueueing
const MAX_ONCE_DRAINS: usize = 64;

/// Owns everything a running EventSync instance needs
///
/// Must be created inside a tokio runtime; signal watchers are spawned
/// immediately and aborted on drop.
pub struct App {
    config: Config,
    registry: PluginRegistry,
    dispatcher: EventDispatcher,
    dispatcher_runner: TaskRunner,
    dispatcher_handle: Option<RunHandle>,
    collectors: Vec<CollectorEntry>,
    collector_handles: Vec<RunHandle>,
    watchers: Vec<JoinHandle<()>>,
}

struct CollectorEntry {
    model: String,
    runner: TaskRunner,
}

impl App {
    pub fn new(config: Config, registry: PluginRegistry) -> Self {
        debug!("App::new: called");
        let dispatcher = EventDispatcher::new(config.dispatcher.clone());
        let dispatcher_runner = TaskRunner::new(DISPATCHER_SERVICE, Arc::new(dispatcher.clone()))
            .with_config(&config.dispatcher.runner_config());

        let watchers = vec![
            tokio::spawn(watch_dispatcher(dispatcher.subscribe())),
            tokio::spawn(watch_runner(dispatcher_runner.subscribe())),
        ];

        Self {
            config,
            registry,
            dispatcher,
            dispatcher_runner,
            dispatcher_handle: None,
            collectors: Vec::new(),
            collector_handles: Vec::new(),
            watchers,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Names of all services, dispatcher first
    pub fn services(&self) -> Vec<&str> {
        std::iter::once(self.dispatcher_runner.name())
            .chain(self.collectors.iter().map(|c| c.runner.name()))
            .collect()
    }

    /// Create a collector from the registry and give it its own service
    pub fn load_collector(&mut self, config: &CollectorConfig) -> Result<()> {
        debug!(plugin = %config.plugin, collector = %config.collector, model = %config.model, "App::load_collector: called");
        let collector = self.registry.create_collector(config)?;
        self.add_collector(&config.model, collector, &config.service)
    }

    /// Run an already-built collector as a service for `model`
    pub fn add_collector(&mut self, model: &str, collector: Arc<dyn Collector>, service: &RunnerConfig) -> Result<()> {
        if self.collectors.iter().any(|c| c.model == model) {
            return Err(eyre!("A collector for model '{}' is already loaded", model));
        }

        let collector = Arc::new(CollectorService::new(model, collector, self.dispatcher.clone()));
        let run: Arc<dyn RunCallback> = if service.retries_enabled() {
            Arc::new(Retry::from_config(collector.clone(), service))
        } else {
            collector.clone()
        };
        let runner = TaskRunner::new(format!("collector:{}", model), run)
            .with_stop(collector)
            .with_config(service);

        self.watchers.push(tokio::spawn(watch_runner(runner.subscribe())));
        info!(service = %runner.name(), "Collector loaded");
        self.collectors.push(CollectorEntry {
            model: model.to_string(),
            runner,
        });
        Ok(())
    }

    /// Create an event handler from the registry and load it
    pub fn load_event_handler(&self, config: &HandlerConfig) -> Result<HandlerId> {
        debug!(plugin = %config.plugin, handler = %config.handler, "App::load_event_handler: called");
        let handler = self.registry.create_event_handler(config)?;
        Ok(self.add_event_handler(handler))
    }

    /// Load an already-built event handler
    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let event = handler.event_name().to_string();
        let id = self.dispatcher.load_event_handler(handler);
        info!(%event, handler = %id, "Event handler loaded");
        id
    }

    /// Load every collector and event handler the config names
    pub fn load_from_config(&mut self) -> Result<()> {
        debug!("App::load_from_config: called");
        for config in self.config.event_handlers.clone() {
            self.load_event_handler(&config)?;
        }
        for config in self.config.collectors.clone() {
            self.load_collector(&config)?;
        }
        Ok(())
    }

    /// Start the dispatcher and every collector service
    pub fn start(&mut self) {
        debug!("App::start: called");
        match self.dispatcher_runner.start(false) {
            Some(handle) => self.dispatcher_handle = Some(handle),
            None => warn!(service = %self.dispatcher_runner.name(), "Service already running"),
        }
        for entry in &self.collectors {
            match entry.runner.start(false) {
                Some(handle) => self.collector_handles.push(handle),
                None => warn!(service = %entry.runner.name(), "Service already running"),
            }
        }
    }

    /// Ask every service to stop after its current iteration
    pub fn stop(&self) {
        debug!("App::stop: called");
        for entry in &self.collectors {
            entry.runner.stop();
        }
        self.dispatcher_runner.stop();
    }

    /// Wait for every started service to finish
    ///
    /// All services are awaited; the first stop failure is returned.
    pub async fn wait(&mut self) -> Result<()> {
        debug!("App::wait: called");
        let mut first_err = self.wait_collectors().await.err();
        if let Some(handle) = self.dispatcher_handle.take() {
            if let Err(e) = handle.wait().await {
                error!(error = %e, "Service failed to stop cleanly");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop all services, wait for them and dispatch what is still queued
    ///
    /// Collectors stop first. Handlers deferred on a collector's completed
    /// poll are then released, since no further poll will raise it. Whatever
    /// still waits after `drain-timeout-ms` is reported and left behind.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down");
        for entry in &self.collectors {
            entry.runner.stop();
        }
        let mut first_err = self.wait_collectors().await.err();

        let collected: Vec<String> = self
            .collectors
            .iter()
            .filter(|c| c.runner.run_count() > 0)
            .map(|c| c.model.clone())
            .collect();

        self.dispatcher_runner.stop();
        if let Some(handle) = self.dispatcher_handle.take() {
            self.raise_collected(&collected);
            let limit = self.config.dispatcher.drain_timeout();
            match tokio::time::timeout(limit, handle.wait()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Service failed to stop cleanly");
                    first_err.get_or_insert(e);
                }
                Err(_) => warn!(?limit, "Dispatcher did not stop in time; deferred handlers left waiting"),
            }
        }

        if self.dispatcher.event_queue_count() > 0 {
            info!(count = self.dispatcher.event_queue_count(), "Dispatching remaining events");
            if let Err(e) = self.drain(&collected).await {
                warn!(error = %e, "Remaining events did not settle");
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Poll every collector once, then drain until the queue is empty
    ///
    /// Every collector is polled even if one fails; the first failure is
    /// returned after draining. Handlers deferred on `complete.<model>` see
    /// that signal for every model polled successfully in this pass.
    pub async fn run_once(&mut self) -> Result<()> {
        debug!("App::run_once: called");
        let mut first_err = None;
        let mut collected = Vec::new();
        for entry in &self.collectors {
            match run_service_once(&entry.runner).await {
                Ok(()) => collected.push(entry.model.clone()),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        let mut drains = 0;
        while self.dispatcher.event_queue_count() > 0 {
            if drains == MAX_ONCE_DRAINS {
                warn!(
                    remaining = self.dispatcher.event_queue_count(),
                    "Events still queued after {} drains",
                    MAX_ONCE_DRAINS
                );
                break;
            }
            if let Err(e) = self.drain(&collected).await {
                first_err.get_or_insert(e);
                break;
            }
            drains += 1;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn wait_collectors(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in self.collector_handles.drain(..) {
            if let Err(e) = handle.wait().await {
                error!(error = %e, "Service failed to stop cleanly");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn raise_collected(&self, models: &[String]) {
        for model in models {
            notify_collected(&self.dispatcher, model);
        }
    }

    /// Dispatch the queue once, bounded by `drain-timeout-ms`
    ///
    /// Deferral waiters subscribe when the drain is taken, so the completed
    /// polls in `collected` are raised again right after for them to see.
    async fn drain(&self, collected: &[String]) -> Result<()> {
        let pending = self.dispatcher.run();
        self.raise_collected(collected);
        let limit = self.config.dispatcher.drain_timeout();
        tokio::time::timeout(limit, pending).await.map_err(|_| {
            eyre!(
                "Queued events did not settle within {:?}; deferred handlers are still waiting",
                limit
            )
        })
    }
}

impl Drop for App {
    fn drop(&mut self) {
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}

/// Run a service for exactly one iteration, surfacing its error if it failed
async fn run_service_once(runner: &TaskRunner) -> Result<()> {
    let mut rx = runner.subscribe();
    let handle = runner
        .start(true)
        .ok_or_else(|| eyre!("{} service is already running", runner.name()))?;
    handle.wait().await?;
    while let Ok(signal) = rx.try_recv() {
        if let RunnerSignal::Error { service, error } = signal {
            return Err(eyre!("{} service failed: {}", service, error));
        }
    }
    Ok(())
}

async fn watch_dispatcher(mut rx: broadcast::Receiver<DispatcherSignal>) {
    loop {
        match rx.recv().await {
            Ok(DispatcherSignal::Dispatched { event, handler }) => {
                debug!(%event, %handler, "Event dispatched");
            }
            Ok(DispatcherSignal::Reverted { event, handler }) => {
                info!(%event, %handler, "Event reverted");
            }
            Ok(DispatcherSignal::Error(err)) => match err.culprit() {
                Some(culprit) => error!(error = %err, culprit = ?culprit, "Event handler error"),
                None => error!(error = %err, "Event handler error"),
            },
            Ok(DispatcherSignal::Notify { name, .. }) => {
                debug!(%name, "Condition raised");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "Dispatcher watcher lagged behind, missed signals");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Dispatcher watcher: channel closed, shutting down");
                break;
            }
        }
    }
}

async fn watch_runner(mut rx: broadcast::Receiver<RunnerSignal>) {
    loop {
        match rx.recv().await {
            Ok(RunnerSignal::Started { service }) => debug!(%service, "Runner signal: started"),
            Ok(RunnerSignal::Stopped { service, iterations }) => {
                debug!(%service, iterations, "Runner signal: stopped");
            }
            Ok(RunnerSignal::Error { service, error }) => {
                debug!(%service, error = %error, "Runner signal: error");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "Runner watcher lagged behind, missed signals");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
