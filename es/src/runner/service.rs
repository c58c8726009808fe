//! TaskRunner - drives a run callback repeatedly until stopped or failed

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use eyre::{Result, eyre};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::callback::{RunCallback, StopCallback};
use super::config::RunnerConfig;
use crate::signal::SignalBus;

/// Everything a `TaskRunner` reports on its signal bus
#[derive(Clone, Debug)]
pub enum RunnerSignal {
    /// A start cycle began
    Started { service: String },
    /// The loop ended and the stop callback completed
    Stopped { service: String, iterations: u64 },
    /// The run callback failed; the cycle ends without retrying
    Error { service: String, error: Arc<eyre::Report> },
}

/// Flags shared between the runner handle and its loop task
#[derive(Default)]
struct RunState {
    /// Desired running state; cleared by `stop()`
    run_flag: AtomicBool,
    /// Actual running state; set between `Started` and `Stopped`
    run_status: AtomicBool,
    /// Total iterations started, across cycles
    run_count: AtomicU64,
    /// Iteration cap (0 = unbounded)
    stop_on_run: AtomicU64,
    /// Wakes a loop sleeping out its minimum interval
    wake: Notify,
}

impl RunState {
    fn should_run(&self) -> bool {
        let cap = self.stop_on_run.load(Ordering::SeqCst);
        if cap != 0 && self.run_count.load(Ordering::SeqCst) >= cap {
            return false;
        }
        self.run_flag.load(Ordering::SeqCst)
    }
}

/// Runs a callback repeatedly, forever or once, until stopped or it fails
///
/// A run-callback error is terminal for the cycle: it is reported as
/// [`RunnerSignal::Error`], the stop callback runs, and a fresh `start()` is
/// needed to run again.
pub struct TaskRunner {
    name: String,
    run: Arc<dyn RunCallback>,
    stop: Option<Arc<dyn StopCallback>>,
    min_interval: Option<Duration>,
    state: Arc<RunState>,
    signals: SignalBus<RunnerSignal>,
}

/// Completion handle for one start cycle
#[derive(Debug)]
pub struct RunHandle {
    service: String,
    task: JoinHandle<Result<()>>,
}

impl RunHandle {
    /// Wait until the loop has fully stopped
    ///
    /// Run-callback errors are reported as signals, not returned here; only a
    /// failing stop callback makes this an error.
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(join_err) => Err(eyre!("{} service task failed: {}", self.service, join_err)),
        }
    }
}

impl TaskRunner {
    /// Create a runner for `run`
    pub fn new(name: impl Into<String>, run: Arc<dyn RunCallback>) -> Self {
        let name = name.into();
        debug!(%name, "TaskRunner::new: called");
        Self {
            name,
            run,
            stop: None,
            min_interval: None,
            state: Arc::new(RunState::default()),
            signals: SignalBus::with_default_capacity(),
        }
    }

    /// Set the callback invoked when the loop ends
    pub fn with_stop(mut self, stop: Arc<dyn StopCallback>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Apply cadence settings
    pub fn with_config(mut self, config: &RunnerConfig) -> Self {
        self.min_interval = config.min_interval();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True between the `Started` and `Stopped` signals of a cycle
    pub fn is_running(&self) -> bool {
        self.state.run_status.load(Ordering::SeqCst)
    }

    /// Total iterations started across all cycles
    pub fn run_count(&self) -> u64 {
        self.state.run_count.load(Ordering::SeqCst)
    }

    /// Subscribe to started, stopped and error signals
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerSignal> {
        self.signals.subscribe()
    }

    /// Begin running the callback
    ///
    /// Returns `None` if a cycle is already running. With `run_once`, the
    /// callback runs exactly one more time.
    pub fn start(&self, run_once: bool) -> Option<RunHandle> {
        debug!(service = %self.name, run_once, "TaskRunner::start: called");
        if self.state.run_status.swap(true, Ordering::SeqCst) {
            debug!(service = %self.name, "TaskRunner::start: already running");
            return None;
        }

        self.state.run_flag.store(true, Ordering::SeqCst);
        if run_once {
            let cap = self.state.run_count.load(Ordering::SeqCst) + 1;
            self.state.stop_on_run.store(cap, Ordering::SeqCst);
        }

        info!(service = %self.name, run_once, "Service started");
        self.signals.emit(RunnerSignal::Started {
            service: self.name.clone(),
        });

        let cycle = RunCycle {
            name: self.name.clone(),
            run: self.run.clone(),
            stop: self.stop.clone(),
            min_interval: self.min_interval,
            state: self.state.clone(),
            signals: self.signals.clone(),
        };
        Some(RunHandle {
            service: self.name.clone(),
            task: tokio::spawn(cycle.run()),
        })
    }

    /// Prevent the next iteration from starting
    ///
    /// An in-flight iteration is allowed to finish.
    pub fn stop(&self) {
        debug!(service = %self.name, "TaskRunner::stop: called");
        self.state.run_flag.store(false, Ordering::SeqCst);
        self.state.wake.notify_waiters();
    }
}

/// Everything one start cycle's loop task needs
struct RunCycle {
    name: String,
    run: Arc<dyn RunCallback>,
    stop: Option<Arc<dyn StopCallback>>,
    min_interval: Option<Duration>,
    state: Arc<RunState>,
    signals: SignalBus<RunnerSignal>,
}

impl RunCycle {
    async fn run(self) -> Result<()> {
        if let Err(err) = self.iterate().await {
            error!(service = %self.name, error = ?err, "Service error");
            self.signals.emit(RunnerSignal::Error {
                service: self.name.clone(),
                error: Arc::new(err),
            });
        }

        let stopped = match &self.stop {
            Some(stop) => stop.stop().await,
            None => Ok(()),
        };

        // Reset even when the stop callback failed, so the runner can restart.
        // run_status goes last: once it is clear, a new start() owns the flags.
        self.state.stop_on_run.store(0, Ordering::SeqCst);
        self.state.run_flag.store(false, Ordering::SeqCst);
        self.state.run_status.store(false, Ordering::SeqCst);

        let iterations = self.state.run_count.load(Ordering::SeqCst);
        info!(service = %self.name, iterations, "Service stopped");
        self.signals.emit(RunnerSignal::Stopped {
            service: self.name.clone(),
            iterations,
        });
        stopped
    }

    async fn iterate(&self) -> Result<()> {
        loop {
            // Each check is a fresh scheduling step; never recurse
            tokio::task::yield_now().await;
            if !self.state.should_run() {
                return Ok(());
            }

            let iteration = self.state.run_count.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(service = %self.name, iteration, "TaskRunner: iteration started");
            let started = Instant::now();

            // Own task so a panicking callback ends the cycle like an error
            let run = self.run.clone();
            match tokio::spawn(async move { run.run().await }).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(join_err) => return Err(eyre!("run callback panicked: {}", join_err)),
            }

            if let Some(min_interval) = self.min_interval {
                self.pace(min_interval.saturating_sub(started.elapsed())).await;
            }
        }
    }

    /// Sleep out the rest of the interval unless stopped meanwhile
    async fn pace(&self, remaining: Duration) {
        if remaining.is_zero() {
            return;
        }
        let woken = self.state.wake.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();
        if !self.state.should_run() {
            return;
        }
        debug!(service = %self.name, ?remaining, "TaskRunner: waiting for next iteration");
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = woken => {}
        }
    }
}
