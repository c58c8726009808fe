//! Signal Bus - typed pub/sub for component lifecycle signals
//!
//! Every component that reports out-of-band activity (task runners, the event
//! dispatcher) owns a `SignalBus` parameterized by its own closed signal enum.
//! Consumers (loggers, deferral waiters, tests) subscribe to the bus.

use tokio::sync::broadcast;
use tracing::debug;

/// Default channel capacity (signals)
pub const DEFAULT_SIGNAL_CAPACITY: usize = 1024;

/// Broadcast bus for one component's signal vocabulary
///
/// Cloning the bus yields another handle to the same channel.
#[derive(Debug)]
pub struct SignalBus<S> {
    tx: broadcast::Sender<S>,
}

impl<S: Clone + Send + 'static> SignalBus<S> {
    /// Create a new signal bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "SignalBus::new: creating signal bus");
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Create a new signal bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_SIGNAL_CAPACITY)
    }

    /// Emit a signal to all subscribers
    ///
    /// Fire-and-forget: if there are no subscribers the signal is dropped.
    pub fn emit(&self, signal: S) {
        // No subscribers is OK
        let _ = self.tx.send(signal);
    }

    /// Subscribe to receive signals
    ///
    /// Signals emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<S> {
        self.tx.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<S> Clone for SignalBus<S> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<S: Clone + Send + 'static> Default for SignalBus<S> {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
