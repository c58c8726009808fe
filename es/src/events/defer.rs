//! Deferred dispatch - gate a handler on an external condition
//!
//! A handler that declares a [`DeferDispatch`] is not dispatched until the
//! dispatcher raises a `Notify` signal with the declared name and the check
//! function accepts that signal's payload.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::error::DeferralError;
use super::signals::DispatcherSignal;
use crate::signal::SignalBus;

/// Check function evaluated against each matching signal payload
pub type CheckFn = Arc<dyn Fn(Value) -> BoxFuture<'static, eyre::Result<bool>> + Send + Sync>;

/// Declares the condition a handler's dispatch waits on
#[derive(Clone)]
pub struct DeferDispatch {
    pub signal_name: String,
    pub check: CheckFn,
    /// Give up waiting after this long; wait forever when unset
    pub timeout: Option<Duration>,
}

impl DeferDispatch {
    /// Defer on `signal_name` with a synchronous check
    pub fn new<F>(signal_name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value) -> eyre::Result<bool> + Send + Sync + 'static,
    {
        let check = Arc::new(check);
        Self {
            signal_name: signal_name.into(),
            check: Arc::new(move |payload: Value| -> BoxFuture<'static, eyre::Result<bool>> {
                let check = check.clone();
                Box::pin(async move { check(&payload) })
            }),
            timeout: None,
        }
    }

    /// Defer on `signal_name` with an asynchronous check
    pub fn new_async<F, Fut>(signal_name: impl Into<String>, check: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<bool>> + Send + 'static,
    {
        Self {
            signal_name: signal_name.into(),
            check: Arc::new(move |payload: Value| -> BoxFuture<'static, eyre::Result<bool>> {
                Box::pin(check(payload))
            }),
            timeout: None,
        }
    }

    /// Defer until `signal_name` fires at all
    pub fn on_signal(signal_name: impl Into<String>) -> Self {
        Self::new(signal_name, |_| Ok(true))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for DeferDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferDispatch")
            .field("signal_name", &self.signal_name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Wait until `defer.signal_name` fires with a payload the check accepts
///
/// The subscription is taken before this function returns, so signals raised
/// after the call are observed even if the returned future is polled later.
pub fn defer_on_signal(
    defer: &DeferDispatch,
    signals: &SignalBus<DispatcherSignal>,
) -> impl Future<Output = Result<(), DeferralError>> + Send + 'static {
    debug!(signal = %defer.signal_name, "defer_on_signal: called");
    let mut rx = signals.subscribe();
    let signal = defer.signal_name.clone();
    let check = defer.check.clone();
    let timeout = defer.timeout;

    async move {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(DispatcherSignal::Notify { name, payload }) if name == signal => {
                        debug!(%signal, "defer_on_signal: signal fired, running check");
                        match check(payload).await {
                            Ok(true) => return Ok(()),
                            Ok(false) => debug!(%signal, "defer_on_signal: check declined, waiting"),
                            Err(culprit) => {
                                return Err(DeferralError::Check {
                                    signal: signal.clone(),
                                    culprit,
                                });
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(%signal, missed = n, "defer_on_signal: lagged behind, missed signals");
                    }
                    Err(RecvError::Closed) => {
                        return Err(DeferralError::Closed { signal: signal.clone() });
                    }
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .unwrap_or_else(|_| {
                    Err(DeferralError::TimedOut {
                        signal: signal.clone(),
                        timeout: limit,
                    })
                }),
            None => wait.await,
        }
    }
}
