//! Dispatch error types

use std::time::Duration;

use thiserror::Error;

use super::event::Event;
use super::handler::LoadedHandler;

/// Which handler operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPhase {
    Dispatch,
    Transform,
    Revert,
}

impl std::fmt::Display for HandlerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerPhase::Dispatch => write!(f, "dispatch"),
            HandlerPhase::Transform => write!(f, "transform"),
            HandlerPhase::Revert => write!(f, "revert"),
        }
    }
}

/// Errors that can occur while a deferred dispatch waits for its condition
#[derive(Debug, Error)]
pub enum DeferralError {
    #[error("Deferral check for signal '{signal}' failed: {culprit}")]
    Check { signal: String, culprit: eyre::Report },

    #[error("Deferral on signal '{signal}' timed out after {timeout:?}")]
    TimedOut { signal: String, timeout: Duration },

    #[error("Signal bus closed while waiting on '{signal}'")]
    Closed { signal: String },
}

impl DeferralError {
    /// The underlying check-function error, if that is what failed
    pub fn culprit(&self) -> Option<&eyre::Report> {
        match self {
            DeferralError::Check { culprit, .. } => Some(culprit),
            _ => None,
        }
    }
}

/// Errors reported through the dispatcher's error signal
///
/// None of these abort a dispatch; each is isolated to one handler (or, for
/// `Unhandled`, to one event).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{handler} failed during {phase} of event {event}: {culprit}")]
    Handler {
        phase: HandlerPhase,
        event: Event,
        handler: LoadedHandler,
        culprit: eyre::Report,
    },

    #[error("{handler} deferral failed for event {event}: {source}")]
    Deferral {
        event: Event,
        handler: LoadedHandler,
        #[source]
        source: DeferralError,
    },

    #[error("{handler} does not support revert (event {event})")]
    RevertUnsupported { event: Event, handler: LoadedHandler },

    #[error("{handler} panicked while handling event {event}")]
    Panicked { event: Event, handler: LoadedHandler },

    #[error("No handlers found for event {}.", .event.name())]
    Unhandled { event: Event },
}

impl DispatchError {
    /// The event being handled when the error occurred
    pub fn event(&self) -> &Event {
        match self {
            DispatchError::Handler { event, .. }
            | DispatchError::Deferral { event, .. }
            | DispatchError::RevertUnsupported { event, .. }
            | DispatchError::Panicked { event, .. }
            | DispatchError::Unhandled { event } => event,
        }
    }

    /// The handler that failed, if the error is tied to one
    pub fn handler(&self) -> Option<&LoadedHandler> {
        match self {
            DispatchError::Handler { handler, .. }
            | DispatchError::Deferral { handler, .. }
            | DispatchError::RevertUnsupported { handler, .. }
            | DispatchError::Panicked { handler, .. } => Some(handler),
            DispatchError::Unhandled { .. } => None,
        }
    }

    /// The root cause raised by handler code, if any
    pub fn culprit(&self) -> Option<&eyre::Report> {
        match self {
            DispatchError::Handler { culprit, .. } => Some(culprit),
            DispatchError::Deferral { source, .. } => source.culprit(),
            _ => None,
        }
    }
}
