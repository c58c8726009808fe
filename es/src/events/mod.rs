//! Event dispatch engine
//!
//! Producers (collectors, handlers, external callers) enqueue [`Event`]s into
//! an [`EventDispatcher`]. Draining the queue matches each event against the
//! loaded [`EventHandler`]s by name and predicate, waits on any declared
//! [`DeferDispatch`] condition, dispatches, and optionally chains a
//! completion event carrying the (transformed) result.
//!
//! ```text
//!   enqueue_event ──▶ queue ──▶ run() ──▶ dispatch_event ─┬─▶ handler A ─▶ Dispatched
//!                       ▲                                 ├─▶ handler B ─▶ Error (isolated)
//!                       │                                 └─▶ handler C ─▶ (deferred) ─▶ Dispatched
//!                       └──────── <name>.complete ◀───────────────┘
//! ```
//!
//! Failures never reject a dispatch; every per-handler failure is converted
//! into a [`DispatcherSignal::Error`] on the dispatcher's signal bus.

mod defer;
mod dispatcher;
mod error;
mod event;
mod handler;
mod signals;

pub use defer::{CheckFn, DeferDispatch, defer_on_signal};
pub use dispatcher::{EventDispatcher, EventSink};
pub use error::{DeferralError, DispatchError, HandlerPhase};
pub use event::{COMPLETE_SUFFIX, Event, QueueId};
pub use handler::{EventHandler, HandlerId, LoadedHandler};
pub use signals::DispatcherSignal;
