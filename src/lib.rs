//! `signaller` is a small reactive library built around a single primitive: a value that
//! announces its own changes.
//!
//! A `Signaller` holds a value and a list of callbacks. Mutating it does not notify anybody right
//! away: notification (a *flush*) is deferred to a later step of the runtime, and all mutations
//! made in the meantime coalesce into one flush. On top of that, `watch` subscribes a handler to
//! several signallers at once, and calls it with the batch of those which changed, never running
//! two invocations of the same handler at the same time.
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use signaller::{watch, Runtime, Signaller};
//!
//! let runtime = Runtime::new();
//! let width   = Signaller::new(&runtime.handle(), 1);
//! let height  = Signaller::new(&runtime.handle(), 1);
//!
//! let areas   = Rc::new(RefCell::new(Vec::new()));
//! let areas_2 = areas.clone();
//! let (width_2, height_2) = (width.clone(), height.clone());
//!
//! let _watch = watch([width.source(), height.source()], move |_| {
//!   areas_2.borrow_mut().push(width_2.get() * height_2.get());
//! });
//!
//! width.assign(4).unwrap();
//! height.assign(3).unwrap();
//! runtime.execute().unwrap();
//!
//! assert_eq!(*areas.borrow(), vec![12]);
//! ```


/// **A continuation is a deferred piece of work.**
///
/// Anything that can be called once, with no argument, is a continuation. Boxed continuations
/// (`Task`) are what the runtime queues and what signallers defer their flushes as.
pub mod continuations;

/// **Configuration of a runtime.**
pub mod config;

/// **Errors returned by this library.**
///
/// Misuse of a signaller is reported as an `InvariantViolation`, runtime termination issues as
/// `Error::Stalled` and `Error::TurnLimit`, and failures of watch handlers as `HandlerFailure`,
/// which never abort the runtime.
pub mod errors;

/// **A runtime is an environment for running deferred work.**
///
/// Work is deferred through the `Scheduler` trait, in one of two phases: `Propagate`, for
/// signaller flushes, and `React`, for watch drains and futures. Every ready `Propagate` task runs
/// before the next `React` step, so that a batch of flushes is always complete before handlers
/// observe it.
///
/// The runtime also discretizes time into *turns*. Futures awaiting `Handle::next_turn` resume
/// at the following turn boundary, one after the other, with all the work they trigger ran to
/// completion in between. The `turn` method runs a single turn, while `execute` runs turns
/// until there is no more work to do.
pub mod runtime;

/// **Signallers are values announcing their own changes.**
///
/// A signaller is parameterized by a mutation policy, chosen at construction and fixed by its
/// type:
///
/// * `OnChange` signallers offer `assign`, which only notifies when the new value differs from
///   the current one;
/// * `Always` signallers offer `set`, which notifies on every write.
///
/// Both can be mutated in place with `modify`, or woken without any change with `signal`.
pub mod signals;

/// **Watches are batched, serialized subscriptions to several signallers.**
///
/// `watch` takes a synchronous handler, `watch_async` one returning a future. The returned
/// `Watch` stops the subscription when dropped.
pub mod watch;

#[cfg(test)]
mod test_utils;


pub use crate::config::RuntimeConfig;
pub use crate::errors::{Error, HandlerFailure, InvariantViolation, Result};
pub use crate::runtime::{Handle, Phase, Runtime, Scheduler};
pub use crate::signals::{Always, Callback, OnChange, Signaller, SignallerId, Source};
pub use crate::watch::{watch, watch_async, Outcome, StopHandle, Watch, WatchId, WatchState};
