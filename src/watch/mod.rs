//! Batched, serialized change notification over a set of signallers.
//!
//! `watch` subscribes a handler to several sources. Every time one of them flushes, it is added
//! to the subscription's changed set (insertion-ordered, deduplicated), and a drain is deferred.
//! The drain hands the whole set to the handler at once. A subscription never runs two
//! invocations at the same time: reports arriving while the handler runs (or is suspended) are
//! kept for the next invocation, which starts as soon as the current one completes.

use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;

use crate::signals::Source;

pub(crate) mod subscription;

use self::subscription::{Invocation, Subscription};


///////////////////////////////////////////////////////////////////////////////////////////////////
// IDENTITY & STATE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Process-unique identity of a watch subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl WatchId {
  pub(crate) fn next() -> Self {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    WatchId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for WatchId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "w{}", self.0)
  }
}

/// Scheduling state of a watch subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchState {
  /// Nothing reported since the last invocation.
  Idle,
  /// A drain is deferred.
  Scheduled,
  /// The handler runs, or is suspended, with nothing reported since it started.
  Running,
  /// The handler runs, or is suspended, and sources reported since it started.
  RunningWithPending,
  /// Inert. Terminal.
  Stopped
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// OUTCOME
///////////////////////////////////////////////////////////////////////////////////////////////////

/// What a handler may return: nothing, or a result whose error is reported to the scheduler.
pub trait Outcome {
  fn into_result(self) -> anyhow::Result<()>;
}

impl Outcome for () {
  fn into_result(self) -> anyhow::Result<()> {
    Ok(())
  }
}

impl<E> Outcome for Result<(), E>
where
  E: Into<anyhow::Error>
{
  fn into_result(self) -> anyhow::Result<()> {
    self.map_err(Into::into)
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// WATCH
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Watches `sources` with a synchronous `handler`, called with the sources that flushed since
/// its previous invocation, in the order they first flushed.
pub fn watch<I, F, O>(sources: I, mut handler: F) -> Watch
where
  I: IntoIterator<Item = Source>,
  F: FnMut(Vec<Source>) -> O + 'static,
  O: Outcome
{
  Watch::new(sources, Box::new(move |changed| Invocation::Ready(handler(changed).into_result())))
}

/// Watches `sources` with an asynchronous `handler`.
///
/// The handler itself is called synchronously by the drain; the future it returns is then
/// spawned on the scheduler, and must complete before the handler is called again.
pub fn watch_async<I, F, Fut>(sources: I, mut handler: F) -> Watch
where
  I: IntoIterator<Item = Source>,
  F: FnMut(Vec<Source>) -> Fut + 'static,
  Fut: Future + 'static,
  Fut::Output: Outcome
{
  Watch::new(sources, Box::new(move |changed| {
    let future = handler(changed);
    Invocation::Suspended(async move { future.await.into_result() }.boxed_local())
  }))
}


/// A running `watch` subscription. Dropping it stops the subscription.
#[must_use = "dropping a `Watch` stops it"]
pub struct Watch {
  subscription: Rc<Subscription>
}


impl Watch {
  fn new<I>(sources: I, handler: subscription::Handler) -> Self
  where
    I: IntoIterator<Item = Source>
  {
    Watch { subscription: Subscription::new(sources.into_iter().collect(), handler) }
  }

  pub fn id(&self) -> WatchId {
    self.subscription.id()
  }

  pub fn state(&self) -> WatchState {
    self.subscription.state()
  }

  pub fn is_stopped(&self) -> bool {
    self.state() == WatchState::Stopped
  }

  /// Stops the subscription: no invocation starts after this call returns. Idempotent.
  pub fn stop(&self) {
    self.subscription.stop();
  }

  /// Returns a clonable handle stopping this subscription, usable from inside its handler.
  pub fn stop_handle(&self) -> StopHandle {
    StopHandle { subscription: Rc::downgrade(&self.subscription) }
  }
}


impl Drop for Watch {
  fn drop(&mut self) {
    self.subscription.stop();
  }
}


impl fmt::Debug for Watch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Watch").field("id", &self.id()).field("state", &self.state()).finish()
  }
}


/// Weak stop operation of a `Watch`.
#[derive(Clone)]
pub struct StopHandle {
  subscription: Weak<Subscription>
}


impl StopHandle {
  /// Stops the subscription, if it still exists. Idempotent.
  pub fn stop(&self) {
    if let Some(subscription) = self.subscription.upgrade() {
      subscription.stop();
    }
  }

  pub fn is_stopped(&self) -> bool {
    self.subscription
      .upgrade()
      .map_or(true, |subscription| subscription.state() == WatchState::Stopped)
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
