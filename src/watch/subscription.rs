use std::cell::{Cell, RefCell};
use std::mem;
use std::rc::{Rc, Weak};
use std::thread;

use futures::future::LocalBoxFuture;
use indexmap::IndexMap;
use tracing::{trace, warn};

use crate::errors::HandlerFailure;
use crate::runtime::{Phase, Scheduler};
use crate::signals::source::{Node, Watcher};
use crate::signals::{SignallerId, Source};
use crate::watch::{WatchId, WatchState};


/// What a type-erased handler gives back when invoked.
pub(crate) enum Invocation {
  /// The handler ran to completion.
  Ready(anyhow::Result<()>),
  /// The handler suspended: the future must complete before the next invocation.
  Suspended(LocalBoxFuture<'static, anyhow::Result<()>>)
}

pub(crate) type Handler = Box<dyn FnMut(Vec<Source>) -> Invocation>;

/// How to proceed once an invocation completed with reports pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resume {
  /// Defer a new drain (synchronous handlers).
  Deferred,
  /// Drain right away (suspended handlers, whose completion already is a later step).
  Immediate
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// SUBSCRIPTION
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Batching and serialization state of one `watch` call.
pub(crate) struct Subscription {
  id       : WatchId,
  me       : Weak<Subscription>,
  state    : Cell<WatchState>,
  pending  : RefCell<IndexMap<SignallerId, Source>>,
  handler  : RefCell<Option<Handler>>,
  sources  : RefCell<Vec<Weak<dyn Node>>>,
  scheduler: RefCell<Option<Rc<dyn Scheduler>>>
}


impl Subscription {
  /// Creates a subscription and attaches it to every source, duplicates included.
  pub(crate) fn new(sources: Vec<Source>, handler: Handler) -> Rc<Self> {
    let id = WatchId::next();

    let subscription = Rc::new_cyclic(|me| Subscription {
      id,
      me       : me.clone(),
      state    : Cell::new(WatchState::Idle),
      pending  : RefCell::new(IndexMap::new()),
      handler  : RefCell::new(Some(handler)),
      sources  : RefCell::new(sources.iter().map(|source| Rc::downgrade(source.node())).collect()),
      scheduler: RefCell::new(None)
    });

    let watcher: Weak<dyn Watcher> = subscription.me.clone();
    for source in &sources {
      source.node().attach(id, watcher.clone());
    }

    trace!(watch = %id, sources = sources.len(), "Watching");
    subscription
  }

  pub(crate) fn id(&self) -> WatchId {
    self.id
  }

  pub(crate) fn state(&self) -> WatchState {
    self.state.get()
  }

  /// Stops the subscription. Idempotent.
  ///
  /// A drain already deferred observes the stop and does nothing; a handler already running
  /// finishes, but is never invoked again.
  pub(crate) fn stop(&self) {
    if self.state.replace(WatchState::Stopped) == WatchState::Stopped {
      return;
    }
    trace!(watch = %self.id, "Stopping");

    let sources = mem::take(&mut *self.sources.borrow_mut());
    for source in sources.iter().filter_map(Weak::upgrade) {
      source.detach(self.id);
    }

    let pending = mem::take(&mut *self.pending.borrow_mut());
    drop(pending);

    self.release();
  }

  /// Drops the handler, unless it is running: it is then dropped when it returns.
  fn release(&self) {
    let handler = self.handler
      .try_borrow_mut()
      .ok()
      .and_then(|mut handler| handler.take());

    drop(handler);
  }

  fn scheduler(&self) -> Option<Rc<dyn Scheduler>> {
    self.scheduler.borrow().clone()
  }

  fn defer_drain(&self, scheduler: &Rc<dyn Scheduler>) {
    if let Some(subscription) = self.me.upgrade() {
      scheduler.defer(Phase::React, Box::new(move || subscription.drain()));
    }
  }

  /// Snapshots and clears the changed set, then invokes the handler with it.
  fn drain(self: &Rc<Self>) {
    if self.state.get() == WatchState::Stopped {
      trace!(watch = %self.id, "Stopped before drain");
      return;
    }

    let batch: Vec<Source> = self.pending.borrow_mut().drain(..).map(|(_, source)| source).collect();
    if batch.is_empty() {
      self.state.set(WatchState::Idle);
      return;
    }

    self.invoke(batch);
  }

  fn invoke(self: &Rc<Self>, batch: Vec<Source>) {
    self.state.set(WatchState::Running);
    trace!(watch = %self.id, changed = batch.len(), "Invoking handler");

    let invocation = {
      let _guard = UnwindGuard(self);
      let mut handler = self.handler.borrow_mut();
      match handler.as_mut() {
        Some(handler) => handler(batch),
        None          => Invocation::Ready(Ok(()))
      }
    };

    match invocation {
      Invocation::Ready(outcome) => self.complete(outcome, Resume::Deferred),

      Invocation::Suspended(future) => {
        let scheduler = match self.scheduler() {
          Some(scheduler) => scheduler,
          None            => {
            warn!(watch = %self.id, "No scheduler to drive the handler, dropping it");
            self.state.set(WatchState::Idle);
            return;
          }
        };

        let subscription = Rc::clone(self);
        scheduler.spawn(Box::pin(async move {
          let outcome = {
            let _guard = UnwindGuard(&subscription);
            future.await
          };
          subscription.complete(outcome, Resume::Immediate);
        }));
      }
    }
  }

  fn complete(self: &Rc<Self>, outcome: anyhow::Result<()>, resume: Resume) {
    if let Err(error) = outcome {
      if let Some(scheduler) = self.scheduler() {
        scheduler.fail(HandlerFailure { watch: self.id, error });
      }
    }

    self.settle(resume);
  }

  /// Moves out of `Running` once an invocation is over, whatever its outcome.
  fn settle(self: &Rc<Self>, resume: Resume) {
    match self.state.get() {
      WatchState::Stopped                         => self.release(),
      _ if self.pending.borrow().is_empty()       => self.state.set(WatchState::Idle),
      _ => match resume {
        Resume::Immediate => self.drain(),
        Resume::Deferred  => {
          self.state.set(WatchState::Scheduled);
          if let Some(scheduler) = self.scheduler() {
            self.defer_drain(&scheduler);
          }
        }
      }
    }
  }
}


impl Watcher for Subscription {
  fn report(&self, source: &Source) {
    let state = self.state.get();
    if state == WatchState::Stopped {
      return;
    }

    // First report in the window fixes the position, later ones keep it
    self.pending.borrow_mut().entry(source.id()).or_insert_with(|| source.clone());

    match state {
      WatchState::Idle => {
        let scheduler = source.node().scheduler();
        self.state.set(WatchState::Scheduled);
        self.defer_drain(&scheduler);
        *self.scheduler.borrow_mut() = Some(scheduler);
      },
      WatchState::Running => self.state.set(WatchState::RunningWithPending),
      WatchState::Scheduled | WatchState::RunningWithPending | WatchState::Stopped => ()
    }

    trace!(watch = %self.id, source = %source.id(), state = ?self.state.get(), "Reported");
  }
}


/// Settles the subscription if the handler unwinds, so that a panic cannot wedge it.
struct UnwindGuard<'a>(&'a Rc<Subscription>);

impl Drop for UnwindGuard<'_> {
  fn drop(&mut self) {
    if thread::panicking() {
      warn!(watch = %self.0.id, "Handler panicked");
      self.0.settle(Resume::Deferred);
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
