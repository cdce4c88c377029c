use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;

use futures::future::LocalBoxFuture;
use futures::task::{self, ArcWake};
use futures::FutureExt;
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use tracing::{debug, error, trace, warn};

use crate::config::RuntimeConfig;
use crate::continuations::{Continuation, Task};
use crate::errors::{Error, HandlerFailure, Result};


///////////////////////////////////////////////////////////////////////////////////////////////////
// SCHEDULER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Pool a deferred task joins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
  /// Signaller flushes. All of them run before any `React` step.
  Propagate,
  /// Watch drains and resumed futures, in FIFO order.
  React
}

/// The host capability used by signallers and watch subscriptions to run work "soon, but not now".
pub trait Scheduler {
  /// Registers `task` to run on a later step. Never runs it synchronously.
  fn defer(&self, phase: Phase, task: Task);

  /// Drives `future` to completion on this scheduler's thread.
  fn spawn(&self, future: LocalBoxFuture<'static, ()>);

  /// Receives the failure of a watch handler.
  fn fail(&self, failure: HandlerFailure);
}

impl<S> Scheduler for Rc<S>
where
  S: Scheduler + ?Sized
{
  fn defer(&self, phase: Phase, task: Task) {
    (**self).defer(phase, task)
  }

  fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
    (**self).spawn(future)
  }

  fn fail(&self, failure: HandlerFailure) {
    (**self).fail(failure)
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// SHARED STATE
///////////////////////////////////////////////////////////////////////////////////////////////////

new_key_type! { struct FutureKey; }

enum Step {
  Task(Task),
  Poll(FutureKey)
}

/// Keys of woken futures. Wakers must be `Send + Sync`, hence the lock.
#[derive(Default)]
struct WakeQueue {
  keys: Mutex<Vec<FutureKey>>
}

struct FutureWaker {
  key  : FutureKey,
  queue: Arc<WakeQueue>
}

impl ArcWake for FutureWaker {
  fn wake_by_ref(arc_self: &Arc<Self>) {
    arc_self.queue.keys.lock().push(arc_self.key);
  }
}

/// A future waiting for the next turn boundary.
struct TurnWaiter {
  fired: Cell<bool>,
  waker: RefCell<Option<Waker>>
}

impl TurnWaiter {
  fn fire(&self) {
    self.fired.set(true);
    let waker = self.waker.borrow_mut().take();
    if let Some(waker) = waker {
      waker.wake();
    }
  }
}

struct Shared {
  config   : RuntimeConfig,
  propagate: RefCell<VecDeque<Task>>,
  react    : RefCell<VecDeque<Step>>,
  futures  : RefCell<SlotMap<FutureKey, Option<LocalBoxFuture<'static, ()>>>>,
  woken    : Arc<WakeQueue>,
  waiters  : RefCell<Vec<Rc<TurnWaiter>>>,
  failures : RefCell<Vec<HandlerFailure>>,
  turn     : Cell<u64>
}

/// Frees the slot of a future whose poll unwinds.
struct SlotGuard<'a> {
  futures: &'a RefCell<SlotMap<FutureKey, Option<LocalBoxFuture<'static, ()>>>>,
  key    : FutureKey
}

impl Drop for SlotGuard<'_> {
  fn drop(&mut self) {
    if thread::panicking() {
      warn!(key = ?self.key, "Future panicked, freeing its slot");
      if let Ok(mut futures) = self.futures.try_borrow_mut() {
        futures.remove(self.key);
      }
    }
  }
}

impl Shared {
  fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
    let key = self.futures.borrow_mut().insert(Some(future));
    trace!(?key, "spawned future");
    self.react.borrow_mut().push_back(Step::Poll(key));
  }

  /// Moves woken futures at the back of the `React` queue.
  fn collect_woken(&self) {
    let keys = mem::take(&mut *self.woken.keys.lock());
    if !keys.is_empty() {
      self.react.borrow_mut().extend(keys.into_iter().map(Step::Poll));
    }
  }

  fn poll_future(&self, key: FutureKey) {
    // The future is taken out of its slot while polled, so that it may spawn or wake freely.
    let future = self.futures.borrow_mut().get_mut(key).and_then(Option::take);
    let mut future = match future {
      Some(future) => future,
      None         => return // Completed, or woken more than once
    };

    let waker   = task::waker(Arc::new(FutureWaker { key, queue: self.woken.clone() }));
    let mut cx  = Context::from_waker(&waker);
    let poll    = {
      let _guard = SlotGuard { futures: &self.futures, key };
      future.poll_unpin(&mut cx)
    };

    let mut futures = self.futures.borrow_mut();
    match poll {
      Poll::Ready(()) => { futures.remove(key); },
      Poll::Pending   => {
        if let Some(slot) = futures.get_mut(key) {
          *slot = Some(future);
        }
      }
    }
  }

  /// Runs a single step, flushes first. Indicates whether a step was ran.
  fn step(&self) -> bool {
    let flush = self.propagate.borrow_mut().pop_front();
    if let Some(task) = flush {
      task.call_box();
      return true;
    }

    self.collect_woken();
    let step = self.react.borrow_mut().pop_front();
    match step {
      Some(Step::Task(task)) => task.call_box(),
      Some(Step::Poll(key))  => self.poll_future(key),
      None                   => return false
    }

    true
  }

  fn has_ready_work(&self) -> bool {
    !self.propagate.borrow().is_empty()
      || !self.react.borrow().is_empty()
      || !self.woken.keys.lock().is_empty()
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// RUNTIME
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Single-threaded cooperative runtime for signallers and watch subscriptions.
pub struct Runtime {
  shared: Rc<Shared>
}


impl Runtime {
  /// Creates a new `Runtime` with the default configuration.
  pub fn new() -> Self {
    Self::with_config(RuntimeConfig::default())
  }

  pub fn with_config(config: RuntimeConfig) -> Self {
    Self {
      shared: Rc::new(Shared {
        config,
        propagate: RefCell::new(VecDeque::new()),
        react    : RefCell::new(VecDeque::new()),
        futures  : RefCell::new(SlotMap::with_key()),
        woken    : Arc::new(WakeQueue::default()),
        waiters  : RefCell::new(Vec::new()),
        failures : RefCell::new(Vec::new()),
        turn     : Cell::new(0)
      })
    }
  }

  /// Returns a handle to schedule work on this runtime.
  pub fn handle(&self) -> Handle {
    Handle { shared: Rc::downgrade(&self.shared) }
  }

  pub fn config(&self) -> &RuntimeConfig {
    &self.shared.config
  }

  /// Number of turns ran so far.
  pub fn turn_count(&self) -> u64 {
    self.shared.turn.get()
  }

  /// Runs deferred tasks and woken futures until none is ready, or the task budget is spent.
  /// Returns the number of steps ran.
  pub fn run_until_stalled(&self) -> usize {
    let budget = self.shared.config.task_budget;
    let mut ran = 0;

    while ran < budget {
      if !self.shared.step() {
        return ran;
      }
      ran += 1;
    }

    if self.shared.has_ready_work() {
      warn!(budget, "Task budget exhausted, yielding with work left");
    }
    ran
  }

  /// Executes a single turn to completion. Indicates if more work remains to be done.
  ///
  /// Waiters registered before the call are woken one after the other, in registration order,
  /// and ready work is ran to completion before and after each of them. Waiters registered
  /// during the turn belong to the next one.
  pub fn turn(&self) -> bool {
    let turn = self.shared.turn.get() + 1;
    self.shared.turn.set(turn);

    let waiters = mem::take(&mut *self.shared.waiters.borrow_mut());
    debug!(turn, waiters = waiters.len(), "Running turn");

    self.run_until_stalled();
    for waiter in waiters {
      waiter.fire();
      self.run_until_stalled();
    }

    self.has_work()
  }

  /// Indicates whether a step is ready, or a waiter awaits the next turn.
  pub fn has_work(&self) -> bool {
    self.shared.has_ready_work() || !self.shared.waiters.borrow().is_empty()
  }

  /// Executes turns until all work is completed.
  pub fn execute(&self) -> Result<()> {
    let limit = self.shared.config.max_turns;

    for _ in 0..limit {
      if !self.turn() {
        return Ok(());
      }
    }

    Err(Error::TurnLimit { limit })
  }

  /// Spawns `future` and executes turns until it completes.
  pub fn block_on<F>(&self, future: F) -> Result<F::Output>
  where
    F: Future + 'static,
    F::Output: 'static
  {
    let output   = Rc::new(RefCell::new(None));
    let output_2 = output.clone();

    self.shared.spawn(Box::pin(async move {
      let value = future.await;
      *output_2.borrow_mut() = Some(value);
    }));

    let limit = self.shared.config.max_turns;
    for turns in 0..limit {
      let work_remains = self.turn();

      let value = output.borrow_mut().take();
      if let Some(value) = value {
        return Ok(value);
      }
      if !work_remains {
        return Err(Error::Stalled { turns: turns + 1 });
      }
    }

    Err(Error::TurnLimit { limit })
  }

  /// Returns and forgets the handler failures reported so far.
  pub fn take_failures(&self) -> Vec<HandlerFailure> {
    mem::take(&mut *self.shared.failures.borrow_mut())
  }
}


impl Default for Runtime {
  fn default() -> Self {
    Self::new()
  }
}


impl Drop for Runtime {
  fn drop(&mut self) {
    // Pending work may own signallers and subscriptions; release it before the runtime goes.
    let propagate = mem::take(&mut *self.shared.propagate.borrow_mut());
    let react     = mem::take(&mut *self.shared.react.borrow_mut());
    let futures   = mem::take(&mut *self.shared.futures.borrow_mut());
    let waiters   = mem::take(&mut *self.shared.waiters.borrow_mut());

    drop(propagate);
    drop(react);
    drop(futures);
    drop(waiters);
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// HANDLE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A weak, clonable reference to a `Runtime`. Work scheduled once the runtime is gone is dropped.
#[derive(Clone)]
pub struct Handle {
  shared: Weak<Shared>
}


impl Handle {
  /// Returns a future resolving at the next turn boundary.
  pub fn next_turn(&self) -> NextTurn {
    NextTurn { shared: self.shared.clone(), waiter: None }
  }

  /// Spawns a future on the runtime.
  pub fn spawn_local<F>(&self, future: F)
  where
    F: Future<Output = ()> + 'static
  {
    Scheduler::spawn(self, future.boxed_local());
  }

  fn upgrade(&self, what: &'static str) -> Option<Rc<Shared>> {
    let shared = self.shared.upgrade();
    if shared.is_none() {
      warn!(what, "Runtime dropped, discarding work");
    }
    shared
  }
}


impl Scheduler for Handle {
  fn defer(&self, phase: Phase, task: Task) {
    if let Some(shared) = self.upgrade("deferred task") {
      match phase {
        Phase::Propagate => shared.propagate.borrow_mut().push_back(task),
        Phase::React     => shared.react.borrow_mut().push_back(Step::Task(task))
      }
    }
  }

  fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
    if let Some(shared) = self.upgrade("future") {
      shared.spawn(future);
    }
  }

  fn fail(&self, failure: HandlerFailure) {
    error!(watch = %failure.watch, error = %failure.error, "Watch handler failed");
    if let Some(shared) = self.shared.upgrade() {
      shared.failures.borrow_mut().push(failure);
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// NEXT TURN
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Future returned by `Handle::next_turn`.
///
/// It registers itself when first polled, and resolves once the runtime reaches the following
/// turn boundary. It resolves immediately if the runtime is gone.
pub struct NextTurn {
  shared: Weak<Shared>,
  waiter: Option<Rc<TurnWaiter>>
}


impl Future for NextTurn {
  type Output = ();

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
    if let Some(waiter) = &self.waiter {
      if waiter.fired.get() {
        return Poll::Ready(());
      }
      *waiter.waker.borrow_mut() = Some(cx.waker().clone());
      return Poll::Pending;
    }

    let shared = match self.shared.upgrade() {
      Some(shared) => shared,
      None         => return Poll::Ready(())
    };

    let waiter = Rc::new(TurnWaiter {
      fired: Cell::new(false),
      waker: RefCell::new(Some(cx.waker().clone()))
    });
    shared.waiters.borrow_mut().push(waiter.clone());
    self.waiter = Some(waiter);

    Poll::Pending
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
