use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::rc::{Rc, Weak};
use std::thread;

use tracing::{trace, warn};

use crate::errors::{InvariantViolation, Result};
use crate::runtime::{Phase, Scheduler};
use crate::signals::policy::{Always, OnChange, Policy};
use crate::signals::source::{Node, SignallerId, Source, Watcher};
use crate::watch::WatchId;


/// A direct listener, invoked with no arguments on every flush. Compared by identity.
pub type Callback = Rc<dyn Fn()>;


///////////////////////////////////////////////////////////////////////////////////////////////////
// SIGNALLER CORE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Shared core of a signaller and its clones.
pub(crate) struct Inner<T, P> {
  id       : SignallerId,
  scheduler: Rc<dyn Scheduler>,
  value    : RefCell<T>,
  pending  : Cell<bool>,
  callbacks: RefCell<Vec<Callback>>,
  watchers : RefCell<Vec<(WatchId, Weak<dyn Watcher>)>>,
  policy   : PhantomData<P>
}


impl<T, P> Inner<T, P>
where
  T: 'static,
  P: Policy
{
  /// Runs `mutation` over the stored value, unless it is already borrowed.
  fn mutate<R>(&self, mutation: impl FnOnce(&mut T) -> R) -> Result<R> {
    let mut value = self.value
      .try_borrow_mut()
      .map_err(|_| InvariantViolation::ValueBorrowed { id: self.id })?;

    Ok(mutation(&mut value))
  }

  /// Marks the signaller as pending, and defers a flush unless one already is.
  fn schedule_flush(self: &Rc<Self>) {
    if self.pending.replace(true) {
      trace!(signaller = %self.id, "Flush already scheduled, coalescing");
      return;
    }

    let inner = Rc::clone(self);
    self.scheduler.defer(Phase::Propagate, Box::new(move || inner.flush()));
  }

  fn flush(self: &Rc<Self>) {
    self.pending.set(false);

    // Registries are snapshotted: changes made while flushing apply to the next flush
    let callbacks = self.callbacks.borrow().clone();
    let watchers: Vec<Rc<dyn Watcher>> = {
      let mut watchers = self.watchers.borrow_mut();
      watchers.retain(|(_, watcher)| watcher.strong_count() > 0);
      watchers.iter().filter_map(|(_, watcher)| watcher.upgrade()).collect()
    };

    trace!(
      signaller = %self.id,
      policy    = P::NAME,
      callbacks = callbacks.len(),
      watchers  = watchers.len(),
      "Flushing"
    );

    let reports = Reports { source: Source::new(self.clone()), watchers };
    for callback in callbacks {
      callback();
    }
    reports.deliver();
  }
}


/// Flush reports still owed to watchers. Delivered even if a callback unwinds.
struct Reports {
  source  : Source,
  watchers: Vec<Rc<dyn Watcher>>
}

impl Reports {
  fn deliver(mut self) {
    self.report_all();
  }

  fn report_all(&mut self) {
    for watcher in mem::take(&mut self.watchers) {
      watcher.report(&self.source);
    }
  }
}

impl Drop for Reports {
  fn drop(&mut self) {
    if thread::panicking() && !self.watchers.is_empty() {
      warn!(signaller = %self.source.id(), "Callback panicked, reporting to watchers anyway");
      self.report_all();
    }
  }
}


impl<T, P> Node for Inner<T, P>
where
  T: 'static,
  P: Policy
{
  fn id(&self) -> SignallerId {
    self.id
  }

  fn scheduler(&self) -> Rc<dyn Scheduler> {
    self.scheduler.clone()
  }

  fn attach(&self, id: WatchId, watcher: Weak<dyn Watcher>) {
    self.watchers.borrow_mut().push((id, watcher));
  }

  fn detach(&self, id: WatchId) {
    self.watchers.borrow_mut().retain(|(watch, _)| *watch != id);
  }

  fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
    self
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// SIGNALLER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A single-value reactive cell. Clones share the same cell.
pub struct Signaller<T, P = OnChange> {
  inner: Rc<Inner<T, P>>
}


impl<T, P> Signaller<T, P>
where
  T: 'static,
  P: Policy
{
  /// Creates a signaller holding `initial`, flushing on `scheduler`, under policy `P`.
  pub fn with_policy<S>(scheduler: &S, initial: T) -> Self
  where
    S: Scheduler + Clone + 'static
  {
    let scheduler: Rc<dyn Scheduler> = Rc::new(scheduler.clone());

    Signaller {
      inner: Rc::new(Inner {
        id       : SignallerId::next(),
        scheduler,
        value    : RefCell::new(initial),
        pending  : Cell::new(false),
        callbacks: RefCell::new(Vec::new()),
        watchers : RefCell::new(Vec::new()),
        policy   : PhantomData
      })
    }
  }

  pub(crate) fn from_inner(inner: Rc<Inner<T, P>>) -> Self {
    Signaller { inner }
  }

  pub fn id(&self) -> SignallerId {
    self.inner.id
  }

  /// Returns a type-erased handle to this signaller.
  pub fn source(&self) -> Source {
    Source::new(self.inner.clone())
  }

  /// Returns a copy of the stored value.
  ///
  /// # Panics
  ///
  /// If called from inside `modify` on the same signaller. See `try_get`.
  pub fn get(&self) -> T
  where
    T: Clone
  {
    self.inner.value.borrow().clone()
  }

  /// Returns a copy of the stored value, or an `InvariantViolation` from inside `modify`.
  pub fn try_get(&self) -> Result<T>
  where
    T: Clone
  {
    self.try_with(T::clone)
  }

  /// Runs `read` over the stored value. Mutations of this signaller attempted by `read` fail.
  ///
  /// # Panics
  ///
  /// If called from inside `modify` on the same signaller. See `try_with`.
  pub fn with<R>(&self, read: impl FnOnce(&T) -> R) -> R {
    read(&self.inner.value.borrow())
  }

  /// Runs `read` over the stored value, or returns an `InvariantViolation` from inside `modify`.
  pub fn try_with<R>(&self, read: impl FnOnce(&T) -> R) -> Result<R> {
    let value = self.inner.value
      .try_borrow()
      .map_err(|_| InvariantViolation::ValueMutated { id: self.inner.id })?;

    Ok(read(&value))
  }

  /// Mutates the stored value in place, and schedules a flush.
  pub fn modify<R>(&self, mutation: impl FnOnce(&mut T) -> R) -> Result<R> {
    let result = self.inner.mutate(mutation)?;
    self.inner.schedule_flush();
    Ok(result)
  }

  /// Schedules a flush without changing the stored value.
  pub fn signal(&self) {
    self.inner.schedule_flush();
  }

  /// Indicates whether a flush is scheduled and has not ran yet.
  pub fn is_pending(&self) -> bool {
    self.inner.pending.get()
  }

  /// Registers `callback` after all others. Does nothing if it already is registered.
  pub fn add_callback(&self, callback: Callback) {
    let mut callbacks = self.inner.callbacks.borrow_mut();
    if callbacks.iter().any(|registered| Rc::ptr_eq(registered, &callback)) {
      return;
    }
    callbacks.push(callback);
  }

  /// Unregisters `callback`. Indicates whether it was registered.
  pub fn remove_callback(&self, callback: &Callback) -> bool {
    let mut callbacks = self.inner.callbacks.borrow_mut();
    let count = callbacks.len();
    callbacks.retain(|registered| !Rc::ptr_eq(registered, callback));
    callbacks.len() != count
  }

  pub fn callback_count(&self) -> usize {
    self.inner.callbacks.borrow().len()
  }
}


impl<T> Signaller<T, OnChange>
where
  T: PartialEq + 'static
{
  /// Creates a signaller whose mutation, `assign`, ignores equal values.
  pub fn new<S>(scheduler: &S, initial: T) -> Self
  where
    S: Scheduler + Clone + 'static
  {
    Self::with_policy(scheduler, initial)
  }

  /// Stores `value` and schedules a flush, unless it is equal to the stored value.
  /// Indicates whether the value changed.
  pub fn assign(&self, value: T) -> Result<bool> {
    let previous = self.inner.mutate(|current| {
      if *current == value {
        None
      }
      else {
        Some(mem::replace(current, value))
      }
    })?;

    match previous {
      Some(previous) => {
        drop(previous);
        self.inner.schedule_flush();
        Ok(true)
      },
      None => Ok(false)
    }
  }
}


impl<T> Signaller<T, Always>
where
  T: 'static
{
  /// Creates a signaller whose mutation, `set`, always schedules a flush.
  pub fn always<S>(scheduler: &S, initial: T) -> Self
  where
    S: Scheduler + Clone + 'static
  {
    Self::with_policy(scheduler, initial)
  }

  /// Stores `value` and schedules a flush, whether it differs from the stored value or not.
  pub fn set(&self, value: T) -> Result<()> {
    let previous = self.inner.mutate(|current| mem::replace(current, value))?;
    drop(previous);
    self.inner.schedule_flush();
    Ok(())
  }
}


impl<T, P> Clone for Signaller<T, P> {
  fn clone(&self) -> Self {
    Signaller { inner: self.inner.clone() }
  }
}


impl<T, P> fmt::Debug for Signaller<T, P>
where
  T: fmt::Debug + 'static,
  P: Policy
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut debug = f.debug_struct("Signaller");
    debug.field("id", &self.inner.id).field("policy", &P::NAME);

    match self.inner.value.try_borrow() {
      Ok(value) => debug.field("value", &*value),
      Err(_)    => debug.field("value", &"<borrowed>")
    };

    debug.field("pending", &self.inner.pending.get()).finish()
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use std::rc::Rc;
  use std::cell::{Cell, RefCell};

  use crate::errors::Error;
  use crate::runtime::Runtime;
  use crate::test_utils::enable_logger;
  use super::*;

  // Registers a callback counting the flushes of `signaller`.
  fn count_flushes<T: 'static, P: Policy>(signaller: &Signaller<T, P>) -> Rc<Cell<u32>> {
    let flushes   = Rc::new(Cell::new(0));
    let flushes_2 = flushes.clone();
    signaller.add_callback(Rc::new(move || flushes_2.set(flushes_2.get() + 1)));
    flushes
  }


  #[test]
  fn construct_and_read() {
    let runtime   = Runtime::new();
    let signaller = Signaller::new(&runtime.handle(), 123);

    assert_eq!(signaller.get(), 123);
    assert_eq!(signaller.with(|value| value + 1), 124);
    assert_eq!(signaller.is_pending(), false);
    assert_eq!(signaller.callback_count(), 0);
  }

  #[test]
  fn sync_assigns_coalesce_into_one_flush() {
    enable_logger();
    let runtime   = Runtime::new();
    let signaller = Signaller::new(&runtime.handle(), 0);
    let flushes   = count_flushes(&signaller);

    assert_eq!(signaller.assign(1).unwrap(), true);
    assert_eq!(signaller.assign(2).unwrap(), true);
    assert_eq!(signaller.assign(3).unwrap(), true);
    assert_eq!(signaller.is_pending(), true);
    assert_eq!(flushes.get(), 0);

    runtime.turn();
    assert_eq!(flushes.get(), 1);
    assert_eq!(signaller.is_pending(), false);
    assert_eq!(signaller.get(), 3);
  }

  #[test]
  fn assigns_separated_by_turns_flush_each_time() {
    let runtime   = Runtime::new();
    let signaller = Signaller::new(&runtime.handle(), 0);
    let flushes   = count_flushes(&signaller);

    for value in 1..=3 {
      signaller.assign(value).unwrap();
      runtime.turn();
    }

    assert_eq!(flushes.get(), 3);
  }

  #[test]
  fn assigning_equal_value_does_not_flush() {
    let runtime   = Runtime::new();
    let signaller = Signaller::new(&runtime.handle(), String::from("same"));
    let flushes   = count_flushes(&signaller);

    assert_eq!(signaller.assign(String::from("same")).unwrap(), false);
    assert_eq!(signaller.is_pending(), false);

    runtime.turn();
    assert_eq!(flushes.get(), 0);
  }

  #[test]
  fn set_flushes_even_for_equal_value() {
    let runtime   = Runtime::new();
    let signaller = Signaller::always(&runtime.handle(), 7);
    let flushes   = count_flushes(&signaller);

    signaller.set(7).unwrap();
    runtime.turn();
    signaller.set(7).unwrap();
    signaller.set(8).unwrap();
    runtime.turn();

    assert_eq!(flushes.get(), 2);
    assert_eq!(signaller.get(), 8);
  }

  #[test]
  fn signal_wakes_without_change() {
    let runtime   = Runtime::new();
    let signaller = Signaller::new(&runtime.handle(), 0);
    let flushes   = count_flushes(&signaller);

    signaller.signal();
    runtime.turn();
    signaller.signal();
    signaller.signal();
    signaller.signal();
    runtime.turn();

    assert_eq!(flushes.get(), 2);
    assert_eq!(signaller.get(), 0);
  }

  #[test]
  fn modify_mutates_in_place_and_flushes() {
    let runtime   = Runtime::new();
    let signaller = Signaller::always(&runtime.handle(), vec![1, 2]);
    let flushes   = count_flushes(&signaller);

    let length = signaller.modify(|values| { values.push(3); values.len() }).unwrap();
    runtime.turn();

    assert_eq!(length, 3);
    assert_eq!(signaller.get(), vec![1, 2, 3]);
    assert_eq!(flushes.get(), 1);
  }

  #[test]
  fn mutation_while_borrowed_is_invariant_violation() {
    let runtime   = Runtime::new();
    let signaller = Signaller::new(&runtime.handle(), 1);
    let id        = signaller.id();

    let inside_read = signaller.with(|_| signaller.assign(2));
    assert!(matches!(
      inside_read,
      Err(Error::InvariantViolation(InvariantViolation::ValueBorrowed { id: culprit })) if culprit == id
    ));

    let inside_modify = signaller.modify(|_| signaller.assign(3)).unwrap();
    assert!(matches!(inside_modify, Err(Error::InvariantViolation(_))));

    // The first error left the value untouched, the modify itself still flushes
    assert_eq!(signaller.get(), 1);
    assert_eq!(signaller.is_pending(), true);
  }

  #[test]
  fn read_while_modifying_is_invariant_violation() {
    let runtime   = Runtime::new();
    let signaller = Signaller::new(&runtime.handle(), 1);
    let id        = signaller.id();

    let inside_modify = signaller.modify(|value| {
      *value = 2;
      signaller.try_get()
    }).unwrap();
    assert!(matches!(
      inside_modify,
      Err(Error::InvariantViolation(InvariantViolation::ValueMutated { id: culprit })) if culprit == id
    ));

    assert_eq!(signaller.try_get().unwrap(), 2);
    assert_eq!(signaller.try_with(|value| value * 10).unwrap(), 20);
  }

  #[test]
  fn add_and_remove_callbacks() {
    let runtime   = Runtime::new();
    let signaller = Signaller::new(&runtime.handle(), "test");
    let calls     = Rc::new(RefCell::new(Vec::new()));

    let make_callback = |name: &'static str| -> Callback {
      let calls = calls.clone();
      Rc::new(move || calls.borrow_mut().push(name))
    };

    let one   = make_callback("one");
    let two   = make_callback("two");
    let three = make_callback("three");
    let four  = make_callback("four");
    let five  = make_callback("five");

    for callback in [&one, &two, &three, &four, &five] {
      signaller.add_callback(callback.clone());
    }

    assert_eq!(signaller.remove_callback(&three), true);
    assert_eq!(signaller.remove_callback(&one), true);
    assert_eq!(signaller.remove_callback(&one), false);

    signaller.signal();
    runtime.turn();

    assert_eq!(*calls.borrow(), vec!["two", "four", "five"]);
  }

  #[test]
  fn callback_added_twice_fires_once_and_readding_moves_it_last() {
    let runtime   = Runtime::new();
    let signaller = Signaller::new(&runtime.handle(), 0);
    let calls     = Rc::new(RefCell::new(Vec::new()));

    let (calls_1, calls_2) = (calls.clone(), calls.clone());
    let first : Callback = Rc::new(move || calls_1.borrow_mut().push("first"));
    let second: Callback = Rc::new(move || calls_2.borrow_mut().push("second"));

    signaller.add_callback(first.clone());
    signaller.add_callback(first.clone());
    signaller.add_callback(second.clone());
    assert_eq!(signaller.callback_count(), 2);

    signaller.remove_callback(&first);
    signaller.add_callback(first.clone());

    signaller.signal();
    runtime.turn();

    assert_eq!(*calls.borrow(), vec!["second", "first"]);
  }

  #[test]
  fn removal_during_flush_applies_to_next_flush() {
    let runtime   = Runtime::new();
    let signaller = Signaller::new(&runtime.handle(), 0);
    let calls     = Rc::new(RefCell::new(Vec::new()));

    let calls_2 = calls.clone();
    let victim: Callback = Rc::new(move || calls_2.borrow_mut().push("victim"));

    let signaller_2 = signaller.clone();
    let victim_2    = victim.clone();
    let calls_3     = calls.clone();
    let remover: Callback = Rc::new(move || {
      calls_3.borrow_mut().push("remover");
      signaller_2.remove_callback(&victim_2);
    });

    signaller.add_callback(remover);
    signaller.add_callback(victim);

    signaller.signal();
    runtime.turn();
    assert_eq!(*calls.borrow(), vec!["remover", "victim"]);

    signaller.signal();
    runtime.turn();
    assert_eq!(*calls.borrow(), vec!["remover", "victim", "remover"]);
  }

  #[test]
  fn assign_from_callback_schedules_a_new_flush() {
    let runtime   = Runtime::new();
    let signaller = Signaller::new(&runtime.handle(), 0);
    let flushes   = count_flushes(&signaller);

    let signaller_2 = signaller.clone();
    signaller.add_callback(Rc::new(move || {
      let value = signaller_2.get();
      if value < 3 {
        signaller_2.assign(value + 1).unwrap();
      }
    }));

    signaller.assign(1).unwrap();
    runtime.run_until_stalled();

    assert_eq!(signaller.get(), 3);
    assert_eq!(flushes.get(), 3);
  }

  #[test]
  fn source_identity_and_downcast() {
    let runtime = Runtime::new();
    let handle  = runtime.handle();
    let number  = Signaller::new(&handle, 1);
    let text    = Signaller::always(&handle, "st");

    let source = number.source();
    assert_eq!(source, number);
    assert_eq!(source, number.clone());
    assert!(source.is(&number));
    assert!(!source.is(&text));
    assert_ne!(source, text.source());
    assert_eq!(Source::from(&number), source);

    assert_eq!(source.downcast::<i32, OnChange>().unwrap().get(), 1);
    assert!(source.downcast::<i32, Always>().is_none());
    assert!(source.downcast::<&str, OnChange>().is_none());
    assert_eq!(text.source().downcast::<&str, Always>().unwrap().get(), "st");
  }

  #[test]
  fn debug_shows_value_and_policy() {
    let runtime   = Runtime::new();
    let signaller = Signaller::always(&runtime.handle(), 5);

    let debug = format!("{:?}", signaller);
    assert!(debug.contains("value: 5"));
    assert!(debug.contains("always"));
  }
}
