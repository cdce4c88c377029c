use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::runtime::Scheduler;
use crate::signals::policy::Policy;
use crate::signals::signaller::{Inner, Signaller};
use crate::watch::WatchId;


///////////////////////////////////////////////////////////////////////////////////////////////////
// SIGNALLER ID
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Process-unique identity of a signaller, shared by all its clones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignallerId(u64);

impl SignallerId {
  pub(crate) fn next() -> Self {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    SignallerId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for SignallerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// NODE & WATCHER
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Type-erased side of a signaller, as seen by watch subscriptions.
pub(crate) trait Node: 'static {
  fn id(&self) -> SignallerId;

  fn scheduler(&self) -> Rc<dyn Scheduler>;

  /// Adds a back-reference to `watcher`, reported to on every flush.
  fn attach(&self, id: WatchId, watcher: Weak<dyn Watcher>);

  /// Removes every back-reference to the watcher `id`.
  fn detach(&self, id: WatchId);

  fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

/// Receiver of flush reports: a watch subscription.
pub(crate) trait Watcher {
  fn report(&self, source: &Source);
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// SOURCE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A signaller of any value type, compared by identity.
///
/// Sources are what `watch` subscribes to and what its handlers receive as changed set.
#[derive(Clone)]
pub struct Source {
  node: Rc<dyn Node>
}


impl Source {
  pub(crate) fn new(node: Rc<dyn Node>) -> Self {
    Source { node }
  }

  pub(crate) fn node(&self) -> &Rc<dyn Node> {
    &self.node
  }

  pub fn id(&self) -> SignallerId {
    self.node.id()
  }

  /// Indicates whether this source is `signaller`.
  pub fn is<T, P>(&self, signaller: &Signaller<T, P>) -> bool
  where
    T: 'static,
    P: Policy
  {
    self.id() == signaller.id()
  }

  /// Returns the typed signaller behind this source, if it holds a `T` under policy `P`.
  pub fn downcast<T, P>(&self) -> Option<Signaller<T, P>>
  where
    T: 'static,
    P: Policy
  {
    self.node.clone().into_any().downcast::<Inner<T, P>>().ok().map(Signaller::from_inner)
  }
}


impl PartialEq for Source {
  fn eq(&self, other: &Self) -> bool {
    self.id() == other.id()
  }
}

impl Eq for Source {}

impl Hash for Source {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.id().hash(state);
  }
}

impl<T, P> PartialEq<Signaller<T, P>> for Source
where
  T: 'static,
  P: Policy
{
  fn eq(&self, other: &Signaller<T, P>) -> bool {
    self.is(other)
  }
}

impl fmt::Debug for Source {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Source").field(&self.id()).finish()
  }
}

impl<T, P> From<&Signaller<T, P>> for Source
where
  T: 'static,
  P: Policy
{
  fn from(signaller: &Signaller<T, P>) -> Self {
    signaller.source()
  }
}
