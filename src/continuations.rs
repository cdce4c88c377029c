///////////////////////////////////////////////////////////////////////////////////////////////////
// CONTINUATION
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A deferred unit of work, ran exactly once by a scheduler.
/// For the sake of simplicity, continuations must be valid on the `static` lifetime.
pub trait Continuation: 'static {
  /// Calls the continuation.
  fn call(self);

  /// Calls the continuation. Works even if the continuation is boxed.
  ///
  /// Scheduler queues only hold boxed continuations, whose concrete type has been erased:
  /// this method lets them consume a `Box<dyn Continuation>` without knowing it.
  fn call_box(self: Box<Self>);
}


/// Functions of type `FnOnce` are considered to be continuations.
///
/// This is used in order to make continuations out of Rust closures.
impl<F> Continuation for F
where
  F: FnOnce() + 'static
{
  fn call(self) {
    self();
  }

  fn call_box(self: Box<Self>) {
    (*self).call();
  }
}


/// A boxed continuation, as stored by schedulers.
pub type Task = Box<dyn Continuation>;


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
