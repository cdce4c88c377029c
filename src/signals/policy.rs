mod sealed {
  pub trait Sealed {}
}


/// Mutation policy of a signaller, chosen at construction.
///
/// The policy decides which mutation method the signaller offers:
/// [`OnChange`] offers `assign`, [`Always`] offers `set`.
pub trait Policy: sealed::Sealed + 'static {
  /// Name of the policy, as logged.
  const NAME: &'static str;
}


/// Equality-gated mutation: `assign` ignores values equal to the stored one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OnChange;

/// Always-notify mutation: `set` schedules a flush even for an equal value.
///
/// The stored value is read-only from the outside, there is no `assign`:
///
/// ```compile_fail
/// use signaller::{Runtime, Signaller};
///
/// let runtime = Runtime::new();
/// let current = Signaller::always(&runtime.handle(), 0);
/// current.assign(1);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Always;


impl sealed::Sealed for OnChange {}
impl sealed::Sealed for Always {}

impl Policy for OnChange {
  const NAME: &'static str = "on-change";
}

impl Policy for Always {
  const NAME: &'static str = "always";
}
