/// **Mutation policies.**
///
/// Marker types deciding, at construction, which mutation a signaller offers:
/// equality-gated `assign` (`OnChange`), or always-notifying `set` (`Always`).
pub mod policy;

/// **The signaller itself.**
///
/// This sub-module contains the shared core of a signaller (value, pending flag, callback
/// registry and watch back-references), its flush routine, and the public `Signaller` handle.
pub mod signaller;

/// **Type-erased signallers.**
///
/// `Source` lets watch subscriptions hold signallers of different value types,
/// and compare them by identity.
pub mod source;


pub use self::policy::{Always, OnChange, Policy};
pub use self::signaller::{Callback, Signaller};
pub use self::source::{SignallerId, Source};
