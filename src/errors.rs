//! Error types raised by signallers, watch subscriptions, and the runtime.

use crate::signals::SignallerId;
use crate::watch::WatchId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// A controlled mutation path was bypassed or re-entered
  #[error(transparent)]
  InvariantViolation(#[from] InvariantViolation),

  /// `block_on` ran out of work while its future was still pending
  #[error("Runtime stalled after {turns} turns with the future still pending")]
  Stalled { turns: u64 },

  /// The configured number of turns was exhausted
  #[error("Turn limit of {limit} reached")]
  TurnLimit { limit: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum InvariantViolation {
  /// The stored value is currently borrowed by `with` or `modify` on the same signaller.
  #[error("Signaller {id} is borrowed: its value cannot be mutated from inside a read or modify")]
  ValueBorrowed { id: SignallerId },

  /// The stored value is being mutated by `modify` on the same signaller.
  #[error("Signaller {id} is being modified: its value cannot be read from inside modify")]
  ValueMutated { id: SignallerId },
}

/// A watch handler returned an error. Reported to the scheduler, never retried.
#[derive(Debug, thiserror::Error)]
#[error("Handler of watch {watch} failed: {error}")]
pub struct HandlerFailure {
  pub watch: WatchId,
  #[source]
  pub error: anyhow::Error,
}
