//! Runtime configuration.

/// Default number of turns `execute` and `block_on` may run before giving up.
pub const DEFAULT_MAX_TURNS: u64 = 10_000;

/// Default number of steps a single `run_until_stalled` call may run.
pub const DEFAULT_TASK_BUDGET: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
  /// Upper bound on turns for `execute` and `block_on`.
  pub max_turns: u64,
  /// Upper bound on steps per `run_until_stalled`. Never zero.
  pub task_budget: usize,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      max_turns  : DEFAULT_MAX_TURNS,
      task_budget: DEFAULT_TASK_BUDGET
    }
  }
}

impl RuntimeConfig {
  pub fn with_max_turns(mut self, max_turns: u64) -> Self {
    self.max_turns = max_turns;
    self
  }

  pub fn with_task_budget(mut self, task_budget: usize) -> Self {
    self.task_budget = task_budget.max(1);
    self
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////
