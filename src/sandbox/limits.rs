//! Resource limiting for a single run.
//!
//! Scripts cannot be pre-empted, so both backends charge evaluation steps
//! against an [`ExecutionBudget`] and check the wall clock as they go: the
//! interpreted backend per statement and loop iteration, the restricted one
//! through the tick guard its rewrite plants in every loop. Exhausting time
//! or fuel is fatal for the run; exceeding the call depth is an ordinary
//! `RecursionError`.

use std::fmt;
use std::time::{Duration, Instant};

use crate::sandbox::config::SandboxConfig;

/// Steps between two wall-clock checks.
const CLOCK_CHECK_INTERVAL: u64 = 256;

/// Why the budget refused to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    /// The wall-clock limit passed.
    Time(Duration),
    /// The step budget ran out.
    Fuel(u64),
    /// Calls nested deeper than allowed.
    Depth(usize),
}

impl LimitExceeded {
    /// Time and fuel end the run; depth is recoverable.
    pub fn is_fatal(self) -> bool {
        !matches!(self, LimitExceeded::Depth(_))
    }

    /// Name of the exception class that reports this limit.
    pub fn exception_name(self) -> &'static str {
        match self {
            LimitExceeded::Depth(_) => "RecursionError",
            _ => "TimeoutError",
        }
    }
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitExceeded::Time(timeout) => write!(f, "execution timed out after {timeout:?}"),
            LimitExceeded::Fuel(fuel) => write!(f, "execution ran out of fuel after {fuel} steps"),
            LimitExceeded::Depth(_) => f.write_str("maximum recursion depth exceeded"),
        }
    }
}

/// Budget tracker for one run.
#[derive(Debug, Clone)]
pub struct ExecutionBudget {
    timeout: Duration,
    deadline: Instant,
    max_fuel: Option<u64>,
    consumed: u64,
    depth: usize,
    max_depth: usize,
    peak_depth: usize,
    exhausted: Option<LimitExceeded>,
}

impl ExecutionBudget {
    /// Create a budget that starts counting now.
    pub fn new(timeout: Duration, max_fuel: Option<u64>, max_depth: usize) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
            max_fuel,
            consumed: 0,
            depth: 0,
            max_depth,
            peak_depth: 0,
            exhausted: None,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.timeout, config.max_fuel, config.recursion_limit)
    }

    fn fail(&mut self, limit: LimitExceeded) -> Result<(), LimitExceeded> {
        self.exhausted = Some(limit);
        Err(limit)
    }

    /// Charges one evaluation step. Once time or fuel ran out, every later
    /// tick fails again, so a script that catches the first failure still
    /// stops at its next loop iteration.
    pub fn tick(&mut self) -> Result<(), LimitExceeded> {
        if let Some(limit) = self.exhausted {
            return Err(limit);
        }
        self.consumed += 1;
        if let Some(fuel) = self.max_fuel {
            if self.consumed > fuel {
                return self.fail(LimitExceeded::Fuel(fuel));
            }
        }
        if self.consumed % CLOCK_CHECK_INTERVAL == 0 && Instant::now() >= self.deadline {
            return self.fail(LimitExceeded::Time(self.timeout));
        }
        Ok(())
    }

    /// Enters a script-level call.
    pub fn enter_call(&mut self) -> Result<(), LimitExceeded> {
        if self.depth >= self.max_depth {
            return Err(LimitExceeded::Depth(self.max_depth));
        }
        self.depth += 1;
        self.peak_depth = self.peak_depth.max(self.depth);
        Ok(())
    }

    pub fn exit_call(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// How long a script may sleep right now, or the limit it hits when the
    /// requested sleep would cross the deadline.
    pub fn admit_sleep(&mut self, duration: Duration) -> Result<Duration, Duration> {
        let remaining = self.remaining();
        if duration >= remaining {
            self.exhausted = Some(LimitExceeded::Time(self.timeout));
            return Err(remaining);
        }
        Ok(duration)
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// The fatal limit hit during this run, if any.
    pub fn exhausted(&self) -> Option<LimitExceeded> {
        self.exhausted
    }

    /// Evaluation steps charged so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Deepest call nesting observed.
    pub fn peak_depth(&self) -> usize {
        self.peak_depth
    }
}
