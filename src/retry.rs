//! Retry policy for attempt chains.

use std::time::Duration;

/// Bounded retries with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per logical command, the first one included.
    pub max_attempts: u32,
    /// Pause before a retried attempt.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// The attempt that follows `attempt`, or `None` once the budget is spent.
    pub fn next_attempt(&self, attempt: u32) -> Option<u32> {
        (attempt < self.max_attempts).then_some(attempt + 1)
    }
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, one second apart.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Exit 255 with a known connection-failure signature.
    RetryableFailure,
    TerminalFailure { status: String },
}

/// One execution of one command on one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionAttempt {
    pub instance: String,
    pub command: String,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub outcome: AttemptOutcome,
}
