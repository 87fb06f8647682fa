use std::time::Duration;

use crate::config::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY};

/// Upper bound on a single backoff wait.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Where a call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    AcquiringMedia,
    AwaitingIceConfig,
    Connecting,
    Negotiating,
    Stable,
    Connected,
    Failed,
    Closed,
}

impl CallPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallPhase::Failed | CallPhase::Closed)
    }
}

/// Exponential backoff with a fixed attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RETRY_BASE_DELAY,
            max_attempts: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Wait before the attempt that follows `attempts_made` failed ones.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        self.base
            .saturating_mul(1u32 << exponent)
            .min(MAX_RETRY_DELAY)
    }
}

/// What the controller should do about a `failed` connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Already established, or a retry is already pending.
    Ignore,
    Schedule { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Retry bookkeeping for one session.
///
/// `attempt_count` counts setup attempts started since the last successful
/// connection, the first one included, so it never exceeds
/// `RetryPolicy::max_attempts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt_count: u32,
    pub is_retrying: bool,
    pub established: bool,
}

impl RetryState {
    pub fn begin_first_attempt(&mut self) {
        if self.attempt_count == 0 {
            self.attempt_count = 1;
        }
    }

    pub fn on_connected(&mut self) {
        self.established = true;
        self.attempt_count = 0;
        self.is_retrying = false;
    }

    pub fn on_failure(&mut self, policy: &RetryPolicy) -> RetryDecision {
        if self.established || self.is_retrying {
            return RetryDecision::Ignore;
        }
        let made = self.attempt_count.max(1);
        if made >= policy.max_attempts {
            return RetryDecision::GiveUp { attempts: made };
        }
        let delay = policy.delay_for(made);
        self.attempt_count = made + 1;
        self.is_retrying = true;
        RetryDecision::Schedule {
            attempt: self.attempt_count,
            delay,
        }
    }

    /// The scheduled wait elapsed and the rebuild is starting.
    pub fn retry_started(&mut self) {
        self.is_retrying = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
