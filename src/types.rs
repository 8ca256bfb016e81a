use std::time::Duration;

use tokio::time::Instant;

/// What the transport should do with a failed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    DoNotRetry,
    RetryNow,
    /// Resubmit after waiting at least this long.
    RetryAfterDelay(Duration),
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        !matches!(self, RetryDecision::DoNotRetry)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Success,
    Failure,
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RefreshOutcome::Success)
    }
}

impl From<RefreshOutcome> for RetryDecision {
    fn from(outcome: RefreshOutcome) -> Self {
        match outcome {
            RefreshOutcome::Success => RetryDecision::RetryNow,
            RefreshOutcome::Failure => RetryDecision::DoNotRetry,
        }
    }
}

/// Snapshot of a coordinator's refresh state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Refreshing { started_at: Instant },
}
