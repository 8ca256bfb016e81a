use std::time::Duration;

use crate::{FailureOutcome, RequestAttempt, RetryDecision, RetryPolicyConfig};

/// Classifier verdict for one failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    DoNotRetry,
    RetryNow,
    RetryAfterDelay(Duration),
    /// The credential expired; only a successful refresh can make a retry useful.
    NeedsCredentialRefresh,
}

impl Classification {
    /// Converts into a transport decision, or `None` when a refresh has to run first.
    pub fn into_decision(self) -> Option<RetryDecision> {
        match self {
            Classification::DoNotRetry => Some(RetryDecision::DoNotRetry),
            Classification::RetryNow => Some(RetryDecision::RetryNow),
            Classification::RetryAfterDelay(delay) => Some(RetryDecision::RetryAfterDelay(delay)),
            Classification::NeedsCredentialRefresh => None,
        }
    }
}

/// Pure retry decision function.
pub struct RetryClassifier;

impl RetryClassifier {
    /// Classifies a failed attempt.
    ///
    /// `attempt` must already include the failure being classified. The
    /// attempt ceiling is checked before anything else, so an exhausted request
    /// is never refreshed or retried whatever it failed with.
    pub fn classify(
        attempt: &RequestAttempt,
        outcome: &FailureOutcome,
        policy: &RetryPolicyConfig,
    ) -> Classification {
        if attempt.count() >= policy.max_retries {
            return Classification::DoNotRetry;
        }

        match outcome {
            FailureOutcome::Status(status) => {
                if policy.is_credential_expired(*status) {
                    Classification::NeedsCredentialRefresh
                } else if policy.is_retryable_status(*status) {
                    Self::plain_retry(attempt, policy)
                } else {
                    Classification::DoNotRetry
                }
            }
            FailureOutcome::Transport(kind) => {
                // Non-idempotent requests may already have been applied upstream.
                if !policy.is_retryable_method(attempt.method()) {
                    Classification::DoNotRetry
                } else if policy.is_retryable_error(*kind) {
                    Self::plain_retry(attempt, policy)
                } else {
                    Classification::DoNotRetry
                }
            }
        }
    }

    fn plain_retry(attempt: &RequestAttempt, policy: &RetryPolicyConfig) -> Classification {
        match policy.backoff_for(attempt.count()) {
            Some(delay) => Classification::RetryAfterDelay(delay),
            None => Classification::RetryNow,
        }
    }
}
