use reqwest::{Method, StatusCode};

use crate::TransportErrorKind;

/// What a single failed attempt observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The server answered with a non-success status.
    Status(StatusCode),
    /// The request never produced a response.
    Transport(TransportErrorKind),
}

impl FailureOutcome {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FailureOutcome::Status(status) => Some(*status),
            FailureOutcome::Transport(_) => None,
        }
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            FailureOutcome::Status(_) => None,
            FailureOutcome::Transport(kind) => Some(*kind),
        }
    }
}

impl From<StatusCode> for FailureOutcome {
    fn from(status: StatusCode) -> Self {
        FailureOutcome::Status(status)
    }
}

impl From<TransportErrorKind> for FailureOutcome {
    fn from(kind: TransportErrorKind) -> Self {
        FailureOutcome::Transport(kind)
    }
}

/// Failure history of one logical request across all of its retries.
///
/// The counter only grows: the first recorded failure is attempt 1, and it is
/// never reset while the request (including its resubmissions) is alive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestAttempt {
    count: u32,
    method: Method,
    last_outcome: Option<FailureOutcome>,
}

impl RequestAttempt {
    pub fn new(method: Method) -> Self {
        Self {
            count: 0,
            method,
            last_outcome: None,
        }
    }

    /// Records a failed attempt and returns the new attempt count.
    pub fn record(&mut self, outcome: impl Into<FailureOutcome>) -> u32 {
        self.count = self.count.saturating_add(1);
        self.last_outcome = Some(outcome.into());
        self.count
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn last_outcome(&self) -> Option<FailureOutcome> {
        self.last_outcome
    }
}
