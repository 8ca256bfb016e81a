//! Request lifecycle events.
//!
//! Sinks only observe. They are called synchronously on the request path and
//! must return quickly; nothing they do can change a retry decision.

use std::time::Duration;

use reqwest::{Method, StatusCode};

use crate::{FailureOutcome, RefreshOutcome, RetryDecision};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestEvent {
    Sent {
        method: Method,
        url: String,
        attempt: u32,
    },
    Retrying {
        method: Method,
        url: String,
        attempt: u32,
        decision: RetryDecision,
    },
    Failed {
        method: Method,
        url: String,
        attempt: u32,
        outcome: FailureOutcome,
    },
    /// A send returned a success status. `elapsed` spans every attempt,
    /// including retry delays and refresh waits.
    Completed {
        method: Method,
        url: String,
        attempt: u32,
        status: StatusCode,
        elapsed: Duration,
    },
    RefreshStarted,
    RefreshCompleted {
        outcome: RefreshOutcome,
        elapsed: Duration,
        /// Rendered [`RefreshError`](crate::RefreshError) when the cycle failed.
        error: Option<String>,
    },
    CancelledAll,
}

/// Observer of [`RequestEvent`]s.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &RequestEvent);
}

/// Sink that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn on_event(&self, _event: &RequestEvent) {}
}

/// Sink that writes events to `tracing`.
#[cfg(feature = "tracing")]
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

#[cfg(feature = "tracing")]
impl EventSink for TracingSink {
    fn on_event(&self, event: &RequestEvent) {
        match event {
            RequestEvent::Sent {
                method,
                url,
                attempt,
            } => tracing::debug!(%method, %url, attempt, "request sent"),
            RequestEvent::Retrying {
                method,
                url,
                attempt,
                decision,
            } => tracing::debug!(%method, %url, attempt, ?decision, "retrying request"),
            RequestEvent::Failed {
                method,
                url,
                attempt,
                outcome,
            } => tracing::warn!(%method, %url, attempt, ?outcome, "request failed"),
            RequestEvent::Completed {
                method,
                url,
                attempt,
                status,
                elapsed,
            } => tracing::debug!(%method, %url, attempt, %status, ?elapsed, "request completed"),
            RequestEvent::RefreshStarted => tracing::info!("credential refresh started"),
            RequestEvent::RefreshCompleted {
                outcome,
                elapsed,
                error: Some(error),
            } => tracing::warn!(?outcome, ?elapsed, %error, "credential refresh failed"),
            RequestEvent::RefreshCompleted { outcome, elapsed, .. } => {
                tracing::info!(?outcome, ?elapsed, "credential refresh finished")
            }
            RequestEvent::CancelledAll => {
                tracing::warn!("credential refresh failed, outstanding requests cancelled")
            }
        }
    }
}
