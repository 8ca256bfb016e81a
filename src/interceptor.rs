use std::fmt;
use std::sync::Arc;

use crate::{
    classify::RetryClassifier,
    events::{EventSink, NoopSink, RequestEvent},
    headers::compose_headers,
    CredentialProvider, CredentialRefreshCoordinator, FailureOutcome, RequestAttempt,
    RetryDecision, RetryPolicyConfig, WaitDiscipline,
};

/// The two hooks every outgoing request passes through.
///
/// [`on_before_send`](Self::on_before_send) injects the provider's common
/// headers; [`on_failure`](Self::on_failure) turns a failed attempt into a
/// [`RetryDecision`], running a shared credential refresh when needed.
pub struct RequestInterceptor<P> {
    policy: Arc<RetryPolicyConfig>,
    coordinator: CredentialRefreshCoordinator<P>,
    events: Arc<dyn EventSink>,
}

impl<P> Clone for RequestInterceptor<P> {
    fn clone(&self) -> Self {
        Self {
            policy: Arc::clone(&self.policy),
            coordinator: self.coordinator.clone(),
            events: Arc::clone(&self.events),
        }
    }
}

impl<P> fmt::Debug for RequestInterceptor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestInterceptor")
            .field("policy", &self.policy)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl<P: CredentialProvider> RequestInterceptor<P> {
    pub fn new(policy: RetryPolicyConfig, provider: P) -> Self {
        Self::with_events(policy, provider, Arc::new(NoopSink))
    }

    pub fn with_events(
        policy: RetryPolicyConfig,
        provider: P,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let coordinator = CredentialRefreshCoordinator::with_events(
            Arc::new(provider),
            policy.refresh_timeout,
            Arc::clone(&events),
        );
        Self {
            policy: Arc::new(policy),
            coordinator,
            events,
        }
    }

    pub fn policy(&self) -> &RetryPolicyConfig {
        &self.policy
    }

    pub fn coordinator(&self) -> &CredentialRefreshCoordinator<P> {
        &self.coordinator
    }

    pub(crate) fn emit(&self, event: RequestEvent) {
        self.events.on_event(&event);
    }

    /// Layers the provider's common headers under the request's own headers.
    pub fn on_before_send(&self, mut request: reqwest::Request) -> reqwest::Request {
        let common = self.coordinator.provider().common_headers();
        let composed = compose_headers(&common, request.headers());
        *request.headers_mut() = composed;
        request
    }

    /// Decides what to do with a failed attempt.
    ///
    /// `attempt` must already have `outcome` recorded. Only suspends when the
    /// failure needs a credential refresh.
    pub async fn on_failure(
        &self,
        request: &reqwest::Request,
        attempt: &RequestAttempt,
        outcome: &FailureOutcome,
    ) -> RetryDecision {
        let classification = RetryClassifier::classify(attempt, outcome, &self.policy);
        let decision = match classification.into_decision() {
            Some(decision) => decision,
            None => self.refresh_decision().await,
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            method = %request.method(),
            url = %request.url(),
            attempt = attempt.count(),
            ?outcome,
            ?classification,
            ?decision,
            "classified failed request"
        );

        let event = if decision.is_retry() {
            RequestEvent::Retrying {
                method: request.method().clone(),
                url: request.url().to_string(),
                attempt: attempt.count(),
                decision,
            }
        } else {
            RequestEvent::Failed {
                method: request.method().clone(),
                url: request.url().to_string(),
                attempt: attempt.count(),
                outcome: *outcome,
            }
        };
        self.emit(event);

        decision
    }

    async fn refresh_decision(&self) -> RetryDecision {
        match self.policy.wait_discipline {
            WaitDiscipline::Block => self.coordinator.await_refresh().await.into(),
            WaitDiscipline::Defer => match self.coordinator.await_refresh_or_defer().await {
                Some(outcome) => outcome.into(),
                None => RetryDecision::RetryAfterDelay(self.policy.retry_delay),
            },
        }
    }
}
