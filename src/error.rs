use std::time::Duration;

/// Boxed error returned by a [`CredentialProvider`](crate::CredentialProvider) refresh.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// Non-success HTTP status code with raw response body.
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },
    /// Response body could not be decoded into the requested type.
    #[error("decode error: {0}")]
    Decode(String),
    /// Request parameters could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),
    /// Base URL or route path could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// Invalid retry configuration value.
    #[error("config error: {0}")]
    Config(String),
}

/// Why a credential refresh cycle ended in failure.
///
/// Every variant maps to [`RefreshOutcome::Failure`](crate::RefreshOutcome::Failure).
/// The rendered message travels on [`RequestEvent::RefreshCompleted`](crate::RequestEvent).
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The provider reported an error.
    #[error("credential provider failed: {0}")]
    Provider(BoxError),
    /// The provider did not finish within the configured refresh timeout.
    #[error("credential refresh timed out after {0:?}")]
    Timeout(Duration),
    /// The provider panicked while refreshing.
    #[error("credential refresh panicked")]
    Panicked,
    /// The refresh task was torn down before it could report.
    #[error("credential refresh aborted")]
    Aborted,
}
