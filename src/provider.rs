use std::future::Future;

use reqwest::header::HeaderMap;

use crate::error::BoxError;

/// Caller-supplied credential source.
///
/// The coordinator keeps a single owned handle to the provider; the provider
/// never needs a reference back to the client.
pub trait CredentialProvider: Send + Sync + 'static {
    /// Headers added to every outgoing request, e.g. `Authorization`.
    ///
    /// Called once per attempt, so a refreshed token is picked up by the retry.
    fn common_headers(&self) -> HeaderMap;

    /// Re-establishes an expired credential.
    ///
    /// Runs at most once per refresh cycle regardless of how many requests are
    /// waiting. Any `Err` ends the cycle as a failure.
    fn refresh_credentials(&self) -> impl Future<Output = Result<(), BoxError>> + Send;

    /// Cancels every outstanding request, typically followed by a logout.
    ///
    /// Invoked once per failed refresh cycle, never once per waiting request.
    fn cancel_all_requests(&self);
}
