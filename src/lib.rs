//! `reauth-http` decides what happens to failed HTTP requests.
//!
//! Every request passes through a [`RequestInterceptor`]:
//! - before sending, the [`CredentialProvider`]'s common headers are layered
//!   under the request's own headers;
//! - after a failure, [`RetryClassifier`] picks retry, delay or give-up, and a
//!   credential-expired status triggers a single refresh shared by every
//!   request that hit it ([`CredentialRefreshCoordinator`]).
//!
//! [`RetryingClient`] wires the interceptor into a `reqwest` client.
//!
//! ```no_run
//! use reauth_http::{BoxError, CredentialProvider, RetryPolicyConfig, RetryingClient};
//! use reqwest::{header::HeaderMap, Method, StatusCode};
//!
//! struct Tokens;
//!
//! impl CredentialProvider for Tokens {
//!     fn common_headers(&self) -> HeaderMap {
//!         HeaderMap::new()
//!     }
//!
//!     async fn refresh_credentials(&self) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//!
//!     fn cancel_all_requests(&self) {}
//! }
//!
//! # async fn run() -> reauth_http::Result<()> {
//! let policy = RetryPolicyConfig::new()
//!     .max_retries(3)
//!     .retry_status_codes([StatusCode::SERVICE_UNAVAILABLE]);
//! let client = RetryingClient::new(policy, Tokens);
//! let response = client
//!     .send(client.request(Method::GET, "https://api.example.com/v1/me"))
//!     .await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

mod attempt;
mod classify;
mod client;
mod coordinator;
mod error;
mod events;
mod headers;
mod interceptor;
mod options;
mod provider;
mod types;

pub use attempt::{FailureOutcome, RequestAttempt};
pub use classify::{Classification, RetryClassifier};
pub use client::{ParamEncoding, RetryingClient, Routable, Route};
pub use coordinator::CredentialRefreshCoordinator;
pub use error::{BoxError, ClientError, RefreshError};
pub use events::{EventSink, NoopSink, RequestEvent};
#[cfg(feature = "tracing")]
pub use events::TracingSink;
pub use headers::{bearer_authorization, compose_headers};
pub use interceptor::RequestInterceptor;
pub use options::{defaults, RetryPolicyConfig, TransportErrorKind, WaitDiscipline};
pub use provider::CredentialProvider;
pub use types::{RefreshOutcome, RefreshPhase, RetryDecision};

pub type Result<T> = std::result::Result<T, ClientError>;
