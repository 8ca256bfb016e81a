use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{header::HeaderMap, Method, Url};
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::{sleep, Instant};

use crate::{
    events::{EventSink, RequestEvent},
    ClientError, CredentialProvider, FailureOutcome, RequestAttempt, RequestInterceptor, Result,
    RetryDecision, RetryPolicyConfig, TransportErrorKind,
};

/// Where route parameters go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamEncoding {
    /// URL query string.
    Query,
    /// `application/json` body.
    Json,
    /// `application/x-www-form-urlencoded` body.
    Form,
}

impl ParamEncoding {
    /// `GET` carries parameters in the query string, every other method as JSON.
    pub fn for_method(method: &Method) -> Self {
        if *method == Method::GET {
            ParamEncoding::Query
        } else {
            ParamEncoding::Json
        }
    }
}

/// Description of one API endpoint.
#[derive(Clone, Debug)]
pub struct Route {
    pub method: Method,
    /// Absolute URL, or a path resolved against the client's base URL.
    pub path: String,
    /// Request-specific headers; they win over the provider's common headers.
    pub headers: HeaderMap,
    /// Overrides [`ParamEncoding::for_method`].
    pub encoding: Option<ParamEncoding>,
}

impl Route {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            encoding: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_encoding(mut self, encoding: ParamEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }
}

/// Anything that knows which [`Route`] it maps to, typically an API enum.
pub trait Routable {
    fn route(&self) -> Route;
}

impl Routable for Route {
    fn route(&self) -> Route {
        self.clone()
    }
}

/// HTTP client that resubmits failed requests according to a [`RequestInterceptor`].
pub struct RetryingClient<P> {
    http: reqwest::Client,
    base_url: Option<Url>,
    request_timeout: Option<Duration>,
    interceptor: RequestInterceptor<P>,
}

impl<P> Clone for RetryingClient<P> {
    fn clone(&self) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            request_timeout: self.request_timeout,
            interceptor: self.interceptor.clone(),
        }
    }
}

impl<P> fmt::Debug for RetryingClient<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingClient")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("request_timeout", &self.request_timeout)
            .field("interceptor", &self.interceptor)
            .finish()
    }
}

enum Failure {
    Status(reqwest::Response),
    Transport(reqwest::Error),
}

impl Failure {
    async fn into_error(self) -> ClientError {
        match self {
            Failure::Status(response) => {
                let status = response.status().as_u16();
                match response.text().await {
                    Ok(body) => ClientError::Http { status, body },
                    Err(err) => ClientError::Transport(err),
                }
            }
            Failure::Transport(err) => ClientError::Transport(err),
        }
    }
}

impl<P: CredentialProvider> RetryingClient<P> {
    /// Creates a client with a default `reqwest::Client`.
    pub fn new(policy: RetryPolicyConfig, provider: P) -> Self {
        Self::with_interceptor(reqwest::Client::new(), RequestInterceptor::new(policy, provider))
    }

    /// Creates a client whose policy is read from `REAUTH_*` environment variables.
    ///
    /// See [`RetryPolicyConfig::from_env`] for the variables.
    pub fn from_env(provider: P) -> Result<Self> {
        Ok(Self::new(RetryPolicyConfig::from_env()?, provider))
    }

    /// Creates a client that reports lifecycle events to `events`.
    pub fn with_events(
        policy: RetryPolicyConfig,
        provider: P,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_interceptor(
            reqwest::Client::new(),
            RequestInterceptor::with_events(policy, provider, events),
        )
    }

    pub fn with_interceptor(http: reqwest::Client, interceptor: RequestInterceptor<P>) -> Self {
        Self {
            http,
            base_url: None,
            request_timeout: None,
            interceptor,
        }
    }

    /// Sets the base URL that relative route paths are joined to.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        let url = Url::parse(base_url)
            .map_err(|err| ClientError::InvalidUrl(format!("{base_url}: {err}")))?;
        self.base_url = Some(url);
        Ok(self)
    }

    /// Applies a per-attempt timeout to requests that do not set their own.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn interceptor(&self) -> &RequestInterceptor<P> {
        &self.interceptor
    }

    /// Starts a request on the underlying `reqwest` client.
    ///
    /// Send it with [`send`](Self::send) to get retries and header injection.
    pub fn request(&self, method: Method, url: impl reqwest::IntoUrl) -> reqwest::RequestBuilder {
        self.http.request(method, url)
    }

    pub async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let request = builder.build().map_err(ClientError::Transport)?;
        self.execute(request).await
    }

    /// Sends a request and decodes a successful JSON body.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = self.send(builder).await?;
        decode_json(response).await
    }

    /// Sends a route without parameters.
    pub async fn send_route<R>(&self, router: &R) -> Result<reqwest::Response>
    where
        R: Routable + ?Sized,
    {
        let request = self.build_route(router, None::<&()>)?;
        self.execute(request).await
    }

    /// Sends a route with parameters.
    ///
    /// `params` are encoded with the route's [`ParamEncoding`], falling back
    /// to a query string for `GET` and a JSON body otherwise.
    pub async fn send_route_with<R, S>(&self, router: &R, params: &S) -> Result<reqwest::Response>
    where
        R: Routable + ?Sized,
        S: Serialize + ?Sized,
    {
        let request = self.build_route(router, Some(params))?;
        self.execute(request).await
    }

    fn build_route<R, S>(&self, router: &R, params: Option<&S>) -> Result<reqwest::Request>
    where
        R: Routable + ?Sized,
        S: Serialize + ?Sized,
    {
        let route = router.route();
        let url = self.resolve(&route.path)?;
        let mut builder = self
            .http
            .request(route.method.clone(), url)
            .headers(route.headers);
        if let Some(params) = params {
            let encoding = route
                .encoding
                .unwrap_or_else(|| ParamEncoding::for_method(&route.method));
            builder = match encoding {
                ParamEncoding::Query => builder.query(params),
                ParamEncoding::Json => builder.json(params),
                ParamEncoding::Form => builder.form(params),
            };
        }
        builder
            .build()
            .map_err(|err| ClientError::Encode(err.to_string()))
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        let resolved = match &self.base_url {
            Some(base) => base.join(path),
            None => Url::parse(path),
        };
        resolved.map_err(|err| ClientError::InvalidUrl(format!("{path}: {err}")))
    }

    /// Sends `request`, resubmitting it for as long as the interceptor says so.
    ///
    /// Non-2xx responses count as failures. A request whose body cannot be
    /// cloned (a stream) is sent once: its failure still goes through the
    /// interceptor, so an expired credential is refreshed for later requests,
    /// but the request itself is never resent.
    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let mut attempt = RequestAttempt::new(request.method().clone());
        let mut request = request;
        let started_at = Instant::now();

        loop {
            if request.timeout().is_none() {
                *request.timeout_mut() = self.request_timeout;
            }
            let (replay, resendable) = match request.try_clone() {
                Some(copy) => (copy, true),
                None => (
                    reqwest::Request::new(request.method().clone(), request.url().clone()),
                    false,
                ),
            };
            let send_number = attempt.count().saturating_add(1);

            self.interceptor.emit(RequestEvent::Sent {
                method: request.method().clone(),
                url: request.url().to_string(),
                attempt: send_number,
            });
            let sent = self.interceptor.on_before_send(request);

            let (outcome, failure) = match self.http.execute(sent).await {
                Ok(response) if response.status().is_success() => {
                    self.interceptor.emit(RequestEvent::Completed {
                        method: replay.method().clone(),
                        url: replay.url().to_string(),
                        attempt: send_number,
                        status: response.status(),
                        elapsed: started_at.elapsed(),
                    });
                    return Ok(response);
                }
                Ok(response) => (
                    FailureOutcome::Status(response.status()),
                    Failure::Status(response),
                ),
                Err(err) => (
                    FailureOutcome::Transport(TransportErrorKind::of(&err)),
                    Failure::Transport(err),
                ),
            };
            attempt.record(outcome);

            let decision = self.interceptor.on_failure(&replay, &attempt, &outcome).await;
            if !resendable {
                #[cfg(feature = "tracing")]
                tracing::debug!(?decision, "request body is not replayable, not resending");
                return Err(failure.into_error().await);
            }
            match decision {
                RetryDecision::DoNotRetry => return Err(failure.into_error().await),
                RetryDecision::RetryNow => {}
                RetryDecision::RetryAfterDelay(delay) => sleep(delay).await,
            }
            request = replay;
        }
    }
}

async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let body = response.text().await.map_err(ClientError::Transport)?;
    serde_json::from_str(&body).map_err(|err| {
        ClientError::Decode(format!("invalid response JSON: {err}; body: {body}"))
    })
}
