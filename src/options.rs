use std::collections::HashSet;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;

use crate::ClientError;

/// Default configuration values, taken from the interceptor this crate replaces.
pub mod defaults {
    use std::time::Duration;

    /// Maximum recorded failures before a request is given up.
    pub const MAX_RETRIES: u32 = 3;

    /// Delay handed to requests that find a refresh already in flight.
    pub const RETRY_DELAY: Duration = Duration::from_secs(2);

    /// Upper bound on one credential refresh.
    pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

    /// Status codes that mean "credential expired".
    pub const CREDENTIAL_EXPIRED: [u16; 1] = [401];
}

/// Transport failure categories used for retry eligibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Request,
    Body,
    Decode,
    Redirect,
    Other,
}

impl TransportErrorKind {
    /// Categorizes a `reqwest` error. Timeouts win over every other flag.
    pub fn of(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_body() {
            TransportErrorKind::Body
        } else if err.is_decode() {
            TransportErrorKind::Decode
        } else if err.is_redirect() {
            TransportErrorKind::Redirect
        } else if err.is_request() {
            TransportErrorKind::Request
        } else {
            TransportErrorKind::Other
        }
    }

    fn parse(value: &str) -> Option<Self> {
        let kind = match value.trim().to_ascii_lowercase().as_str() {
            "timeout" => TransportErrorKind::Timeout,
            "connect" => TransportErrorKind::Connect,
            "request" => TransportErrorKind::Request,
            "body" => TransportErrorKind::Body,
            "decode" => TransportErrorKind::Decode,
            "redirect" => TransportErrorKind::Redirect,
            "other" => TransportErrorKind::Other,
            _ => return None,
        };
        Some(kind)
    }
}

/// How a request that finds a refresh already in flight is resolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitDiscipline {
    /// Suspend until the in-flight refresh publishes its outcome.
    #[default]
    Block,
    /// Answer `RetryAfterDelay(retry_delay)` and let the request be classified again later.
    ///
    /// Meant for environments that cannot park a task; bursts of failures cost
    /// one extra classification per waiter.
    Defer,
}

impl WaitDiscipline {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" => Some(WaitDiscipline::Block),
            "defer" => Some(WaitDiscipline::Defer),
            _ => None,
        }
    }
}

/// Immutable retry and refresh policy of one client.
///
/// Build it with the consuming setters, then hand it to
/// [`RequestInterceptor`](crate::RequestInterceptor) which keeps it behind an `Arc`.
///
/// ```
/// use std::time::Duration;
/// use reauth_http::RetryPolicyConfig;
/// use reqwest::StatusCode;
///
/// let policy = RetryPolicyConfig::new()
///     .max_retries(2)
///     .retry_status_codes([StatusCode::SERVICE_UNAVAILABLE])
///     .retry_delay(Duration::from_millis(500));
/// assert!(policy.is_credential_expired(StatusCode::UNAUTHORIZED));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawPolicy")]
pub struct RetryPolicyConfig {
    /// Attempt count at which classification stops retrying.
    pub max_retries: u32,
    /// Statuses retried as-is.
    pub retry_status_codes: HashSet<StatusCode>,
    /// Transport failures retried when the method allows it.
    pub retry_error_kinds: HashSet<TransportErrorKind>,
    /// Methods allowed to retry after a transport failure.
    pub retry_methods: HashSet<Method>,
    /// Statuses that trigger a credential refresh instead of a plain retry.
    pub credential_expired_status_codes: HashSet<StatusCode>,
    /// Delay used under [`WaitDiscipline::Defer`].
    pub retry_delay: Duration,
    /// Base for exponential delays on plain retries; `None` retries immediately.
    pub retry_backoff: Option<Duration>,
    /// Refreshes running longer than this count as failed.
    pub refresh_timeout: Duration,
    pub wait_discipline: WaitDiscipline,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::MAX_RETRIES,
            retry_status_codes: HashSet::new(),
            retry_error_kinds: [TransportErrorKind::Timeout, TransportErrorKind::Connect]
                .into_iter()
                .collect(),
            retry_methods: idempotent_methods(),
            credential_expired_status_codes: defaults::CREDENTIAL_EXPIRED
                .iter()
                .filter_map(|code| StatusCode::from_u16(*code).ok())
                .collect(),
            retry_delay: defaults::RETRY_DELAY,
            retry_backoff: None,
            refresh_timeout: defaults::REFRESH_TIMEOUT,
            wait_discipline: WaitDiscipline::Block,
        }
    }
}

impl RetryPolicyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries and never refreshes.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_status_codes(mut self, codes: impl IntoIterator<Item = StatusCode>) -> Self {
        self.retry_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retry_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retry_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retry_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.retry_methods = methods.into_iter().collect();
        self
    }

    pub fn credential_expired_status_codes(
        mut self,
        codes: impl IntoIterator<Item = StatusCode>,
    ) -> Self {
        self.credential_expired_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn wait_discipline(mut self, discipline: WaitDiscipline) -> Self {
        self.wait_discipline = discipline;
        self
    }

    pub fn is_credential_expired(&self, status: StatusCode) -> bool {
        self.credential_expired_status_codes.contains(&status)
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retry_status_codes.contains(&status)
    }

    pub fn is_retryable_method(&self, method: &Method) -> bool {
        self.retry_methods.contains(method)
    }

    pub fn is_retryable_error(&self, kind: TransportErrorKind) -> bool {
        self.retry_error_kinds.contains(&kind)
    }

    /// Exponential delay for the given attempt count, if backoff is enabled.
    ///
    /// Attempt 1 waits the base delay; the exponent is capped at 16.
    pub fn backoff_for(&self, attempt: u32) -> Option<Duration> {
        let base = self.retry_backoff?;
        let exp = attempt.saturating_sub(1).min(16);
        Some(base.saturating_mul(1u32 << exp))
    }

    /// Reads the policy from `REAUTH_*` environment variables.
    ///
    /// Unset variables keep their defaults:
    /// - `REAUTH_MAX_RETRIES`
    /// - `REAUTH_RETRY_STATUS_CODES` (comma separated, e.g. `502,503`)
    /// - `REAUTH_CREDENTIAL_EXPIRED_STATUS_CODES`
    /// - `REAUTH_RETRY_METHODS` (e.g. `GET,PUT`)
    /// - `REAUTH_RETRY_ERROR_KINDS` (e.g. `timeout,connect`)
    /// - `REAUTH_RETRY_DELAY_MS`
    /// - `REAUTH_RETRY_BACKOFF_MS`
    /// - `REAUTH_REFRESH_TIMEOUT_MS`
    /// - `REAUTH_WAIT_DISCIPLINE` (`block` or `defer`)
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let raw = RawPolicy {
            max_retries: get("REAUTH_MAX_RETRIES")
                .map(|value| parse_number("REAUTH_MAX_RETRIES", &value))
                .transpose()?,
            retry_status_codes: get("REAUTH_RETRY_STATUS_CODES")
                .map(|value| parse_list("REAUTH_RETRY_STATUS_CODES", &value, |v| v.parse().ok()))
                .transpose()?,
            credential_expired_status_codes: get("REAUTH_CREDENTIAL_EXPIRED_STATUS_CODES")
                .map(|value| {
                    parse_list("REAUTH_CREDENTIAL_EXPIRED_STATUS_CODES", &value, |v| {
                        v.parse().ok()
                    })
                })
                .transpose()?,
            retry_methods: get("REAUTH_RETRY_METHODS")
                .map(|value| parse_list("REAUTH_RETRY_METHODS", &value, |v| Some(v.to_owned())))
                .transpose()?,
            retry_error_kinds: get("REAUTH_RETRY_ERROR_KINDS")
                .map(|value| {
                    parse_list("REAUTH_RETRY_ERROR_KINDS", &value, TransportErrorKind::parse)
                })
                .transpose()?,
            retry_delay_ms: get("REAUTH_RETRY_DELAY_MS")
                .map(|value| parse_number("REAUTH_RETRY_DELAY_MS", &value))
                .transpose()?,
            retry_backoff_ms: get("REAUTH_RETRY_BACKOFF_MS")
                .map(|value| parse_number("REAUTH_RETRY_BACKOFF_MS", &value))
                .transpose()?,
            refresh_timeout_ms: get("REAUTH_REFRESH_TIMEOUT_MS")
                .map(|value| parse_number("REAUTH_REFRESH_TIMEOUT_MS", &value))
                .transpose()?,
            wait_discipline: get("REAUTH_WAIT_DISCIPLINE")
                .map(|value| {
                    WaitDiscipline::parse(&value).ok_or_else(|| {
                        ClientError::Config(format!(
                            "REAUTH_WAIT_DISCIPLINE must be 'block' or 'defer', got '{value}'"
                        ))
                    })
                })
                .transpose()?,
        };
        Self::try_from(raw)
    }
}

fn idempotent_methods() -> HashSet<Method> {
    [
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::PUT,
        Method::DELETE,
        Method::TRACE,
    ]
    .into_iter()
    .collect()
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ClientError> {
    value
        .trim()
        .parse()
        .map_err(|_| ClientError::Config(format!("{name} is not a valid number: '{value}'")))
}

fn parse_list<T>(
    name: &str,
    value: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Vec<T>, ClientError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            parse(item)
                .ok_or_else(|| ClientError::Config(format!("{name} has invalid entry '{item}'")))
        })
        .collect()
}

/// Wire shape of a serialized policy; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawPolicy {
    max_retries: Option<u32>,
    retry_status_codes: Option<Vec<u16>>,
    retry_error_kinds: Option<Vec<TransportErrorKind>>,
    retry_methods: Option<Vec<String>>,
    credential_expired_status_codes: Option<Vec<u16>>,
    retry_delay_ms: Option<u64>,
    retry_backoff_ms: Option<u64>,
    refresh_timeout_ms: Option<u64>,
    wait_discipline: Option<WaitDiscipline>,
}

impl TryFrom<RawPolicy> for RetryPolicyConfig {
    type Error = ClientError;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        let mut policy = RetryPolicyConfig::default();
        if let Some(max_retries) = raw.max_retries {
            policy.max_retries = max_retries;
        }
        if let Some(codes) = raw.retry_status_codes {
            policy.retry_status_codes = status_set(&codes)?;
        }
        if let Some(kinds) = raw.retry_error_kinds {
            policy.retry_error_kinds = kinds.into_iter().collect();
        }
        if let Some(methods) = raw.retry_methods {
            policy.retry_methods = methods
                .iter()
                .map(|name| {
                    Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes())
                        .map_err(|_| ClientError::Config(format!("invalid http method '{name}'")))
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(codes) = raw.credential_expired_status_codes {
            policy.credential_expired_status_codes = status_set(&codes)?;
        }
        if let Some(ms) = raw.retry_delay_ms {
            policy.retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.retry_backoff_ms {
            policy.retry_backoff = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = raw.refresh_timeout_ms {
            policy.refresh_timeout = Duration::from_millis(ms);
        }
        if let Some(discipline) = raw.wait_discipline {
            policy.wait_discipline = discipline;
        }
        Ok(policy)
    }
}

fn status_set(codes: &[u16]) -> Result<HashSet<StatusCode>, ClientError> {
    codes
        .iter()
        .map(|code| {
            StatusCode::from_u16(*code)
                .map_err(|_| ClientError::Config(format!("invalid http status code {code}")))
        })
        .collect()
}
