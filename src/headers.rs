use reqwest::header::{HeaderMap, HeaderValue};

use crate::ClientError;

/// Layers request-specific headers over the shared common set.
///
/// Every name present in `overrides` replaces all of its values in `base`;
/// names only present in `base` are kept. `HeaderName` is lowercase by
/// construction, so `Authorization` and `authorization` collide as expected.
pub fn compose_headers(base: &HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    let mut composed = base.clone();
    for name in overrides.keys() {
        composed.remove(name);
        for value in overrides.get_all(name) {
            composed.append(name.clone(), value.clone());
        }
    }
    composed
}

/// Builds a sensitive `Authorization` value from a bearer token.
///
/// If the token is missing the `Bearer ` prefix, it is added automatically.
pub fn bearer_authorization(token: &str) -> Result<HeaderValue, ClientError> {
    let mut value = HeaderValue::from_str(&normalize_bearer_authorization(token))
        .map_err(|_| ClientError::Config("bearer token is not a valid header value".to_owned()))?;
    value.set_sensitive(true);
    Ok(value)
}

fn normalize_bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}
