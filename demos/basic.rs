use std::sync::Mutex;

use reauth_http::{
    bearer_authorization, BoxError, CredentialProvider, RetryPolicyConfig, RetryingClient, Route,
};
use reqwest::{
    header::{HeaderMap, AUTHORIZATION},
    Method,
};

/// Reads the access token from `REAUTH_TOKEN` and "refreshes" it from
/// `REAUTH_REFRESHED_TOKEN`.
struct EnvTokens {
    token: Mutex<String>,
}

impl CredentialProvider for EnvTokens {
    fn common_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let token = self.token.lock().map(|t| t.clone()).unwrap_or_default();
        if let Ok(value) = bearer_authorization(&token) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    async fn refresh_credentials(&self) -> Result<(), BoxError> {
        let fresh = std::env::var("REAUTH_REFRESHED_TOKEN")?;
        *self.token.lock().map_err(|_| "token lock poisoned")? = fresh;
        Ok(())
    }

    fn cancel_all_requests(&self) {
        eprintln!("refresh failed; signing out");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let base_url = std::env::var("REAUTH_BASE_URL")?;
    let token = std::env::var("REAUTH_TOKEN")?;

    let client = RetryingClient::new(
        RetryPolicyConfig::from_env()?,
        EnvTokens {
            token: Mutex::new(token),
        },
    )
    .with_base_url(&base_url)?;

    let response = client.send_route(&Route::new(Method::GET, "me")).await?;
    println!("{}", response.text().await?);

    Ok(())
}
