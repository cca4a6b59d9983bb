use std::time::Duration;

use async_trait::async_trait;
use ka_core::config::BackendConfig;
use ka_core::error::AuthError;
use ka_core::types::{LoginCredentials, SessionCredential};
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{RequestBuilder, Response};
use tracing::debug;

/// Longest backend body excerpt carried in a rejection message.
const MAX_MESSAGE_LEN: usize = 200;

// ---------------------------------------------------------------------------
// SessionApi
// ---------------------------------------------------------------------------

/// The three backend calls the keep-alive engine needs.
///
/// Implementations must be side-effect free beyond the network call itself.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Authenticate and return the new session credential.
    async fn login(&self, credentials: &LoginCredentials) -> Result<SessionCredential, AuthError>;

    /// Check that `credential` still identifies a live session.
    async fn verify(&self, credential: &SessionCredential) -> Result<(), AuthError>;

    /// Invalidate the session behind `credential`.
    async fn logout(&self, credential: &SessionCredential) -> Result<(), AuthError>;
}

// ---------------------------------------------------------------------------
// HttpSessionClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpSessionClient {
    http: reqwest::Client,
    base_url: String,
    verify_path: String,
    login_timeout: Duration,
    logout_timeout: Duration,
}

impl HttpSessionClient {
    /// Build a client from the backend section of the config.
    pub fn new(config: &BackendConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("ka-keepalive/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            verify_path: config.verify_path.clone(),
            login_timeout: config.login_timeout,
            logout_timeout: config.logout_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, AuthError> {
        let response = request.send().await.map_err(transport_error)?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(rejection(response).await)
        }
    }
}

#[async_trait]
impl SessionApi for HttpSessionClient {
    async fn login(&self, credentials: &LoginCredentials) -> Result<SessionCredential, AuthError> {
        let mut body = serde_json::Map::new();
        body.insert(
            credentials.identity.field_name().to_string(),
            serde_json::Value::String(credentials.identity.value().to_string()),
        );
        body.insert(
            "password".to_string(),
            serde_json::Value::String(credentials.password.clone()),
        );

        let request = self
            .http
            .post(self.url("/api/auth/login"))
            .timeout(self.login_timeout)
            .json(&body);
        let response = self.send(request).await?;

        let cookie = cookie_header(&response);
        debug!(
            status = response.status().as_u16(),
            has_cookie = cookie.is_some(),
            "login response received"
        );
        cookie.and_then(SessionCredential::new).ok_or_else(|| {
            AuthError::rejected(
                Some(response.status().as_u16()),
                "no session cookie in login response",
            )
        })
    }

    async fn verify(&self, credential: &SessionCredential) -> Result<(), AuthError> {
        let request = self
            .http
            .get(self.url(&self.verify_path))
            .timeout(self.login_timeout)
            .header(COOKIE, credential.as_str());
        self.send(request).await?;
        Ok(())
    }

    async fn logout(&self, credential: &SessionCredential) -> Result<(), AuthError> {
        let request = self
            .http
            .post(self.url("/api/auth/logout"))
            .timeout(self.logout_timeout)
            .header(COOKIE, credential.as_str());
        self.send(request).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn transport_error(e: reqwest::Error) -> AuthError {
    if e.is_timeout() {
        AuthError::Transport(format!("request timed out: {e}"))
    } else {
        AuthError::Transport(e.to_string())
    }
}

/// Build a `Rejected` error from a non-2xx response, preferring the
/// backend's own `message` / `error` field over the raw body.
async fn rejection(response: Response) -> AuthError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| {
            ["message", "error"]
                .iter()
                .find_map(|k| v.get(*k).and_then(|m| m.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                trimmed.chars().take(MAX_MESSAGE_LEN).collect()
            }
        });
    AuthError::rejected(Some(status.as_u16()), message)
}

/// Fold every `Set-Cookie` header into a single `Cookie` header value,
/// keeping only the `name=value` pair of each cookie.
fn cookie_header(response: &Response) -> Option<String> {
    let pairs: Vec<&str> = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}
