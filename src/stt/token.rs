use crate::error::TokenError;
use serde::Deserialize;
use tracing::debug;

/// A short-lived bearer token for one streaming session.
#[derive(Debug, Clone, Deserialize)]
pub struct IssuedToken {
    pub token: String,
    /// Seconds until expiry, when the endpoint reports it. Tokens are
    /// single-use per session start, so nothing refreshes this.
    #[serde(default)]
    pub expires_in_seconds: Option<u64>,
}

/// Source of session tokens. A fresh token is fetched per session start;
/// tokens expire quickly, so nothing is cached across sessions.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<IssuedToken, TokenError>;
}

/// Fetches tokens from the application's token endpoint over HTTP GET.
/// The endpoint returns `{"token": "...", "expires_in_seconds": ...}`.
pub struct HttpTokenSource {
    url: String,
    client: reqwest::Client,
}

impl HttpTokenSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch(&self) -> Result<IssuedToken, TokenError> {
        debug!("Requesting session token from {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| TokenError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TokenError::Status(response.status().as_u16()));
        }

        let issued: IssuedToken = response
            .json()
            .await
            .map_err(|e| TokenError::Request(e.to_string()))?;

        if issued.token.is_empty() {
            return Err(TokenError::Missing);
        }

        Ok(issued)
    }
}
