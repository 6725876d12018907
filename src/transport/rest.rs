use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, header::{HeaderValue, AUTHORIZATION}};
use crate::protocol::models::SessionConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const REST_BASE_URL: &str = "https://api.openai.com/v1/realtime";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Short-lived token authorizing exactly one provider session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl Credential {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now().timestamp()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ClientSecret {
    value: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateSessionResponse {
    client_secret: ClientSecret,
}

/// Source of ephemeral credentials. Each call gets a fresh one.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// # Errors
    /// Returns an error if the provider refuses or cannot be reached.
    async fn issue(&self) -> Result<Credential>;
}

/// Mints credentials through the provider's REST session endpoint, keeping the
/// long-lived API key on the server.
#[derive(Clone, Debug)]
pub struct RestCredentialIssuer {
    client: Client,
    auth_header: HeaderValue,
    base_url: String,
    session: SessionConfig,
    fallback_ttl: Duration,
}

impl RestCredentialIssuer {
    /// Create an issuer with the given API key and session template.
    ///
    /// # Errors
    /// Returns an error if the API key results in an invalid header or client build fails.
    #[allow(clippy::result_large_err)]
    pub fn new(api_key: &str, session: SessionConfig) -> Result<Self> {
        Self::new_with_timeouts(api_key, session, DEFAULT_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT)
    }

    /// Create an issuer with custom timeouts.
    ///
    /// # Errors
    /// Returns an error if the API key results in an invalid header or client build fails.
    #[allow(clippy::result_large_err)]
    pub fn new_with_timeouts(
        api_key: &str,
        session: SessionConfig,
        timeout: Duration,
        pool_idle_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(pool_idle_timeout)
            .build()?;

        let auth_header = HeaderValue::from_str(&format!("Bearer {api_key}"))?;

        Ok(Self {
            client,
            auth_header,
            base_url: REST_BASE_URL.to_string(),
            session,
            fallback_ttl: Duration::from_secs(60),
        })
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Lifetime assumed when the provider omits `expires_at`.
    #[must_use]
    pub const fn with_fallback_ttl(mut self, ttl: Duration) -> Self {
        self.fallback_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn session(&self) -> &SessionConfig {
        &self.session
    }
}

#[async_trait]
impl CredentialIssuer for RestCredentialIssuer {
    async fn issue(&self) -> Result<Credential> {
        let res = self.client
            .post(format!("{}/sessions", self.base_url))
            .header(AUTHORIZATION, &self.auth_header)
            .json(&self.session)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            tracing::warn!("Credential request rejected with {status}: {body}");
            return Err(Error::Connection(format!("credential request failed with {status}")));
        }

        let body: CreateSessionResponse = res.json().await?;
        let ttl = i64::try_from(self.fallback_ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = body
            .client_secret
            .expires_at
            .unwrap_or_else(|| Utc::now().timestamp().saturating_add(ttl));

        tracing::debug!("Issued ephemeral credential expiring at {expires_at}");

        Ok(Credential {
            token: body.client_secret.value,
            expires_at,
        })
    }
}
