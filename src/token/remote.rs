use super::{IssuedToken, TokenError, TokenProvider, TokenValidation};
use crate::httpclient::{self, RetryError};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    user_id: &'a str,
    client_id: &'a str,
    scopes: &'a str,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    success: bool,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    claims: Option<HashMap<String, Value>>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    scopes: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    claims: Option<HashMap<String, Value>>,
}

/// Delegates generation and validation to `POST {base}/generate` and
/// `POST {base}/validate`. Retried calls resend the full body; the remote is
/// not assumed to be idempotent.
pub struct RemoteTokenProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl RemoteTokenProvider {
    pub fn new(
        base_url: String,
        timeout: Duration,
        insecure: bool,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.timeout * (httpclient::MAX_RETRIES + 1)
    }
}

#[async_trait]
impl TokenProvider for RemoteTokenProvider {
    async fn generate(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
        ttl_secs: i64,
    ) -> Result<IssuedToken, TokenError> {
        let url = format!("{}/generate", self.base_url);
        let response = httpclient::send_with_retry(
            || {
                self.client.post(&url).json(&GenerateRequest {
                    user_id,
                    client_id,
                    scopes: scope,
                    expires_in: ttl_secs,
                })
            },
            Some(self.deadline()),
        )
        .await
        .map_err(|err| match err {
            RetryError::Exhausted { source, .. } | RetryError::DeadlineExceeded { source, .. } => {
                warn!(url = %url, error = %source, "remote token service unreachable");
                TokenError::Unavailable(source.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(TokenError::Generation(format!(
                "token service answered {}",
                response.status()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|_| TokenError::InvalidResponse)?;

        if !body.success {
            return Err(TokenError::Generation(
                body.message.unwrap_or_else(|| "generation refused".to_string()),
            ));
        }
        let token = match body.access_token {
            Some(token) if !token.is_empty() => token,
            _ => return Err(TokenError::InvalidResponse),
        };

        let expires_in = body.expires_in.unwrap_or(ttl_secs);
        Ok(IssuedToken {
            token,
            token_type: body.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at: Utc::now().timestamp() + expires_in,
            claims: body.claims.unwrap_or_default(),
        })
    }

    async fn validate(&self, token: &str) -> Result<TokenValidation, TokenError> {
        let url = format!("{}/validate", self.base_url);
        let response = httpclient::send_with_retry(
            || self.client.post(&url).json(&ValidateRequest { token }),
            Some(self.deadline()),
        )
        .await
        .map_err(|err| match err {
            RetryError::Exhausted { source, .. } | RetryError::DeadlineExceeded { source, .. } => {
                warn!(url = %url, error = %source, "remote token service unreachable");
                TokenError::Unavailable(source.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(TokenError::Validation(format!(
                "token service answered {}",
                response.status()
            )));
        }

        let body: ValidateResponse = response
            .json()
            .await
            .map_err(|_| TokenError::InvalidResponse)?;

        Ok(TokenValidation {
            valid: body.valid,
            user_id: body.user_id,
            client_id: body.client_id,
            scope: body.scopes,
            expires_at: body.expires_at,
            claims: body.claims.unwrap_or_default(),
        })
    }
}
