use super::{AuthError, AuthProvider, VerifiedIdentity};
use crate::httpclient::{self, RetryError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    success: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Delegates verification to `POST {url}` with a `{username, password}` body.
/// `success == true` together with a non-empty `user_id` is the only
/// positive outcome.
pub struct RemoteAuthProvider {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl RemoteAuthProvider {
    pub fn new(url: String, timeout: Duration, insecure: bool) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure)
            .build()?;
        Ok(Self {
            client,
            url,
            timeout,
        })
    }
}

#[async_trait]
impl AuthProvider for RemoteAuthProvider {
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<VerifiedIdentity, AuthError> {
        // Overall deadline spans all retry attempts.
        let deadline = Instant::now() + self.timeout * (httpclient::MAX_RETRIES + 1);

        let response = httpclient::send_with_retry(
            || {
                self.client
                    .post(&self.url)
                    .json(&VerifyRequest { username, password })
            },
            Some(deadline),
        )
        .await
        .map_err(|err| match err {
            RetryError::Exhausted { source, .. } | RetryError::DeadlineExceeded { source, .. } => {
                warn!(url = %self.url, error = %source, "remote auth unreachable");
                AuthError::Unavailable(source.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::BadCredentials);
        }
        if !status.is_success() {
            return Err(AuthError::InvalidResponse);
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|_| AuthError::InvalidResponse)?;

        if !body.success {
            if let Some(message) = body.message {
                warn!(username, message, "remote auth rejected credentials");
            }
            return Err(AuthError::BadCredentials);
        }

        match body.user_id.as_deref() {
            Some(user_id) if !user_id.is_empty() => Ok(VerifiedIdentity {
                external_id: body.user_id,
                email: body.email,
                full_name: body.full_name,
            }),
            // success with an empty user_id counts as a denial
            _ => Err(AuthError::BadCredentials),
        }
    }
}
