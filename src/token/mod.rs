//! Bearer-credential providers. `local` signs a symmetric claim set;
//! `remote` delegates generation and validation to an external service.
//! Either way the issued token is also recorded in the access_tokens table
//! so listing and revocation stay local-authoritative.

pub mod local;
pub mod remote;

pub use local::LocalTokenProvider;
pub use remote::RemoteTokenProvider;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub token_type: String,
    pub expires_at: i64,
    pub claims: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenValidation {
    pub valid: bool,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub scope: Option<String>,
    pub expires_at: Option<i64>,
    pub claims: HashMap<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("failed to generate token: {0}")]
    Generation(String),

    #[error("failed to validate token: {0}")]
    Validation(String),

    #[error("token service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid response from token service")]
    InvalidResponse,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn generate(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
        ttl_secs: i64,
    ) -> Result<IssuedToken, TokenError>;

    async fn validate(&self, token: &str) -> Result<TokenValidation, TokenError>;
}
