//! Credential verification providers. `local` compares an Argon2 hash from
//! the users table; `remote` delegates to an external verification service.

pub mod local;
pub mod remote;

pub use local::LocalAuthProvider;
pub use remote::RemoteAuthProvider;

use async_trait::async_trait;

/// Positive verification outcome. `external_id` is present only for the
/// remote provider.
#[derive(Debug, Clone, Default)]
pub struct VerifiedIdentity {
    pub external_id: Option<String>,
    pub email: Option<String>,
    pub full_name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("user not found")]
    NotFound,

    #[error("bad credentials")]
    BadCredentials,

    #[error("invalid response from verification service")]
    InvalidResponse,

    #[error("verification service unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] crate::errors::AuthoraError),
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn verify(&self, username: &str, password: &str)
        -> Result<VerifiedIdentity, AuthError>;
}
