use super::{AuthError, AuthProvider, VerifiedIdentity};
use crate::storage;
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use sea_orm::DatabaseConnection;

/// Verifies against the local users table with a constant-time Argon2
/// comparison.
#[derive(Clone)]
pub struct LocalAuthProvider {
    db: DatabaseConnection,
}

impl LocalAuthProvider {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<VerifiedIdentity, AuthError> {
        let user = storage::get_user_by_username(&self.db, username)
            .await?
            .ok_or(AuthError::NotFound)?;

        if user.password_hash.is_empty() {
            // Remote-sourced rows carry no local secret.
            return Err(AuthError::BadCredentials);
        }

        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|_| AuthError::BadCredentials)?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| AuthError::BadCredentials)?;

        Ok(VerifiedIdentity {
            external_id: None,
            email: user.email,
            full_name: user.full_name,
        })
    }
}
