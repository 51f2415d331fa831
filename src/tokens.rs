use crate::entities::{access_token, client};
use crate::storage;
use crate::token::TokenProvider;
use chrono::Utc;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TokenServiceError {
    #[error("token not found")]
    NotFound,

    #[error("token belongs to another user")]
    Forbidden,

    #[error("{0}")]
    Storage(String),
}

impl From<crate::errors::AuthoraError> for TokenServiceError {
    fn from(value: crate::errors::AuthoraError) -> Self {
        TokenServiceError::Storage(value.to_string())
    }
}

/// A token row joined with its client for display.
#[derive(Debug, Clone)]
pub struct TokenWithClient {
    pub token: access_token::Model,
    pub client_name: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TokenInfo {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Owner-scoped management of issued tokens. The record in the
/// access_tokens table is authoritative for revocation and listing no
/// matter which provider minted the credential.
#[derive(Clone)]
pub struct TokenService {
    db: DatabaseConnection,
    provider: Arc<dyn TokenProvider>,
}

impl TokenService {
    pub fn new(db: DatabaseConnection, provider: Arc<dyn TokenProvider>) -> Self {
        Self { db, provider }
    }

    pub async fn list_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<TokenWithClient>, TokenServiceError> {
        let rows = storage::list_user_tokens_with_client(&self.db, user_id).await?;
        Ok(rows
            .into_iter()
            .map(|(token, client)| TokenWithClient {
                token,
                client_name: client
                    .filter(|c: &client::Model| c.deleted_at.is_none())
                    .map(|c| c.name),
            })
            .collect())
    }

    pub async fn revoke(&self, caller_id: &str, token_id: &str) -> Result<(), TokenServiceError> {
        self.check_ownership(caller_id, token_id).await?;
        storage::revoke_access_token(&self.db, token_id, Utc::now().timestamp()).await?;
        Ok(())
    }

    pub async fn disable(&self, caller_id: &str, token_id: &str) -> Result<(), TokenServiceError> {
        self.check_ownership(caller_id, token_id).await?;
        storage::set_access_token_disabled(&self.db, token_id, true, Utc::now().timestamp())
            .await?;
        Ok(())
    }

    pub async fn enable(&self, caller_id: &str, token_id: &str) -> Result<(), TokenServiceError> {
        self.check_ownership(caller_id, token_id).await?;
        storage::set_access_token_disabled(&self.db, token_id, false, Utc::now().timestamp())
            .await?;
        Ok(())
    }

    /// Ownership is verified before any state change.
    async fn check_ownership(
        &self,
        caller_id: &str,
        token_id: &str,
    ) -> Result<(), TokenServiceError> {
        let token = storage::get_access_token_by_id(&self.db, token_id)
            .await?
            .ok_or(TokenServiceError::NotFound)?;
        if token.user_id != caller_id {
            return Err(TokenServiceError::Forbidden);
        }
        Ok(())
    }

    /// Bearer introspection: the provider checks the credential itself, the
    /// local record supplies revocation and disable state.
    pub async fn introspect(&self, token: &str) -> Result<TokenInfo, TokenServiceError> {
        let validation = self
            .provider
            .validate(token)
            .await
            .map_err(|e| TokenServiceError::Storage(e.to_string()))?;

        let record = storage::get_access_token_by_token_string(&self.db, token).await?;
        let now = Utc::now().timestamp();

        let record_active = record.as_ref().is_some_and(|r| r.is_active(now));
        let active = validation.valid && record_active;

        let record = record.filter(|_| active);
        Ok(TokenInfo {
            active,
            user_id: record
                .as_ref()
                .map(|r| r.user_id.clone())
                .or(validation.user_id.filter(|_| active)),
            client_id: record
                .as_ref()
                .map(|r| r.client_id.clone())
                .or(validation.client_id.filter(|_| active)),
            scope: record
                .as_ref()
                .map(|r| r.scope.clone())
                .or(validation.scope.filter(|_| active)),
            exp: record
                .as_ref()
                .map(|r| r.expires_at)
                .or(validation.expires_at.filter(|_| active)),
        })
    }
}
