use crate::auth::{AuthError, AuthProvider};
use crate::entities::user;
use crate::storage::{self, AUTH_SOURCE_LOCAL, AUTH_SOURCE_REMOTE, ROLE_ADMIN};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("invalid username or password")]
    BadCredentials,

    #[error("username already registered to a different identity")]
    UsernameConflict,

    #[error("authentication service unavailable")]
    AuthUnavailable,

    #[error("{0}")]
    Storage(String),
}

impl From<crate::errors::AuthoraError> for LoginError {
    fn from(value: crate::errors::AuthoraError) -> Self {
        LoginError::Storage(value.to_string())
    }
}

/// Unified login. Each user routes to the provider named by their
/// `auth_source`; the seeded admin is always local, so the deployment stays
/// manageable when the remote service is down.
#[derive(Clone)]
pub struct UserService {
    db: DatabaseConnection,
    local: Arc<dyn AuthProvider>,
    remote: Option<Arc<dyn AuthProvider>>,
    remote_mode: bool,
}

impl UserService {
    pub fn new(
        db: DatabaseConnection,
        local: Arc<dyn AuthProvider>,
        remote: Option<Arc<dyn AuthProvider>>,
        remote_mode: bool,
    ) -> Self {
        Self {
            db,
            local,
            remote,
            remote_mode,
        }
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<user::Model, LoginError> {
        match storage::get_user_by_username(&self.db, username).await? {
            Some(user) => self.login_known_user(user, username, password).await,
            None => self.login_unknown_user(username, password).await,
        }
    }

    async fn login_known_user(
        &self,
        user: user::Model,
        username: &str,
        password: &str,
    ) -> Result<user::Model, LoginError> {
        match user.auth_source.as_str() {
            AUTH_SOURCE_LOCAL => match self.local.verify(username, password).await {
                Ok(_) => Ok(user),
                Err(AuthError::NotFound | AuthError::BadCredentials) => {
                    Err(LoginError::BadCredentials)
                }
                Err(AuthError::Storage(e)) => Err(LoginError::Storage(e.to_string())),
                Err(AuthError::Unavailable(_) | AuthError::InvalidResponse) => {
                    Err(LoginError::AuthUnavailable)
                }
            },
            AUTH_SOURCE_REMOTE => {
                let remote = self.remote.as_ref().ok_or(LoginError::AuthUnavailable)?;
                match remote.verify(username, password).await {
                    Ok(identity) => {
                        let external_id = identity.external_id.unwrap_or_default();
                        if external_id != user.external_id {
                            warn!(
                                username,
                                "remote identity changed under an existing username"
                            );
                            return Err(LoginError::UsernameConflict);
                        }
                        storage::update_remote_profile(
                            &self.db,
                            &user.id,
                            identity.email.clone(),
                            identity.full_name.clone(),
                        )
                        .await?;
                        Ok(user::Model {
                            email: identity.email,
                            full_name: identity.full_name,
                            ..user
                        })
                    }
                    Err(AuthError::Unavailable(_) | AuthError::InvalidResponse) => {
                        Err(LoginError::AuthUnavailable)
                    }
                    Err(AuthError::Storage(e)) => Err(LoginError::Storage(e.to_string())),
                    Err(_) => Err(LoginError::BadCredentials),
                }
            }
            other => Err(LoginError::Storage(format!(
                "unknown auth_source: {}",
                other
            ))),
        }
    }

    /// Auto-provision from the remote source when global mode allows it.
    async fn login_unknown_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<user::Model, LoginError> {
        if !self.remote_mode {
            return Err(LoginError::BadCredentials);
        }
        let remote = self.remote.as_ref().ok_or(LoginError::AuthUnavailable)?;

        let identity = match remote.verify(username, password).await {
            Ok(identity) => identity,
            Err(AuthError::Unavailable(_) | AuthError::InvalidResponse) => {
                return Err(LoginError::AuthUnavailable)
            }
            Err(AuthError::Storage(e)) => return Err(LoginError::Storage(e.to_string())),
            Err(_) => return Err(LoginError::BadCredentials),
        };
        let external_id = identity.external_id.unwrap_or_default();
        if external_id.is_empty() {
            return Err(LoginError::BadCredentials);
        }

        // Re-check under the verified identity: a concurrent provision of
        // the same remote identity is fine, anything else is a conflict.
        if let Some(existing) = storage::get_user_by_username(&self.db, username).await? {
            if existing.auth_source == AUTH_SOURCE_REMOTE && existing.external_id == external_id
            {
                return Ok(existing);
            }
            warn!(username, "username taken by a different identity, refusing to merge");
            return Err(LoginError::UsernameConflict);
        }

        let created = storage::create_remote_user(
            &self.db,
            username,
            &external_id,
            identity.email,
            identity.full_name,
        )
        .await?;
        info!(username, "auto-provisioned user from remote identity source");
        Ok(created)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<user::Model>, LoginError> {
        Ok(storage::get_user_by_id(&self.db, id).await?)
    }
}

/// Seed the break-glass admin on first start.
pub async fn ensure_default_admin(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
) -> Result<(), crate::errors::AuthoraError> {
    if storage::get_user_by_username(db, username).await?.is_none() {
        storage::create_local_user(db, username, password, ROLE_ADMIN, None, None).await?;
        info!(username, "created default admin user");
    }
    Ok(())
}
