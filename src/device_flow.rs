//! The device-grant state machine: code issuance, user-code verification,
//! and the polled exchange of an authorized device code for a bearer token.
//! All transitions run through the storage-layer compare-and-set operations,
//! so no lock is held across I/O and concurrent exchanges settle to exactly
//! one winner.

use crate::entities::device_code::{
    self, STATUS_AUTHORIZED, STATUS_CONSUMED, STATUS_DENIED, STATUS_PENDING,
};
use crate::storage::{self, NewAccessToken, NewDeviceCode};
use crate::token::{TokenError, TokenProvider};
use base64ct::Encoding;
use chrono::Utc;
use rand::{Rng, RngCore};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

pub const USER_CODE_LEN: usize = 8;
const USER_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const DEVICE_CODE_BYTES: usize = 40;
const USER_CODE_MAX_ATTEMPTS: u32 = 5;
const SLOW_DOWN_BUMP_SECS: i64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DeviceFlowError {
    #[error("client unknown or inactive")]
    InvalidClient,

    #[error("device code unknown, consumed, or not issued to this client")]
    InvalidGrant,

    #[error("device code expired")]
    ExpiredToken,

    #[error("polling too fast")]
    SlowDown,

    #[error("user has not yet approved or denied the request")]
    AuthorizationPending,

    #[error("user denied the request")]
    AccessDenied,

    #[error("token service unavailable")]
    TokenUnavailable,

    #[error("{0}")]
    ServerError(String),
}

impl DeviceFlowError {
    /// RFC 8628 wire token and description.
    pub fn oauth_error(&self) -> (&'static str, &'static str) {
        match self {
            Self::InvalidClient => ("invalid_client", "Client unknown or inactive"),
            Self::InvalidGrant => (
                "invalid_grant",
                "device_code not found, already used, or not bound to this client",
            ),
            Self::ExpiredToken => ("expired_token", "device_code expired"),
            Self::SlowDown => ("slow_down", "Polling too frequently"),
            Self::AuthorizationPending => (
                "authorization_pending",
                "User has not yet authorized the device",
            ),
            Self::AccessDenied => ("access_denied", "User denied the authorization request"),
            Self::TokenUnavailable | Self::ServerError(_) => {
                ("server_error", "Internal server error")
            }
        }
    }
}

impl From<crate::errors::AuthoraError> for DeviceFlowError {
    fn from(value: crate::errors::AuthoraError) -> Self {
        DeviceFlowError::ServerError(value.to_string())
    }
}

/// Errors for the browser-side verify/deny operations.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("code not recognized")]
    InvalidCode,

    #[error("code expired")]
    Expired,

    #[error("code already used")]
    AlreadyUsed,

    #[error("{0}")]
    Storage(String),
}

impl From<crate::errors::AuthoraError> for VerifyError {
    fn from(value: crate::errors::AuthoraError) -> Self {
        VerifyError::Storage(value.to_string())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i64,
    pub interval: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub scope: String,
}

#[derive(Debug, Clone)]
pub struct DeviceFlowConfig {
    pub base_url: String,
    pub expiry_secs: i64,
    pub poll_interval_secs: i64,
    pub token_ttl_secs: i64,
}

#[derive(Clone)]
pub struct DeviceFlow {
    db: DatabaseConnection,
    provider: Arc<dyn TokenProvider>,
    cfg: Arc<DeviceFlowConfig>,
}

impl DeviceFlow {
    pub fn new(
        db: DatabaseConnection,
        provider: Arc<dyn TokenProvider>,
        cfg: DeviceFlowConfig,
    ) -> Self {
        Self {
            db,
            provider,
            cfg: Arc::new(cfg),
        }
    }

    /// Issue a device/user code pair for an active client.
    pub async fn issue(
        &self,
        client_id: &str,
        scope: &str,
    ) -> Result<DeviceAuthorization, DeviceFlowError> {
        let client = storage::get_client(&self.db, client_id)
            .await?
            .filter(|c| c.is_active())
            .ok_or(DeviceFlowError::InvalidClient)?;

        let now = Utc::now().timestamp();
        let device_code = generate_device_code();

        let mut user_code = generate_user_code();
        let mut attempts = 1;
        while storage::user_code_in_use(&self.db, &user_code, now).await? {
            if attempts >= USER_CODE_MAX_ATTEMPTS {
                return Err(DeviceFlowError::ServerError(
                    "could not allocate a unique user code".to_string(),
                ));
            }
            attempts += 1;
            user_code = generate_user_code();
        }

        let expires_at = now + self.cfg.expiry_secs;
        storage::create_device_code(
            &self.db,
            NewDeviceCode {
                device_code: device_code.clone(),
                user_code: user_code.clone(),
                client_id: client.client_id.clone(),
                scope: scope.to_string(),
                expires_at,
                interval: self.cfg.poll_interval_secs,
            },
        )
        .await?;

        let verification_uri = format!("{}/device", self.cfg.base_url);
        let display_code = format_user_code(&user_code);
        let verification_uri_complete =
            format!("{}?user_code={}", verification_uri, display_code);

        Ok(DeviceAuthorization {
            device_code,
            user_code: display_code,
            verification_uri,
            verification_uri_complete,
            expires_in: self.cfg.expiry_secs,
            interval: self.cfg.poll_interval_secs,
        })
    }

    /// Find the live grant behind a (decorated) user code.
    pub async fn find_by_user_code(
        &self,
        raw_user_code: &str,
    ) -> Result<device_code::Model, VerifyError> {
        let normalized = normalize_user_code(raw_user_code);
        if normalized.is_empty() {
            return Err(VerifyError::InvalidCode);
        }
        let row = storage::get_device_code_by_user_code(&self.db, &normalized)
            .await?
            .ok_or(VerifyError::InvalidCode)?;
        Ok(row)
    }

    /// Bind the authenticated user to a pending grant.
    pub async fn authorize(
        &self,
        raw_user_code: &str,
        user_id: &str,
    ) -> Result<(), VerifyError> {
        let row = self.find_by_user_code(raw_user_code).await?;
        let now = Utc::now().timestamp();
        if row.is_expired(now) {
            return Err(VerifyError::Expired);
        }
        if row.status != STATUS_PENDING {
            return Err(VerifyError::AlreadyUsed);
        }
        let won = storage::authorize_device_code(&self.db, &row.device_code, user_id, now).await?;
        if !won {
            // lost the CAS to a concurrent approve/deny
            return Err(VerifyError::AlreadyUsed);
        }
        Ok(())
    }

    /// Record the user's refusal. Terminal.
    pub async fn deny(&self, raw_user_code: &str) -> Result<(), VerifyError> {
        let row = self.find_by_user_code(raw_user_code).await?;
        let now = Utc::now().timestamp();
        if row.is_expired(now) {
            return Err(VerifyError::Expired);
        }
        if row.status != STATUS_PENDING {
            return Err(VerifyError::AlreadyUsed);
        }
        let won = storage::deny_device_code(&self.db, &row.device_code, now).await?;
        if !won {
            return Err(VerifyError::AlreadyUsed);
        }
        Ok(())
    }

    /// The polled exchange. Preconditions answer in a fixed order; a
    /// consumed code always answers invalid_grant, even past expiry.
    pub async fn exchange(
        &self,
        client_id: &str,
        device_code: &str,
    ) -> Result<TokenGrant, DeviceFlowError> {
        storage::get_client(&self.db, client_id)
            .await?
            .filter(|c| c.is_active())
            .ok_or(DeviceFlowError::InvalidClient)?;

        // Unknown codes get no poll bookkeeping.
        let row = storage::get_device_code(&self.db, device_code)
            .await?
            .ok_or(DeviceFlowError::InvalidGrant)?;

        if row.client_id != client_id {
            return Err(DeviceFlowError::InvalidGrant);
        }

        let now = Utc::now().timestamp();

        if row.status == STATUS_CONSUMED {
            storage::touch_device_code_poll(&self.db, device_code, now, None).await?;
            return Err(DeviceFlowError::InvalidGrant);
        }

        if row.is_expired(now) {
            storage::touch_device_code_poll(&self.db, device_code, now, None).await?;
            return Err(DeviceFlowError::ExpiredToken);
        }

        if let Some(last_polled) = row.last_polled_at {
            if now - last_polled < row.interval {
                // persist the bumped interval so the client adopts it
                storage::touch_device_code_poll(
                    &self.db,
                    device_code,
                    now,
                    Some(row.interval + SLOW_DOWN_BUMP_SECS),
                )
                .await?;
                return Err(DeviceFlowError::SlowDown);
            }
        }
        storage::touch_device_code_poll(&self.db, device_code, now, None).await?;

        match row.status.as_str() {
            STATUS_DENIED => return Err(DeviceFlowError::AccessDenied),
            STATUS_PENDING => return Err(DeviceFlowError::AuthorizationPending),
            STATUS_AUTHORIZED => {}
            other => {
                return Err(DeviceFlowError::ServerError(format!(
                    "unexpected device code status: {}",
                    other
                )))
            }
        }

        let user_id = row.user_id.clone().ok_or_else(|| {
            DeviceFlowError::ServerError("authorized device code without a user".to_string())
        })?;

        let issued = self
            .provider
            .generate(&user_id, client_id, &row.scope, self.cfg.token_ttl_secs)
            .await
            .map_err(|e| match e {
                TokenError::Unavailable(_) => DeviceFlowError::TokenUnavailable,
                other => DeviceFlowError::ServerError(other.to_string()),
            })?;

        let record = NewAccessToken {
            id: storage::random_id(),
            token_string: issued.token.clone(),
            user_id,
            client_id: client_id.to_string(),
            scope: row.scope.clone(),
            issued_at: now,
            expires_at: issued.expires_at,
        };

        match storage::consume_device_code_issuing_token(&self.db, device_code, record).await? {
            Some(_) => Ok(TokenGrant {
                access_token: issued.token,
                token_type: issued.token_type,
                expires_in: issued.expires_at - now,
                scope: row.scope,
            }),
            // Lost the consume race: the generated token is discarded. A
            // delegated remote may have issued anyway; that is the contract.
            None => Err(DeviceFlowError::InvalidGrant),
        }
    }
}

/// Uppercase and strip `-`, `_` and whitespace. Lookups only ever see the
/// normalized form.
pub fn normalize_user_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Render an 8-char code as `XXXX-XXXX` for humans.
pub fn format_user_code(code: &str) -> String {
    if code.len() == USER_CODE_LEN {
        format!("{}-{}", &code[..4], &code[4..])
    } else {
        code.to_string()
    }
}

fn generate_device_code() -> String {
    let mut bytes = [0u8; DEVICE_CODE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

fn generate_user_code() -> String {
    let mut rng = rand::thread_rng();
    (0..USER_CODE_LEN)
        .map(|_| USER_CODE_ALPHABET[rng.gen_range(0..USER_CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_decoration() {
        for decorated in ["ABCD1234", "abcd1234", "ABCD-1234", "  abcd-1234  ", "ab_cd 12-34"] {
            assert_eq!(normalize_user_code(decorated), "ABCD1234");
        }
    }

    #[test]
    fn normalization_of_formatted_code_round_trips() {
        for _ in 0..50 {
            let code = generate_user_code();
            assert_eq!(normalize_user_code(&format_user_code(&code)), code);
        }
    }

    #[test]
    fn user_codes_use_the_uppercase_alphanumeric_alphabet() {
        for _ in 0..50 {
            let code = generate_user_code();
            assert_eq!(code.len(), USER_CODE_LEN);
            assert!(code
                .bytes()
                .all(|b| USER_CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn device_codes_are_long_and_url_safe() {
        let code = generate_device_code();
        assert!(code.len() >= 40);
        assert!(code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn format_user_code_inserts_hyphen() {
        assert_eq!(format_user_code("WDJBMJHT"), "WDJB-MJHT");
        assert_eq!(format_user_code("SHORT"), "SHORT");
    }
}
