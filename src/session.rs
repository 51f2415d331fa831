use crate::entities::session;
use crate::ratelimit::client_ip;
use crate::settings::Settings;
use crate::storage;
use axum::http::HeaderMap;
use base64ct::Encoding;
use chrono::Utc;
use sea_orm::DatabaseConnection;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;

pub const SESSION_COOKIE_NAME: &str = "authora_session";

#[derive(Clone, Debug)]
pub struct SessionCookie {
    pub session_id: String,
}

impl SessionCookie {
    pub fn new(session_id: String) -> Self {
        Self { session_id }
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let cookie_header = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;

        for cookie in cookie_header.split(';') {
            let cookie = cookie.trim();
            if let Some(value) = cookie
                .strip_prefix(SESSION_COOKIE_NAME)
                .and_then(|s| s.strip_prefix('='))
            {
                return Some(Self {
                    session_id: value.to_string(),
                });
            }
        }
        None
    }

    pub fn to_cookie_header(&self, settings: &Settings) -> String {
        let secure = settings.base_url().starts_with("https://");

        format!(
            "{}={}; HttpOnly; {}SameSite=Lax; Path=/",
            SESSION_COOKIE_NAME,
            self.session_id,
            if secure { "Secure; " } else { "" },
        )
    }

    pub fn delete_cookie_header() -> String {
        format!(
            "{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0",
            SESSION_COOKIE_NAME
        )
    }
}

/// SHA-256 over the user agent, optionally mixed with the client IP.
pub fn compute_fingerprint(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    include_ip: bool,
    trust_proxy: bool,
) -> String {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let mut hasher = Sha256::new();
    hasher.update(user_agent.as_bytes());
    if include_ip {
        hasher.update(b"|");
        hasher.update(client_ip(headers, peer, trust_proxy).as_bytes());
    }
    base64ct::Base64UrlUnpadded::encode_string(&hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRejection {
    /// No cookie or no matching record.
    NotLoggedIn,
    /// Idle timeout exceeded; the session was cleared.
    Timeout,
    /// Fingerprint mismatch; the session was cleared.
    Invalid,
}

impl SessionRejection {
    pub fn login_error(&self) -> &'static str {
        match self {
            SessionRejection::NotLoggedIn => "login_required",
            SessionRejection::Timeout => "session_timeout",
            SessionRejection::Invalid => "session_invalid",
        }
    }
}

/// Per-request session validation: idle timeout, fingerprint comparison,
/// and the activity touch.
#[derive(Clone)]
pub struct SessionGuard {
    db: DatabaseConnection,
    idle_timeout_secs: i64,
    fingerprint_enabled: bool,
    fingerprint_include_ip: bool,
    trust_proxy: bool,
}

impl SessionGuard {
    pub fn new(db: DatabaseConnection, settings: &Settings) -> Self {
        Self {
            db,
            idle_timeout_secs: settings.session.idle_timeout_secs,
            fingerprint_enabled: settings.session.fingerprint,
            fingerprint_include_ip: settings.session.fingerprint_include_ip,
            trust_proxy: settings.rate_limit.trust_proxy_headers,
        }
    }

    pub async fn start(
        &self,
        user_id: &str,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Result<session::Model, crate::errors::AuthoraError> {
        let fingerprint = self.fingerprint_enabled.then(|| {
            compute_fingerprint(headers, peer, self.fingerprint_include_ip, self.trust_proxy)
        });
        storage::create_session(&self.db, user_id, fingerprint).await
    }

    pub async fn check(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Result<session::Model, SessionRejection> {
        let cookie =
            SessionCookie::from_headers(headers).ok_or(SessionRejection::NotLoggedIn)?;
        let session = storage::get_session(&self.db, &cookie.session_id)
            .await
            .ok()
            .flatten()
            .ok_or(SessionRejection::NotLoggedIn)?;

        let now = Utc::now().timestamp();

        if self.idle_timeout_secs > 0 && now - session.last_activity > self.idle_timeout_secs {
            let _ = storage::delete_session(&self.db, &session.session_id).await;
            return Err(SessionRejection::Timeout);
        }

        if self.fingerprint_enabled {
            let expected = compute_fingerprint(
                headers,
                peer,
                self.fingerprint_include_ip,
                self.trust_proxy,
            );
            if session.fingerprint.as_deref() != Some(expected.as_str()) {
                let _ = storage::delete_session(&self.db, &session.session_id).await;
                return Err(SessionRejection::Invalid);
            }
        }

        let _ = storage::touch_session(&self.db, &session.session_id, now).await;
        Ok(session)
    }

    pub async fn end(&self, headers: &HeaderMap) {
        if let Some(cookie) = SessionCookie::from_headers(headers) {
            let _ = storage::delete_session(&self.db, &cookie.session_id).await;
        }
    }
}
