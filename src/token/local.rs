use super::{IssuedToken, TokenError, TokenProvider, TokenValidation};
use async_trait::async_trait;
use chrono::Utc;
use josekit::jws::{JwsHeader, HS256};
use josekit::jwt::{self, JwtPayload};
use serde_json::json;
use std::collections::HashMap;

/// Signs `{sub, aud, scope, exp, iat}` with a symmetric secret.
pub struct LocalTokenProvider {
    secret: String,
}

impl LocalTokenProvider {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }
}

#[async_trait]
impl TokenProvider for LocalTokenProvider {
    async fn generate(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
        ttl_secs: i64,
    ) -> Result<IssuedToken, TokenError> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl_secs;

        let mut payload = JwtPayload::new();
        let claims = [
            ("sub", json!(user_id)),
            ("aud", json!(client_id)),
            ("scope", json!(scope)),
            ("iat", json!(now)),
            ("exp", json!(expires_at)),
        ];
        for (name, value) in claims {
            payload
                .set_claim(name, Some(value))
                .map_err(|e| TokenError::Generation(e.to_string()))?;
        }

        let mut header = JwsHeader::new();
        header.set_token_type("JWT");

        let signer = HS256
            .signer_from_bytes(self.secret.as_bytes())
            .map_err(|e| TokenError::Generation(e.to_string()))?;
        let token = jwt::encode_with_signer(&payload, &header, &signer)
            .map_err(|e| TokenError::Generation(e.to_string()))?;

        Ok(IssuedToken {
            token,
            token_type: "Bearer".to_string(),
            expires_at,
            claims: payload
                .claims_set()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    async fn validate(&self, token: &str) -> Result<TokenValidation, TokenError> {
        let verifier = HS256
            .verifier_from_bytes(self.secret.as_bytes())
            .map_err(|e| TokenError::Validation(e.to_string()))?;

        let payload = match jwt::decode_with_verifier(token, &verifier) {
            Ok((payload, _header)) => payload,
            // Bad signature or malformed token: invalid, not an error
            Err(_) => return Ok(TokenValidation::default()),
        };

        let claim_str =
            |name: &str| payload.claim(name).and_then(|v| v.as_str()).map(String::from);
        let claim_i64 = |name: &str| payload.claim(name).and_then(|v| v.as_i64());

        let expires_at = claim_i64("exp");
        let valid = matches!(expires_at, Some(exp) if exp > Utc::now().timestamp());

        let mut claims: HashMap<String, serde_json::Value> = HashMap::new();
        if valid {
            claims = payload
                .claims_set()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }

        Ok(TokenValidation {
            valid,
            user_id: claim_str("sub"),
            client_id: claim_str("aud"),
            scope: claim_str("scope"),
            expires_at,
            claims,
        })
    }
}
