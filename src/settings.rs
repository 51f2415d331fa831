use miette::{miette, IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub database: Database,
    pub jwt: Jwt,
    pub session: Session,
    pub auth: Auth,
    pub token_provider: TokenProvider,
    pub rate_limit: RateLimit,
    pub device: Device,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub addr: String,
    /// Public base URL used for verification URIs, e.g. https://auth.example.com
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub driver: String, // "sqlite" | "postgres"
    pub dsn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwt {
    pub secret: String,
    pub ttl_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub secret: String,
    /// 0 disables the idle timeout.
    pub idle_timeout_secs: i64,
    pub fingerprint: bool,
    pub fingerprint_include_ip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub mode: String, // "local" | "remote"
    pub remote_url: Option<String>,
    pub remote_timeout_secs: u64,
    pub remote_insecure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenProvider {
    pub mode: String, // "local" | "remote"
    pub remote_url: Option<String>,
    pub remote_timeout_secs: u64,
    pub remote_insecure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub enabled: bool,
    pub store: String, // "memory" | "shared"
    pub shared_addr: Option<String>,
    pub shared_password: Option<String>,
    pub shared_db: i64,
    pub trust_proxy_headers: bool,
    pub login_per_minute: u64,
    pub device_code_per_minute: u64,
    pub token_per_minute: u64,
    pub device_verify_per_minute: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub expiry_secs: i64,
    pub poll_interval_secs: i64,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            base_url: None,
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            dsn: "sqlite://authora.db?mode=rwc".to_string(),
        }
    }
}

impl Default for Jwt {
    fn default() -> Self {
        Self {
            secret: "change-me-256-bit-secret".to_string(),
            ttl_secs: 3600,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            secret: "change-me-session-secret".to_string(),
            idle_timeout_secs: 1800,
            fingerprint: false,
            fingerprint_include_ip: false,
        }
    }
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            mode: "local".to_string(),
            remote_url: None,
            remote_timeout_secs: 10,
            remote_insecure: false,
        }
    }
}

impl Default for TokenProvider {
    fn default() -> Self {
        Self {
            mode: "local".to_string(),
            remote_url: None,
            remote_timeout_secs: 10,
            remote_insecure: false,
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            enabled: true,
            store: "memory".to_string(),
            shared_addr: None,
            shared_password: None,
            shared_db: 0,
            trust_proxy_headers: false,
            login_per_minute: 5,
            device_code_per_minute: 10,
            token_per_minute: 20,
            device_verify_per_minute: 10,
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self {
            expiry_secs: 1800,
            poll_interval_secs: 5,
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: AUTHORA__SERVER__ADDR=0.0.0.0:9090, etc.
        builder = builder.add_source(
            config::Environment::with_prefix("AUTHORA")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().into_diagnostic()?;

        // Defaults come from the section Default impls; the file and the
        // environment only override what they name.
        let mut s = Settings::default();
        let overlay: serde_json::Value = cfg.try_deserialize().into_diagnostic()?;
        s.apply_overlay(&overlay)?;

        s.validate()?;
        Ok(s)
    }

    fn apply_overlay(&mut self, overlay: &serde_json::Value) -> Result<()> {
        let mut base = serde_json::to_value(&*self).into_diagnostic()?;
        merge_json(&mut base, overlay);
        *self = serde_json::from_value(base).into_diagnostic()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        match self.database.driver.as_str() {
            "sqlite" | "postgres" => {}
            other => return Err(miette!("unsupported database.driver: {other}")),
        }
        match self.auth.mode.as_str() {
            "local" => {}
            "remote" => {
                if self.auth.remote_url.as_deref().unwrap_or("").is_empty() {
                    return Err(miette!("auth.mode = remote requires auth.remote_url"));
                }
            }
            other => return Err(miette!("unsupported auth.mode: {other}")),
        }
        match self.token_provider.mode.as_str() {
            "local" => {}
            "remote" => {
                if self
                    .token_provider
                    .remote_url
                    .as_deref()
                    .unwrap_or("")
                    .is_empty()
                {
                    return Err(miette!(
                        "token_provider.mode = remote requires token_provider.remote_url"
                    ));
                }
            }
            other => return Err(miette!("unsupported token_provider.mode: {other}")),
        }
        match self.rate_limit.store.as_str() {
            "memory" => {}
            "shared" => {
                if self
                    .rate_limit
                    .shared_addr
                    .as_deref()
                    .unwrap_or("")
                    .is_empty()
                {
                    return Err(miette!(
                        "rate_limit.store = shared requires rate_limit.shared_addr"
                    ));
                }
            }
            other => return Err(miette!("unsupported rate_limit.store: {other}")),
        }
        if self.device.expiry_secs <= 0 {
            return Err(miette!("device.expiry_secs must be positive"));
        }
        if self.device.poll_interval_secs <= 0 {
            return Err(miette!("device.poll_interval_secs must be positive"));
        }
        Ok(())
    }

    /// Public base URL without a trailing slash.
    pub fn base_url(&self) -> String {
        if let Some(base) = &self.server.base_url {
            base.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", self.server.addr)
        }
    }
}

fn merge_json(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn rejects_unknown_auth_mode() {
        let mut s = Settings::default();
        s.auth.mode = "ldap".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_remote_auth_without_url() {
        let mut s = Settings::default();
        s.auth.mode = "remote".to_string();
        assert!(s.validate().is_err());

        s.auth.remote_url = Some("https://sso.example.com/verify".to_string());
        s.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_rate_limit_store() {
        let mut s = Settings::default();
        s.rate_limit.store = "memcached".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_shared_store_without_addr() {
        let mut s = Settings::default();
        s.rate_limit.store = "shared".to_string();
        assert!(s.validate().is_err());

        s.rate_limit.shared_addr = Some("redis://127.0.0.1:6379".to_string());
        s.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_db_driver() {
        let mut s = Settings::default();
        s.database.driver = "mysql".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn base_url_strips_trailing_slash() {
        let mut s = Settings::default();
        s.server.base_url = Some("https://auth.example.com/".to_string());
        assert_eq!(s.base_url(), "https://auth.example.com");
    }

    #[test]
    fn overlay_merges_nested_sections() {
        let mut s = Settings::default();
        let overlay = serde_json::json!({
            "server": { "addr": "127.0.0.1:9999" },
            "rate_limit": { "login_per_minute": 3 }
        });
        s.apply_overlay(&overlay).unwrap();
        assert_eq!(s.server.addr, "127.0.0.1:9999");
        assert_eq!(s.rate_limit.login_per_minute, 3);
        // Untouched sections keep their defaults
        assert_eq!(s.device.poll_interval_secs, 5);
    }
}
