use authora::device_flow::{DeviceFlow, DeviceFlowConfig};
use authora::entities::{self, device_code};
use authora::storage;
use authora::token::LocalTokenProvider;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::sync::Arc;

pub const TEST_JWT_SECRET: &str = "integration-test-secret";

/// Builder for test users
pub struct UserBuilder {
    username: String,
    password: String,
    role: String,
    remote_external_id: Option<String>,
}

impl UserBuilder {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            password: "password123".to_string(),
            role: "user".to_string(),
            remote_external_id: None,
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn admin(mut self) -> Self {
        self.role = "admin".to_string();
        self
    }

    /// Make this a remote-sourced user with the given external id.
    pub fn remote(mut self, external_id: &str) -> Self {
        self.remote_external_id = Some(external_id.to_string());
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> entities::user::Model {
        match self.remote_external_id {
            Some(external_id) => {
                storage::create_remote_user(db, &self.username, &external_id, None, None)
                    .await
                    .expect("Failed to create remote test user")
            }
            None => storage::create_local_user(
                db,
                &self.username,
                &self.password,
                &self.role,
                None,
                None,
            )
            .await
            .expect("Failed to create test user"),
        }
    }
}

/// Builder for test OAuth clients
pub struct ClientBuilder {
    name: String,
    creator_user_id: Option<String>,
    scopes: String,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            name: "Test Client".to_string(),
            creator_user_id: None,
            scopes: "read write".to_string(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn created_by(mut self, user_id: &str) -> Self {
        self.creator_user_id = Some(user_id.to_string());
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> entities::client::Model {
        storage::create_client(
            db,
            storage::NewClient {
                name: self.name,
                creator_user_id: self.creator_user_id,
                grant_types: "urn:ietf:params:oauth:grant-type:device_code".to_string(),
                scopes: self.scopes,
            },
        )
        .await
        .expect("Failed to create test client")
    }
}

/// A device flow wired to the local token provider.
pub fn device_flow(db: &DatabaseConnection) -> DeviceFlow {
    DeviceFlow::new(
        db.clone(),
        Arc::new(LocalTokenProvider::new(TEST_JWT_SECRET.to_string())),
        DeviceFlowConfig {
            base_url: "http://localhost:8080".to_string(),
            expiry_secs: 1800,
            poll_interval_secs: 5,
            token_ttl_secs: 3600,
        },
    )
}

/// Rewrite a device code's expiry, simulating the passage of time.
pub async fn set_device_code_expiry(db: &DatabaseConnection, code: &str, expires_at: i64) {
    device_code::Entity::update_many()
        .col_expr(device_code::Column::ExpiresAt, Expr::value(expires_at))
        .filter(device_code::Column::DeviceCode.eq(code))
        .exec(db)
        .await
        .expect("Failed to update device code expiry");
}

/// Pretend the last poll happened long enough ago for the interval check.
pub async fn age_last_poll(db: &DatabaseConnection, code: &str) {
    device_code::Entity::update_many()
        .col_expr(
            device_code::Column::LastPolledAt,
            Expr::value(Utc::now().timestamp() - 60),
        )
        .filter(device_code::Column::DeviceCode.eq(code))
        .exec(db)
        .await
        .expect("Failed to age last poll");
}
