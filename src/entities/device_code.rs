use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_AUTHORIZED: &str = "authorized";
pub const STATUS_DENIED: &str = "denied";
pub const STATUS_EXPIRED: &str = "expired";
pub const STATUS_CONSUMED: &str = "consumed";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "device_codes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub device_code: String,
    pub user_code: String,
    pub client_id: String,
    pub scope: String,
    pub status: String,
    /// Set when the user authorizes the code.
    pub user_id: Option<String>,
    pub authorized_at: Option<i64>,
    pub expires_at: i64,
    pub last_polled_at: Option<i64>,
    pub interval: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Model {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at || self.status == STATUS_EXPIRED
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
