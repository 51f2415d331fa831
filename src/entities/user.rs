use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub username: String,
    /// Empty unless auth_source is "local".
    pub password_hash: String,
    pub role: String,        // "admin" | "user"
    pub auth_source: String, // "local" | "remote"
    /// Empty unless auth_source is "remote".
    pub external_id: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Model {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    pub fn is_remote(&self) -> bool {
        self.auth_source == "remote"
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
