use crate::entities::{access_token, client, device_code, session, user};
use crate::entities::device_code::{
    STATUS_AUTHORIZED, STATUS_CONSUMED, STATUS_DENIED, STATUS_EXPIRED, STATUS_PENDING,
};
use crate::errors::AuthoraError;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use rand::RngCore;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, Statement,
    TransactionTrait,
};
use std::collections::HashMap;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";
pub const AUTH_SOURCE_LOCAL: &str = "local";
pub const AUTH_SOURCE_REMOTE: &str = "remote";

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, AuthoraError> {
    let db = Database::connect(&cfg.dsn).await?;
    if db.get_database_backend() == DbBackend::Sqlite {
        db.execute(Statement::from_string(
            DbBackend::Sqlite,
            "PRAGMA foreign_keys = ON",
        ))
        .await?;
    }
    Ok(db)
}

pub async fn ping(db: &DatabaseConnection) -> Result<(), AuthoraError> {
    db.ping().await?;
    Ok(())
}

pub fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn hash_password(password: &str) -> Result<String, AuthoraError> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AuthoraError::Other(format!("Password hashing failed: {}", e)))?;
    Ok(hash.to_string())
}

// User functions

pub async fn create_local_user(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
    role: &str,
    email: Option<String>,
    full_name: Option<String>,
) -> Result<user::Model, AuthoraError> {
    let now = now_ts();
    let model = user::ActiveModel {
        id: Set(random_id()),
        username: Set(username.to_string()),
        password_hash: Set(hash_password(password)?),
        role: Set(role.to_string()),
        auth_source: Set(AUTH_SOURCE_LOCAL.to_string()),
        external_id: Set(String::new()),
        email: Set(email),
        full_name: Set(full_name),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
    };
    Ok(model.insert(db).await?)
}

/// Auto-provisioned from a successful remote verification. The remote path
/// never assigns the admin role.
pub async fn create_remote_user(
    db: &DatabaseConnection,
    username: &str,
    external_id: &str,
    email: Option<String>,
    full_name: Option<String>,
) -> Result<user::Model, AuthoraError> {
    let now = now_ts();
    let model = user::ActiveModel {
        id: Set(random_id()),
        username: Set(username.to_string()),
        password_hash: Set(String::new()),
        role: Set(ROLE_USER.to_string()),
        auth_source: Set(AUTH_SOURCE_REMOTE.to_string()),
        external_id: Set(external_id.to_string()),
        email: Set(email),
        full_name: Set(full_name),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
    };
    Ok(model.insert(db).await?)
}

pub async fn get_user_by_username(
    db: &DatabaseConnection,
    username: &str,
) -> Result<Option<user::Model>, AuthoraError> {
    Ok(user::Entity::find()
        .filter(user::Column::Username.eq(username))
        .filter(user::Column::DeletedAt.is_null())
        .one(db)
        .await?)
}

pub async fn get_user_by_id(
    db: &DatabaseConnection,
    id: &str,
) -> Result<Option<user::Model>, AuthoraError> {
    Ok(user::Entity::find_by_id(id)
        .filter(user::Column::DeletedAt.is_null())
        .one(db)
        .await?)
}

/// Bulk lookup. Absent keys mean the user is missing or soft-deleted.
pub async fn get_users_by_ids(
    db: &DatabaseConnection,
    ids: &[String],
) -> Result<HashMap<String, user::Model>, AuthoraError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let users = user::Entity::find()
        .filter(user::Column::Id.is_in(ids.iter().cloned()))
        .filter(user::Column::DeletedAt.is_null())
        .all(db)
        .await?;
    Ok(users.into_iter().map(|u| (u.id.clone(), u)).collect())
}

/// Refresh email and full name from the remote identity source.
pub async fn update_remote_profile(
    db: &DatabaseConnection,
    id: &str,
    email: Option<String>,
    full_name: Option<String>,
) -> Result<(), AuthoraError> {
    user::Entity::update_many()
        .col_expr(user::Column::Email, Expr::value(email))
        .col_expr(user::Column::FullName, Expr::value(full_name))
        .col_expr(user::Column::UpdatedAt, Expr::value(now_ts()))
        .filter(user::Column::Id.eq(id))
        .filter(user::Column::DeletedAt.is_null())
        .exec(db)
        .await?;
    Ok(())
}

pub async fn soft_delete_user(db: &DatabaseConnection, id: &str) -> Result<bool, AuthoraError> {
    let now = now_ts();
    let res = user::Entity::update_many()
        .col_expr(user::Column::DeletedAt, Expr::value(now))
        .col_expr(user::Column::UpdatedAt, Expr::value(now))
        .filter(user::Column::Id.eq(id))
        .filter(user::Column::DeletedAt.is_null())
        .exec(db)
        .await?;
    Ok(res.rows_affected == 1)
}

// Client functions

#[derive(Debug, Clone)]
pub struct NewClient {
    pub name: String,
    pub creator_user_id: Option<String>,
    pub grant_types: String,
    pub scopes: String,
}

pub async fn create_client(
    db: &DatabaseConnection,
    input: NewClient,
) -> Result<client::Model, AuthoraError> {
    let now = now_ts();
    let model = client::ActiveModel {
        client_id: Set(uuid::Uuid::new_v4().to_string()),
        client_secret: Set(random_id()),
        name: Set(input.name),
        creator_user_id: Set(input.creator_user_id),
        grant_types: Set(input.grant_types),
        scopes: Set(input.scopes),
        active: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
    };
    Ok(model.insert(db).await?)
}

pub async fn any_client_exists(db: &DatabaseConnection) -> Result<bool, AuthoraError> {
    let count = client::Entity::find()
        .filter(client::Column::DeletedAt.is_null())
        .count(db)
        .await?;
    Ok(count > 0)
}

pub async fn get_client(
    db: &DatabaseConnection,
    client_id: &str,
) -> Result<Option<client::Model>, AuthoraError> {
    Ok(client::Entity::find_by_id(client_id)
        .filter(client::Column::DeletedAt.is_null())
        .one(db)
        .await?)
}

pub async fn set_client_active(
    db: &DatabaseConnection,
    client_id: &str,
    active: bool,
) -> Result<bool, AuthoraError> {
    let res = client::Entity::update_many()
        .col_expr(client::Column::Active, Expr::value(i64::from(active)))
        .col_expr(client::Column::UpdatedAt, Expr::value(now_ts()))
        .filter(client::Column::ClientId.eq(client_id))
        .filter(client::Column::DeletedAt.is_null())
        .exec(db)
        .await?;
    Ok(res.rows_affected == 1)
}

#[derive(Debug, Clone)]
pub struct ClientWithCreator {
    pub client: client::Model,
    pub creator_username: Option<String>,
}

pub async fn list_clients_with_creator(
    db: &DatabaseConnection,
    params: &PaginationParams,
) -> Result<(Vec<ClientWithCreator>, Pagination), AuthoraError> {
    let mut query = client::Entity::find().filter(client::Column::DeletedAt.is_null());
    if !params.search.is_empty() {
        query = query.filter(client::Column::Name.contains(&params.search));
    }

    let total = query.clone().count(db).await?;
    let pagination = Pagination::calculate(total, params.page, params.page_size);
    let offset = (pagination.current_page.saturating_sub(1)) * params.page_size;

    let rows = query
        .find_also_related(user::Entity)
        .order_by_desc(client::Column::CreatedAt)
        .offset(offset)
        .limit(params.page_size)
        .all(db)
        .await?;

    let clients = rows
        .into_iter()
        .map(|(c, creator)| ClientWithCreator {
            client: c,
            creator_username: creator
                .filter(|u| u.deleted_at.is_none())
                .map(|u| u.username),
        })
        .collect();

    Ok((clients, pagination))
}

// Device code functions

#[derive(Debug, Clone)]
pub struct NewDeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub client_id: String,
    pub scope: String,
    pub expires_at: i64,
    pub interval: i64,
}

pub async fn create_device_code(
    db: &DatabaseConnection,
    input: NewDeviceCode,
) -> Result<device_code::Model, AuthoraError> {
    let now = now_ts();
    let model = device_code::ActiveModel {
        device_code: Set(input.device_code),
        user_code: Set(input.user_code),
        client_id: Set(input.client_id),
        scope: Set(input.scope),
        status: Set(STATUS_PENDING.to_string()),
        user_id: Set(None),
        authorized_at: Set(None),
        expires_at: Set(input.expires_at),
        last_polled_at: Set(None),
        interval: Set(input.interval),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
    };
    Ok(model.insert(db).await?)
}

pub async fn get_device_code(
    db: &DatabaseConnection,
    device_code: &str,
) -> Result<Option<device_code::Model>, AuthoraError> {
    Ok(device_code::Entity::find_by_id(device_code)
        .filter(device_code::Column::DeletedAt.is_null())
        .one(db)
        .await?)
}

/// Lookup by an already-normalized user code. Consumed rows are skipped and
/// the newest row wins, so a recycled user code resolves to the live grant.
pub async fn get_device_code_by_user_code(
    db: &DatabaseConnection,
    user_code: &str,
) -> Result<Option<device_code::Model>, AuthoraError> {
    Ok(device_code::Entity::find()
        .filter(device_code::Column::UserCode.eq(user_code))
        .filter(device_code::Column::Status.is_in([
            STATUS_PENDING,
            STATUS_AUTHORIZED,
            STATUS_DENIED,
            STATUS_EXPIRED,
        ]))
        .filter(device_code::Column::DeletedAt.is_null())
        .order_by_desc(device_code::Column::CreatedAt)
        .one(db)
        .await?)
}

/// A user code is in use while a non-terminal row holds it.
pub async fn user_code_in_use(
    db: &DatabaseConnection,
    user_code: &str,
    now: i64,
) -> Result<bool, AuthoraError> {
    let count = device_code::Entity::find()
        .filter(device_code::Column::UserCode.eq(user_code))
        .filter(device_code::Column::Status.is_in([STATUS_PENDING, STATUS_AUTHORIZED]))
        .filter(device_code::Column::ExpiresAt.gt(now))
        .filter(device_code::Column::DeletedAt.is_null())
        .count(db)
        .await?;
    Ok(count > 0)
}

/// CAS: pending and unexpired -> authorized, binding the user. Returns false
/// when the precondition no longer holds (lost race, expiry, terminal state).
pub async fn authorize_device_code(
    db: &DatabaseConnection,
    device_code: &str,
    user_id: &str,
    now: i64,
) -> Result<bool, AuthoraError> {
    let res = device_code::Entity::update_many()
        .col_expr(device_code::Column::Status, Expr::value(STATUS_AUTHORIZED))
        .col_expr(device_code::Column::UserId, Expr::value(user_id))
        .col_expr(device_code::Column::AuthorizedAt, Expr::value(now))
        .col_expr(device_code::Column::UpdatedAt, Expr::value(now))
        .filter(device_code::Column::DeviceCode.eq(device_code))
        .filter(device_code::Column::Status.eq(STATUS_PENDING))
        .filter(device_code::Column::ExpiresAt.gt(now))
        .filter(device_code::Column::DeletedAt.is_null())
        .exec(db)
        .await?;
    Ok(res.rows_affected == 1)
}

/// CAS: pending and unexpired -> denied. Terminal.
pub async fn deny_device_code(
    db: &DatabaseConnection,
    device_code: &str,
    now: i64,
) -> Result<bool, AuthoraError> {
    let res = device_code::Entity::update_many()
        .col_expr(device_code::Column::Status, Expr::value(STATUS_DENIED))
        .col_expr(device_code::Column::UpdatedAt, Expr::value(now))
        .filter(device_code::Column::DeviceCode.eq(device_code))
        .filter(device_code::Column::Status.eq(STATUS_PENDING))
        .filter(device_code::Column::ExpiresAt.gt(now))
        .filter(device_code::Column::DeletedAt.is_null())
        .exec(db)
        .await?;
    Ok(res.rows_affected == 1)
}

/// Record a poll. When the client polled too fast the bumped interval is
/// persisted alongside the timestamp.
pub async fn touch_device_code_poll(
    db: &DatabaseConnection,
    device_code: &str,
    now: i64,
    new_interval: Option<i64>,
) -> Result<(), AuthoraError> {
    let mut update = device_code::Entity::update_many()
        .col_expr(device_code::Column::LastPolledAt, Expr::value(now))
        .col_expr(device_code::Column::UpdatedAt, Expr::value(now));
    if let Some(interval) = new_interval {
        update = update.col_expr(device_code::Column::Interval, Expr::value(interval));
    }
    update
        .filter(device_code::Column::DeviceCode.eq(device_code))
        .exec(db)
        .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NewAccessToken {
    pub id: String,
    pub token_string: String,
    pub user_id: String,
    pub client_id: String,
    pub scope: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

/// CAS: authorized and unexpired -> consumed, inserting the access-token row
/// in the same transaction. Exactly one caller can win; losers get None and
/// the transaction leaves no trace.
pub async fn consume_device_code_issuing_token(
    db: &DatabaseConnection,
    device_code: &str,
    token: NewAccessToken,
) -> Result<Option<access_token::Model>, AuthoraError> {
    let now = now_ts();
    let txn = db.begin().await?;

    let res = device_code::Entity::update_many()
        .col_expr(device_code::Column::Status, Expr::value(STATUS_CONSUMED))
        .col_expr(device_code::Column::UpdatedAt, Expr::value(now))
        .filter(device_code::Column::DeviceCode.eq(device_code))
        .filter(device_code::Column::Status.eq(STATUS_AUTHORIZED))
        .filter(device_code::Column::ExpiresAt.gt(now))
        .filter(device_code::Column::DeletedAt.is_null())
        .exec(&txn)
        .await?;

    if res.rows_affected != 1 {
        txn.rollback().await?;
        return Ok(None);
    }

    let model = access_token::ActiveModel {
        id: Set(token.id),
        token_string: Set(token.token_string),
        user_id: Set(token.user_id),
        client_id: Set(token.client_id),
        scope: Set(token.scope),
        issued_at: Set(token.issued_at),
        expires_at: Set(token.expires_at),
        revoked_at: Set(None),
        disabled: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        deleted_at: Set(None),
    };
    let inserted = model.insert(&txn).await?;

    txn.commit().await?;
    Ok(Some(inserted))
}

/// Sweep: mark overdue pending/authorized rows expired.
pub async fn expire_overdue_device_codes(
    db: &DatabaseConnection,
    now: i64,
) -> Result<u64, AuthoraError> {
    let res = device_code::Entity::update_many()
        .col_expr(device_code::Column::Status, Expr::value(STATUS_EXPIRED))
        .col_expr(device_code::Column::UpdatedAt, Expr::value(now))
        .filter(device_code::Column::Status.is_in([STATUS_PENDING, STATUS_AUTHORIZED]))
        .filter(device_code::Column::ExpiresAt.lte(now))
        .filter(device_code::Column::DeletedAt.is_null())
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

/// Sweep: drop rows a day past expiry.
pub async fn cleanup_expired_device_codes(
    db: &DatabaseConnection,
    now: i64,
) -> Result<u64, AuthoraError> {
    let res = device_code::Entity::delete_many()
        .filter(device_code::Column::ExpiresAt.lt(now - 86_400))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

// Access token functions

pub async fn get_access_token_by_id(
    db: &DatabaseConnection,
    id: &str,
) -> Result<Option<access_token::Model>, AuthoraError> {
    Ok(access_token::Entity::find_by_id(id)
        .filter(access_token::Column::DeletedAt.is_null())
        .one(db)
        .await?)
}

pub async fn get_access_token_by_token_string(
    db: &DatabaseConnection,
    token_string: &str,
) -> Result<Option<access_token::Model>, AuthoraError> {
    Ok(access_token::Entity::find()
        .filter(access_token::Column::TokenString.eq(token_string))
        .filter(access_token::Column::DeletedAt.is_null())
        .one(db)
        .await?)
}

pub async fn list_user_tokens_with_client(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Vec<(access_token::Model, Option<client::Model>)>, AuthoraError> {
    Ok(access_token::Entity::find()
        .filter(access_token::Column::UserId.eq(user_id))
        .filter(access_token::Column::DeletedAt.is_null())
        .find_also_related(client::Entity)
        .order_by_desc(access_token::Column::IssuedAt)
        .all(db)
        .await?)
}

/// Irreversible. Returns false when already revoked or missing.
pub async fn revoke_access_token(
    db: &DatabaseConnection,
    id: &str,
    now: i64,
) -> Result<bool, AuthoraError> {
    let res = access_token::Entity::update_many()
        .col_expr(access_token::Column::RevokedAt, Expr::value(now))
        .col_expr(access_token::Column::UpdatedAt, Expr::value(now))
        .filter(access_token::Column::Id.eq(id))
        .filter(access_token::Column::RevokedAt.is_null())
        .filter(access_token::Column::DeletedAt.is_null())
        .exec(db)
        .await?;
    Ok(res.rows_affected == 1)
}

pub async fn set_access_token_disabled(
    db: &DatabaseConnection,
    id: &str,
    disabled: bool,
    now: i64,
) -> Result<bool, AuthoraError> {
    let res = access_token::Entity::update_many()
        .col_expr(
            access_token::Column::Disabled,
            Expr::value(i64::from(disabled)),
        )
        .col_expr(access_token::Column::UpdatedAt, Expr::value(now))
        .filter(access_token::Column::Id.eq(id))
        .filter(access_token::Column::DeletedAt.is_null())
        .exec(db)
        .await?;
    Ok(res.rows_affected == 1)
}

pub async fn cleanup_expired_access_tokens(
    db: &DatabaseConnection,
    now: i64,
) -> Result<u64, AuthoraError> {
    let res = access_token::Entity::delete_many()
        .filter(access_token::Column::ExpiresAt.lt(now))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

// Session functions

pub async fn create_session(
    db: &DatabaseConnection,
    user_id: &str,
    fingerprint: Option<String>,
) -> Result<session::Model, AuthoraError> {
    let now = now_ts();
    let model = session::ActiveModel {
        session_id: Set(random_id()),
        user_id: Set(user_id.to_string()),
        last_activity: Set(now),
        fingerprint: Set(fingerprint),
        created_at: Set(now),
    };
    Ok(model.insert(db).await?)
}

pub async fn get_session(
    db: &DatabaseConnection,
    session_id: &str,
) -> Result<Option<session::Model>, AuthoraError> {
    Ok(session::Entity::find_by_id(session_id).one(db).await?)
}

pub async fn touch_session(
    db: &DatabaseConnection,
    session_id: &str,
    now: i64,
) -> Result<(), AuthoraError> {
    session::Entity::update_many()
        .col_expr(session::Column::LastActivity, Expr::value(now))
        .filter(session::Column::SessionId.eq(session_id))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn delete_session(
    db: &DatabaseConnection,
    session_id: &str,
) -> Result<(), AuthoraError> {
    session::Entity::delete_by_id(session_id).exec(db).await?;
    Ok(())
}

pub async fn cleanup_idle_sessions(
    db: &DatabaseConnection,
    idle_timeout_secs: i64,
    now: i64,
) -> Result<u64, AuthoraError> {
    if idle_timeout_secs <= 0 {
        return Ok(0);
    }
    let res = session::Entity::delete_many()
        .filter(session::Column::LastActivity.lt(now - idle_timeout_secs))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

// Pagination

#[derive(Debug, Clone)]
pub struct PaginationParams {
    pub page: u64,
    pub page_size: u64,
    pub search: String,
}

impl PaginationParams {
    pub fn new(page: i64, page_size: i64, search: &str) -> Self {
        let page = if page < 1 { 1 } else { page as u64 };
        let page_size = if page_size < 1 {
            10
        } else if page_size > 50 {
            50
        } else {
            page_size as u64
        };
        Self {
            page,
            page_size,
            search: search.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pagination {
    pub total: u64,
    pub total_pages: u64,
    pub current_page: u64,
    pub has_prev: bool,
    pub has_next: bool,
    pub prev_page: u64,
    pub next_page: u64,
}

impl Pagination {
    pub fn calculate(total: u64, current_page: u64, page_size: u64) -> Self {
        let total_pages = if total == 0 {
            0
        } else {
            total.div_ceil(page_size)
        };
        let mut current_page = current_page.max(1);
        if total_pages > 0 && current_page > total_pages {
            current_page = total_pages;
        }
        let has_prev = current_page > 1;
        let has_next = total_pages > 0 && current_page < total_pages;
        Self {
            total,
            total_pages,
            current_page,
            has_prev,
            has_next,
            prev_page: if has_prev { current_page - 1 } else { 1 },
            next_page: if has_next {
                current_page + 1
            } else {
                total_pages
            },
        }
    }
}
