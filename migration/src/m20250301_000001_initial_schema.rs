use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Create users table
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Users::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string_uniq(Users::Username))
                    .col(string(Users::PasswordHash))
                    .col(ColumnDef::new(Users::Role).string().not_null().default("user"))
                    .col(
                        ColumnDef::new(Users::AuthSource)
                            .string()
                            .not_null()
                            .default("local"),
                    )
                    .col(ColumnDef::new(Users::ExternalId).string().not_null().default(""))
                    .col(string_null(Users::Email))
                    .col(string_null(Users::FullName))
                    .col(big_integer(Users::CreatedAt))
                    .col(big_integer(Users::UpdatedAt))
                    .col(big_integer_null(Users::DeletedAt))
                    .to_owned(),
            )
            .await?;

        // Create clients table
        manager
            .create_table(
                Table::create()
                    .table(Clients::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Clients::ClientId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Clients::ClientSecret))
                    .col(string(Clients::Name))
                    .col(string_null(Clients::CreatorUserId))
                    .col(string(Clients::GrantTypes))
                    .col(string(Clients::Scopes))
                    .col(
                        ColumnDef::new(Clients::Active)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .col(big_integer(Clients::CreatedAt))
                    .col(big_integer(Clients::UpdatedAt))
                    .col(big_integer_null(Clients::DeletedAt))
                    .to_owned(),
            )
            .await?;

        // Create device_codes table
        manager
            .create_table(
                Table::create()
                    .table(DeviceCodes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceCodes::DeviceCode)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(DeviceCodes::UserCode))
                    .col(string(DeviceCodes::ClientId))
                    .col(string(DeviceCodes::Scope))
                    .col(
                        ColumnDef::new(DeviceCodes::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(string_null(DeviceCodes::UserId))
                    .col(big_integer_null(DeviceCodes::AuthorizedAt))
                    .col(big_integer(DeviceCodes::ExpiresAt))
                    .col(big_integer_null(DeviceCodes::LastPolledAt))
                    .col(
                        ColumnDef::new(DeviceCodes::Interval)
                            .big_integer()
                            .not_null()
                            .default(5),
                    )
                    .col(big_integer(DeviceCodes::CreatedAt))
                    .col(big_integer(DeviceCodes::UpdatedAt))
                    .col(big_integer_null(DeviceCodes::DeletedAt))
                    .to_owned(),
            )
            .await?;

        // Index on user_code for fast lookups during verification
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_codes_user_code")
                    .table(DeviceCodes::Table)
                    .col(DeviceCodes::UserCode)
                    .to_owned(),
            )
            .await?;

        // Index on expires_at for the cleanup job
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_codes_expires_at")
                    .table(DeviceCodes::Table)
                    .col(DeviceCodes::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // Create access_tokens table
        manager
            .create_table(
                Table::create()
                    .table(AccessTokens::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AccessTokens::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(AccessTokens::TokenString))
                    .col(string(AccessTokens::UserId))
                    .col(string(AccessTokens::ClientId))
                    .col(string(AccessTokens::Scope))
                    .col(big_integer(AccessTokens::IssuedAt))
                    .col(big_integer(AccessTokens::ExpiresAt))
                    .col(big_integer_null(AccessTokens::RevokedAt))
                    .col(
                        ColumnDef::new(AccessTokens::Disabled)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer(AccessTokens::CreatedAt))
                    .col(big_integer(AccessTokens::UpdatedAt))
                    .col(big_integer_null(AccessTokens::DeletedAt))
                    .to_owned(),
            )
            .await?;

        // Index on token_string for bearer lookups
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_access_tokens_token_string")
                    .table(AccessTokens::Table)
                    .col(AccessTokens::TokenString)
                    .to_owned(),
            )
            .await?;

        // Index on user_id for the account token list
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_access_tokens_user_id")
                    .table(AccessTokens::Table)
                    .col(AccessTokens::UserId)
                    .to_owned(),
            )
            .await?;

        // Create sessions table
        manager
            .create_table(
                Table::create()
                    .table(Sessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sessions::SessionId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Sessions::UserId))
                    .col(big_integer(Sessions::LastActivity))
                    .col(string_null(Sessions::Fingerprint))
                    .col(big_integer(Sessions::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_last_activity")
                    .table(Sessions::Table)
                    .col(Sessions::LastActivity)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Sessions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AccessTokens::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DeviceCodes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Clients::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
    Username,
    PasswordHash,
    Role,
    AuthSource,
    ExternalId,
    Email,
    FullName,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}

#[derive(DeriveIden)]
enum Clients {
    Table,
    ClientId,
    ClientSecret,
    Name,
    CreatorUserId,
    GrantTypes,
    Scopes,
    Active,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}

#[derive(DeriveIden)]
enum DeviceCodes {
    Table,
    DeviceCode,
    UserCode,
    ClientId,
    Scope,
    Status,
    UserId,
    AuthorizedAt,
    ExpiresAt,
    LastPolledAt,
    Interval,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}

#[derive(DeriveIden)]
enum AccessTokens {
    Table,
    Id,
    TokenString,
    UserId,
    ClientId,
    Scope,
    IssuedAt,
    ExpiresAt,
    RevokedAt,
    Disabled,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}

#[derive(DeriveIden)]
enum Sessions {
    Table,
    SessionId,
    UserId,
    LastActivity,
    Fingerprint,
    CreatedAt,
}
