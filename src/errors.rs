use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AuthoraError {
    #[error("Database error: {0}")]
    #[diagnostic(code(authora::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(authora::serde))]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    #[diagnostic(code(authora::other))]
    Other(String),
}
