//! Typed error type for the db crate.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// A stored column held a value the record type cannot represent.
    #[error("cannot decode column '{column}': {message}")]
    Decode { column: &'static str, message: String },

    /// The backing store refused the operation (connection loss, injected
    /// fault). The whole transaction must be retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
