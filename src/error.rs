//! Error taxonomy for the image store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A database handle could not be opened or used.
    #[error("database connection error: {0}")]
    Connection(String),

    /// A schema migration step failed, or the database is from a newer build.
    #[error("schema error at version {version}: {reason}")]
    Schema { version: u32, reason: String },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("image {0} not found")]
    NotFound(i64),

    /// A batched write transaction failed and was rolled back.
    #[error("write transaction failed: {0}")]
    Transaction(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::ConstraintViolation(e.to_string())
            }
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::CannotOpen | rusqlite::ErrorCode::NotADatabase
                ) =>
            {
                StoreError::Connection(e.to_string())
            }
            _ => StoreError::Database(e),
        }
    }
}

impl StoreError {
    /// Errors that only affect a single image and should not abort a batch.
    pub fn is_per_row(&self) -> bool {
        matches!(
            self,
            StoreError::Decode(_) | StoreError::Encode(_) | StoreError::NotFound(_)
        )
    }
}
