//! Error types for the courier-db crate.
//!
//! Provides a unified error type that wraps `SQLx` errors with additional context.

use thiserror::Error;

/// Postgres SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

/// Database operation errors.
///
/// # Example
///
/// ```rust
/// use courier_db::DbError;
///
/// fn handle_error(err: DbError) {
///     match err {
///         DbError::ConnectionFailed(e) => eprintln!("Cannot connect: {}", e),
///         DbError::MigrationFailed(e) => eprintln!("Migration error: {}", e),
///         DbError::QueryFailed(e) => eprintln!("Query error: {}", e),
///         DbError::Conflict(msg) => eprintln!("Conflict: {}", msg),
///         DbError::NotFound(msg) => eprintln!("Not found: {}", msg),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to establish or acquire a database connection.
    ///
    /// This typically indicates network issues, invalid credentials,
    /// or the database server being unavailable.
    #[error("Database connection failed: {0}")]
    ConnectionFailed(#[source] sqlx::Error),

    /// A database migration failed to apply.
    #[error("Migration failed: {0}")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    /// A database query failed to execute.
    #[error("Query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),

    /// A unique constraint rejected the write (duplicate idempotency key,
    /// duplicate key id, ...).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl DbError {
    /// Check if this error indicates a connection problem.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            DbError::ConnectionFailed(_) => true,
            DbError::QueryFailed(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }

    /// Check if this error indicates a migration problem.
    #[must_use]
    pub fn is_migration_error(&self) -> bool {
        matches!(self, DbError::MigrationFailed(_))
    }

    /// Check if this error indicates a unique constraint conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::Conflict(_))
    }

    /// Check if this error indicates a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                let constraint = db_err.constraint().unwrap_or("unique constraint");
                return DbError::Conflict(format!("violates {constraint}"));
            }
        }
        DbError::QueryFailed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_conflict() {
        let err = DbError::Conflict("events_idempotency_key_key".to_string());
        assert_eq!(err.to_string(), "Conflict: events_idempotency_key_key");
    }

    #[test]
    fn test_is_conflict() {
        let err = DbError::Conflict("dup".to_string());
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
        assert!(!err.is_connection_error());
        assert!(!err.is_migration_error());
    }

    #[test]
    fn test_row_not_found_maps_to_query_failed() {
        let err = DbError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, DbError::QueryFailed(_)));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_pool_timeout_is_connection_error() {
        let err = DbError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_connection_error());
    }
}
