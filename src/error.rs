//! Error types for request-scoped database resources.
//!
//! All failures surface through [`ScopeError`]. Acquisition and decision errors
//! are never recovered locally: they propagate to the request or application
//! caller, which alone decides whether to retry, degrade, or fail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Improper configuration: {message}")]
    Configuration { message: String },

    #[error("Pool acquisition failed: {message}")]
    PoolAcquisition { message: String },

    #[error("Connection acquisition failed: {message}")]
    ConnectionAcquisition { message: String },

    #[error("Commit failed: {message}")]
    Commit { message: String },

    #[error("Rollback failed: {message}")]
    Rollback { message: String },

    #[error("Release failed: {message}")]
    Release { message: String },

    #[error("Lifespan called out of order: cannot {operation} while {state}")]
    LifecycleOrder {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Connection under '{key}' was already released")]
    ConnectionReleased { key: String },

    #[error("Resource under '{key}' is not a {expected}")]
    ResourceTypeMismatch { key: String, expected: &'static str },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "2067" for a SQLite unique constraint violation
        code: Option<String>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ScopeError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a pool acquisition error.
    pub fn pool_acquisition(message: impl Into<String>) -> Self {
        Self::PoolAcquisition {
            message: message.into(),
        }
    }

    /// Create a connection acquisition error.
    pub fn connection_acquisition(message: impl Into<String>) -> Self {
        Self::ConnectionAcquisition {
            message: message.into(),
        }
    }

    /// Create a commit error.
    pub fn commit(message: impl Into<String>) -> Self {
        Self::Commit {
            message: message.into(),
        }
    }

    /// Create a rollback error.
    pub fn rollback(message: impl Into<String>) -> Self {
        Self::Rollback {
            message: message.into(),
        }
    }

    /// Create a release error.
    pub fn release(message: impl Into<String>) -> Self {
        Self::Release {
            message: message.into(),
        }
    }

    /// Create a lifecycle ordering error.
    pub fn lifecycle_order(operation: &'static str, state: &'static str) -> Self {
        Self::LifecycleOrder { operation, state }
    }

    pub fn connection_released(key: impl Into<String>) -> Self {
        Self::ConnectionReleased { key: key.into() }
    }

    pub fn resource_type_mismatch(key: impl Into<String>, expected: &'static str) -> Self {
        Self::ResourceTypeMismatch {
            key: key.into(),
            expected,
        }
    }

    /// Create a database error with an optional driver code.
    pub fn database(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            code,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Convert into a connection acquisition error unless it already is one.
    pub(crate) fn into_connection_acquisition(self) -> Self {
        match self {
            Self::ConnectionAcquisition { .. } => self,
            other => Self::connection_acquisition(other.to_string()),
        }
    }

    pub(crate) fn into_pool_acquisition(self) -> Self {
        match self {
            Self::PoolAcquisition { .. } => self,
            other => Self::pool_acquisition(other.to_string()),
        }
    }

    /// Check if the caller may reasonably retry the failed operation.
    ///
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolAcquisition { .. } | Self::ConnectionAcquisition { .. }
        )
    }

    /// HTTP status used when the error reaches the host framework.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PoolAcquisition { .. } | Self::ConnectionAcquisition { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convert sqlx errors to ScopeError.
impl From<sqlx::Error> for ScopeError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => ScopeError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                ScopeError::database(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => ScopeError::database("No rows returned", None),
            sqlx::Error::PoolTimedOut => {
                ScopeError::connection_acquisition("Timed out waiting for a pooled connection")
            }
            sqlx::Error::PoolClosed => ScopeError::pool_acquisition("Connection pool is closed"),
            sqlx::Error::Io(io_err) => {
                ScopeError::connection_acquisition(format!("I/O error: {}", io_err))
            }
            sqlx::Error::Protocol(msg) => ScopeError::database(format!("Protocol error: {}", msg), None),
            sqlx::Error::ColumnNotFound(col) => {
                ScopeError::database(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnDecode { index, source } => {
                ScopeError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => ScopeError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => ScopeError::internal("Database worker crashed"),
            _ => ScopeError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for scope operations.
pub type ScopeResult<T> = Result<T, ScopeError>;

impl IntoResponse for ScopeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.to_string(),
            "retryable": self.is_retryable(),
        });
        (status, axum::Json(body)).into_response()
    }
}
