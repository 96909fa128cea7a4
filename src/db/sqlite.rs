//! SQLite backend on sqlx.
//!
//! With pooling enabled, connections are borrowed from a [`SqlitePool`] that
//! lives for the application lifespan. Without pooling, every request opens
//! and closes its own connection and the "pool" is only a marker.

use crate::config::PoolOptions;
use crate::db::Backend;
use crate::db::session::SqliteSession;
use crate::error::{ScopeError, ScopeResult};
use crate::scope::ConnectionHandle;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Pool handle shared through the application scope.
#[derive(Debug, Clone)]
pub enum SqlitePoolHandle {
    Pooled(SqlitePool),
    /// Pooling disabled; connections are opened directly.
    Direct,
}

impl SqlitePoolHandle {
    pub fn as_pool(&self) -> Option<&SqlitePool> {
        match self {
            Self::Pooled(pool) => Some(pool),
            Self::Direct => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.as_pool().is_some_and(SqlitePool::is_closed)
    }
}

/// A request connection and its open transaction.
///
/// The transaction is opened when the connection is acquired, so every
/// statement of the request, reads included, runs inside it. After an
/// explicit commit or rollback the next statement opens a new one. Without
/// pooling the connection lives in a private single-connection pool that is
/// closed on release.
pub struct SqliteScopedConnection {
    pool: SqlitePool,
    pooled: bool,
    transaction: Option<Transaction<'static, Sqlite>>,
}

impl std::fmt::Debug for SqliteScopedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteScopedConnection")
            .field("pooled", &self.pooled)
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

impl SqliteScopedConnection {
    async fn open(pool: SqlitePool, pooled: bool, acquire_timeout: u64) -> ScopeResult<Self> {
        let transaction = begin(&pool, acquire_timeout).await?;
        Ok(Self {
            pool,
            pooled,
            transaction: Some(transaction),
        })
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// The driver connection inside the request transaction.
    ///
    /// Opens a new transaction if the previous one was committed or rolled back.
    pub async fn transaction(&mut self) -> ScopeResult<&mut SqliteConnection> {
        let transaction = match self.transaction.take() {
            Some(transaction) => transaction,
            None => self.pool.begin().await.map_err(ScopeError::from)?,
        };
        Ok(&mut **self.transaction.insert(transaction))
    }

    /// Commit the open transaction. No-op without one.
    pub async fn commit(&mut self) -> ScopeResult<()> {
        if let Some(transaction) = self.transaction.take() {
            transaction
                .commit()
                .await
                .map_err(|e| ScopeError::commit(e.to_string()))?;
        }
        Ok(())
    }

    /// Roll back the open transaction. No-op without one.
    pub async fn rollback(&mut self) -> ScopeResult<()> {
        if let Some(transaction) = self.transaction.take() {
            transaction
                .rollback()
                .await
                .map_err(|e| ScopeError::rollback(e.to_string()))?;
        }
        Ok(())
    }
}

async fn begin(
    pool: &SqlitePool,
    acquire_timeout: u64,
) -> ScopeResult<Transaction<'static, Sqlite>> {
    pool.begin().await.map_err(|e| match e {
        sqlx::Error::PoolTimedOut => ScopeError::connection_acquisition(format!(
            "No connection became available within {}s",
            acquire_timeout
        )),
        other => ScopeError::from(other).into_connection_acquisition(),
    })
}

/// SQLite backend configuration and driver.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    connect_options: SqliteConnectOptions,
    pooling: bool,
    pool_options: PoolOptions,
    decode_binary: bool,
}

impl SqliteBackend {
    /// Create a backend from a connection string such as `sqlite:app.db`.
    ///
    /// The database file is created if missing.
    pub fn new(connection_string: &str, pooling: bool, pool_options: PoolOptions) -> ScopeResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(connection_string)
            .map_err(|e| {
                ScopeError::configuration(format!("Invalid SQLite connection string: {}", e))
            })?
            .create_if_missing(true);
        Self::from_options(connect_options, pooling, pool_options)
    }

    pub fn from_options(
        connect_options: SqliteConnectOptions,
        pooling: bool,
        pool_options: PoolOptions,
    ) -> ScopeResult<Self> {
        pool_options.validate().map_err(ScopeError::configuration)?;
        Ok(Self {
            connect_options,
            pooling,
            pool_options,
            decode_binary: false,
        })
    }

    /// Sessions return BLOB columns as UTF-8 text where valid instead of base64.
    pub fn with_binary_decoding(mut self, decode_binary: bool) -> Self {
        self.decode_binary = decode_binary;
        self
    }

    pub fn decodes_binary(&self) -> bool {
        self.decode_binary
    }

    pub fn pool_options(&self) -> &PoolOptions {
        &self.pool_options
    }
}

impl Backend for SqliteBackend {
    type Pool = SqlitePoolHandle;
    type Connection = SqliteScopedConnection;
    type Session = SqliteSession;

    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn supports_pooling(&self) -> bool {
        self.pooling
    }

    async fn create_pool(&self) -> ScopeResult<SqlitePoolHandle> {
        if !self.pooling {
            return Ok(SqlitePoolHandle::Direct);
        }

        let opts = &self.pool_options;
        let pool = SqlitePoolOptions::new()
            .min_connections(opts.min_connections_or_default())
            .max_connections(opts.max_connections_or_default())
            .acquire_timeout(Duration::from_secs(opts.acquire_timeout_or_default()))
            .idle_timeout(Some(Duration::from_secs(opts.idle_timeout_or_default())))
            .test_before_acquire(opts.test_before_acquire_or_default())
            .connect_with(self.connect_options.clone())
            .await
            .map_err(|e| ScopeError::pool_acquisition(format!("Failed to open pool: {}", e)))?;

        debug!(
            max_connections = opts.max_connections_or_default(),
            "SQLite pool created"
        );
        Ok(SqlitePoolHandle::Pooled(pool))
    }

    async fn close_pool(&self, pool: SqlitePoolHandle) -> ScopeResult<()> {
        if let SqlitePoolHandle::Pooled(pool) = pool {
            pool.close().await;
        }
        Ok(())
    }

    async fn acquire_connection(
        &self,
        pool: Option<&SqlitePoolHandle>,
    ) -> ScopeResult<SqliteScopedConnection> {
        let acquire_timeout = self.pool_options.acquire_timeout_or_default();
        match pool {
            Some(SqlitePoolHandle::Pooled(pool)) => {
                SqliteScopedConnection::open(pool.clone(), true, acquire_timeout).await
            }
            Some(SqlitePoolHandle::Direct) | None => {
                let pool = SqlitePoolOptions::new()
                    .min_connections(0)
                    .max_connections(1)
                    .acquire_timeout(Duration::from_secs(acquire_timeout))
                    .connect_with(self.connect_options.clone())
                    .await
                    .map_err(|e| ScopeError::from(e).into_connection_acquisition())?;
                match SqliteScopedConnection::open(pool.clone(), false, acquire_timeout).await {
                    Ok(connection) => Ok(connection),
                    Err(e) => {
                        pool.close().await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn commit(&self, connection: &mut SqliteScopedConnection) -> ScopeResult<()> {
        connection.commit().await
    }

    async fn rollback(&self, connection: &mut SqliteScopedConnection) -> ScopeResult<()> {
        connection.rollback().await
    }

    async fn release_connection(&self, mut connection: SqliteScopedConnection) -> ScopeResult<()> {
        let rolled_back = connection.rollback().await;
        if let Err(e) = &rolled_back {
            // sqlx queues the rollback again before the connection is reused.
            warn!(error = %e, "Rollback on release failed");
        }

        let SqliteScopedConnection { pool, pooled, .. } = connection;
        if !pooled {
            pool.close().await;
        }
        rolled_back.map_err(|e| ScopeError::release(e.to_string()))
    }

    fn wrap_session(&self, connection: ConnectionHandle<SqliteScopedConnection>) -> SqliteSession {
        SqliteSession::new(connection).with_binary_decoding(self.decode_binary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_connection_string() {
        let result = SqliteBackend::new("sqlite:app.db?mode=sometimes", true, PoolOptions::default());
        assert!(matches!(result, Err(ScopeError::Configuration { .. })));
    }

    #[test]
    fn test_invalid_pool_options() {
        let options = PoolOptions {
            max_connections: Some(0),
            ..PoolOptions::default()
        };
        let result = SqliteBackend::new("sqlite::memory:", true, options);
        assert!(matches!(result, Err(ScopeError::Configuration { .. })));
    }

    #[test]
    fn test_pooling_flag() {
        let pooled = SqliteBackend::new("sqlite::memory:", true, PoolOptions::default()).unwrap();
        let direct = SqliteBackend::new("sqlite::memory:", false, PoolOptions::default()).unwrap();
        assert!(pooled.supports_pooling());
        assert!(!direct.supports_pooling());
        assert_eq!(pooled.name(), "sqlite");
    }

    #[tokio::test]
    async fn test_direct_pool_handle_is_marker() {
        let backend = SqliteBackend::new("sqlite::memory:", false, PoolOptions::default()).unwrap();
        let pool = backend.create_pool().await.unwrap();
        assert!(pool.as_pool().is_none());
        assert!(!pool.is_closed());
        backend.close_pool(pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_connection_transaction_cycle() {
        let backend = SqliteBackend::new("sqlite::memory:", false, PoolOptions::default()).unwrap();
        let mut conn = backend.acquire_connection(None).await.unwrap();
        assert!(!conn.is_pooled());
        assert!(conn.in_transaction());

        conn.commit().await.unwrap();
        assert!(!conn.in_transaction());

        // Nothing open: both are no-ops.
        conn.commit().await.unwrap();
        conn.rollback().await.unwrap();

        conn.transaction().await.unwrap();
        assert!(conn.in_transaction());
        backend.release_connection(conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_connection_acquisition_error() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let url = format!("sqlite:{}", temp_file.path().display());
        let options = PoolOptions {
            max_connections: Some(1),
            acquire_timeout_secs: Some(1),
            ..PoolOptions::default()
        };
        let backend = SqliteBackend::new(&url, true, options).unwrap();
        let pool = backend.create_pool().await.unwrap();

        let held = backend.acquire_connection(Some(&pool)).await.unwrap();
        let err = backend.acquire_connection(Some(&pool)).await.unwrap_err();
        assert!(matches!(err, ScopeError::ConnectionAcquisition { .. }));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("within 1s"));

        backend.release_connection(held).await.unwrap();
        let again = backend.acquire_connection(Some(&pool)).await.unwrap();
        backend.release_connection(again).await.unwrap();
        backend.close_pool(pool).await.unwrap();
    }
}
