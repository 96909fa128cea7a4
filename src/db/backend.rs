//! Backend capability surface.
//!
//! A [`Backend`] is the opaque handle to a concrete database driver. The scope
//! machinery never looks inside pools or connections; it only asks the backend
//! to create, borrow, decide on, and give back resources.

use crate::error::ScopeResult;
use crate::scope::ConnectionHandle;
use std::future::Future;

/// Trait for concrete database backends.
///
/// Every method that touches the database may suspend. Implementations must be
/// safe for concurrent borrow/return through the pool they hand out.
pub trait Backend: Send + Sync + 'static {
    /// Process-wide pool handle. Cloning must share, not copy, the pool.
    type Pool: Clone + Send + Sync + 'static;

    /// One connection, owned by a single request.
    type Connection: Send + 'static;

    /// Higher-level driver wrapping a request connection.
    type Session: Clone + Send + Sync + 'static;

    /// Short backend name for logging.
    fn name(&self) -> &'static str;

    /// Whether connections come from a shared pool.
    fn supports_pooling(&self) -> bool;

    /// Create the process-wide pool.
    fn create_pool(&self) -> impl Future<Output = ScopeResult<Self::Pool>> + Send;

    /// Close the pool, releasing every connection it holds.
    fn close_pool(&self, pool: Self::Pool) -> impl Future<Output = ScopeResult<()>> + Send;

    /// Acquire one connection.
    ///
    /// `pool` is `Some` only when [`supports_pooling`](Self::supports_pooling)
    /// is true; otherwise a direct connection is opened.
    fn acquire_connection(
        &self,
        pool: Option<&Self::Pool>,
    ) -> impl Future<Output = ScopeResult<Self::Connection>> + Send;

    /// Commit the work done on the connection.
    fn commit(&self, connection: &mut Self::Connection)
    -> impl Future<Output = ScopeResult<()>> + Send;

    /// Roll back the work done on the connection.
    fn rollback(
        &self,
        connection: &mut Self::Connection,
    ) -> impl Future<Output = ScopeResult<()>> + Send;

    /// Return the connection to its pool, or close it when unpooled.
    fn release_connection(
        &self,
        connection: Self::Connection,
    ) -> impl Future<Output = ScopeResult<()>> + Send;

    /// Wrap a request connection in a session.
    fn wrap_session(&self, connection: ConnectionHandle<Self::Connection>) -> Self::Session;
}
