//! Lazy resource providers.
//!
//! Each provider takes the application scope and the request scope explicitly
//! and memoizes its resource in the request scope under its configured key.

use crate::db::Backend;
use crate::error::{ScopeError, ScopeResult};
use crate::scope::{ConnectionHandle, Lifespan, ResourceCache};
use std::sync::Arc;
use tracing::debug;

/// Hands out the process-wide pool.
pub struct PoolProvider<B: Backend> {
    pool_key: String,
    lifespan: Lifespan<B>,
}

impl<B: Backend> Clone for PoolProvider<B> {
    fn clone(&self) -> Self {
        Self {
            pool_key: self.pool_key.clone(),
            lifespan: self.lifespan.clone(),
        }
    }
}

impl<B: Backend> PoolProvider<B> {
    pub(crate) fn new(pool_key: impl Into<String>, lifespan: Lifespan<B>) -> Self {
        Self {
            pool_key: pool_key.into(),
            lifespan,
        }
    }

    pub fn key(&self) -> &str {
        &self.pool_key
    }

    /// Return the pool, creating it on first use per application lifetime.
    ///
    /// Concurrent first use from several requests creates one pool. Once the
    /// lifespan has stopped no pool is handed out or re-created.
    pub async fn provide(&self, app: &ResourceCache, scope: &ResourceCache) -> ScopeResult<B::Pool> {
        self.lifespan.ensure_not_stopped()?;
        if let Some(pool) = scope.get::<B::Pool>(&self.pool_key)? {
            return Ok(pool);
        }

        let pool = self.lifespan.provide_pool(app).await?;
        scope.insert(&self.pool_key, pool.clone());
        Ok(pool)
    }
}

/// Hands out the request's connection.
pub struct ConnectionProvider<B: Backend> {
    backend: Arc<B>,
    connection_key: String,
    pools: PoolProvider<B>,
}

impl<B: Backend> Clone for ConnectionProvider<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            connection_key: self.connection_key.clone(),
            pools: self.pools.clone(),
        }
    }
}

impl<B: Backend> ConnectionProvider<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        connection_key: impl Into<String>,
        pools: PoolProvider<B>,
    ) -> Self {
        Self {
            backend,
            connection_key: connection_key.into(),
            pools,
        }
    }

    pub fn key(&self) -> &str {
        &self.connection_key
    }

    /// Return the request's connection, acquiring it on first call.
    ///
    /// A failed acquisition leaves nothing cached under the connection key.
    pub async fn provide(
        &self,
        app: &ResourceCache,
        scope: &ResourceCache,
    ) -> ScopeResult<ConnectionHandle<B::Connection>> {
        scope
            .get_or_try_init(&self.connection_key, || async {
                let pool = if self.backend.supports_pooling() {
                    Some(self.pools.provide(app, scope).await?)
                } else {
                    None
                };
                let connection = self
                    .backend
                    .acquire_connection(pool.as_ref())
                    .await
                    .map_err(ScopeError::into_connection_acquisition)?;
                debug!(
                    scope = %scope.id(),
                    connection_key = %self.connection_key,
                    pooled = pool.is_some(),
                    "Connection acquired"
                );
                Ok(ConnectionHandle::new(&self.connection_key, connection))
            })
            .await
    }
}

/// Hands out the request's session.
pub struct SessionProvider<B: Backend> {
    backend: Arc<B>,
    session_key: String,
    connections: ConnectionProvider<B>,
}

impl<B: Backend> Clone for SessionProvider<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            session_key: self.session_key.clone(),
            connections: self.connections.clone(),
        }
    }
}

impl<B: Backend> SessionProvider<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        session_key: impl Into<String>,
        connections: ConnectionProvider<B>,
    ) -> Self {
        Self {
            backend,
            session_key: session_key.into(),
            connections,
        }
    }

    pub fn key(&self) -> &str {
        &self.session_key
    }

    /// Return the request's session, wrapping the request connection once.
    pub async fn provide(&self, app: &ResourceCache, scope: &ResourceCache) -> ScopeResult<B::Session> {
        scope
            .get_or_try_init(&self.session_key, || async {
                let connection = self.connections.provide(app, scope).await?;
                Ok(self.backend.wrap_session(connection))
            })
            .await
    }
}
