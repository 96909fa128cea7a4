//! Application-lifetime pool management.
//!
//! The pool lives in the application scope under the configured pool key.
//! [`Lifespan`] is the only component that closes it.

use crate::db::Backend;
use crate::error::{ScopeError, ScopeResult};
use crate::scope::ResourceCache;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use tracing::{error, info};

/// Lifespan state. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifespanState {
    Unstarted,
    Started,
    Stopped,
}

impl LifespanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifespanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct LifespanInner {
    state: LifespanState,
    started_at: Option<DateTime<Utc>>,
}

/// Start/stop guard for the process-wide pool.
///
/// Pool creation holds `gate` shared and `stop` holds it exclusively, so a
/// pool is never created after, or concurrently with, its removal.
pub struct Lifespan<B: Backend> {
    backend: Arc<B>,
    pool_key: String,
    inner: Arc<Mutex<LifespanInner>>,
    gate: Arc<RwLock<()>>,
}

impl<B: Backend> Clone for Lifespan<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            pool_key: self.pool_key.clone(),
            inner: Arc::clone(&self.inner),
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Lifespan<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifespan")
            .field("backend", &self.backend.name())
            .field("pool_key", &self.pool_key)
            .field("state", &self.state())
            .finish()
    }
}

impl<B: Backend> Lifespan<B> {
    pub(crate) fn new(backend: Arc<B>, pool_key: impl Into<String>) -> Self {
        Self {
            backend,
            pool_key: pool_key.into(),
            inner: Arc::new(Mutex::new(LifespanInner {
                state: LifespanState::Unstarted,
                started_at: None,
            })),
            gate: Arc::new(RwLock::new(())),
        }
    }

    fn inner(&self) -> MutexGuard<'_, LifespanInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LifespanState {
        self.inner().state
    }

    /// When the pool was opened, if it currently is.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner().started_at
    }

    pub fn pool_key(&self) -> &str {
        &self.pool_key
    }

    /// Open the pool and store it in the application scope.
    ///
    /// A pool already created lazily by the pool provider is adopted rather
    /// than replaced. On failure the lifespan returns to `Unstarted`.
    pub async fn start(&self, app: &ResourceCache) -> ScopeResult<B::Pool> {
        let _gate = self.gate.read().await;
        {
            let mut inner = self.inner();
            if inner.state != LifespanState::Unstarted {
                return Err(ScopeError::lifecycle_order("start", inner.state.as_str()));
            }
            inner.state = LifespanState::Started;
        } // Lock released here

        match self.create_pool(app).await {
            Ok(pool) => {
                self.inner().started_at = Some(Utc::now());
                info!(
                    backend = self.backend.name(),
                    pool_key = %self.pool_key,
                    pooling = self.backend.supports_pooling(),
                    "Database pool opened"
                );
                Ok(pool)
            }
            Err(e) => {
                self.inner().state = LifespanState::Unstarted;
                error!(pool_key = %self.pool_key, error = %e, "Failed to open database pool");
                Err(e)
            }
        }
    }

    /// Close the pool and remove it from the application scope.
    ///
    /// Waits for any pool creation in flight, so that pool is closed too.
    pub async fn stop(&self, app: &ResourceCache) -> ScopeResult<()> {
        let _gate = self.gate.write().await;
        {
            let mut inner = self.inner();
            if inner.state != LifespanState::Started {
                return Err(ScopeError::lifecycle_order("stop", inner.state.as_str()));
            }
            inner.state = LifespanState::Stopped;
            inner.started_at = None;
        } // Lock released here

        // A mismatch means another resource owns this key; it stays in place.
        let pool = app
            .remove::<B::Pool>(&self.pool_key)
            .map_err(|e| ScopeError::release(e.to_string()))?;

        if let Some(pool) = pool {
            self.backend.close_pool(pool).await.map_err(|e| match e {
                ScopeError::Release { .. } => e,
                other => ScopeError::release(other.to_string()),
            })?;
        }

        info!(pool_key = %self.pool_key, "Database pool closed");
        Ok(())
    }

    /// Return the pool, creating it on first use.
    ///
    /// Refuses once the lifespan has stopped. Concurrent callers share one
    /// creation.
    pub(crate) async fn provide_pool(&self, app: &ResourceCache) -> ScopeResult<B::Pool> {
        let _gate = self.gate.read().await;
        self.ensure_not_stopped()?;
        self.create_pool(app).await
    }

    /// Fail with a pool acquisition error once the lifespan has stopped.
    pub(crate) fn ensure_not_stopped(&self) -> ScopeResult<()> {
        if self.state() == LifespanState::Stopped {
            return Err(ScopeError::pool_acquisition(format!(
                "Pool '{}' is closed: the application lifespan has stopped",
                self.pool_key
            )));
        }
        Ok(())
    }

    async fn create_pool(&self, app: &ResourceCache) -> ScopeResult<B::Pool> {
        app.get_or_try_init(&self.pool_key, || async {
            info!(
                backend = self.backend.name(),
                pool_key = %self.pool_key,
                "Creating database pool"
            );
            self.backend
                .create_pool()
                .await
                .map_err(ScopeError::into_pool_acquisition)
        })
        .await
    }

    /// The pool, while the lifespan is started.
    pub fn pool(&self, app: &ResourceCache) -> ScopeResult<Option<B::Pool>> {
        if self.state() != LifespanState::Started {
            return Ok(None);
        }
        app.get::<B::Pool>(&self.pool_key)
    }

    /// Run `work` between start and stop.
    ///
    /// Stop runs whatever `work` returns. A stop failure is reported only when
    /// `work` itself succeeded.
    pub async fn run<F, T>(&self, app: &ResourceCache, work: F) -> ScopeResult<T>
    where
        F: Future<Output = ScopeResult<T>>,
    {
        self.start(app).await?;
        let result = work.await;
        let stopped = self.stop(app).await;

        match (result, stopped) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(stop_err)) => Err(stop_err),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(stop_err)) => {
                error!(error = %stop_err, "Failed to close database pool after error");
                Err(e)
            }
        }
    }
}
