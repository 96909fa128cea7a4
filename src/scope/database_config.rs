//! Per-database configuration and its derived components.

use crate::db::Backend;
use crate::error::{ScopeError, ScopeResult};
use crate::scope::{
    CommitMode, ConnectionHandle, ConnectionProvider, Lifespan, OutcomeHandler, PoolProvider,
    RequestGuard, ResourceCache, SessionProvider, StatusPolicy,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_COMMIT_MODE: CommitMode = CommitMode::Manual;
pub const DEFAULT_CONNECTION_KEY: &str = "db_connection";
pub const DEFAULT_POOL_KEY: &str = "db_pool";
pub const DEFAULT_SESSION_KEY: &str = "db_session";

/// Immutable binding of one backend into the host application.
///
/// Built through [`DatabaseConfig::builder`]. Construction validates the
/// commit mode, the keys and the override sets, then derives the providers,
/// the outcome handler and the lifespan guard once.
pub struct DatabaseConfig<B: Backend> {
    backend: Arc<B>,
    connection_key: String,
    pool_key: String,
    session_key: String,
    commit_mode: CommitMode,
    extra_commit_statuses: HashSet<u16>,
    extra_rollback_statuses: HashSet<u16>,
    pool_provider: PoolProvider<B>,
    connection_provider: ConnectionProvider<B>,
    session_provider: SessionProvider<B>,
    outcome_handler: OutcomeHandler<B>,
    lifespan: Lifespan<B>,
}

impl<B: Backend> std::fmt::Debug for DatabaseConfig<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("backend", &self.backend.name())
            .field("connection_key", &self.connection_key)
            .field("pool_key", &self.pool_key)
            .field("session_key", &self.session_key)
            .field("commit_mode", &self.commit_mode)
            .field("extra_commit_statuses", &self.extra_commit_statuses)
            .field("extra_rollback_statuses", &self.extra_rollback_statuses)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> DatabaseConfig<B> {
    /// Configuration with every option at its default.
    pub fn new(backend: B) -> ScopeResult<Self> {
        Self::builder(backend).build()
    }

    pub fn builder(backend: B) -> DatabaseConfigBuilder<B> {
        DatabaseConfigBuilder::new(backend)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn connection_key(&self) -> &str {
        &self.connection_key
    }

    /// Effective pool key (may differ from the configured one, see the builder).
    pub fn pool_key(&self) -> &str {
        &self.pool_key
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn commit_mode(&self) -> CommitMode {
        self.commit_mode
    }

    pub fn extra_commit_statuses(&self) -> &HashSet<u16> {
        &self.extra_commit_statuses
    }

    pub fn extra_rollback_statuses(&self) -> &HashSet<u16> {
        &self.extra_rollback_statuses
    }

    pub fn pool_provider(&self) -> &PoolProvider<B> {
        &self.pool_provider
    }

    pub fn connection_provider(&self) -> &ConnectionProvider<B> {
        &self.connection_provider
    }

    pub fn session_provider(&self) -> &SessionProvider<B> {
        &self.session_provider
    }

    pub fn outcome_handler(&self) -> &OutcomeHandler<B> {
        &self.outcome_handler
    }

    pub fn lifespan(&self) -> &Lifespan<B> {
        &self.lifespan
    }

    pub async fn provide_pool(&self, app: &ResourceCache, scope: &ResourceCache) -> ScopeResult<B::Pool> {
        self.pool_provider.provide(app, scope).await
    }

    pub async fn provide_connection(
        &self,
        app: &ResourceCache,
        scope: &ResourceCache,
    ) -> ScopeResult<ConnectionHandle<B::Connection>> {
        self.connection_provider.provide(app, scope).await
    }

    pub async fn provide_session(
        &self,
        app: &ResourceCache,
        scope: &ResourceCache,
    ) -> ScopeResult<B::Session> {
        self.session_provider.provide(app, scope).await
    }

    /// Arm a teardown guard for a new request scope.
    pub fn request_guard(&self, scope: ResourceCache) -> RequestGuard<B> {
        RequestGuard::new(self.outcome_handler.clone(), scope)
    }
}

/// Builder for [`DatabaseConfig`].
pub struct DatabaseConfigBuilder<B: Backend> {
    backend: B,
    connection_key: String,
    pool_key: String,
    session_key: String,
    commit_mode: ScopeResult<CommitMode>,
    extra_commit_statuses: HashSet<u16>,
    extra_rollback_statuses: HashSet<u16>,
}

impl<B: Backend> DatabaseConfigBuilder<B> {
    fn new(backend: B) -> Self {
        Self {
            backend,
            connection_key: DEFAULT_CONNECTION_KEY.to_string(),
            pool_key: DEFAULT_POOL_KEY.to_string(),
            session_key: DEFAULT_SESSION_KEY.to_string(),
            commit_mode: Ok(DEFAULT_COMMIT_MODE),
            extra_commit_statuses: HashSet::new(),
            extra_rollback_statuses: HashSet::new(),
        }
    }

    pub fn commit_mode(mut self, mode: CommitMode) -> Self {
        self.commit_mode = Ok(mode);
        self
    }

    /// Set the commit mode by name. An unknown name fails at [`build`](Self::build).
    pub fn commit_mode_name(mut self, name: &str) -> Self {
        self.commit_mode = name.parse();
        self
    }

    pub fn connection_key(mut self, key: impl Into<String>) -> Self {
        self.connection_key = key.into();
        self
    }

    /// Set the pool key.
    ///
    /// When the backend cannot pool and the key is left at its default, the
    /// effective key gets a unique suffix so several such configurations can
    /// share one application scope.
    pub fn pool_key(mut self, key: impl Into<String>) -> Self {
        self.pool_key = key.into();
        self
    }

    pub fn session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = key.into();
        self
    }

    pub fn extra_commit_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.extra_commit_statuses = statuses.into_iter().collect();
        self
    }

    pub fn extra_rollback_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.extra_rollback_statuses = statuses.into_iter().collect();
        self
    }

    /// Validate and derive the configuration's components.
    pub fn build(self) -> ScopeResult<DatabaseConfig<B>> {
        let commit_mode = self.commit_mode?;

        for (name, key) in [
            ("connection_key", &self.connection_key),
            ("pool_key", &self.pool_key),
            ("session_key", &self.session_key),
        ] {
            if key.trim().is_empty() {
                return Err(ScopeError::configuration(format!("{name} must not be empty")));
            }
        }
        if self.connection_key == self.pool_key
            || self.connection_key == self.session_key
            || self.pool_key == self.session_key
        {
            return Err(ScopeError::configuration(
                "connection_key, pool_key and session_key must be distinct",
            ));
        }

        let policy = StatusPolicy::new(
            commit_mode,
            &self.extra_commit_statuses,
            &self.extra_rollback_statuses,
        )?;

        let pool_key = if !self.backend.supports_pooling() && self.pool_key == DEFAULT_POOL_KEY {
            unique_pool_key(&self.pool_key)
        } else {
            self.pool_key
        };

        let backend = Arc::new(self.backend);
        let lifespan = Lifespan::new(Arc::clone(&backend), pool_key.clone());
        let pool_provider = PoolProvider::new(pool_key.clone(), lifespan.clone());
        let connection_provider = ConnectionProvider::new(
            Arc::clone(&backend),
            self.connection_key.clone(),
            pool_provider.clone(),
        );
        let session_provider = SessionProvider::new(
            Arc::clone(&backend),
            self.session_key.clone(),
            connection_provider.clone(),
        );
        let outcome_handler = OutcomeHandler::new(
            Arc::clone(&backend),
            policy,
            self.connection_key.clone(),
            self.session_key.clone(),
        );

        debug!(
            backend = backend.name(),
            commit_mode = %commit_mode,
            pool_key = %pool_key,
            "Database configuration built"
        );

        Ok(DatabaseConfig {
            backend,
            connection_key: self.connection_key,
            pool_key,
            session_key: self.session_key,
            commit_mode,
            extra_commit_statuses: self.extra_commit_statuses,
            extra_rollback_statuses: self.extra_rollback_statuses,
            pool_provider,
            connection_provider,
            session_provider,
            outcome_handler,
            lifespan,
        })
    }
}

fn unique_pool_key(base: &str) -> String {
    format!("_{}_{}", base, uuid::Uuid::new_v4().simple())
}
