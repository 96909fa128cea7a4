//! Axum middleware binding a database request scope to each request.

use crate::db::Backend;
use crate::error::{ScopeError, ScopeResult};
use crate::scope::{ConnectionHandle, DatabaseConfig, ResourceCache, ResponseSignal};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, error};

/// State shared by every request: the configuration and the application scope.
pub struct ScopeState<B: Backend> {
    config: Arc<DatabaseConfig<B>>,
    app: ResourceCache,
}

impl<B: Backend> Clone for ScopeState<B> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            app: self.app.clone(),
        }
    }
}

impl<B: Backend> ScopeState<B> {
    pub fn new(config: Arc<DatabaseConfig<B>>, app: ResourceCache) -> Self {
        Self { config, app }
    }

    pub fn config(&self) -> &DatabaseConfig<B> {
        &self.config
    }

    pub fn app(&self) -> &ResourceCache {
        &self.app
    }
}

/// Database access for the current request.
///
/// Inserted into the request extensions by [`scope_layer`] and usable as an
/// extractor. Resources are acquired on first use and memoized for the rest
/// of the request.
pub struct RequestScope<B: Backend> {
    state: ScopeState<B>,
    scope: ResourceCache,
}

impl<B: Backend> Clone for RequestScope<B> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            scope: self.scope.clone(),
        }
    }
}

impl<B: Backend> RequestScope<B> {
    pub fn new(state: ScopeState<B>, scope: ResourceCache) -> Self {
        Self { state, scope }
    }

    pub fn scope(&self) -> &ResourceCache {
        &self.scope
    }

    pub async fn pool(&self) -> ScopeResult<B::Pool> {
        self.state
            .config
            .provide_pool(&self.state.app, &self.scope)
            .await
    }

    pub async fn connection(&self) -> ScopeResult<ConnectionHandle<B::Connection>> {
        self.state
            .config
            .provide_connection(&self.state.app, &self.scope)
            .await
    }

    pub async fn session(&self) -> ScopeResult<B::Session> {
        self.state
            .config
            .provide_session(&self.state.app, &self.scope)
            .await
    }
}

impl<B: Backend, S: Send + Sync> FromRequestParts<S> for RequestScope<B> {
    type Rejection = ScopeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestScope<B>>()
            .cloned()
            .ok_or_else(|| ScopeError::internal("Request scope missing: scope_layer is not installed"))
    }
}

/// Scope middleware.
///
/// Creates the request scope, runs the handler, then hands the response
/// status to the outcome handler before the response leaves. A failed
/// commit replaces the response with the error. If the request is dropped
/// before a response exists, the armed guard releases the connection.
pub async fn scope_layer<B: Backend>(
    State(state): State<ScopeState<B>>,
    mut request: Request,
    next: Next,
) -> Response {
    let scope = ResourceCache::new();
    let mut guard = state.config.request_guard(scope.clone());
    let mut observer = state.config.outcome_handler().observer();

    request
        .extensions_mut()
        .insert(RequestScope::new(state.clone(), scope.clone()));

    let response = next.run(request).await;
    let signal = ResponseSignal::Start {
        status: response.status().as_u16(),
    };

    // Disposition runs to completion even if the client goes away meanwhile.
    let task_scope = scope.clone();
    let outcome =
        tokio::spawn(async move { observer.on_signal(&signal, &task_scope).await }).await;
    guard.disarm();

    match outcome {
        Ok(Ok(disposition)) => {
            if let Some(disposition) = disposition {
                debug!(scope = %scope.id(), disposition = %disposition, "Request finalized");
            }
            response
        }
        Ok(Err(e)) => {
            error!(scope = %scope.id(), error = %e, "Failed to finalize request");
            e.into_response()
        }
        Err(join_err) => {
            error!(scope = %scope.id(), error = %join_err, "Finalize task failed");
            ScopeError::internal(format!("Finalize task failed: {}", join_err)).into_response()
        }
    }
}
