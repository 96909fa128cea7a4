//! HTTP transport serving a small notes API under request scopes.
//!
//! Every route runs inside [`scope_layer`], so handlers only write; whether
//! the writes are kept is decided by the response status and commit mode.

use crate::db::{SqliteBackend, SqliteSession};
use crate::error::{ScopeError, ScopeResult};
use crate::models::QueryParam;
use crate::scope::{DatabaseConfig, ResourceCache};
use crate::transport::Transport;
use crate::transport::middleware::{RequestScope, ScopeState, scope_layer};
use axum::{
    Json, Router,
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS notes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);";

type Scope = RequestScope<SqliteBackend>;

#[derive(Debug, Deserialize)]
pub struct NewNote {
    pub body: String,
    /// Respond with this status after writing, to exercise the commit policy.
    #[serde(default)]
    pub respond_with: Option<u16>,
}

/// Build the notes router with the scope middleware installed.
pub fn router(state: ScopeState<SqliteBackend>) -> Router {
    Router::new()
        .route("/notes", get(list_notes).post(create_note))
        .route("/notes/{id}", get(get_note).delete(delete_note))
        .route_layer(axum::middleware::from_fn_with_state(
            state,
            scope_layer::<SqliteBackend>,
        ))
        .route("/health", get(health))
}

/// Create the notes table, committing outside any request.
pub async fn ensure_schema(config: &DatabaseConfig<SqliteBackend>, app: &ResourceCache) -> ScopeResult<()> {
    let scope = ResourceCache::new();
    let session = config.provide_session(app, &scope).await?;
    let created = async {
        session.execute_script(SCHEMA).await?;
        session.commit().await
    }
    .await;

    let status = if created.is_ok() { 200 } else { 500 };
    config.outcome_handler().finalize(status, &scope).await?;
    created
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_notes(db: Scope) -> Result<Response, ScopeError> {
    let session = db.session().await?;
    let notes = session
        .select("SELECT id, body, created_at FROM notes ORDER BY id", &[])
        .await?;
    Ok(Json(notes).into_response())
}

async fn get_note(db: Scope, Path(id): Path<i64>) -> Result<Response, ScopeError> {
    let session = db.session().await?;
    let note = session
        .select_one_or_none(
            "SELECT id, body, created_at FROM notes WHERE id = ?",
            &[QueryParam::Int(id)],
        )
        .await?;
    Ok(match note {
        Some(note) => Json(note).into_response(),
        None => not_found(id),
    })
}

async fn create_note(db: Scope, Json(note): Json<NewNote>) -> Result<Response, ScopeError> {
    let session: SqliteSession = db.session().await?;
    let created = session
        .insert_update_delete_returning(
            "INSERT INTO notes (body) VALUES (?) RETURNING id, body, created_at",
            &[QueryParam::from(note.body)],
        )
        .await?;

    let status = note
        .respond_with
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::CREATED);
    Ok((status, Json(created)).into_response())
}

async fn delete_note(db: Scope, Path(id): Path<i64>) -> Result<Response, ScopeError> {
    let session = db.session().await?;
    let result = session
        .insert_update_delete("DELETE FROM notes WHERE id = ?", &[QueryParam::Int(id)])
        .await?;
    Ok(if result.rows_affected == 0 {
        not_found(id)
    } else {
        StatusCode::NO_CONTENT.into_response()
    })
}

fn not_found(id: i64) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("Note {} not found", id) })),
    )
        .into_response()
}

/// HTTP transport running the notes API for the lifetime of the pool.
pub struct HttpTransport {
    config: Arc<DatabaseConfig<SqliteBackend>>,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
}

impl HttpTransport {
    pub fn new(config: Arc<DatabaseConfig<SqliteBackend>>, host: impl Into<String>, port: u16) -> Self {
        Self {
            config,
            host: host.into(),
            port,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn serve(&self, app: &ResourceCache) -> ScopeResult<()> {
        ensure_schema(&self.config, app).await?;

        let bind_addr = self.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ScopeError::configuration(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        info!(
            addr = %bind_addr,
            commit_mode = %self.config.commit_mode(),
            "HTTP server listening"
        );

        let router = router(ScopeState::new(Arc::clone(&self.config), app.clone()));

        const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

        let shutdown_notify = Arc::new(tokio::sync::Notify::new());
        let shutdown_notify_clone = shutdown_notify.clone();

        let shutdown_signal = async move {
            wait_for_signal().await;
            shutdown_notify_clone.notify_one();
        };

        let server = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal);

        // Race between: server completing normally vs forced timeout/second signal after shutdown
        tokio::select! {
            result = server => {
                match result {
                    Ok(()) => info!("HTTP server stopped"),
                    Err(e) => {
                        error!(error = %e, "HTTP server error");
                        return Err(ScopeError::internal(format!("HTTP server error: {}", e)));
                    }
                }
            }
            _ = async {
                shutdown_notify.notified().await;
                info!(
                    timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                    "Waiting for in-flight requests (send signal again to force exit)..."
                );

                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                        warn!("Graceful shutdown timeout, forcing exit");
                    }
                    _ = wait_for_signal() => {
                        warn!("Received second signal, forcing immediate exit");
                    }
                }
            } => {}
        }

        Ok(())
    }
}

impl Transport for HttpTransport {
    async fn run(&self) -> ScopeResult<()> {
        let app = ResourceCache::new();
        self.config
            .lifespan()
            .run(&app, self.serve(&app))
            .await
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
