//! Request-scoped database lifecycle for axum services.
//!
//! A process-wide pool lives for the application lifespan. Each request gets
//! at most one connection and session, acquired on first use and committed,
//! rolled back or released according to the response status and the
//! configured commit mode.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod scope;
pub mod transport;

pub use config::Config;
pub use db::{Backend, SqliteBackend, SqliteSession};
pub use error::{ScopeError, ScopeResult};
pub use scope::{CommitMode, DatabaseConfig, Lifespan, ResourceCache};
pub use transport::{RequestScope, ScopeState, scope_layer};
