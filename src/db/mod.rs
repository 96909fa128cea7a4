//! Database layer.
//!
//! This module provides:
//! - The backend capability trait used by the scope machinery
//! - The SQLite backend on sqlx, pooled or direct
//! - The session driver handlers use for statements
//! - Parameter binding and row decoding

pub mod backend;
pub mod params;
pub mod session;
pub mod sqlite;
pub mod types;

pub use backend::Backend;
pub use session::SqliteSession;
pub use sqlite::{SqliteBackend, SqlitePoolHandle, SqliteScopedConnection};
pub use types::RowToJson;
