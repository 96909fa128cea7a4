//! Data models shared by the session API and the HTTP layer.

pub mod query;

pub use query::{ExecuteResult, QueryParam};
