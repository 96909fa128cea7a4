//! Transport layer.
//!
//! - Middleware: binds a request scope to every axum request
//! - HTTP: serves the notes API for the lifetime of the database pool

pub mod http;
pub mod middleware;

pub use http::HttpTransport;
pub use middleware::{RequestScope, ScopeState, scope_layer};

use crate::error::ScopeResult;
use std::future::Future;

/// Trait for server transports.
pub trait Transport: Send + Sync {
    /// Start the transport and begin handling requests.
    ///
    /// This method should block until the transport is shut down.
    fn run(&self) -> impl Future<Output = ScopeResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
