//! Request-scoped database resource lifecycle.
//!
//! This module binds database resources to two lifetimes:
//! - The application: the pool, opened and closed by [`Lifespan`]
//! - One request: the connection and session, memoized in a [`ResourceCache`]
//!   and disposed of by the [`OutcomeHandler`] when the response starts

pub mod cache;
pub mod database_config;
pub mod handle;
pub mod lifespan;
pub mod outcome;
pub mod providers;

pub use cache::ResourceCache;
pub use database_config::{
    DEFAULT_COMMIT_MODE, DEFAULT_CONNECTION_KEY, DEFAULT_POOL_KEY, DEFAULT_SESSION_KEY,
    DatabaseConfig, DatabaseConfigBuilder,
};
pub use handle::ConnectionHandle;
pub use lifespan::{Lifespan, LifespanState};
pub use outcome::{
    CommitMode, Disposition, ObserverState, OutcomeHandler, RequestGuard, ResponseObserver,
    ResponseSignal, StatusPolicy,
};
pub use providers::{ConnectionProvider, PoolProvider, SessionProvider};
