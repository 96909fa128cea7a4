//! Shared handle to a request-owned connection.

use crate::error::{ScopeError, ScopeResult};
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

/// Handle to the connection cached for one request.
///
/// Clones share the same connection. Once the outcome handler has disposed of
/// the connection, every clone reports [`ScopeError::ConnectionReleased`].
pub struct ConnectionHandle<C> {
    key: Arc<str>,
    slot: Arc<Mutex<Option<C>>>,
}

impl<C> Clone for ConnectionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<C> std::fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<C: Send> ConnectionHandle<C> {
    pub(crate) fn new(key: &str, connection: C) -> Self {
        Self {
            key: Arc::from(key),
            slot: Arc::new(Mutex::new(Some(connection))),
        }
    }

    /// Cache key this connection was registered under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lock the connection for exclusive use.
    ///
    /// Do not hold the guard past the handler: the outcome handler waits on
    /// the same lock before committing.
    pub async fn lock(&self) -> ScopeResult<MappedMutexGuard<'_, C>> {
        let guard = self.slot.lock().await;
        MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| ScopeError::connection_released(self.key.as_ref()))
    }

    /// Whether the connection has already been disposed of.
    pub async fn is_released(&self) -> bool {
        self.slot.lock().await.is_none()
    }

    /// Take the connection out for final disposition.
    ///
    /// Returns `None` on every call after the first.
    pub(crate) async fn take(&self) -> Option<C> {
        self.slot.lock().await.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_connection() {
        let handle = ConnectionHandle::new("db_connection", 41_u32);
        let other = handle.clone();
        *handle.lock().await.unwrap() += 1;
        assert_eq!(*other.lock().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_take_is_exactly_once() {
        let handle = ConnectionHandle::new("db_connection", "conn");
        assert_eq!(handle.take().await, Some("conn"));
        assert_eq!(handle.take().await, None);
        assert!(handle.is_released().await);
    }

    #[tokio::test]
    async fn test_lock_after_release_fails() {
        let handle = ConnectionHandle::new("primary", 1_u8);
        handle.take().await;
        let err = handle.lock().await.unwrap_err();
        assert!(matches!(err, ScopeError::ConnectionReleased { ref key } if key == "primary"));
    }
}
