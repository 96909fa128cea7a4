//! Keyed resource cache.
//!
//! One [`ResourceCache`] backs each request scope, and one backs the
//! application scope that holds the pool.
//!
//! # Design Decisions
//!
//! - **`OnceCell` per key**: single-flight initialization, so two callers that
//!   race on the same key observe one resource
//! - **`std::sync::Mutex` for the map**: it is only held for map edits, never
//!   across an await point
//! - **Failed initialization removes the key**: nothing half-built stays cached

use crate::error::{ScopeError, ScopeResult};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tracing::debug;

type Slot = Arc<dyn Any + Send + Sync>;

/// Keyed store of resource handles.
///
/// Clones share the same entries. Each request must get its own instance via
/// [`ResourceCache::new`]; a clone is the same scope, not a new one.
#[derive(Clone)]
pub struct ResourceCache {
    id: Arc<str>,
    entries: Arc<Mutex<HashMap<String, Slot>>>,
}

impl ResourceCache {
    /// Create an empty scope.
    pub fn new() -> Self {
        Self {
            id: Arc::from(format!("scope_{}", uuid::Uuid::new_v4().simple())),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Identifier used in log fields.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn downcast<T>(key: &str, slot: Slot) -> ScopeResult<Arc<OnceCell<T>>>
    where
        T: Send + Sync + 'static,
    {
        slot.downcast::<OnceCell<T>>()
            .map_err(|_| ScopeError::resource_type_mismatch(key, std::any::type_name::<T>()))
    }

    /// Get the resource cached under `key`, if one is fully initialized.
    pub fn get<T>(&self, key: &str) -> ScopeResult<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let slot = self.entries().get(key).cloned();
        match slot {
            Some(slot) => Ok(Self::downcast::<T>(key, slot)?.get().cloned()),
            None => Ok(None),
        }
    }

    /// Check whether `key` is present, including a resource still being created.
    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    /// Cache `value` under `key`, replacing whatever was there.
    pub fn insert<T>(&self, key: &str, value: T)
    where
        T: Send + Sync + 'static,
    {
        let cell: Slot = Arc::new(OnceCell::new_with(Some(value)));
        self.entries().insert(key.to_string(), cell);
    }

    /// Return the resource under `key`, creating it with `init` on first use.
    ///
    /// Concurrent callers on the same key wait for the first initializer. If
    /// `init` fails the error is returned and the key is left vacant.
    pub async fn get_or_try_init<T, F, Fut>(&self, key: &str, init: F) -> ScopeResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ScopeResult<T>>,
    {
        let cell = {
            let mut entries = self.entries();
            let slot = entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::<T>::new()) as Slot)
                .clone();
            Self::downcast::<T>(key, slot)?
        }; // Lock released here

        if let Some(value) = cell.get() {
            debug!(scope = %self.id, key = %key, "Resource cache hit");
            return Ok(value.clone());
        }

        match cell.get_or_try_init(init).await {
            Ok(value) => Ok(value.clone()),
            Err(e) => {
                self.evict_vacant(key, &cell);
                Err(e)
            }
        }
    }

    /// Drop `key` if it still maps to this uninitialized cell.
    fn evict_vacant<T>(&self, key: &str, cell: &Arc<OnceCell<T>>)
    where
        T: Send + Sync + 'static,
    {
        let mut entries = self.entries();
        let same_cell = entries
            .get(key)
            .is_some_and(|slot| Arc::as_ptr(slot) as *const () == Arc::as_ptr(cell) as *const ());
        if same_cell && !cell.initialized() {
            entries.remove(key);
        }
    }

    /// Remove and return the resource under `key`.
    ///
    /// A type mismatch leaves the entry in place.
    pub fn remove<T>(&self, key: &str) -> ScopeResult<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut entries = self.entries();
        let Some(slot) = entries.remove(key) else {
            return Ok(None);
        };
        match Self::downcast::<T>(key, slot.clone()) {
            Ok(cell) => Ok(cell.get().cloned()),
            Err(e) => {
                entries.insert(key.to_string(), slot);
                Err(e)
            }
        }
    }

    /// Remove `key` regardless of the resource type. Returns whether it existed.
    pub fn discard(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    /// Keys currently present, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("id", &self.id)
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_get_or_try_init_memoizes() {
        let cache = ResourceCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_try_init("db_connection", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ScopeError>(7_u32)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_init_leaves_key_vacant() {
        let cache = ResourceCache::new();
        let result = cache
            .get_or_try_init::<u32, _, _>("db_connection", || async {
                Err(ScopeError::connection_acquisition("refused"))
            })
            .await;

        assert!(matches!(result, Err(ScopeError::ConnectionAcquisition { .. })));
        assert!(!cache.contains("db_connection"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_init_is_single_flight() {
        let cache = ResourceCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let init = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok::<_, ScopeError>(String::from("pool"))
        };

        let (a, b) = tokio::join!(
            cache.get_or_try_init("db_pool", || init(calls.clone())),
            cache.get_or_try_init("db_pool", || init(calls.clone())),
        );
        assert_eq!(a.unwrap(), "pool");
        assert_eq!(b.unwrap(), "pool");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let cache = ResourceCache::new();
        cache.insert("db_session", 1_u64);
        let err = cache.get::<String>("db_session").unwrap_err();
        assert!(matches!(err, ScopeError::ResourceTypeMismatch { .. }));

        // Mismatched remove keeps the entry.
        assert!(cache.remove::<String>("db_session").is_err());
        assert_eq!(cache.get::<u64>("db_session").unwrap(), Some(1));
    }

    #[test]
    fn test_remove_returns_value_once() {
        let cache = ResourceCache::new();
        cache.insert("db_pool", String::from("p"));
        assert_eq!(cache.remove::<String>("db_pool").unwrap(), Some("p".into()));
        assert_eq!(cache.remove::<String>("db_pool").unwrap(), None);
    }

    #[test]
    fn test_separate_scopes_are_isolated() {
        let first = ResourceCache::new();
        let second = ResourceCache::new();
        first.insert("db_connection", 1_i32);
        assert!(!second.contains("db_connection"));
        assert_ne!(first.id(), second.id());

        // A clone is the same scope.
        let alias = first.clone();
        assert!(alias.contains("db_connection"));
    }
}
