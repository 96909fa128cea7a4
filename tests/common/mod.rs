//! Shared helpers for integration tests.

#![allow(dead_code)]

use db_request_scope::db::Backend;
use db_request_scope::error::{ScopeError, ScopeResult};
use db_request_scope::scope::ConnectionHandle;
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Records every backend call and injects failures on demand.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<&'static str>>,
    pub fail_create_pool: AtomicBool,
    pub fail_acquire: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    pub fail_release: AtomicBool,
}

impl Recorder {
    fn record(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == event)
            .count()
    }

    pub fn fail(flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPool {
    pub id: u64,
}

#[derive(Debug)]
pub struct MockConnection {
    pub id: u64,
    pub pool_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MockSession {
    pub connection: ConnectionHandle<MockConnection>,
}

/// In-memory backend that only records what the scope machinery asks of it.
#[derive(Debug)]
pub struct MockBackend {
    pooling: bool,
    recorder: Arc<Recorder>,
    next_id: AtomicU64,
}

impl MockBackend {
    pub fn new(pooling: bool) -> (Self, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let backend = Self {
            pooling,
            recorder: Arc::clone(&recorder),
            next_id: AtomicU64::new(1),
        };
        (backend, recorder)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn check(&self, flag: &AtomicBool, err: ScopeError) -> ScopeResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(err)
        } else {
            Ok(())
        }
    }
}

impl Backend for MockBackend {
    type Pool = MockPool;
    type Connection = MockConnection;
    type Session = MockSession;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports_pooling(&self) -> bool {
        self.pooling
    }

    async fn create_pool(&self) -> ScopeResult<MockPool> {
        // Widen the window for concurrent first use.
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.recorder.record("create_pool");
        self.check(
            &self.recorder.fail_create_pool,
            ScopeError::pool_acquisition("mock pool unavailable"),
        )?;
        Ok(MockPool { id: self.next_id() })
    }

    async fn close_pool(&self, _pool: MockPool) -> ScopeResult<()> {
        self.recorder.record("close_pool");
        Ok(())
    }

    async fn acquire_connection(&self, pool: Option<&MockPool>) -> ScopeResult<MockConnection> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.recorder.record("acquire");
        self.check(
            &self.recorder.fail_acquire,
            ScopeError::internal("mock backend refused connection"),
        )?;
        Ok(MockConnection {
            id: self.next_id(),
            pool_id: pool.map(|p| p.id),
        })
    }

    async fn commit(&self, _connection: &mut MockConnection) -> ScopeResult<()> {
        self.recorder.record("commit");
        self.check(&self.recorder.fail_commit, ScopeError::commit("mock commit failed"))
    }

    async fn rollback(&self, _connection: &mut MockConnection) -> ScopeResult<()> {
        self.recorder.record("rollback");
        self.check(
            &self.recorder.fail_rollback,
            ScopeError::rollback("mock rollback failed"),
        )
    }

    async fn release_connection(&self, _connection: MockConnection) -> ScopeResult<()> {
        self.recorder.record("release");
        self.check(&self.recorder.fail_release, ScopeError::release("mock release failed"))
    }

    fn wrap_session(&self, connection: ConnectionHandle<MockConnection>) -> MockSession {
        MockSession { connection }
    }
}

/// Poll until `condition` holds or a second has passed.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
