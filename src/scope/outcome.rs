//! Commit-mode outcome handling.
//!
//! The outcome handler turns the first response-start signal of a request into
//! a single transaction decision, then releases the request's connection. The
//! commit mode is resolved once into a [`StatusPolicy`] when the configuration
//! is built; requests only call the resolved decision function.

use crate::db::Backend;
use crate::error::{ScopeError, ScopeResult};
use crate::scope::{ConnectionHandle, ResourceCache};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Policy for deciding a request's transaction outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Never commit or roll back; the handler decides. Only release happens.
    #[default]
    Manual,
    /// Commit on 2xx, roll back on everything else.
    Autocommit,
    /// Commit on 2xx and 3xx, roll back on everything else.
    AutocommitIncludeRedirect,
}

impl CommitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Autocommit => "autocommit",
            Self::AutocommitIncludeRedirect => "autocommit_include_redirect",
        }
    }
}

impl std::fmt::Display for CommitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommitMode {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "autocommit" => Ok(Self::Autocommit),
            "autocommit_include_redirect" => Ok(Self::AutocommitIncludeRedirect),
            other => Err(ScopeError::configuration(format!(
                "Invalid commit mode: {other}"
            ))),
        }
    }
}

/// What happens to a request's connection at response time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Commit,
    Rollback,
    /// Release only, no transaction decision.
    Release,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Release => "release",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type DecideFn = dyn Fn(u16) -> Disposition + Send + Sync;

/// Commit mode and override sets resolved into one decision function.
#[derive(Clone)]
pub struct StatusPolicy {
    mode: CommitMode,
    decide: Arc<DecideFn>,
}

impl StatusPolicy {
    /// Resolve a commit mode and its override sets.
    ///
    /// Fails when a status code appears in both override sets.
    pub fn new(
        mode: CommitMode,
        extra_commit_statuses: &HashSet<u16>,
        extra_rollback_statuses: &HashSet<u16>,
    ) -> ScopeResult<Self> {
        let mut overlap: Vec<u16> = extra_commit_statuses
            .intersection(extra_rollback_statuses)
            .copied()
            .collect();
        if !overlap.is_empty() {
            overlap.sort_unstable();
            return Err(ScopeError::configuration(format!(
                "Extra rollback statuses and extra commit statuses must not share any status codes: {overlap:?}"
            )));
        }

        let decide: Arc<DecideFn> = match mode {
            CommitMode::Manual => Arc::new(|_| Disposition::Release),
            CommitMode::Autocommit => {
                autocommit_decider(false, extra_commit_statuses, extra_rollback_statuses)
            }
            CommitMode::AutocommitIncludeRedirect => {
                autocommit_decider(true, extra_commit_statuses, extra_rollback_statuses)
            }
        };

        Ok(Self { mode, decide })
    }

    pub fn mode(&self) -> CommitMode {
        self.mode
    }

    /// Decide the outcome for a response status.
    pub fn decide(&self, status: u16) -> Disposition {
        (self.decide)(status)
    }
}

impl std::fmt::Debug for StatusPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPolicy")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

fn autocommit_decider(
    commit_on_redirect: bool,
    extra_commit_statuses: &HashSet<u16>,
    extra_rollback_statuses: &HashSet<u16>,
) -> Arc<DecideFn> {
    let extra_commit = extra_commit_statuses.clone();
    let extra_rollback = extra_rollback_statuses.clone();
    Arc::new(move |status| {
        if extra_commit.contains(&status) {
            return Disposition::Commit;
        }
        if extra_rollback.contains(&status) {
            return Disposition::Rollback;
        }
        let success = status < 300 || (commit_on_redirect && (300..400).contains(&status));
        if success {
            Disposition::Commit
        } else {
            Disposition::Rollback
        }
    })
}

/// One outgoing response event, as seen by the outcome handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSignal {
    /// Status line and headers are ready.
    Start { status: u16 },
    /// A chunk of the body.
    Body { more_body: bool },
}

/// Applies the status policy to a request's connection and releases it.
pub struct OutcomeHandler<B: Backend> {
    backend: Arc<B>,
    policy: StatusPolicy,
    connection_key: String,
    session_key: String,
}

impl<B: Backend> Clone for OutcomeHandler<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            policy: self.policy.clone(),
            connection_key: self.connection_key.clone(),
            session_key: self.session_key.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for OutcomeHandler<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeHandler")
            .field("backend", &self.backend.name())
            .field("policy", &self.policy)
            .field("connection_key", &self.connection_key)
            .field("session_key", &self.session_key)
            .finish()
    }
}

impl<B: Backend> OutcomeHandler<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        policy: StatusPolicy,
        connection_key: impl Into<String>,
        session_key: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            policy,
            connection_key: connection_key.into(),
            session_key: session_key.into(),
        }
    }

    pub fn policy(&self) -> &StatusPolicy {
        &self.policy
    }

    /// Start observing a new request's response signals.
    pub fn observer(&self) -> ResponseObserver<B> {
        ResponseObserver {
            handler: self.clone(),
            state: ObserverState::AwaitingFirstSignal,
        }
    }

    /// Decide and dispose of the request's connection for `status`.
    ///
    /// Returns `None` when the request never acquired a connection.
    pub async fn finalize(
        &self,
        status: u16,
        scope: &ResourceCache,
    ) -> ScopeResult<Option<Disposition>> {
        let disposition = self.policy.decide(status);
        self.dispose(disposition, scope).await
    }

    /// Release the request's connection without committing.
    ///
    /// This is the unconditional teardown path for requests that never reach
    /// a response (cancelled, timed out, or panicked handlers). Any open
    /// transaction is rolled back by the release.
    pub async fn teardown(&self, scope: &ResourceCache) -> ScopeResult<bool> {
        let outcome = self.dispose(Disposition::Release, scope).await?;
        if outcome.is_some() {
            warn!(
                scope = %scope.id(),
                connection_key = %self.connection_key,
                "Released connection of an abandoned request"
            );
        }
        Ok(outcome.is_some())
    }

    async fn dispose(
        &self,
        disposition: Disposition,
        scope: &ResourceCache,
    ) -> ScopeResult<Option<Disposition>> {
        // The session wraps the connection; neither may be reused afterwards.
        scope.discard(&self.session_key);
        let Some(handle) = scope.remove::<ConnectionHandle<B::Connection>>(&self.connection_key)?
        else {
            debug!(scope = %scope.id(), "No connection acquired for request");
            return Ok(None);
        };
        let Some(mut connection) = handle.take().await else {
            return Ok(None);
        };

        let decided = match disposition {
            Disposition::Commit => self
                .backend
                .commit(&mut connection)
                .await
                .map_err(|e| as_decision_error(e, ScopeError::commit)),
            Disposition::Rollback => self
                .backend
                .rollback(&mut connection)
                .await
                .map_err(|e| as_decision_error(e, ScopeError::rollback)),
            Disposition::Release => Ok(()),
        };
        if let Err(e) = &decided {
            error!(
                scope = %scope.id(),
                connection_key = %self.connection_key,
                disposition = %disposition,
                error = %e,
                "Transaction decision failed; releasing connection anyway"
            );
        }

        let released = self
            .backend
            .release_connection(connection)
            .await
            .map_err(|e| match e {
                ScopeError::Release { .. } => e,
                other => ScopeError::release(other.to_string()),
            });

        match (decided, released) {
            (Err(primary), Err(release_err)) => {
                error!(
                    scope = %scope.id(),
                    connection_key = %self.connection_key,
                    error = %release_err,
                    "Connection release failed"
                );
                Err(primary)
            }
            (Err(primary), Ok(())) => Err(primary),
            (Ok(()), Err(release_err)) => {
                error!(
                    scope = %scope.id(),
                    connection_key = %self.connection_key,
                    error = %release_err,
                    "Connection release failed"
                );
                Err(release_err)
            }
            (Ok(()), Ok(())) => {
                info!(
                    scope = %scope.id(),
                    connection_key = %self.connection_key,
                    disposition = %disposition,
                    "Connection disposed"
                );
                Ok(Some(disposition))
            }
        }
    }
}

fn as_decision_error(err: ScopeError, wrap: fn(String) -> ScopeError) -> ScopeError {
    match err {
        ScopeError::Commit { .. } | ScopeError::Rollback { .. } => err,
        other => wrap(other.to_string()),
    }
}

/// Observer state for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    AwaitingFirstSignal,
    Decided,
}

/// Per-request observer of outgoing response signals.
///
/// Only the first [`ResponseSignal::Start`] triggers the outcome; every later
/// signal passes through untouched.
pub struct ResponseObserver<B: Backend> {
    handler: OutcomeHandler<B>,
    state: ObserverState,
}

impl<B: Backend> ResponseObserver<B> {
    pub fn state(&self) -> ObserverState {
        self.state
    }

    /// Feed one outgoing signal.
    ///
    /// Returns the disposition applied by this signal, if any.
    pub async fn on_signal(
        &mut self,
        signal: &ResponseSignal,
        scope: &ResourceCache,
    ) -> ScopeResult<Option<Disposition>> {
        let ResponseSignal::Start { status } = *signal else {
            return Ok(None);
        };
        if self.state == ObserverState::Decided {
            return Ok(None);
        }
        // Decided before acting: a failed commit must not be retried.
        self.state = ObserverState::Decided;
        self.handler.finalize(status, scope).await
    }
}

/// Teardown guard for one request scope.
///
/// If dropped while still armed (the request was cancelled before its response
/// started), the connection is released in a spawned task. The task may not
/// run if the runtime is shutting down; the pool is closed by the lifespan in
/// that case anyway.
pub struct RequestGuard<B: Backend> {
    handler: OutcomeHandler<B>,
    scope: ResourceCache,
    armed: bool,
}

impl<B: Backend> RequestGuard<B> {
    pub fn new(handler: OutcomeHandler<B>, scope: ResourceCache) -> Self {
        Self {
            handler,
            scope,
            armed: true,
        }
    }

    pub fn scope(&self) -> &ResourceCache {
        &self.scope
    }

    /// The response path took over disposition.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<B: Backend> Drop for RequestGuard<B> {
    fn drop(&mut self) {
        if !self.armed || !self.scope.contains(&self.handler.connection_key) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                scope = %self.scope.id(),
                "No runtime available to release abandoned connection"
            );
            return;
        };

        let handler = self.handler.clone();
        let scope = self.scope.clone();
        runtime.spawn(async move {
            if let Err(e) = handler.teardown(&scope).await {
                error!(scope = %scope.id(), error = %e, "Teardown of abandoned request failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(codes: &[u16]) -> HashSet<u16> {
        codes.iter().copied().collect()
    }

    fn policy(mode: CommitMode) -> StatusPolicy {
        StatusPolicy::new(mode, &HashSet::new(), &HashSet::new()).unwrap()
    }

    #[test]
    fn test_commit_mode_from_str() {
        assert_eq!("manual".parse::<CommitMode>().unwrap(), CommitMode::Manual);
        assert_eq!(
            "autocommit_include_redirect".parse::<CommitMode>().unwrap(),
            CommitMode::AutocommitIncludeRedirect
        );
        let err = "invalid".parse::<CommitMode>().unwrap_err();
        assert!(matches!(err, ScopeError::Configuration { .. }));
    }

    #[test]
    fn test_commit_mode_display_round_trips_names() {
        for mode in [
            CommitMode::Manual,
            CommitMode::Autocommit,
            CommitMode::AutocommitIncludeRedirect,
        ] {
            assert_eq!(mode.to_string().parse::<CommitMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_autocommit_defaults() {
        let p = policy(CommitMode::Autocommit);
        assert_eq!(p.decide(200), Disposition::Commit);
        assert_eq!(p.decide(204), Disposition::Commit);
        assert_eq!(p.decide(302), Disposition::Rollback);
        assert_eq!(p.decide(404), Disposition::Rollback);
        assert_eq!(p.decide(500), Disposition::Rollback);
    }

    #[test]
    fn test_autocommit_include_redirect_defaults() {
        let p = policy(CommitMode::AutocommitIncludeRedirect);
        assert_eq!(p.decide(200), Disposition::Commit);
        assert_eq!(p.decide(302), Disposition::Commit);
        assert_eq!(p.decide(304), Disposition::Commit);
        assert_eq!(p.decide(400), Disposition::Rollback);
        assert_eq!(p.decide(500), Disposition::Rollback);
    }

    #[test]
    fn test_manual_never_decides() {
        let p = policy(CommitMode::Manual);
        for status in [100, 200, 302, 404, 500, 503] {
            assert_eq!(p.decide(status), Disposition::Release);
        }
    }

    #[test]
    fn test_overrides_win() {
        let p = StatusPolicy::new(CommitMode::Autocommit, &statuses(&[500, 302]), &statuses(&[200]))
            .unwrap();
        assert_eq!(p.decide(500), Disposition::Commit);
        assert_eq!(p.decide(302), Disposition::Commit);
        assert_eq!(p.decide(200), Disposition::Rollback);
        assert_eq!(p.decide(201), Disposition::Commit);

        let p = StatusPolicy::new(
            CommitMode::AutocommitIncludeRedirect,
            &HashSet::new(),
            &statuses(&[301]),
        )
        .unwrap();
        assert_eq!(p.decide(301), Disposition::Rollback);
        assert_eq!(p.decide(302), Disposition::Commit);
    }

    #[test]
    fn test_overlapping_overrides_rejected() {
        let err = StatusPolicy::new(CommitMode::Autocommit, &statuses(&[500, 409]), &statuses(&[409, 500]))
            .unwrap_err();
        assert!(matches!(err, ScopeError::Configuration { .. }));
        assert!(err.to_string().contains("[409, 500]"));
    }
}
