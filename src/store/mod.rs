//! Flow storage backends.
//!
//! Key-value CRUD over forms and sessions. A session (status plus every
//! answer record) is saved as one unit, guarded by an optimistic version:
//! `save_session` succeeds only if the stored version still equals
//! `expected_version`, and then bumps it. This is the transaction boundary
//! of a submission.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{Form, FormId, ResponseSession, SessionId};

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Session was modified since it was loaded.
    #[error("Version conflict on session {session_id}: expected {expected}, found {actual}")]
    Conflict {
        /// Session being saved.
        session_id: SessionId,
        /// Version the caller loaded.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },
    /// Insert of a session id that already exists.
    #[error("Session already exists: {0}")]
    AlreadyExists(SessionId),
    /// Save of a session that was never inserted.
    #[error("Session not stored: {0}")]
    Missing(SessionId),
    /// Backend failure (connection, serialization, constraint).
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Create a backend error from any error type.
    pub fn backend<E: std::error::Error>(e: E) -> Self {
        Self::Backend(e.to_string())
    }

    /// Whether retrying after a reload can succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Connection pool statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Current pool size.
    pub size: u32,
    /// Number of idle connections.
    pub idle: usize,
    /// Maximum pool size.
    pub max: u32,
}

/// Trait for flow storage backends.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Fetch a form by id.
    async fn get_form(&self, id: &FormId) -> Result<Option<Form>, StoreError>;

    /// Insert or replace a form.
    async fn put_form(&self, form: &Form) -> Result<(), StoreError>;

    /// Fetch a session with all its answer records.
    async fn get_session(&self, id: &SessionId) -> Result<Option<ResponseSession>, StoreError>;

    /// Insert a new session.
    async fn insert_session(&self, session: &ResponseSession) -> Result<(), StoreError>;

    /// Atomically replace a session and its answers.
    ///
    /// Fails with `Conflict` when the stored version differs from
    /// `expected_version`. Returns the new version.
    async fn save_session(&self, session: &ResponseSession, expected_version: u64) -> Result<u64, StoreError>;

    /// Non-terminal sessions whose last update is older than `cutoff`,
    /// ordered by id.
    async fn idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionId>, StoreError>;

    /// Whether the backend is reachable.
    async fn is_healthy(&self) -> bool {
        true
    }

    /// Pool statistics, for backends that pool connections.
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }

    /// Short backend name for health reporting.
    fn backend_name(&self) -> &'static str;
}

pub use memory::InMemoryFlowStore;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresFlowStore, PostgresConfig, FLOW_SCHEMA_SQL};
