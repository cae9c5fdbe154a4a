//! In-memory flow store for tests and single-process deployments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::{Form, FormId, ResponseSession, SessionId};
use super::{FlowStore, StoreError};

/// In-memory flow store.
///
/// Uses BTreeMap for deterministic iteration order. A save swaps the whole
/// session under one write lock, so readers never see a partial cascade.
#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    forms: RwLock<BTreeMap<FormId, Form>>,
    sessions: RwLock<BTreeMap<SessionId, ResponseSession>>,
}

impl InMemoryFlowStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-loaded with forms.
    pub fn with_forms(forms: impl IntoIterator<Item = Form>) -> Self {
        let store = Self::new();
        {
            let mut map = store.forms.write();
            for form in forms {
                map.insert(form.id(), form);
            }
        }
        store
    }

    /// Number of stored forms.
    pub fn num_forms(&self) -> usize {
        self.forms.read().len()
    }

    /// Number of stored sessions.
    pub fn num_sessions(&self) -> usize {
        self.sessions.read().len()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn get_form(&self, id: &FormId) -> Result<Option<Form>, StoreError> {
        Ok(self.forms.read().get(id).cloned())
    }

    async fn put_form(&self, form: &Form) -> Result<(), StoreError> {
        self.forms.write().insert(form.id(), form.clone());
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<ResponseSession>, StoreError> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn insert_session(&self, session: &ResponseSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(session.id));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn save_session(&self, session: &ResponseSession, expected_version: u64) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write();
        let stored = sessions
            .get_mut(&session.id)
            .ok_or(StoreError::Missing(session.id))?;
        if stored.version != expected_version {
            return Err(StoreError::Conflict {
                session_id: session.id,
                expected: expected_version,
                actual: stored.version,
            });
        }
        let mut next = session.clone();
        next.version = expected_version + 1;
        *stored = next;
        Ok(expected_version + 1)
    }

    async fn idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionId>, StoreError> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| !s.status.is_terminal() && s.updated_at < cutoff)
            .map(|s| s.id)
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
