//! External collaborators consumed by the engine.
//!
//! Neither collaborator is on the authoritative path: the engine spawns them
//! after the session has been committed and never awaits their results
//! inline.
//!
//! | Collaborator | Contract | Failure handling |
//! |--------------|----------|------------------|
//! | `CompletionTrigger` | notified once per completed session | not observable by the engine |
//! | `AnswerEnricher` | may attach metadata to an answer | logged and dropped |

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::{AnswerRecord, FormId, Question, ResponseSession, SessionId};

/// Fire-and-forget notification that a session completed, used for
/// downstream analytics and report generation.
#[async_trait]
pub trait CompletionTrigger: Send + Sync {
    /// Called once, after the completed session was committed.
    async fn session_completed(&self, session_id: SessionId, form_id: FormId);
}

/// Error from an enrichment backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EnrichmentError {
    /// Backend reachable but refused or failed the request.
    #[error("Enrichment backend error: {0}")]
    Backend(String),
    /// Backend did not answer within the configured timeout.
    #[error("Enrichment timed out after {0} ms")]
    Timeout(u64),
}

/// Best-effort AI enrichment of a submitted answer.
///
/// Output is stored as `AnswerRecord::metadata` and is never consulted by
/// visibility, traversal or completion.
#[async_trait]
pub trait AnswerEnricher: Send + Sync {
    /// Produce metadata for `answer`, or `None` when there is nothing to add.
    async fn enrich(
        &self,
        session: &ResponseSession,
        question: &Question,
        answer: &AnswerRecord,
    ) -> Result<Option<serde_json::Value>, EnrichmentError>;
}

/// Completion trigger that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCompletionTrigger;

#[async_trait]
impl CompletionTrigger for NoOpCompletionTrigger {
    async fn session_completed(&self, _session_id: SessionId, _form_id: FormId) {}
}

/// Completion trigger that remembers every notification.
#[derive(Debug, Default)]
pub struct RecordingCompletionTrigger {
    completed: Mutex<Vec<SessionId>>,
}

impl RecordingCompletionTrigger {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions notified so far, in order.
    pub fn completed(&self) -> Vec<SessionId> {
        self.completed.lock().clone()
    }

    /// Number of notifications for `session_id`.
    pub fn count_for(&self, session_id: &SessionId) -> usize {
        self.completed.lock().iter().filter(|id| *id == session_id).count()
    }
}

#[async_trait]
impl CompletionTrigger for RecordingCompletionTrigger {
    async fn session_completed(&self, session_id: SessionId, _form_id: FormId) {
        self.completed.lock().push(session_id);
    }
}

/// Enricher that never adds metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEnricher;

#[async_trait]
impl AnswerEnricher for NoOpEnricher {
    async fn enrich(
        &self,
        _session: &ResponseSession,
        _question: &Question,
        _answer: &AnswerRecord,
    ) -> Result<Option<serde_json::Value>, EnrichmentError> {
        Ok(None)
    }
}
