//! Answer submission pipeline and session operations.
//!
//! Every mutating operation follows the same shape:
//!
//! 1. Acquire the session's in-process lock
//! 2. Load the session and its form, then compute the change on a working copy
//! 3. Commit the working copy with one `save_session` against the loaded version
//! 4. On a version conflict, reload and recompute (bounded by `max_commit_attempts`)
//!
//! Collaborators (completion trigger, enrichment) run in spawned tasks after
//! the commit and never influence the returned outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

use crate::cache::{CacheStats, FormCache};
use crate::cascade::invalidate;
use crate::collaborators::{
    AnswerEnricher, CompletionTrigger, EnrichmentError, NoOpCompletionTrigger, NoOpEnricher,
};
use crate::completion;
use crate::config::EngineConfig;
use crate::handlers::{HandlerRegistry, ValidationError};
use crate::store::{FlowStore, StoreError};
use crate::traversal::{advance, peek};
use crate::types::{
    AnswerRecord, Form, FormError, FormId, Question, QuestionId, ResponseSession, RuleError,
    SessionId, SessionStatus, TransitionError,
};
use crate::visibility::should_show;

/// Errors surfaced by [`FlowEngine`].
///
/// Validation problems are not errors; they come back in
/// [`SubmitOutcome::errors`].
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// No form with this id.
    #[error("Form not found: {0}")]
    FormNotFound(FormId),

    /// No session with this id.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Question is not part of the session's form.
    #[error("Question {question_id} is not part of form {form_id}")]
    QuestionNotFound {
        /// Requested question.
        question_id: QuestionId,
        /// The session's form.
        form_id: FormId,
    },

    /// Session does not accept answers in its current status.
    #[error("Session {session_id} is {status} and does not accept answers")]
    SessionNotActive {
        /// Session that rejected the submission.
        session_id: SessionId,
        /// Its status.
        status: SessionStatus,
    },

    /// Status change not allowed by the session state machine.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Form violates a construction invariant.
    #[error(transparent)]
    Form(#[from] FormError),

    /// Rule could not be built.
    #[error(transparent)]
    Rule(#[from] RuleError),

    /// Persistence failure. Nothing from the failed operation is visible.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of [`FlowEngine::submit_answer`].
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SubmitOutcome {
    /// Question to present next, `None` when traversal is exhausted.
    pub next_question: Option<Question>,
    /// Whether the session is completed.
    pub completed: bool,
    /// Validation messages; non-empty means nothing was written.
    pub errors: Vec<ValidationError>,
    /// The submission targeted a hidden question or one ahead of the
    /// current question and was not written.
    pub corrected: bool,
    /// Records removed by the invalidation cascade.
    pub invalidated: Vec<QuestionId>,
}

/// What a step decided to do with its working copy.
enum Mutation<T> {
    /// Persist the working copy.
    Commit(T),
    /// Drop the working copy.
    Unchanged(T),
}

/// Output of [`FlowEngine::mutate`].
struct Applied<T> {
    value: T,
    session: ResponseSession,
    form: Arc<Form>,
}

/// Submission step output that drives the post-commit tasks.
struct Submitted {
    outcome: SubmitOutcome,
    completed_now: bool,
    enrich: Option<AnswerRecord>,
}

/// Per-session async locks.
///
/// The table itself is guarded by a short-lived `parking_lot` mutex; the
/// per-session `tokio` mutex is held across awaits. An entry lives only
/// while some task holds or awaits it.
#[derive(Debug, Default)]
struct SessionLocks {
    table: parking_lot::Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, id: SessionId) -> SessionGuard<'_> {
        let lock = Arc::clone(self.table.lock().entry(id).or_default());
        SessionGuard { guard: Some(lock.lock_owned().await), id, locks: self }
    }

    /// Remove the entry unless another task still holds a handle to it.
    /// Handles are only cloned under the table lock, so a count of one
    /// means nobody is waiting.
    fn release(&self, id: &SessionId) {
        let mut table = self.table.lock();
        if table.get(id).map_or(false, |lock| Arc::strong_count(lock) == 1) {
            table.remove(id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().len()
    }
}

/// A held session lock. Dropping it unlocks and prunes the table entry.
struct SessionGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    id: SessionId,
    locks: &'a SessionLocks,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release(&self.id);
    }
}

/// The conditional question flow engine.
pub struct FlowEngine<S: FlowStore + 'static> {
    store: Arc<S>,
    handlers: HandlerRegistry,
    trigger: Arc<dyn CompletionTrigger>,
    enricher: Arc<dyn AnswerEnricher>,
    config: EngineConfig,
    forms: FormCache,
    locks: Arc<SessionLocks>,
}

impl<S: FlowStore + 'static> FlowEngine<S> {
    /// Engine with the built-in handlers, no-op collaborators and default config.
    pub fn new(store: Arc<S>) -> Self {
        let config = EngineConfig::default();
        Self {
            store,
            handlers: HandlerRegistry::with_defaults(),
            trigger: Arc::new(NoOpCompletionTrigger),
            enricher: Arc::new(NoOpEnricher),
            forms: FormCache::new(config.form_cache_size),
            config,
            locks: Arc::new(SessionLocks::default()),
        }
    }

    /// Replace the configuration. Rebuilds the form cache.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.forms = FormCache::new(config.form_cache_size);
        self.config = config;
        self
    }

    /// Replace the handler registry.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Install a completion trigger.
    pub fn with_completion_trigger(mut self, trigger: Arc<dyn CompletionTrigger>) -> Self {
        self.trigger = trigger;
        self
    }

    /// Install an answer enricher.
    pub fn with_enricher(mut self, enricher: Arc<dyn AnswerEnricher>) -> Self {
        self.enricher = enricher;
        self
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Form cache statistics, `None` when caching is disabled.
    pub fn form_cache_stats(&self) -> Option<CacheStats> {
        self.forms.stats()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Forms
    // ─────────────────────────────────────────────────────────────────────

    /// Insert or replace a form.
    ///
    /// Sessions started against an earlier version keep running against the
    /// new one; a fingerprint mismatch is logged when they are next touched.
    pub async fn register_form(&self, form: Form) -> Result<(), FlowError> {
        self.store.put_form(&form).await?;
        self.forms.invalidate(&form.id());
        tracing::info!(
            form_id = %form.id(),
            questions = form.len(),
            fingerprint = form.fingerprint(),
            "Form registered"
        );
        Ok(())
    }

    /// Fetch a form, through the cache.
    pub async fn get_form(&self, form_id: &FormId) -> Result<Arc<Form>, FlowError> {
        if let Some(form) = self.forms.get(form_id) {
            return Ok(form);
        }
        let form = self
            .store
            .get_form(form_id)
            .await?
            .ok_or(FlowError::FormNotFound(*form_id))?;
        let form = Arc::new(form);
        self.forms.put(Arc::clone(&form));
        Ok(form)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────

    /// Start a new in-progress session for `form_id`.
    pub async fn start_session(&self, form_id: &FormId) -> Result<ResponseSession, FlowError> {
        let form = self.get_form(form_id).await?;
        let session = ResponseSession::new(
            SessionId::generate(),
            form.id(),
            form.fingerprint().to_string(),
            Utc::now(),
        );
        self.store.insert_session(&session).await?;
        tracing::info!(session_id = %session.id, form_id = %form.id(), "Session started");
        Ok(session)
    }

    /// Current snapshot of a session.
    pub async fn get_session(&self, session_id: &SessionId) -> Result<ResponseSession, FlowError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or(FlowError::SessionNotFound(*session_id))
    }

    /// Question the respondent should see now.
    ///
    /// For an in-progress session the skip records written while getting
    /// there are persisted. A paused session is only peeked at. Terminal
    /// sessions have no current question.
    pub async fn get_current_question(&self, session_id: &SessionId) -> Result<Option<Question>, FlowError> {
        let applied = self
            .mutate(*session_id, |form, session, now| match session.status {
                SessionStatus::InProgress => {
                    let step = advance(form, session, now);
                    Ok(if step.mutated() {
                        Mutation::Commit(step.next)
                    } else {
                        Mutation::Unchanged(step.next)
                    })
                }
                SessionStatus::Paused => Ok(Mutation::Unchanged(peek(form, session))),
                SessionStatus::Completed | SessionStatus::Abandoned => Ok(Mutation::Unchanged(None)),
            })
            .await?;
        Ok(applied.value.and_then(|id| applied.form.question(&id).cloned()))
    }

    /// Submit `raw` as the answer to `question_id`.
    ///
    /// Validation errors come back in the outcome and write nothing. A
    /// submission to a hidden question, or one ahead of the current question,
    /// is dropped and the outcome carries the current question with
    /// `corrected` set. Submissions to a completed session are no-ops.
    pub async fn submit_answer(
        &self,
        session_id: &SessionId,
        question_id: &QuestionId,
        raw: Value,
    ) -> Result<SubmitOutcome, FlowError> {
        let applied = self
            .mutate(*session_id, |form, session, now| {
                self.submit_step(form, session, *question_id, &raw, now)
            })
            .await?;

        let Submitted { outcome, completed_now, enrich } = applied.value;

        if completed_now {
            tracing::info!(
                session_id = %applied.session.id,
                form_id = %applied.session.form_id,
                answered = applied.session.answered_count(),
                "Session completed"
            );
            let trigger = Arc::clone(&self.trigger);
            let (sid, fid) = (applied.session.id, applied.session.form_id);
            spawn_background("completion_trigger", async move {
                trigger.session_completed(sid, fid).await;
            });
        }

        if let Some(record) = enrich {
            if self.config.enrichment_enabled {
                if let Some(question) = applied.form.question(&record.question_id).cloned() {
                    self.spawn_enrichment(applied.session, question, record);
                }
            }
        }

        Ok(outcome)
    }

    fn submit_step(
        &self,
        form: &Form,
        session: &mut ResponseSession,
        question_id: QuestionId,
        raw: &Value,
        now: DateTime<Utc>,
    ) -> Result<Mutation<Submitted>, FlowError> {
        let unchanged = |outcome: SubmitOutcome| -> Result<Mutation<Submitted>, FlowError> {
            Ok(Mutation::Unchanged(Submitted { outcome, completed_now: false, enrich: None }))
        };

        match session.status {
            SessionStatus::InProgress => {}
            SessionStatus::Completed => {
                return unchanged(SubmitOutcome { completed: true, ..Default::default() });
            }
            status @ (SessionStatus::Paused | SessionStatus::Abandoned) => {
                return Err(FlowError::SessionNotActive { session_id: session.id, status });
            }
        }

        let question = form
            .question(&question_id)
            .ok_or(FlowError::QuestionNotFound { question_id, form_id: form.id() })?;

        let errors = self.handlers.validate(question, raw);
        if !errors.is_empty() {
            tracing::debug!(
                session_id = %session.id,
                question_id = %question_id,
                errors = errors.len(),
                "Submission failed validation"
            );
            let next_question = peek(form, session).and_then(|id| form.question(&id).cloned());
            return unchanged(SubmitOutcome { next_question, errors, ..Default::default() });
        }

        // Where the respondent should be before this submission lands.
        let current = advance(form, session, now);
        let current_position = current.next.and_then(|id| form.question(&id)).map(|q| q.position);
        let hidden = !should_show(question, &session.answers);
        let ahead = current_position.map_or(false, |p| question.position > p);
        if hidden || ahead {
            tracing::warn!(
                session_id = %session.id,
                question_id = %question_id,
                hidden,
                ahead,
                current = ?current.next,
                "Stale submission dropped"
            );
            let outcome = SubmitOutcome {
                next_question: current.next.and_then(|id| form.question(&id).cloned()),
                corrected: true,
                ..Default::default()
            };
            let submitted = Submitted { outcome, completed_now: false, enrich: None };
            return Ok(if current.mutated() {
                Mutation::Commit(submitted)
            } else {
                Mutation::Unchanged(submitted)
            });
        }

        let value = self.handlers.process(question, raw);
        let same_value = session
            .record(&question_id)
            .map_or(false, |r| r.is_answered() && r.value == value);

        let mut invalidated = Vec::new();
        let mut enrich = None;
        if !same_value {
            let record = AnswerRecord::answered(session.id, question_id, value, now);
            if !record.value.is_blank() {
                enrich = Some(record.clone());
            }
            session.answers.insert(question_id, record);
            invalidated = invalidate(form, session, question_id).invalidated;
            if !invalidated.is_empty() {
                tracing::info!(
                    session_id = %session.id,
                    trigger = %question_id,
                    invalidated = invalidated.len(),
                    "Cascade invalidated dependent answers"
                );
            }
        }

        let step = advance(form, session, now);
        let mut completed_now = false;
        if step.next.is_none() {
            let check = completion::check(form, session);
            if check.can_complete {
                session.complete(now)?;
                completed_now = true;
                if !check.unreachable_required.is_empty() {
                    tracing::debug!(
                        session_id = %session.id,
                        unreachable_required = ?check.unreachable_required,
                        "Completed with required answers invalidated behind the frontier"
                    );
                }
            } else {
                tracing::warn!(
                    session_id = %session.id,
                    unanswered_required = ?check.unanswered_required,
                    "Traversal exhausted but session cannot complete"
                );
            }
        }

        let outcome = SubmitOutcome {
            next_question: step.next.and_then(|id| form.question(&id).cloned()),
            completed: completed_now,
            errors: Vec::new(),
            corrected: false,
            invalidated,
        };
        let changed = !same_value || current.mutated() || step.mutated() || completed_now;
        let submitted = Submitted { outcome, completed_now, enrich };
        Ok(if changed {
            Mutation::Commit(submitted)
        } else {
            Mutation::Unchanged(submitted)
        })
    }

    /// Pause a session. It can be resumed later at the same frontier.
    pub async fn abandon(&self, session_id: &SessionId, reason: &str) -> Result<(), FlowError> {
        let applied = self
            .mutate(*session_id, |_, session, now| {
                session.pause(reason, now)?;
                Ok(Mutation::Commit(()))
            })
            .await?;
        tracing::info!(session_id = %applied.session.id, reason, "Session paused");
        Ok(())
    }

    /// Resume a paused session and return its current question.
    pub async fn resume(&self, session_id: &SessionId) -> Result<Option<Question>, FlowError> {
        let applied = self
            .mutate(*session_id, |form, session, now| {
                let was_paused = session.status == SessionStatus::Paused;
                session.resume(now)?;
                let step = advance(form, session, now);
                Ok(if was_paused || step.mutated() {
                    Mutation::Commit(step.next)
                } else {
                    Mutation::Unchanged(step.next)
                })
            })
            .await?;
        tracing::info!(session_id = %applied.session.id, "Session resumed");
        Ok(applied.value.and_then(|id| applied.form.question(&id).cloned()))
    }

    /// Close a session for good, recording `reason`.
    pub async fn close(&self, session_id: &SessionId, reason: &str) -> Result<(), FlowError> {
        let applied = self
            .mutate(*session_id, |_, session, now| {
                session.close(reason, now)?;
                Ok(Mutation::Commit(()))
            })
            .await?;
        tracing::info!(session_id = %applied.session.id, reason, "Session closed");
        Ok(())
    }

    /// Close every non-terminal session idle for longer than `idle_for`.
    ///
    /// Returns the sessions that were closed. A session that became active
    /// again between the scan and its lock is left alone.
    pub async fn expire_idle_sessions(&self, idle_for: chrono::Duration) -> Result<Vec<SessionId>, FlowError> {
        let cutoff = Utc::now() - idle_for;
        let candidates = self.store.idle_sessions(cutoff).await?;
        let mut closed = Vec::new();

        for session_id in candidates {
            let result = self
                .mutate(session_id, |_, session, now| {
                    if session.status.is_terminal() || session.updated_at >= cutoff {
                        return Ok(Mutation::Unchanged(false));
                    }
                    session.close("expired", now)?;
                    Ok(Mutation::Commit(true))
                })
                .await;
            match result {
                Ok(applied) if applied.value => closed.push(session_id),
                Ok(_) | Err(FlowError::SessionNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to expire session");
                }
            }
        }

        if !closed.is_empty() {
            tracing::info!(expired = closed.len(), "Idle sessions closed");
        }
        Ok(closed)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    /// Load, apply `step` to a working copy, and commit it.
    ///
    /// `step` may run more than once: after a version conflict the session
    /// is reloaded and the step recomputed from scratch.
    async fn mutate<T, F>(&self, session_id: SessionId, mut step: F) -> Result<Applied<T>, FlowError>
    where
        F: FnMut(&Form, &mut ResponseSession, DateTime<Utc>) -> Result<Mutation<T>, FlowError>,
    {
        let _guard = self.locks.acquire(session_id).await;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut session = self.get_session(&session_id).await?;
            let form = self.get_form(&session.form_id).await?;
            if session.form_fingerprint != form.fingerprint() {
                tracing::warn!(
                    session_id = %session.id,
                    form_id = %form.id(),
                    session_fingerprint = %session.form_fingerprint,
                    form_fingerprint = form.fingerprint(),
                    "Form changed since session started"
                );
            }

            let expected = session.version;
            let now = Utc::now();
            let value = match step(form.as_ref(), &mut session, now)? {
                Mutation::Unchanged(value) => return Ok(Applied { value, session, form }),
                Mutation::Commit(value) => value,
            };

            session.updated_at = now;
            match self.store.save_session(&session, expected).await {
                Ok(version) => {
                    session.version = version;
                    return Ok(Applied { value, session, form });
                }
                Err(e) if e.is_conflict() && attempt < self.config.max_commit_attempts => {
                    tracing::debug!(
                        session_id = %session_id,
                        attempt,
                        error = %e,
                        "Version conflict, recomputing"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn spawn_enrichment(&self, session: ResponseSession, question: Question, record: AnswerRecord) {
        let enricher = Arc::clone(&self.enricher);
        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        let timeout = self.config.enrichment_timeout;

        spawn_background("enrichment", async move {
            let result = tokio::time::timeout(timeout, enricher.enrich(&session, &question, &record)).await;
            let metadata = match result {
                Ok(Ok(Some(metadata))) => metadata,
                Ok(Ok(None)) => return,
                Ok(Err(e)) => {
                    tracing::warn!(
                        session_id = %record.session_id,
                        question_id = %record.question_id,
                        error = %e,
                        "Enrichment failed"
                    );
                    return;
                }
                Err(_) => {
                    let e = EnrichmentError::Timeout(timeout.as_millis() as u64);
                    tracing::warn!(
                        session_id = %record.session_id,
                        question_id = %record.question_id,
                        error = %e,
                        "Enrichment failed"
                    );
                    return;
                }
            };

            match attach_metadata(store.as_ref(), &locks, &record, metadata).await {
                Ok(true) => tracing::debug!(
                    session_id = %record.session_id,
                    question_id = %record.question_id,
                    "Enrichment attached"
                ),
                Ok(false) => tracing::debug!(
                    session_id = %record.session_id,
                    question_id = %record.question_id,
                    "Answer changed before enrichment finished, dropped"
                ),
                Err(e) => tracing::warn!(
                    session_id = %record.session_id,
                    question_id = %record.question_id,
                    error = %e,
                    "Failed to store enrichment"
                ),
            }
        });
    }
}

/// Store `metadata` on the answer, if it still holds the enriched value.
async fn attach_metadata<S: FlowStore + ?Sized>(
    store: &S,
    locks: &SessionLocks,
    record: &AnswerRecord,
    metadata: Value,
) -> Result<bool, StoreError> {
    let _guard = locks.acquire(record.session_id).await;
    let Some(mut session) = store.get_session(&record.session_id).await? else {
        return Ok(false);
    };
    match session.answers.get_mut(&record.question_id) {
        Some(current) if current.is_answered() && current.value == record.value => {
            current.metadata = Some(metadata);
        }
        _ => return Ok(false),
    }
    let expected = session.version;
    store.save_session(&session, expected).await?;
    Ok(true)
}

fn spawn_background<F>(task: &'static str, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => tracing::warn!(task, "No tokio runtime, background task dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::RecordingCompletionTrigger;
    use crate::store::InMemoryFlowStore;
    use crate::types::{AnswerValue, Condition, QuestionType, Rule, RuleSet};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn qid(n: u128) -> QuestionId {
        QuestionId::new(Uuid::from_u128(n))
    }

    fn form_id() -> FormId {
        FormId::new(Uuid::from_u128(100))
    }

    /// Q1 yes/no, Q2 shown if Q1 == "Yes", Q3 unconditional.
    fn scenario_form() -> Form {
        Form::new(
            form_id(),
            "Scenario",
            vec![
                Question::new(qid(1), form_id(), 1, "Q1", QuestionType::YesNo),
                Question::new(qid(2), form_id(), 2, "Q2", QuestionType::ShortText).shown_when(
                    RuleSet::all(vec![Rule::new(qid(1), Condition::Equals("Yes".into()))]),
                ),
                Question::new(qid(3), form_id(), 3, "Q3", QuestionType::ShortText),
            ],
        )
        .unwrap()
    }

    async fn engine_with<S: FlowStore + 'static>(store: S, form: Form) -> FlowEngine<S> {
        let engine = FlowEngine::new(Arc::new(store)).with_config(EngineConfig::default().without_enrichment());
        engine.register_form(form).await.unwrap();
        engine
    }

    async fn engine(form: Form) -> FlowEngine<InMemoryFlowStore> {
        engine_with(InMemoryFlowStore::new(), form).await
    }

    fn next_id(outcome: &SubmitOutcome) -> Option<QuestionId> {
        outcome.next_question.as_ref().map(|q| q.id)
    }

    #[tokio::test]
    async fn test_hidden_question_is_auto_skipped() {
        let engine = engine(scenario_form()).await;
        let session = engine.start_session(&form_id()).await.unwrap();

        let outcome = engine.submit_answer(&session.id, &qid(1), json!("No")).await.unwrap();
        assert_eq!(next_id(&outcome), Some(qid(3)));

        let stored = engine.get_session(&session.id).await.unwrap();
        assert!(stored.record(&qid(2)).unwrap().skipped);
    }

    #[tokio::test]
    async fn test_changed_answer_invalidates_dependent() {
        let engine = engine(scenario_form()).await;
        let session = engine.start_session(&form_id()).await.unwrap();

        let outcome = engine.submit_answer(&session.id, &qid(1), json!("Yes")).await.unwrap();
        assert_eq!(next_id(&outcome), Some(qid(2)));
        engine.submit_answer(&session.id, &qid(2), json!("X")).await.unwrap();

        let outcome = engine.submit_answer(&session.id, &qid(1), json!("No")).await.unwrap();
        assert_eq!(outcome.invalidated, vec![qid(2)]);
        assert_eq!(next_id(&outcome), Some(qid(3)));

        let stored = engine.get_session(&session.id).await.unwrap();
        assert!(stored.record(&qid(2)).map_or(true, |r| !r.is_answered()));
    }

    #[tokio::test]
    async fn test_validation_error_writes_nothing() {
        let form = Form::new(
            form_id(),
            "",
            vec![Question::new(qid(1), form_id(), 1, "Age", QuestionType::Number).required()],
        )
        .unwrap();
        let engine = engine(form).await;
        let session = engine.start_session(&form_id()).await.unwrap();

        let outcome = engine.submit_answer(&session.id, &qid(1), json!("")).await.unwrap();
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(next_id(&outcome), Some(qid(1)));

        let outcome = engine.submit_answer(&session.id, &qid(1), json!("abc")).await.unwrap();
        assert!(!outcome.errors.is_empty());

        let stored = engine.get_session(&session.id).await.unwrap();
        assert!(stored.answers.is_empty());
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn test_repeat_submission_is_idempotent() {
        let engine = engine(scenario_form()).await;
        let session = engine.start_session(&form_id()).await.unwrap();

        let first = engine.submit_answer(&session.id, &qid(1), json!("No")).await.unwrap();
        let before = engine.get_session(&session.id).await.unwrap();
        let second = engine.submit_answer(&session.id, &qid(1), json!("no")).await.unwrap();
        let after = engine.get_session(&session.id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(before.answers, after.answers);
        assert_eq!(before.version, after.version);
    }

    #[tokio::test]
    async fn test_stale_hidden_submission_is_corrected() {
        let engine = engine(scenario_form()).await;
        let session = engine.start_session(&form_id()).await.unwrap();
        engine.submit_answer(&session.id, &qid(1), json!("No")).await.unwrap();

        let outcome = engine.submit_answer(&session.id, &qid(2), json!("X")).await.unwrap();
        assert!(outcome.corrected);
        assert_eq!(next_id(&outcome), Some(qid(3)));

        let stored = engine.get_session(&session.id).await.unwrap();
        assert!(stored.record(&qid(2)).unwrap().skipped);
    }

    #[tokio::test]
    async fn test_submission_ahead_of_current_is_corrected() {
        let engine = engine(scenario_form()).await;
        let session = engine.start_session(&form_id()).await.unwrap();

        let outcome = engine.submit_answer(&session.id, &qid(3), json!("early")).await.unwrap();
        assert!(outcome.corrected);
        assert_eq!(next_id(&outcome), Some(qid(1)));
        assert!(engine.get_session(&session.id).await.unwrap().answers.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let engine = engine(scenario_form()).await;
        let session = engine.start_session(&form_id()).await.unwrap();

        let err = engine.submit_answer(&session.id, &qid(99), json!("x")).await.unwrap_err();
        assert!(matches!(err, FlowError::QuestionNotFound { .. }));

        let err = engine.get_current_question(&SessionId::generate()).await.unwrap_err();
        assert!(matches!(err, FlowError::SessionNotFound(_)));

        let err = engine.start_session(&FormId::generate()).await.unwrap_err();
        assert!(matches!(err, FlowError::FormNotFound(_)));
    }

    #[tokio::test]
    async fn test_completion_fires_trigger_once() {
        let trigger = Arc::new(RecordingCompletionTrigger::new());
        let engine = engine(scenario_form())
            .await
            .with_completion_trigger(trigger.clone());
        let session = engine.start_session(&form_id()).await.unwrap();

        engine.submit_answer(&session.id, &qid(1), json!("No")).await.unwrap();
        let outcome = engine.submit_answer(&session.id, &qid(3), json!("done")).await.unwrap();
        assert!(outcome.completed);
        assert!(outcome.next_question.is_none());

        // Completed sessions ignore further submissions.
        let again = engine.submit_answer(&session.id, &qid(1), json!("Yes")).await.unwrap();
        assert!(again.completed);
        let stored = engine.get_session(&session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.record(&qid(1)).unwrap().value, AnswerValue::text("No"));

        for _ in 0..50 {
            if trigger.count_for(&session.id) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(trigger.count_for(&session.id), 1);
    }

    #[tokio::test]
    async fn test_pause_resume_and_inactive_submit() {
        let engine = engine(scenario_form()).await;
        let session = engine.start_session(&form_id()).await.unwrap();
        engine.submit_answer(&session.id, &qid(1), json!("Yes")).await.unwrap();

        engine.abandon(&session.id, "user_left").await.unwrap();
        let paused = engine.get_session(&session.id).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        assert_eq!(paused.status_reason.as_deref(), Some("user_left"));

        let err = engine.submit_answer(&session.id, &qid(2), json!("X")).await.unwrap_err();
        assert!(matches!(err, FlowError::SessionNotActive { status: SessionStatus::Paused, .. }));
        assert_eq!(engine.get_current_question(&session.id).await.unwrap().map(|q| q.id), Some(qid(2)));

        let resumed = engine.resume(&session.id).await.unwrap();
        assert_eq!(resumed.map(|q| q.id), Some(qid(2)));
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let engine = engine(scenario_form()).await;
        let session = engine.start_session(&form_id()).await.unwrap();
        engine.close(&session.id, "withdrawn").await.unwrap();

        let err = engine.resume(&session.id).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition(_)));
        assert!(engine.get_current_question(&session.id).await.unwrap().is_none());
        let err = engine.submit_answer(&session.id, &qid(1), json!("Yes")).await.unwrap_err();
        assert!(matches!(err, FlowError::SessionNotActive { .. }));
    }

    #[tokio::test]
    async fn test_expire_idle_sessions() {
        let store = Arc::new(InMemoryFlowStore::new());
        let engine = FlowEngine::new(Arc::clone(&store));
        engine.register_form(scenario_form()).await.unwrap();

        let idle = engine.start_session(&form_id()).await.unwrap();
        let fresh = engine.start_session(&form_id()).await.unwrap();
        let mut aged = store.get_session(&idle.id).await.unwrap().unwrap();
        aged.updated_at = Utc::now() - chrono::Duration::hours(3);
        store.save_session(&aged, aged.version).await.unwrap();

        let closed = engine.expire_idle_sessions(chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(closed, vec![idle.id]);

        let stored = engine.get_session(&idle.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Abandoned);
        assert_eq!(stored.status_reason.as_deref(), Some("expired"));
        assert_eq!(engine.get_session(&fresh.id).await.unwrap().status, SessionStatus::InProgress);
    }

    #[tokio::test]
    async fn test_skip_record_survives_when_question_becomes_visible() {
        let engine = engine(scenario_form()).await;
        let session = engine.start_session(&form_id()).await.unwrap();

        let outcome = engine.submit_answer(&session.id, &qid(1), json!("No")).await.unwrap();
        assert_eq!(next_id(&outcome), Some(qid(3)));

        let outcome = engine.submit_answer(&session.id, &qid(1), json!("Yes")).await.unwrap();
        assert!(outcome.invalidated.is_empty());
        assert_eq!(next_id(&outcome), Some(qid(3)));

        let stored = engine.get_session(&session.id).await.unwrap();
        assert!(stored.record(&qid(2)).unwrap().skipped);
    }

    #[tokio::test]
    async fn test_negated_rule_on_skipped_source_shows_question() {
        let form = Form::new(
            form_id(),
            "Negated",
            vec![
                Question::new(qid(1), form_id(), 1, "Q1", QuestionType::YesNo),
                Question::new(qid(2), form_id(), 2, "Q2", QuestionType::ShortText).shown_when(
                    RuleSet::all(vec![Rule::new(qid(1), Condition::Equals("Yes".into()))]),
                ),
                Question::new(qid(3), form_id(), 3, "Q3", QuestionType::ShortText).shown_when(
                    RuleSet::all(vec![Rule::new(qid(2), Condition::NotEquals("bad".into()))]),
                ),
                Question::new(qid(4), form_id(), 4, "Q4", QuestionType::ShortText),
            ],
        )
        .unwrap();
        let engine = engine(form).await;
        let session = engine.start_session(&form_id()).await.unwrap();

        let outcome = engine.submit_answer(&session.id, &qid(1), json!("No")).await.unwrap();
        assert_eq!(next_id(&outcome), Some(qid(3)));

        let stored = engine.get_session(&session.id).await.unwrap();
        assert!(stored.record(&qid(2)).unwrap().skipped);
        assert!(stored.record(&qid(3)).is_none());
    }

    #[tokio::test]
    async fn test_lock_table_is_pruned_after_use() {
        let engine = engine(scenario_form()).await;

        let done = engine.start_session(&form_id()).await.unwrap();
        engine.submit_answer(&done.id, &qid(1), json!("No")).await.unwrap();
        let outcome = engine.submit_answer(&done.id, &qid(3), json!("end")).await.unwrap();
        assert!(outcome.completed);
        assert_eq!(engine.locks.len(), 0);

        let closed = engine.start_session(&form_id()).await.unwrap();
        engine.abandon(&closed.id, "user_left").await.unwrap();
        engine.close(&closed.id, "withdrawn").await.unwrap();
        assert_eq!(engine.locks.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lock_table_is_pruned_after_contention() {
        let engine = Arc::new(engine(scenario_form()).await);
        let session_id = engine.start_session(&form_id()).await.unwrap().id;

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let engine = Arc::clone(&engine);
                let value = if i % 2 == 0 { "Yes" } else { "No" };
                tokio::spawn(async move { engine.submit_answer(&session_id, &qid(1), json!(value)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(engine.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_register_form_invalidates_cache() {
        let engine = engine(scenario_form()).await;
        assert_eq!(engine.get_form(&form_id()).await.unwrap().title(), "Scenario");
        assert_eq!(engine.form_cache_stats().map(|s| s.len), Some(1));

        let renamed = Form::new(form_id(), "Renamed", scenario_form().questions().to_vec()).unwrap();
        engine.register_form(renamed).await.unwrap();
        assert_eq!(engine.get_form(&form_id()).await.unwrap().title(), "Renamed");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Store failure and conflict handling
    // ─────────────────────────────────────────────────────────────────────

    /// Delegates to an in-memory store; `save_session` fails on demand.
    struct FlakyStore {
        inner: InMemoryFlowStore,
        conflicts: AtomicU32,
        broken: std::sync::atomic::AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryFlowStore::new(),
                conflicts: AtomicU32::new(0),
                broken: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl FlowStore for FlakyStore {
        async fn get_form(&self, id: &FormId) -> Result<Option<Form>, StoreError> {
            self.inner.get_form(id).await
        }
        async fn put_form(&self, form: &Form) -> Result<(), StoreError> {
            self.inner.put_form(form).await
        }
        async fn get_session(&self, id: &SessionId) -> Result<Option<ResponseSession>, StoreError> {
            self.inner.get_session(id).await
        }
        async fn insert_session(&self, session: &ResponseSession) -> Result<(), StoreError> {
            self.inner.insert_session(session).await
        }
        async fn save_session(&self, session: &ResponseSession, expected: u64) -> Result<u64, StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".into()));
            }
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Conflict { session_id: session.id, expected, actual: expected + 1 });
            }
            self.inner.save_session(session, expected).await
        }
        async fn idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionId>, StoreError> {
            self.inner.idle_sessions(cutoff).await
        }
        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_nothing_behind() {
        let engine = engine_with(FlakyStore::new(), scenario_form()).await;
        let session = engine.start_session(&form_id()).await.unwrap();
        engine.submit_answer(&session.id, &qid(1), json!("Yes")).await.unwrap();
        engine.submit_answer(&session.id, &qid(2), json!("X")).await.unwrap();
        let before = engine.get_session(&session.id).await.unwrap();

        engine.store().broken.store(true, Ordering::SeqCst);
        let err = engine.submit_answer(&session.id, &qid(1), json!("No")).await.unwrap_err();
        assert!(matches!(err, FlowError::Store(StoreError::Backend(_))));

        // Neither the new Q1 value nor the cascade on Q2 is visible.
        let after = engine.get_session(&session.id).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_conflict_is_retried() {
        let engine = engine_with(FlakyStore::new(), scenario_form()).await;
        let session = engine.start_session(&form_id()).await.unwrap();

        engine.store().conflicts.store(2, Ordering::SeqCst);
        let outcome = engine.submit_answer(&session.id, &qid(1), json!("No")).await.unwrap();
        assert_eq!(next_id(&outcome), Some(qid(3)));
        assert_eq!(engine.get_session(&session.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_conflict_gives_up_after_max_attempts() {
        let engine = engine_with(FlakyStore::new(), scenario_form()).await;
        let session = engine.start_session(&form_id()).await.unwrap();

        engine.store().conflicts.store(3, Ordering::SeqCst);
        let err = engine.submit_answer(&session.id, &qid(1), json!("No")).await.unwrap_err();
        assert!(matches!(err, FlowError::Store(StoreError::Conflict { .. })));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Enrichment
    // ─────────────────────────────────────────────────────────────────────

    struct StaticEnricher(Value);

    #[async_trait]
    impl AnswerEnricher for StaticEnricher {
        async fn enrich(
            &self,
            _session: &ResponseSession,
            _question: &Question,
            _answer: &AnswerRecord,
        ) -> Result<Option<Value>, EnrichmentError> {
            Ok(Some(self.0.clone()))
        }
    }

    struct FailingEnricher;

    #[async_trait]
    impl AnswerEnricher for FailingEnricher {
        async fn enrich(
            &self,
            _session: &ResponseSession,
            _question: &Question,
            _answer: &AnswerRecord,
        ) -> Result<Option<Value>, EnrichmentError> {
            Err(EnrichmentError::Backend("model unavailable".into()))
        }
    }

    struct SlowEnricher;

    #[async_trait]
    impl AnswerEnricher for SlowEnricher {
        async fn enrich(
            &self,
            _session: &ResponseSession,
            _question: &Question,
            _answer: &AnswerRecord,
        ) -> Result<Option<Value>, EnrichmentError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Some(json!({"late": true})))
        }
    }

    async fn enriching_engine(enricher: Arc<dyn AnswerEnricher>) -> FlowEngine<InMemoryFlowStore> {
        let config = EngineConfig { enrichment_timeout: Duration::from_millis(20), ..EngineConfig::default() };
        let engine = FlowEngine::new(Arc::new(InMemoryFlowStore::new()))
            .with_config(config)
            .with_enricher(enricher);
        engine.register_form(scenario_form()).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_enrichment_attaches_metadata() {
        let engine = enriching_engine(Arc::new(StaticEnricher(json!({"sentiment": "positive"})))).await;
        let session = engine.start_session(&form_id()).await.unwrap();
        engine.submit_answer(&session.id, &qid(1), json!("Yes")).await.unwrap();

        let mut metadata = None;
        for _ in 0..50 {
            let stored = engine.get_session(&session.id).await.unwrap();
            metadata = stored.record(&qid(1)).and_then(|r| r.metadata.clone());
            if metadata.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(metadata, Some(json!({"sentiment": "positive"})));
    }

    #[tokio::test]
    async fn test_enrichment_failure_and_timeout_are_swallowed() {
        let enrichers: Vec<Arc<dyn AnswerEnricher>> = vec![Arc::new(FailingEnricher), Arc::new(SlowEnricher)];
        for enricher in enrichers {
            let engine = enriching_engine(enricher).await;
            let session = engine.start_session(&form_id()).await.unwrap();
            let outcome = engine.submit_answer(&session.id, &qid(1), json!("No")).await.unwrap();
            assert_eq!(next_id(&outcome), Some(qid(3)));

            tokio::time::sleep(Duration::from_millis(60)).await;
            let stored = engine.get_session(&session.id).await.unwrap();
            let record = stored.record(&qid(1)).unwrap();
            assert_eq!(record.value, AnswerValue::text("No"));
            assert!(record.metadata.is_none());
        }
    }

    #[tokio::test]
    async fn test_enrichment_dropped_when_answer_changed() {
        let locks = SessionLocks::default();
        let store = InMemoryFlowStore::new();
        let form = scenario_form();
        store.put_form(&form).await.unwrap();
        let mut session = ResponseSession::new(SessionId::generate(), form_id(), String::new(), Utc::now());
        let original = AnswerRecord::answered(session.id, qid(1), AnswerValue::text("Yes"), Utc::now());
        session.answers.insert(qid(1), AnswerRecord::answered(session.id, qid(1), AnswerValue::text("No"), Utc::now()));
        store.insert_session(&session).await.unwrap();

        let attached = attach_metadata(&store, &locks, &original, json!({"x": 1})).await.unwrap();
        assert!(!attached);
        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        assert!(stored.record(&qid(1)).unwrap().metadata.is_none());
    }
}
