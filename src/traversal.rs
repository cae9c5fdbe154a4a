//! Forward traversal with durable auto-skips.
//!
//! ## Algorithm
//!
//! 1. `frontier` = highest position holding a record (answer or skip)
//! 2. Scan questions with `position > frontier` in ascending order
//! 3. Visible candidate: stop and return it
//! 4. Hidden candidate: insert a skip record and continue
//! 5. Scan exhausted: return `None`
//!
//! Skip records move the frontier, so a re-run never re-evaluates a
//! processed position. Only invalidation lowers the frontier, and only when
//! it deletes the topmost records.

use chrono::{DateTime, Utc};

use crate::types::{AnswerRecord, Form, Question, QuestionId, ResponseSession};
use crate::visibility::should_show;

/// Result of one traversal step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TraversalOutcome {
    /// Next visible question, `None` when the form is exhausted.
    pub next: Option<QuestionId>,
    /// Questions that received a skip record during this step.
    pub skipped: Vec<QuestionId>,
}

impl TraversalOutcome {
    /// Whether the step wrote skip records that need persisting.
    pub fn mutated(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Highest position among the session's records, if any.
pub fn frontier(form: &Form, session: &ResponseSession) -> Option<u32> {
    session
        .answers
        .keys()
        .filter_map(|id| form.question(id))
        .map(|q| q.position)
        .max()
}

/// Advance past hidden questions and return the next visible one.
///
/// Mutates `session.answers` by inserting skip records.
pub fn advance(form: &Form, session: &mut ResponseSession, now: DateTime<Utc>) -> TraversalOutcome {
    let start = frontier(form, session);
    let mut outcome = TraversalOutcome::default();

    for candidate in form.questions_after(start) {
        if should_show(candidate, &session.answers) {
            outcome.next = Some(candidate.id);
            break;
        }
        tracing::debug!(
            session_id = %session.id,
            question_id = %candidate.id,
            position = candidate.position,
            "auto-skipping hidden question"
        );
        session
            .answers
            .insert(candidate.id, AnswerRecord::skip(session.id, candidate.id, now));
        outcome.skipped.push(candidate.id);
    }

    outcome
}

/// Convenience wrapper around [`advance`] returning the question itself.
pub fn next_question<'f>(
    form: &'f Form,
    session: &mut ResponseSession,
    now: DateTime<Utc>,
) -> Option<&'f Question> {
    advance(form, session, now).next.and_then(|id| form.question(&id))
}

/// Next visible question without recording anything.
pub fn peek(form: &Form, session: &ResponseSession) -> Option<QuestionId> {
    let mut scratch = session.clone();
    advance(form, &mut scratch, Utc::now()).next
}
