//! Completion checking.
//!
//! A session may complete when traversal has nothing left to offer and every
//! visible required question holds a real answer. A visible question with no
//! record at all behind the frontier does not block: invalidation removed its
//! answer and traversal never returns below the frontier, so it can no longer
//! be asked.

use crate::traversal::{frontier, peek};
use crate::types::{Form, QuestionId, ResponseSession};
use crate::visibility::should_show;

/// Outcome of a completion check.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompletionCheck {
    /// Whether the session may transition to `completed`.
    pub can_complete: bool,
    /// Question traversal would still present, if any.
    pub pending: Option<QuestionId>,
    /// Visible required questions holding only a skip record.
    pub unanswered_required: Vec<QuestionId>,
    /// Visible required questions left behind the frontier without a record.
    pub unreachable_required: Vec<QuestionId>,
}

/// Full completion check with diagnostics.
pub fn check(form: &Form, session: &ResponseSession) -> CompletionCheck {
    let pending = peek(form, session);
    let front = frontier(form, session);

    let mut unanswered_required = Vec::new();
    let mut unreachable_required = Vec::new();
    for question in form.questions().iter().filter(|q| q.required) {
        if !should_show(question, &session.answers) {
            continue;
        }
        match session.record(&question.id) {
            Some(record) if record.is_answered() => {}
            Some(_) => unanswered_required.push(question.id),
            None if front.map_or(false, |f| question.position < f) => {
                unreachable_required.push(question.id)
            }
            // Beyond the frontier: traversal reports it as pending.
            None => {}
        }
    }

    CompletionCheck {
        can_complete: pending.is_none() && unanswered_required.is_empty(),
        pending,
        unanswered_required,
        unreachable_required,
    }
}

/// Whether the session may transition to `completed`.
pub fn can_complete(form: &Form, session: &ResponseSession) -> bool {
    check(form, session).can_complete
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traversal::advance;
    use crate::types::{
        AnswerRecord, AnswerValue, Condition, FormId, Question, QuestionType, Rule, RuleSet,
        SessionId,
    };
    use chrono::Utc;
    use uuid::Uuid;

    fn qid(n: u128) -> QuestionId {
        QuestionId::new(Uuid::from_u128(n))
    }

    fn form_id() -> FormId {
        FormId::new(Uuid::from_u128(100))
    }

    fn q(n: u128) -> Question {
        Question::new(qid(n), form_id(), n as u32, format!("Q{n}"), QuestionType::ShortText).required()
    }

    fn session() -> ResponseSession {
        ResponseSession::new(SessionId::generate(), form_id(), String::new(), Utc::now())
    }

    fn answer(s: &mut ResponseSession, n: u128, v: &str) {
        s.answers.insert(
            qid(n),
            AnswerRecord::answered(s.id, qid(n), AnswerValue::text(v), Utc::now()),
        );
    }

    #[test]
    fn test_pending_question_blocks() {
        let form = Form::new(form_id(), "", vec![q(1), q(2)]).unwrap();
        let mut s = session();
        answer(&mut s, 1, "a");
        let result = check(&form, &s);
        assert!(!result.can_complete);
        assert_eq!(result.pending, Some(qid(2)));
    }

    #[test]
    fn test_all_answered_completes() {
        let form = Form::new(form_id(), "", vec![q(1), q(2)]).unwrap();
        let mut s = session();
        answer(&mut s, 1, "a");
        answer(&mut s, 2, "b");
        assert!(can_complete(&form, &s));
    }

    #[test]
    fn test_hidden_required_question_does_not_block() {
        let form = Form::new(
            form_id(),
            "",
            vec![
                q(1),
                q(2).shown_when(RuleSet::all(vec![Rule::new(qid(1), Condition::Equals("Yes".into()))])),
            ],
        )
        .unwrap();
        let mut s = session();
        answer(&mut s, 1, "No");
        advance(&form, &mut s, Utc::now());
        assert!(can_complete(&form, &s));
    }

    #[test]
    fn test_visible_skip_record_blocks() {
        let form = Form::new(
            form_id(),
            "",
            vec![
                q(1),
                q(2).shown_when(RuleSet::all(vec![Rule::new(qid(1), Condition::Equals("Yes".into()))])),
            ],
        )
        .unwrap();
        let mut s = session();
        answer(&mut s, 1, "No");
        advance(&form, &mut s, Utc::now());
        // Flip without running the cascade.
        answer(&mut s, 1, "Yes");
        let result = check(&form, &s);
        assert!(!result.can_complete);
        assert_eq!(result.unanswered_required, vec![qid(2)]);
    }

    #[test]
    fn test_record_missing_behind_frontier_does_not_block() {
        let form = Form::new(form_id(), "", vec![q(1), q(2), q(3)]).unwrap();
        let mut s = session();
        answer(&mut s, 1, "a");
        answer(&mut s, 3, "c");
        let result = check(&form, &s);
        assert!(result.can_complete);
        assert_eq!(result.unreachable_required, vec![qid(2)]);
    }
}
