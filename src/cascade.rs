//! Invalidation cascade.
//!
//! When a real answer is written for question `Q`, records of questions that
//! depend on `Q` may lose their justification. The cascade walks the
//! dependency graph with an explicit worklist:
//!
//! ```text
//! (Q, Changed) ──▶ dependents of Q holding a record
//!                     ├─ real answer, now hidden    ─▶ delete, push (D, Removed)
//!                     └─ otherwise                  ─▶ keep
//! (D, Removed) ──▶ every dependent of D holding a record ─▶ delete, push
//! ```
//!
//! A skip record whose question became visible again is kept: it still
//! holds the frontier, and traversal does not revisit processed positions.
//!
//! A removed record leaves nothing for its dependents' rules to examine, so
//! they are deleted whatever their own rules now say. Rule sources always
//! sit at lower positions, so the walk terminates without a visited set.
//!
//! The cascade mutates a working copy of the session; the caller commits it
//! together with the triggering write.

use std::collections::VecDeque;

use crate::types::{Form, QuestionId, ResponseSession};
use crate::visibility::should_show;

/// Why a question is on the worklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Its answer was (re)written.
    Changed,
    /// Its record was deleted.
    Removed,
}

/// Records deleted by one cascade run, in deletion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CascadeOutcome {
    /// Invalidated questions.
    pub invalidated: Vec<QuestionId>,
}

impl CascadeOutcome {
    /// Whether anything was deleted.
    pub fn is_empty(&self) -> bool {
        self.invalidated.is_empty()
    }
}

/// Run the cascade triggered by a write to `changed`.
pub fn invalidate(form: &Form, session: &mut ResponseSession, changed: QuestionId) -> CascadeOutcome {
    let mut outcome = CascadeOutcome::default();
    let mut worklist: VecDeque<(QuestionId, Trigger)> = VecDeque::new();
    worklist.push_back((changed, Trigger::Changed));

    while let Some((trigger, kind)) = worklist.pop_front() {
        for dependent_id in form.dependents_of(&trigger) {
            let Some(record) = session.answers.get(dependent_id) else {
                continue;
            };
            let Some(dependent) = form.question(dependent_id) else {
                continue;
            };

            let stale = match kind {
                Trigger::Removed => true,
                Trigger::Changed => record.is_answered() && !should_show(dependent, &session.answers),
            };
            if !stale {
                continue;
            }

            tracing::debug!(
                session_id = %session.id,
                trigger = %trigger,
                question_id = %dependent_id,
                was_skipped = record.skipped,
                "invalidating dependent answer"
            );
            session.answers.remove(dependent_id);
            outcome.invalidated.push(*dependent_id);
            worklist.push_back((*dependent_id, Trigger::Removed));
        }
    }

    outcome
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
    use proptest::prelude::*;
    use uuid::Uuid;

    fn qid(n: u128) -> QuestionId {
        QuestionId::new(Uuid::from_u128(n))
    }

    fn form_id() -> FormId {
        FormId::new(Uuid::from_u128(100))
    }

    fn q(n: u128) -> Question {
        Question::new(qid(n), form_id(), n as u32, format!("Q{n}"), QuestionType::ShortText)
    }

    fn when(n: u128, condition: Condition) -> RuleSet {
        RuleSet::all(vec![Rule::new(qid(n), condition)])
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
    fn test_hidden_dependent_is_removed() {
        let form = Form::new(
            form_id(),
            "",
            vec![q(1), q(2).shown_when(when(1, Condition::Equals("Yes".into()))), q(3)],
        )
        .unwrap();
        let mut s = session();
        answer(&mut s, 1, "Yes");
        answer(&mut s, 2, "X");

        answer(&mut s, 1, "No");
        let outcome = invalidate(&form, &mut s, qid(1));
        assert_eq!(outcome.invalidated, vec![qid(2)]);
        assert!(s.record(&qid(2)).is_none());
        assert!(s.record(&qid(1)).is_some());
    }

    #[test]
    fn test_still_visible_dependent_is_kept() {
        let form = Form::new(
            form_id(),
            "",
            vec![q(1), q(2).shown_when(when(1, Condition::StartsWith("Y".into())))],
        )
        .unwrap();
        let mut s = session();
        answer(&mut s, 1, "Yes");
        answer(&mut s, 2, "X");

        answer(&mut s, 1, "Yep");
        assert!(invalidate(&form, &mut s, qid(1)).is_empty());
        assert!(s.record(&qid(2)).is_some());
    }

    #[test]
    fn test_removal_propagates_regardless_of_own_rules() {
        // Q3 would still be visible via Q1 == "No", but it examines Q2 too.
        let form = Form::new(
            form_id(),
            "",
            vec![
                q(1),
                q(2).shown_when(when(1, Condition::Equals("Yes".into()))),
                q(3).shown_when(RuleSet::any(vec![
                    Rule::new(qid(2), Condition::Equals("X".into())),
                    Rule::new(qid(1), Condition::Equals("No".into())),
                ])),
                q(4).shown_when(when(3, Condition::IsNotEmpty)),
            ],
        )
        .unwrap();
        let mut s = session();
        answer(&mut s, 1, "Yes");
        answer(&mut s, 2, "X");
        answer(&mut s, 3, "Z");
        answer(&mut s, 4, "W");

        answer(&mut s, 1, "No");
        let outcome = invalidate(&form, &mut s, qid(1));

        // Q3 is a direct dependent of Q1 and still visible, so the Changed pass
        // keeps it; the Removed pass from Q2 then deletes it anyway.
        assert_eq!(outcome.invalidated, vec![qid(2), qid(3), qid(4)]);
        assert_eq!(s.answers.len(), 1);
    }

    #[test]
    fn test_skip_record_that_became_visible_is_kept() {
        let form = Form::new(
            form_id(),
            "",
            vec![q(1), q(2).shown_when(when(1, Condition::Equals("Yes".into()))), q(3)],
        )
        .unwrap();
        let mut s = session();
        answer(&mut s, 1, "No");
        assert_eq!(advance(&form, &mut s, Utc::now()).next, Some(qid(3)));
        assert!(s.record(&qid(2)).unwrap().skipped);

        answer(&mut s, 1, "Yes");
        assert!(invalidate(&form, &mut s, qid(1)).is_empty());
        assert!(s.record(&qid(2)).unwrap().skipped);

        // The skip record still holds the frontier at Q2.
        assert_eq!(advance(&form, &mut s, Utc::now()).next, Some(qid(3)));
    }

    #[test]
    fn test_answer_gated_on_skip_record_is_kept() {
        // Q3 reads Q2's skip record, which the change to Q1 leaves in place.
        let form = Form::new(
            form_id(),
            "",
            vec![
                q(1),
                q(2).shown_when(when(1, Condition::Equals("Yes".into()))),
                q(3).shown_when(when(2, Condition::NotEquals("bad".into()))),
                q(4).shown_when(when(1, Condition::IsNotEmpty)),
            ],
        )
        .unwrap();
        let mut s = session();
        answer(&mut s, 1, "No");
        assert_eq!(advance(&form, &mut s, Utc::now()).next, Some(qid(3)));
        answer(&mut s, 3, "fine");

        answer(&mut s, 1, "");
        assert!(invalidate(&form, &mut s, qid(1)).is_empty());
        assert!(s.record(&qid(2)).unwrap().skipped);
        assert!(s.record(&qid(3)).unwrap().is_answered());
    }

    #[test]
    fn test_skip_record_still_hidden_is_kept() {
        let form = Form::new(
            form_id(),
            "",
            vec![q(1), q(2).shown_when(when(1, Condition::Equals("Yes".into()))), q(3)],
        )
        .unwrap();
        let mut s = session();
        answer(&mut s, 1, "No");
        advance(&form, &mut s, Utc::now());

        answer(&mut s, 1, "Maybe");
        assert!(invalidate(&form, &mut s, qid(1)).is_empty());
        assert!(s.record(&qid(2)).unwrap().skipped);
    }

    #[test]
    fn test_question_without_dependents_is_noop() {
        let form = Form::new(form_id(), "", vec![q(1), q(2)]).unwrap();
        let mut s = session();
        answer(&mut s, 1, "a");
        answer(&mut s, 2, "b");
        assert!(invalidate(&form, &mut s, qid(1)).is_empty());
        assert_eq!(s.answers.len(), 2);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Closure property
    // ─────────────────────────────────────────────────────────────────────

    /// Per question (after the first): optional (source offset, condition kind).
    fn arb_form() -> impl Strategy<Value = Form> {
        prop::collection::vec(prop::option::of((0usize..8, 0u8..4)), 1..8).prop_map(|shapes| {
            let mut questions = vec![q(1)];
            for (i, shape) in shapes.into_iter().enumerate() {
                let n = (i + 2) as u128;
                let mut question = q(n);
                if let Some((offset, kind)) = shape {
                    let source = 1 + (offset as u128 % (n - 1));
                    let condition = match kind {
                        0 => Condition::Equals("A".into()),
                        1 => Condition::NotEquals("A".into()),
                        2 => Condition::IsEmpty,
                        _ => Condition::InList(vec!["B".into()]),
                    };
                    question = question.shown_when(when(source, condition));
                }
                questions.push(question);
            }
            Form::new(form_id(), "", questions).unwrap()
        })
    }

    proptest! {
        #[test]
        fn prop_no_hidden_question_keeps_a_real_answer(
            form in arb_form(),
            answers in prop::collection::vec(prop::bool::ANY, 8),
            edit_index in 0usize..8,
            edit_to_a in prop::bool::ANY,
        ) {
            let mut s = session();
            let mut answered = Vec::new();
            for pick_a in answers {
                let Some(next) = advance(&form, &mut s, Utc::now()).next else { break };
                let value = if pick_a { "A" } else { "B" };
                s.answers.insert(next, AnswerRecord::answered(s.id, next, AnswerValue::text(value), Utc::now()));
                invalidate(&form, &mut s, next);
                answered.push(next);
            }
            answered.retain(|id| s.record(id).map_or(false, |r| r.is_answered()));
            prop_assume!(!answered.is_empty());

            let target = answered[edit_index % answered.len()];
            let value = if edit_to_a { "A" } else { "B" };
            s.answers.insert(target, AnswerRecord::answered(s.id, target, AnswerValue::text(value), Utc::now()));
            invalidate(&form, &mut s, target);

            for question in form.questions() {
                if let Some(record) = s.record(&question.id) {
                    if record.is_answered() {
                        prop_assert!(
                            should_show(question, &s.answers),
                            "hidden question {} kept a real answer", question.position
                        );
                    }
                }
            }
        }
    }
}
