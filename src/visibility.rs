//! Visibility resolution: combines a question's rules into show / hide.

use crate::evaluator::evaluate;
use crate::types::{AnswerMap, Combinator, Question};

/// Whether `question` should be shown given `answers`.
///
/// Unconditional questions (flag off or no rules) are always visible.
pub fn should_show(question: &Question, answers: &AnswerMap) -> bool {
    if !question.is_conditional() {
        return true;
    }
    let mut results = question.rules.items.iter().map(|rule| evaluate(rule, answers));
    match question.rules.combinator {
        Combinator::And => results.all(|holds| holds),
        Combinator::Or => results.any(|holds| holds),
    }
}
