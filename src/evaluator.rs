//! Rule evaluation against a session's answers.
//!
//! A source with no record at all (never answered, or invalidated) makes
//! every operator false except `is_empty`. A skip record is a record: its
//! empty value is evaluated like any other.

use crate::types::{AnswerMap, AnswerValue, Condition, Rule};

/// Evaluate one rule against the accumulated answers.
pub fn evaluate(rule: &Rule, answers: &AnswerMap) -> bool {
    match answers.get(&rule.source) {
        None => matches!(rule.condition, Condition::IsEmpty),
        Some(record) => evaluate_condition(&rule.condition, &record.value),
    }
}

/// Evaluate a condition against a present answer value.
pub fn evaluate_condition(condition: &Condition, value: &AnswerValue) -> bool {
    match condition {
        Condition::Equals(expected) => value.as_text() == *expected,
        Condition::NotEquals(expected) => value.as_text() != *expected,
        Condition::Contains(needle) => contains(value, needle),
        Condition::NotContains(needle) => !contains(value, needle),
        Condition::StartsWith(prefix) => value.as_text().starts_with(prefix.as_str()),
        Condition::EndsWith(suffix) => value.as_text().ends_with(suffix.as_str()),
        Condition::GreaterThan(n) => compare(value, |v| v > *n),
        Condition::LessThan(n) => compare(value, |v| v < *n),
        Condition::GreaterThanOrEqual(n) => compare(value, |v| v >= *n),
        Condition::LessThanOrEqual(n) => compare(value, |v| v <= *n),
        Condition::InList(list) => in_list(value, list),
        Condition::NotInList(list) => !in_list(value, list),
        Condition::IsEmpty => value.is_blank(),
        Condition::IsNotEmpty => !value.is_blank(),
    }
}

// Multiple-choice answers test membership; everything else is a substring test.
fn contains(value: &AnswerValue, needle: &str) -> bool {
    match value {
        AnswerValue::Choices(items) => items.iter().any(|item| item == needle),
        other => other.as_text().contains(needle),
    }
}

fn compare(value: &AnswerValue, op: impl Fn(f64) -> bool) -> bool {
    value.as_number().map(op).unwrap_or(false)
}

fn in_list(value: &AnswerValue, list: &[String]) -> bool {
    value.members().iter().any(|member| list.contains(member))
}
