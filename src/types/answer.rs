//! Answer values and records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::question::QuestionId;
use super::session::SessionId;

/// Answers of one session keyed by question.
///
/// BTreeMap keeps iteration deterministic.
pub type AnswerMap = BTreeMap<QuestionId, AnswerRecord>;

/// Normalized answer value produced by a `QuestionTypeHandler`.
///
/// Serialized untagged: `null`, a number, a string or an array of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    /// No value (skip records, cleared answers).
    Empty,
    /// Numeric answer.
    Number(f64),
    /// Free text or a single choice.
    Text(String),
    /// Multiple choices, in submission order.
    Choices(Vec<String>),
}

impl AnswerValue {
    /// Shorthand for a text value.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Render as the string the string operators compare against.
    ///
    /// Numbers use their shortest decimal form, choices are joined by `", "`.
    pub fn as_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
            Self::Choices(items) => items.join(", "),
        }
    }

    /// Coerce to a float. Non-numeric text and choice lists yield `None`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse::<f64>().ok(),
            Self::Empty | Self::Choices(_) => None,
        }
    }

    /// Individual values for set membership tests.
    pub fn members(&self) -> Vec<String> {
        match self {
            Self::Empty => Vec::new(),
            Self::Choices(items) => items.clone(),
            other => vec![other.as_text()],
        }
    }

    /// Whether the value counts as blank.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Number(_) => false,
            Self::Text(s) => s.trim().is_empty(),
            Self::Choices(items) => items.iter().all(|s| s.trim().is_empty()),
        }
    }
}

impl Default for AnswerValue {
    fn default() -> Self {
        Self::Empty
    }
}

/// One answer (or synthetic skip) for a question within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    /// Owning session.
    pub session_id: SessionId,
    /// Answered question.
    pub question_id: QuestionId,
    /// Normalized value; `Empty` for skip records.
    pub value: AnswerValue,
    /// True when the traversal skipped the question as not visible.
    pub skipped: bool,
    /// When the record was written.
    pub answered_at: DateTime<Utc>,
    /// Enrichment output, if any. Never consulted by the flow logic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AnswerRecord {
    /// A real answer.
    pub fn answered(
        session_id: SessionId,
        question_id: QuestionId,
        value: AnswerValue,
        answered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            question_id,
            value,
            skipped: false,
            answered_at,
            metadata: None,
        }
    }

    /// A synthetic skip record.
    pub fn skip(session_id: SessionId, question_id: QuestionId, at: DateTime<Utc>) -> Self {
        Self {
            session_id,
            question_id,
            value: AnswerValue::Empty,
            skipped: true,
            answered_at: at,
            metadata: None,
        }
    }

    /// Whether this is a real (non-skip) answer.
    pub fn is_answered(&self) -> bool {
        !self.skipped
    }
}
