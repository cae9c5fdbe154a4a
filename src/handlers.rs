//! Question type handlers: validation and normalization of raw submissions.
//!
//! Each [`QuestionType`] maps to one [`QuestionTypeHandler`]. The registry
//! applies the shared rules (blank input is valid for optional questions and
//! an error for required ones) and delegates everything else.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{AnswerValue, Question, QuestionType};

/// Maximum length of a short text answer, in characters.
pub const SHORT_TEXT_MAX_CHARS: usize = 255;
/// Maximum length of a long text answer, in characters.
pub const LONG_TEXT_MAX_CHARS: usize = 10_000;

/// A per-field validation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Field the message applies to (the question id).
    pub field: String,
    /// Human-readable message.
    pub message: String,
}

impl ValidationError {
    /// Create a message for `question`.
    pub fn new(question: &Question, message: impl Into<String>) -> Self {
        Self { field: question.id.to_string(), message: message.into() }
    }
}

/// Validates and normalizes raw answers for one question type.
pub trait QuestionTypeHandler: Send + Sync {
    /// Problems with `raw`; empty when acceptable. Never called with blank input.
    fn validate(&self, question: &Question, raw: &Value) -> Vec<ValidationError>;

    /// Normalized value. Only called after `validate` returned no errors.
    fn process(&self, question: &Question, raw: &Value) -> AnswerValue;
}

/// Whether the raw input carries no answer at all.
pub fn is_blank_input(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn scalar_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Free text with a character limit.
#[derive(Debug, Clone)]
pub struct TextHandler {
    max_chars: usize,
}

impl TextHandler {
    /// Handler accepting up to `max_chars` characters.
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl QuestionTypeHandler for TextHandler {
    fn validate(&self, question: &Question, raw: &Value) -> Vec<ValidationError> {
        match scalar_text(raw) {
            None => vec![ValidationError::new(question, "must be text")],
            Some(text) if text.chars().count() > self.max_chars => vec![ValidationError::new(
                question,
                format!("must be at most {} characters", self.max_chars),
            )],
            Some(_) => Vec::new(),
        }
    }

    fn process(&self, _question: &Question, raw: &Value) -> AnswerValue {
        scalar_text(raw).map(AnswerValue::Text).unwrap_or_default()
    }
}

/// "Yes" / "No", accepting booleans and common spellings.
#[derive(Debug, Clone, Default)]
pub struct YesNoHandler;

impl YesNoHandler {
    fn normalize(raw: &Value) -> Option<&'static str> {
        match raw {
            Value::Bool(true) => Some("Yes"),
            Value::Bool(false) => Some("No"),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "yes" | "y" | "true" => Some("Yes"),
                "no" | "n" | "false" => Some("No"),
                _ => None,
            },
            _ => None,
        }
    }
}

impl QuestionTypeHandler for YesNoHandler {
    fn validate(&self, question: &Question, raw: &Value) -> Vec<ValidationError> {
        match Self::normalize(raw) {
            Some(_) => Vec::new(),
            None => vec![ValidationError::new(question, "must be Yes or No")],
        }
    }

    fn process(&self, _question: &Question, raw: &Value) -> AnswerValue {
        Self::normalize(raw).map(AnswerValue::text).unwrap_or_default()
    }
}

/// Finite numbers, from JSON numbers or numeric strings.
#[derive(Debug, Clone, Default)]
pub struct NumberHandler;

impl NumberHandler {
    fn parse(raw: &Value) -> Option<f64> {
        let n = match raw {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        n.filter(|n| n.is_finite())
    }
}

impl QuestionTypeHandler for NumberHandler {
    fn validate(&self, question: &Question, raw: &Value) -> Vec<ValidationError> {
        match Self::parse(raw) {
            Some(_) => Vec::new(),
            None => vec![ValidationError::new(question, "must be a number")],
        }
    }

    fn process(&self, _question: &Question, raw: &Value) -> AnswerValue {
        Self::parse(raw).map(AnswerValue::Number).unwrap_or_default()
    }
}

/// Email addresses.
#[derive(Debug, Clone, Default)]
pub struct EmailHandler;

impl EmailHandler {
    fn pattern() -> Option<&'static Regex> {
        static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
        EMAIL
            .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok())
            .as_ref()
    }

    fn is_valid(s: &str) -> bool {
        match Self::pattern() {
            Some(re) => re.is_match(s),
            None => Self::has_email_shape(s),
        }
    }

    // Same shape as the pattern: local@domain.tld, no whitespace.
    fn has_email_shape(s: &str) -> bool {
        let Some((local, domain)) = s.split_once('@') else {
            return false;
        };
        !local.is_empty()
            && !s.contains(char::is_whitespace)
            && !domain.contains('@')
            && domain
                .char_indices()
                .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len())
    }
}

impl QuestionTypeHandler for EmailHandler {
    fn validate(&self, question: &Question, raw: &Value) -> Vec<ValidationError> {
        match raw.as_str().map(str::trim) {
            Some(s) if s.len() <= SHORT_TEXT_MAX_CHARS && Self::is_valid(s) => Vec::new(),
            _ => vec![ValidationError::new(question, "must be a valid email address")],
        }
    }

    fn process(&self, _question: &Question, raw: &Value) -> AnswerValue {
        raw.as_str().map(|s| AnswerValue::text(s.trim())).unwrap_or_default()
    }
}

/// Exactly one of the question's options.
#[derive(Debug, Clone, Default)]
pub struct SingleChoiceHandler;

impl QuestionTypeHandler for SingleChoiceHandler {
    fn validate(&self, question: &Question, raw: &Value) -> Vec<ValidationError> {
        match scalar_text(raw) {
            Some(choice) if question.options.contains(&choice) => Vec::new(),
            Some(choice) => vec![ValidationError::new(question, format!("{choice:?} is not an option"))],
            None => vec![ValidationError::new(question, "must be one of the options")],
        }
    }

    fn process(&self, _question: &Question, raw: &Value) -> AnswerValue {
        scalar_text(raw).map(AnswerValue::Text).unwrap_or_default()
    }
}

/// Any subset of the question's options. Duplicates are dropped.
#[derive(Debug, Clone, Default)]
pub struct MultipleChoiceHandler;

impl MultipleChoiceHandler {
    fn choices(raw: &Value) -> Option<Vec<String>> {
        match raw {
            Value::Array(items) => items.iter().map(scalar_text).collect(),
            other => scalar_text(other).map(|s| vec![s]),
        }
    }
}

impl QuestionTypeHandler for MultipleChoiceHandler {
    fn validate(&self, question: &Question, raw: &Value) -> Vec<ValidationError> {
        match Self::choices(raw) {
            None => vec![ValidationError::new(question, "must be a list of options")],
            Some(choices) => choices
                .into_iter()
                .filter(|c| !question.options.contains(c))
                .map(|c| ValidationError::new(question, format!("{c:?} is not an option")))
                .collect(),
        }
    }

    fn process(&self, _question: &Question, raw: &Value) -> AnswerValue {
        let mut seen = Vec::new();
        for choice in Self::choices(raw).unwrap_or_default() {
            if !seen.contains(&choice) {
                seen.push(choice);
            }
        }
        AnswerValue::Choices(seen)
    }
}

/// Handler lookup by question type.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<QuestionType, Arc<dyn QuestionTypeHandler>>,
}

impl HandlerRegistry {
    /// Registry with no handlers.
    pub fn empty() -> Self {
        Self { handlers: BTreeMap::new() }
    }

    /// Registry with the built-in handler for every question type.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(QuestionType::ShortText, TextHandler::new(SHORT_TEXT_MAX_CHARS));
        registry.register(QuestionType::LongText, TextHandler::new(LONG_TEXT_MAX_CHARS));
        registry.register(QuestionType::YesNo, YesNoHandler);
        registry.register(QuestionType::Number, NumberHandler);
        registry.register(QuestionType::Email, EmailHandler);
        registry.register(QuestionType::SingleChoice, SingleChoiceHandler);
        registry.register(QuestionType::MultipleChoice, MultipleChoiceHandler);
        registry
    }

    /// Install or replace the handler for `question_type`.
    pub fn register(&mut self, question_type: QuestionType, handler: impl QuestionTypeHandler + 'static) {
        self.handlers.insert(question_type, Arc::new(handler));
    }

    /// Validate `raw` for `question`, including the required-answer check.
    pub fn validate(&self, question: &Question, raw: &Value) -> Vec<ValidationError> {
        if is_blank_input(raw) {
            return if question.required {
                vec![ValidationError::new(question, "is required")]
            } else {
                Vec::new()
            };
        }
        match self.handlers.get(&question.question_type) {
            Some(handler) => handler.validate(question, raw),
            None => vec![ValidationError::new(
                question,
                format!("unsupported question type {}", question.question_type),
            )],
        }
    }

    /// Normalize `raw`. Blank input becomes `AnswerValue::Empty`.
    pub fn process(&self, question: &Question, raw: &Value) -> AnswerValue {
        if is_blank_input(raw) {
            return AnswerValue::Empty;
        }
        self.handlers
            .get(&question.question_type)
            .map(|handler| handler.process(question, raw))
            .unwrap_or_default()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
