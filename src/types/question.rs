//! Question types for the flow kernel.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::rule::Rule;

uuid_id! {
    /// Unique identifier for a question.
    QuestionId
}

uuid_id! {
    /// Unique identifier for a form.
    FormId
}

/// Answer type of a question. Selects the `QuestionTypeHandler` used to
/// validate and normalize raw submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    /// Single-line free text.
    ShortText,
    /// Multi-line free text.
    LongText,
    /// "Yes" / "No".
    YesNo,
    /// Numeric answer.
    Number,
    /// Email address.
    Email,
    /// Exactly one of `options`.
    SingleChoice,
    /// Any subset of `options`.
    MultipleChoice,
}

impl QuestionType {
    /// Parse question type from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "short_text" | "text" => Some(Self::ShortText),
            "long_text" => Some(Self::LongText),
            "yes_no" => Some(Self::YesNo),
            "number" => Some(Self::Number),
            "email" => Some(Self::Email),
            "single_choice" => Some(Self::SingleChoice),
            "multiple_choice" => Some(Self::MultipleChoice),
            _ => None,
        }
    }

    /// Whether this type draws its answers from `Question::options`.
    pub fn has_options(&self) -> bool {
        matches!(self, Self::SingleChoice | Self::MultipleChoice)
    }
}

impl Default for QuestionType {
    fn default() -> Self {
        Self::ShortText
    }
}

impl fmt::Display for QuestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortText => write!(f, "short_text"),
            Self::LongText => write!(f, "long_text"),
            Self::YesNo => write!(f, "yes_no"),
            Self::Number => write!(f, "number"),
            Self::Email => write!(f, "email"),
            Self::SingleChoice => write!(f, "single_choice"),
            Self::MultipleChoice => write!(f, "multiple_choice"),
        }
    }
}

/// How the rules of a question combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combinator {
    /// Every rule must hold.
    And,
    /// At least one rule must hold.
    Or,
}

impl Default for Combinator {
    fn default() -> Self {
        Self::And
    }
}

/// A question's show-conditions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    /// AND / OR.
    #[serde(default)]
    pub combinator: Combinator,
    /// Individual rules.
    #[serde(default)]
    pub items: Vec<Rule>,
}

impl RuleSet {
    /// Rule set combining `items` with AND.
    pub fn all(items: Vec<Rule>) -> Self {
        Self { combinator: Combinator::And, items }
    }

    /// Rule set combining `items` with OR.
    pub fn any(items: Vec<Rule>) -> Self {
        Self { combinator: Combinator::Or, items }
    }

    /// Check whether no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Source questions referenced by this rule set.
    pub fn sources(&self) -> impl Iterator<Item = QuestionId> + '_ {
        self.items.iter().map(|r| r.source)
    }
}

/// A question in a form.
///
/// `position` is unique within the form and defines traversal order. Rules
/// may only reference questions at a strictly lower position; `Form::new`
/// enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Unique question identifier.
    pub id: QuestionId,
    /// Owning form.
    pub form_id: FormId,
    /// Ordering key within the form.
    pub position: u32,
    /// Prompt shown to the respondent.
    #[serde(default)]
    pub title: String,
    /// Answer type.
    #[serde(default)]
    pub question_type: QuestionType,
    /// Allowed values for choice types.
    #[serde(default)]
    pub options: Vec<String>,
    /// Whether a visible instance must be answered before completion.
    #[serde(default)]
    pub required: bool,
    /// Whether `rules` are consulted at all.
    #[serde(default)]
    pub conditional_enabled: bool,
    /// Show-conditions.
    #[serde(default)]
    pub rules: RuleSet,
}

impl Question {
    /// Create an unconditional, optional question.
    pub fn new(
        id: QuestionId,
        form_id: FormId,
        position: u32,
        title: impl Into<String>,
        question_type: QuestionType,
    ) -> Self {
        Self {
            id,
            form_id,
            position,
            title: title.into(),
            question_type,
            options: Vec::new(),
            required: false,
            conditional_enabled: false,
            rules: RuleSet::default(),
        }
    }

    /// Mark the question as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the choice options.
    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Attach show-conditions and enable conditional logic.
    pub fn shown_when(mut self, rules: RuleSet) -> Self {
        self.conditional_enabled = true;
        self.rules = rules;
        self
    }

    /// Whether visibility depends on other answers.
    pub fn is_conditional(&self) -> bool {
        self.conditional_enabled && !self.rules.is_empty()
    }
}
