//! Conditional rules.
//!
//! A rule pairs a source question with a typed [`Condition`]. Operators and
//! their payloads are a single enum so that a malformed rule (a numeric
//! comparison against `"abc"`, a list operator without a list) is rejected
//! when the rule is built rather than silently evaluating to `false`.
//!
//! ## Wire format
//!
//! ```json
//! { "source": "…uuid…", "condition": { "operator": "equals", "value": "Yes" } }
//! { "source": "…uuid…", "condition": { "operator": "is_empty" } }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::question::QuestionId;

/// Error raised while building or validating a rule.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    /// Operator name is not recognised.
    #[error("Unknown rule operator: {0}")]
    UnknownOperator(String),
    /// Operator requires a value but none was supplied.
    #[error("Operator {operator} requires a value")]
    MissingValue {
        /// Operator name.
        operator: String,
    },
    /// Numeric operator with a value that is not a finite number.
    #[error("Operator {operator} requires a finite number, got {value}")]
    InvalidNumber {
        /// Operator name.
        operator: String,
        /// Offending value as supplied.
        value: String,
    },
    /// List operator with a value that is not a list of strings.
    #[error("Operator {operator} requires a list of strings")]
    InvalidList {
        /// Operator name.
        operator: String,
    },
}

/// Operator plus typed comparison value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", content = "value", rename_all = "snake_case")]
pub enum Condition {
    /// Stored text equals value (case-sensitive).
    Equals(String),
    /// Stored text differs from value.
    NotEquals(String),
    /// Stored text contains value as a substring.
    Contains(String),
    /// Stored text does not contain value.
    NotContains(String),
    /// Stored text starts with value.
    StartsWith(String),
    /// Stored text ends with value.
    EndsWith(String),
    /// Stored number > value.
    GreaterThan(f64),
    /// Stored number < value.
    LessThan(f64),
    /// Stored number >= value.
    GreaterThanOrEqual(f64),
    /// Stored number <= value.
    LessThanOrEqual(f64),
    /// Stored answer is one of the listed values.
    InList(Vec<String>),
    /// Stored answer is none of the listed values.
    NotInList(Vec<String>),
    /// Stored answer is blank or missing.
    IsEmpty,
    /// Stored answer is present and not blank.
    IsNotEmpty,
}

impl Condition {
    /// Build a condition from an operator name and an untyped value.
    ///
    /// Numeric operators accept JSON numbers or numeric strings. List
    /// operators accept an array of strings or a comma-separated string.
    pub fn parse(operator: &str, value: Option<&serde_json::Value>) -> Result<Self, RuleError> {
        let op = operator.to_lowercase();
        let text = || -> Result<String, RuleError> {
            match value {
                Some(serde_json::Value::String(s)) => Ok(s.clone()),
                Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
                Some(serde_json::Value::Bool(b)) => Ok(b.to_string()),
                _ => Err(RuleError::MissingValue { operator: op.clone() }),
            }
        };
        let number = || -> Result<f64, RuleError> {
            let parsed = match value {
                Some(serde_json::Value::Number(n)) => n.as_f64(),
                Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
                None | Some(serde_json::Value::Null) => {
                    return Err(RuleError::MissingValue { operator: op.clone() })
                }
                _ => None,
            };
            parsed.filter(|n| n.is_finite()).ok_or_else(|| RuleError::InvalidNumber {
                operator: op.clone(),
                value: value.map(|v| v.to_string()).unwrap_or_default(),
            })
        };
        let list = || -> Result<Vec<String>, RuleError> {
            match value {
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => Ok(s.clone()),
                        serde_json::Value::Number(n) => Ok(n.to_string()),
                        _ => Err(RuleError::InvalidList { operator: op.clone() }),
                    })
                    .collect(),
                Some(serde_json::Value::String(s)) => {
                    Ok(s.split(',').map(|part| part.trim().to_string()).collect())
                }
                None | Some(serde_json::Value::Null) => {
                    Err(RuleError::MissingValue { operator: op.clone() })
                }
                _ => Err(RuleError::InvalidList { operator: op.clone() }),
            }
        };

        match op.as_str() {
            "equals" => Ok(Self::Equals(text()?)),
            "not_equals" => Ok(Self::NotEquals(text()?)),
            "contains" => Ok(Self::Contains(text()?)),
            "not_contains" => Ok(Self::NotContains(text()?)),
            "starts_with" => Ok(Self::StartsWith(text()?)),
            "ends_with" => Ok(Self::EndsWith(text()?)),
            "greater_than" => Ok(Self::GreaterThan(number()?)),
            "less_than" => Ok(Self::LessThan(number()?)),
            "greater_than_or_equal" => Ok(Self::GreaterThanOrEqual(number()?)),
            "less_than_or_equal" => Ok(Self::LessThanOrEqual(number()?)),
            "in_list" => Ok(Self::InList(list()?)),
            "not_in_list" => Ok(Self::NotInList(list()?)),
            "is_empty" => Ok(Self::IsEmpty),
            "is_not_empty" => Ok(Self::IsNotEmpty),
            _ => Err(RuleError::UnknownOperator(operator.to_string())),
        }
    }

    /// Operator name as used on the wire.
    pub fn operator(&self) -> &'static str {
        match self {
            Self::Equals(_) => "equals",
            Self::NotEquals(_) => "not_equals",
            Self::Contains(_) => "contains",
            Self::NotContains(_) => "not_contains",
            Self::StartsWith(_) => "starts_with",
            Self::EndsWith(_) => "ends_with",
            Self::GreaterThan(_) => "greater_than",
            Self::LessThan(_) => "less_than",
            Self::GreaterThanOrEqual(_) => "greater_than_or_equal",
            Self::LessThanOrEqual(_) => "less_than_or_equal",
            Self::InList(_) => "in_list",
            Self::NotInList(_) => "not_in_list",
            Self::IsEmpty => "is_empty",
            Self::IsNotEmpty => "is_not_empty",
        }
    }

    /// Check payload invariants that deserialization alone cannot enforce.
    pub fn validate(&self) -> Result<(), RuleError> {
        match self {
            Self::GreaterThan(n)
            | Self::LessThan(n)
            | Self::GreaterThanOrEqual(n)
            | Self::LessThanOrEqual(n)
                if !n.is_finite() =>
            {
                Err(RuleError::InvalidNumber {
                    operator: self.operator().to_string(),
                    value: n.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals(v)
            | Self::NotEquals(v)
            | Self::Contains(v)
            | Self::NotContains(v)
            | Self::StartsWith(v)
            | Self::EndsWith(v) => write!(f, "{} {:?}", self.operator(), v),
            Self::GreaterThan(n)
            | Self::LessThan(n)
            | Self::GreaterThanOrEqual(n)
            | Self::LessThanOrEqual(n) => write!(f, "{} {}", self.operator(), n),
            Self::InList(items) | Self::NotInList(items) => {
                write!(f, "{} [{}]", self.operator(), items.join(", "))
            }
            Self::IsEmpty | Self::IsNotEmpty => write!(f, "{}", self.operator()),
        }
    }
}

/// A single show-condition: `source` answer must satisfy `condition`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Question whose answer is examined.
    pub source: QuestionId,
    /// Operator and comparison value.
    pub condition: Condition,
}

impl Rule {
    /// Create a new rule.
    pub fn new(source: QuestionId, condition: Condition) -> Self {
        Self { source, condition }
    }

    /// Build a rule from untyped storage fields.
    pub fn parse(
        source: QuestionId,
        operator: &str,
        value: Option<&serde_json::Value>,
    ) -> Result<Self, RuleError> {
        Ok(Self::new(source, Condition::parse(operator, value)?))
    }
}
