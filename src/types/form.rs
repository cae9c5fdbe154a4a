//! Validated forms and their dependency index.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::question::{FormId, Question, QuestionId};
use super::rule::RuleError;
use crate::canonical::canonical_hash_hex;

/// Error raised when a form violates its construction invariants.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormError {
    /// Form has no questions.
    #[error("Form {0} has no questions")]
    Empty(FormId),
    /// Two questions share a position.
    #[error("Duplicate position {position} in form {form_id}")]
    DuplicatePosition {
        /// Form.
        form_id: FormId,
        /// Repeated position.
        position: u32,
    },
    /// Two questions share an id.
    #[error("Duplicate question id {0}")]
    DuplicateQuestion(QuestionId),
    /// Question claims a different form.
    #[error("Question {question_id} belongs to form {actual}, not {expected}")]
    ForeignQuestion {
        /// Question.
        question_id: QuestionId,
        /// Form being built.
        expected: FormId,
        /// Form the question claims.
        actual: FormId,
    },
    /// Rule references a question not in the form.
    #[error("Question {question_id} has a rule on unknown question {source_id}")]
    UnknownSource {
        /// Owning question.
        question_id: QuestionId,
        /// Referenced question.
        source_id: QuestionId,
    },
    /// Rule references a question at the same or a later position.
    #[error(
        "Question {question_id} (position {position}) has a rule on {source_id} \
         (position {source_position}); sources must come strictly earlier"
    )]
    SourceNotEarlier {
        /// Owning question.
        question_id: QuestionId,
        /// Owning question's position.
        position: u32,
        /// Referenced question.
        source_id: QuestionId,
        /// Referenced question's position.
        source_position: u32,
    },
    /// Choice question without options.
    #[error("Choice question {0} has no options")]
    MissingOptions(QuestionId),
    /// Rule payload failed validation.
    #[error("Invalid rule on question {question_id}: {source}")]
    InvalidRule {
        /// Owning question.
        question_id: QuestionId,
        /// Underlying rule error.
        #[source]
        source: RuleError,
    },
}

/// Serialized shape of a form. Deserialization goes through [`Form::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormDefinition {
    /// Form identifier.
    pub id: FormId,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Questions in any order.
    pub questions: Vec<Question>,
}

/// An ordered question set with a precomputed dependency index.
///
/// ## Invariants
///
/// - Questions are sorted by strictly increasing `position`.
/// - Every rule's source exists and sits at a lower position, so the
///   dependency graph is acyclic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FormDefinition", into = "FormDefinition")]
pub struct Form {
    id: FormId,
    title: String,
    questions: Vec<Question>,
    index: BTreeMap<QuestionId, usize>,
    /// Source -> questions whose rules reference it.
    dependents: BTreeMap<QuestionId, BTreeSet<QuestionId>>,
    fingerprint: String,
}

impl Form {
    /// Build and validate a form.
    pub fn new(id: FormId, title: impl Into<String>, mut questions: Vec<Question>) -> Result<Self, FormError> {
        if questions.is_empty() {
            return Err(FormError::Empty(id));
        }
        questions.sort_by_key(|q| q.position);

        let mut index = BTreeMap::new();
        for (i, q) in questions.iter().enumerate() {
            if q.form_id != id {
                return Err(FormError::ForeignQuestion {
                    question_id: q.id,
                    expected: id,
                    actual: q.form_id,
                });
            }
            if i > 0 && questions[i - 1].position == q.position {
                return Err(FormError::DuplicatePosition { form_id: id, position: q.position });
            }
            if index.insert(q.id, i).is_some() {
                return Err(FormError::DuplicateQuestion(q.id));
            }
            if q.question_type.has_options() && q.options.is_empty() {
                return Err(FormError::MissingOptions(q.id));
            }
        }

        let mut dependents: BTreeMap<QuestionId, BTreeSet<QuestionId>> = BTreeMap::new();
        for q in &questions {
            for rule in &q.rules.items {
                rule.condition.validate().map_err(|source| FormError::InvalidRule {
                    question_id: q.id,
                    source,
                })?;
                let source = index
                    .get(&rule.source)
                    .map(|&i| &questions[i])
                    .ok_or(FormError::UnknownSource { question_id: q.id, source_id: rule.source })?;
                if source.position >= q.position {
                    return Err(FormError::SourceNotEarlier {
                        question_id: q.id,
                        position: q.position,
                        source_id: source.id,
                        source_position: source.position,
                    });
                }
                dependents.entry(rule.source).or_default().insert(q.id);
            }
        }

        let title = title.into();
        let fingerprint = canonical_hash_hex(&(id, &title, &questions));

        Ok(Self { id, title, questions, index, dependents, fingerprint })
    }

    /// Form identifier.
    pub fn id(&self) -> FormId {
        self.id
    }

    /// Display title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Questions in ascending position order.
    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    /// Number of questions.
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    /// Always false for a constructed form; provided for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// Look up a question by id.
    pub fn question(&self, id: &QuestionId) -> Option<&Question> {
        self.index.get(id).map(|&i| &self.questions[i])
    }

    /// Questions with `position > after`, ascending. `None` yields all.
    pub fn questions_after(&self, after: Option<u32>) -> impl Iterator<Item = &Question> {
        let start = match after {
            Some(p) => self.questions.partition_point(|q| q.position <= p),
            None => 0,
        };
        self.questions[start..].iter()
    }

    /// Questions whose rules reference `source` directly (sorted by id).
    pub fn dependents_of(&self, source: &QuestionId) -> impl Iterator<Item = &QuestionId> {
        self.dependents.get(source).into_iter().flatten()
    }

    /// xxh64 fingerprint of the canonical question set.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl TryFrom<FormDefinition> for Form {
    type Error = FormError;

    fn try_from(def: FormDefinition) -> Result<Self, Self::Error> {
        Self::new(def.id, def.title, def.questions)
    }
}

impl From<Form> for FormDefinition {
    fn from(form: Form) -> Self {
        Self { id: form.id, title: form.title, questions: form.questions }
    }
}
