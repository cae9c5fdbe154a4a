//! Core types for the flow kernel.

/// Declares a UUID-backed identifier newtype with deterministic ordering.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Wrap an existing UUID.
            pub fn new(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Parse from a UUID string.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> uuid::Uuid {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

pub mod question;
pub mod rule;
pub mod form;
pub mod answer;
pub mod session;

pub use question::{QuestionId, FormId, Question, QuestionType, RuleSet, Combinator};
pub use rule::{Rule, Condition, RuleError};
pub use form::{Form, FormError};
pub use answer::{AnswerValue, AnswerRecord, AnswerMap};
pub use session::{SessionId, SessionStatus, ResponseSession, TransitionError};
