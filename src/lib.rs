//! # form-flow-kernel
//!
//! Conditional question flow for multi-step forms.
//!
//! Given a respondent's accumulated answers, the kernel answers one question:
//!
//! > Which question comes next, and which earlier answers are no longer valid?
//!
//! ## Core Contract
//!
//! 1. Show-conditions are typed rules over earlier answers, combined with AND/OR
//! 2. Traversal moves forward only and records a durable skip for every hidden question
//! 3. Changing an answer invalidates every dependent answer that lost its justification,
//!    transitively, in the same commit as the change
//!
//! ## Architecture
//!
//! ```text
//! submit_answer → HandlerRegistry → write → Cascade → Traversal → Completion
//!                                                  ↓
//!                                   FlowStore (Postgres or Memory)
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same form + same answers → same next question
//! - Answer maps are ordered by question id, forms by position
//! - Form fingerprints are xxh64 over canonical JSON

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod canonical;
pub mod evaluator;
pub mod visibility;
pub mod traversal;
pub mod cascade;
pub mod completion;
pub mod handlers;
pub mod collaborators;
pub mod config;
pub mod cache;
pub mod store;
pub mod engine;

#[cfg(feature = "service")]
pub mod service;

// Re-exports
pub use types::{
    AnswerMap, AnswerRecord, AnswerValue, Combinator, Condition, Form, FormError, FormId,
    Question, QuestionId, QuestionType, ResponseSession, Rule, RuleError, RuleSet, SessionId,
    SessionStatus, TransitionError,
};
pub use types::form::FormDefinition;
pub use evaluator::{evaluate, evaluate_condition};
pub use visibility::should_show;
pub use traversal::{advance, next_question, peek, TraversalOutcome};
pub use cascade::{invalidate, CascadeOutcome};
pub use completion::{can_complete, CompletionCheck};
pub use handlers::{HandlerRegistry, QuestionTypeHandler, ValidationError};
pub use collaborators::{
    AnswerEnricher, CompletionTrigger, EnrichmentError, NoOpCompletionTrigger, NoOpEnricher,
    RecordingCompletionTrigger,
};
pub use config::EngineConfig;
pub use cache::{CacheStats, FormCache};
pub use store::{FlowStore, InMemoryFlowStore, PoolStats, StoreError};
#[cfg(feature = "postgres")]
pub use store::{PostgresConfig, PostgresFlowStore, FLOW_SCHEMA_SQL};
pub use engine::{FlowEngine, FlowError, SubmitOutcome};
pub use canonical::{canonical_hash, canonical_hash_hex, to_canonical_bytes};

// Service re-exports (when service feature is enabled)
#[cfg(feature = "service")]
pub use service::{create_router, ServiceState};

/// Schema version for all flow kernel types.
/// Increment on breaking changes to any serialized type.
pub const FLOW_KERNEL_SCHEMA_VERSION: &str = "1.0.0";
