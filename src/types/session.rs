//! Response sessions and their status machine.
//!
//! ```text
//!               abandon                close
//!   in_progress ───────▶ paused ─────────────▶ abandoned
//!       │  ▲               │
//!       │  └───── resume ──┘
//!       │
//!       ├──────── complete ───────▶ completed
//!       └──────── close ──────────▶ abandoned
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::answer::{AnswerMap, AnswerRecord};
use super::question::{FormId, QuestionId};

uuid_id! {
    /// Unique identifier for a response session.
    SessionId
}

/// Lifecycle status of a response session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepting answers.
    InProgress,
    /// All visible required questions answered. Terminal.
    Completed,
    /// Respondent left; may resume.
    Paused,
    /// Closed without completion. Terminal.
    Abandoned,
}

impl SessionStatus {
    /// Parse status from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "paused" => Some(Self::Paused),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::InProgress
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Paused => write!(f, "paused"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// A status change the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot {action} a session that is {from}")]
pub struct TransitionError {
    /// Status at the time of the attempt.
    pub from: SessionStatus,
    /// Attempted action.
    pub action: &'static str,
}

/// One respondent's pass through a form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSession {
    /// Unique session identifier.
    pub id: SessionId,
    /// Form being answered.
    pub form_id: FormId,
    /// Fingerprint of the form when the session started.
    pub form_fingerprint: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Reason given on abandon / close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// Answers and skip records, at most one per question.
    #[serde(default)]
    pub answers: AnswerMap,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Completion time, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter, bumped by every committed save.
    pub version: u64,
}

impl ResponseSession {
    /// Start a new in-progress session.
    pub fn new(id: SessionId, form_id: FormId, form_fingerprint: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            form_id,
            form_fingerprint,
            status: SessionStatus::InProgress,
            status_reason: None,
            answers: AnswerMap::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        }
    }

    /// Record for `question_id`, answered or skipped.
    pub fn record(&self, question_id: &QuestionId) -> Option<&AnswerRecord> {
        self.answers.get(question_id)
    }

    /// Number of real (non-skip) answers.
    pub fn answered_count(&self) -> usize {
        self.answers.values().filter(|r| r.is_answered()).count()
    }

    /// `in_progress → paused`. Pausing an already paused session only
    /// refreshes the reason.
    pub fn pause(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            SessionStatus::InProgress | SessionStatus::Paused => {
                self.status = SessionStatus::Paused;
                self.status_reason = Some(reason.into());
                self.updated_at = now;
                Ok(())
            }
            from => Err(TransitionError { from, action: "abandon" }),
        }
    }

    /// `paused → in_progress`. Resuming an in-progress session is a no-op.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            SessionStatus::Paused => {
                self.status = SessionStatus::InProgress;
                self.status_reason = None;
                self.updated_at = now;
                Ok(())
            }
            SessionStatus::InProgress => Ok(()),
            from => Err(TransitionError { from, action: "resume" }),
        }
    }

    /// `in_progress → completed`.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            SessionStatus::InProgress => {
                self.status = SessionStatus::Completed;
                self.completed_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
            from => Err(TransitionError { from, action: "complete" }),
        }
    }

    /// `in_progress | paused → abandoned`.
    pub fn close(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            SessionStatus::InProgress | SessionStatus::Paused => {
                self.status = SessionStatus::Abandoned;
                self.status_reason = Some(reason.into());
                self.updated_at = now;
                Ok(())
            }
            from => Err(TransitionError { from, action: "close" }),
        }
    }
}
