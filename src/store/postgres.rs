//! PostgreSQL flow store for production use.
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 2)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)
//!
//! ## Atomicity
//!
//! `save_session` runs the version check, the session update and the full
//! rewrite of the session's answer rows in one transaction. A failure at any
//! point rolls the whole submission back, cascade included.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

use crate::types::{
    AnswerMap, AnswerRecord, AnswerValue, Form, FormId, Question, QuestionId, ResponseSession,
    SessionId, SessionStatus,
};
use super::{FlowStore, PoolStats, StoreError};

/// Schema for the flow tables. Applied statement by statement by
/// [`PostgresFlowStore::migrate`].
pub const FLOW_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS flow_forms (
    id           UUID PRIMARY KEY,
    title        TEXT NOT NULL,
    fingerprint  TEXT NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS flow_questions (
    id        UUID PRIMARY KEY,
    form_id   UUID NOT NULL REFERENCES flow_forms(id) ON DELETE CASCADE,
    position  INTEGER NOT NULL,
    body      JSONB NOT NULL,
    UNIQUE (form_id, position)
);
CREATE TABLE IF NOT EXISTS flow_sessions (
    id                UUID PRIMARY KEY,
    form_id           UUID NOT NULL REFERENCES flow_forms(id),
    form_fingerprint  TEXT NOT NULL,
    status            TEXT NOT NULL,
    status_reason     TEXT,
    created_at        TIMESTAMPTZ NOT NULL,
    updated_at        TIMESTAMPTZ NOT NULL,
    completed_at      TIMESTAMPTZ,
    version           BIGINT NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS flow_sessions_idle_idx ON flow_sessions (status, updated_at);
CREATE TABLE IF NOT EXISTS flow_answers (
    session_id   UUID NOT NULL REFERENCES flow_sessions(id) ON DELETE CASCADE,
    question_id  UUID NOT NULL,
    value        JSONB,
    skipped      BOOLEAN NOT NULL,
    answered_at  TIMESTAMPTZ NOT NULL,
    metadata     JSONB,
    PRIMARY KEY (session_id, question_id)
)
"#;

/// Configuration for PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum connections in pool (default: 10).
    pub max_connections: u32,
    /// Minimum idle connections to keep warm (default: 2).
    pub min_connections: u32,
    /// Connection acquire timeout in seconds (default: 10).
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds (default: 300 = 5 min).
    pub idle_timeout_secs: u64,
    /// Maximum connection lifetime in seconds (default: 1800 = 30 min).
    pub max_lifetime_secs: u64,
}

impl PostgresConfig {
    /// Load configuration from environment variables with production defaults.
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
        }
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/forms".to_string()),
            max_connections: var("DB_MAX_CONNECTIONS", 10),
            min_connections: var("DB_MIN_CONNECTIONS", 2),
            connect_timeout_secs: var("DB_CONNECT_TIMEOUT_SECS", 10),
            idle_timeout_secs: var("DB_IDLE_TIMEOUT_SECS", 300),
            max_lifetime_secs: var("DB_MAX_LIFETIME_SECS", 1800),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// PostgreSQL flow store.
pub struct PostgresFlowStore {
    pool: PgPool,
}

impl PostgresFlowStore {
    /// Create a new store with the given configuration.
    pub async fn new(config: PostgresConfig) -> Result<Self, sqlx::Error> {
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connect_timeout_secs = config.connect_timeout_secs,
            idle_timeout_secs = config.idle_timeout_secs,
            max_lifetime_secs = config.max_lifetime_secs,
            "Initializing PostgreSQL connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Create a store from environment variables.
    pub async fn from_env() -> Result<Self, sqlx::Error> {
        Self::new(PostgresConfig::from_env()).await
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply [`FLOW_SCHEMA_SQL`].
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in FLOW_SCHEMA_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Flow schema applied");
        Ok(())
    }

    fn parse_session_row(row: &PgRow, answers: AnswerMap) -> Result<ResponseSession, StoreError> {
        let status: String = row.try_get("status")?;
        let version: i64 = row.try_get("version")?;
        Ok(ResponseSession {
            id: SessionId::new(row.try_get("id")?),
            form_id: FormId::new(row.try_get("form_id")?),
            form_fingerprint: row.try_get("form_fingerprint")?,
            status: SessionStatus::from_str(&status)
                .ok_or_else(|| StoreError::Backend(format!("Unknown session status: {status}")))?,
            status_reason: row.try_get("status_reason")?,
            answers,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            version: version.max(0) as u64,
        })
    }

    fn parse_answer_row(row: &PgRow) -> Result<AnswerRecord, StoreError> {
        let value: Option<serde_json::Value> = row.try_get("value")?;
        let value = match value {
            Some(v) => serde_json::from_value::<AnswerValue>(v).map_err(StoreError::backend)?,
            None => AnswerValue::Empty,
        };
        Ok(AnswerRecord {
            session_id: SessionId::new(row.try_get("session_id")?),
            question_id: QuestionId::new(row.try_get("question_id")?),
            value,
            skipped: row.try_get("skipped")?,
            answered_at: row.try_get("answered_at")?,
            metadata: row.try_get("metadata")?,
        })
    }

    async fn write_answers(
        tx: &mut Transaction<'_, Postgres>,
        session: &ResponseSession,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM flow_answers WHERE session_id = $1")
            .bind(session.id.as_uuid())
            .execute(&mut **tx)
            .await?;

        for record in session.answers.values() {
            let value = serde_json::to_value(&record.value).map_err(StoreError::backend)?;
            sqlx::query(
                r#"
                INSERT INTO flow_answers (session_id, question_id, value, skipped, answered_at, metadata)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(session.id.as_uuid())
            .bind(record.question_id.as_uuid())
            .bind(value)
            .bind(record.skipped)
            .bind(record.answered_at)
            .bind(&record.metadata)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FlowStore for PostgresFlowStore {
    async fn get_form(&self, id: &FormId) -> Result<Option<Form>, StoreError> {
        let Some(form_row) = sqlx::query("SELECT id, title FROM flow_forms WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let title: String = form_row.try_get("title")?;

        let rows = sqlx::query(
            r#"
            SELECT body
            FROM flow_questions
            WHERE form_id = $1
            ORDER BY position
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let questions = rows
            .iter()
            .map(|row| {
                let body: serde_json::Value = row.try_get("body")?;
                serde_json::from_value::<Question>(body).map_err(StoreError::backend)
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Form::new(*id, title, questions).map(Some).map_err(StoreError::backend)
    }

    async fn put_form(&self, form: &Form) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO flow_forms (id, title, fingerprint, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (id) DO UPDATE
            SET title = EXCLUDED.title, fingerprint = EXCLUDED.fingerprint, updated_at = now()
            "#,
        )
        .bind(form.id().as_uuid())
        .bind(form.title())
        .bind(form.fingerprint())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM flow_questions WHERE form_id = $1")
            .bind(form.id().as_uuid())
            .execute(&mut *tx)
            .await?;

        for question in form.questions() {
            let body = serde_json::to_value(question).map_err(StoreError::backend)?;
            sqlx::query("INSERT INTO flow_questions (id, form_id, position, body) VALUES ($1, $2, $3, $4)")
                .bind(question.id.as_uuid())
                .bind(form.id().as_uuid())
                .bind(question.position as i32)
                .bind(body)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<ResponseSession>, StoreError> {
        let Some(row) = sqlx::query(
            r#"
            SELECT id, form_id, form_fingerprint, status, status_reason,
                   created_at, updated_at, completed_at, version
            FROM flow_sessions
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let answer_rows = sqlx::query(
            r#"
            SELECT session_id, question_id, value, skipped, answered_at, metadata
            FROM flow_answers
            WHERE session_id = $1
            ORDER BY question_id
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let mut answers = AnswerMap::new();
        for answer_row in &answer_rows {
            let record = Self::parse_answer_row(answer_row)?;
            answers.insert(record.question_id, record);
        }

        Self::parse_session_row(&row, answers).map(Some)
    }

    async fn insert_session(&self, session: &ResponseSession) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO flow_sessions (id, form_id, form_fingerprint, status, status_reason,
                                       created_at, updated_at, completed_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(session.id.as_uuid())
        .bind(session.form_id.as_uuid())
        .bind(&session.form_fingerprint)
        .bind(session.status.to_string())
        .bind(&session.status_reason)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.completed_at)
        .bind(session.version as i64)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(session.id));
        }

        Self::write_answers(&mut tx, session).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_session(&self, session: &ResponseSession, expected_version: u64) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE flow_sessions
            SET status = $2, status_reason = $3, updated_at = $4, completed_at = $5,
                version = version + 1
            WHERE id = $1 AND version = $6
            "#,
        )
        .bind(session.id.as_uuid())
        .bind(session.status.to_string())
        .bind(&session.status_reason)
        .bind(session.updated_at)
        .bind(session.completed_at)
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let current: Option<i64> = sqlx::query_scalar("SELECT version FROM flow_sessions WHERE id = $1")
                .bind(session.id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
            // Dropping the transaction rolls it back.
            return Err(match current {
                Some(actual) => StoreError::Conflict {
                    session_id: session.id,
                    expected: expected_version,
                    actual: actual.max(0) as u64,
                },
                None => StoreError::Missing(session.id),
            });
        }

        Self::write_answers(&mut tx, session).await?;
        tx.commit().await?;
        Ok(expected_version + 1)
    }

    async fn idle_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM flow_sessions
            WHERE status IN ('in_progress', 'paused') AND updated_at < $1
            ORDER BY id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(SessionId::new(row.try_get::<Uuid, _>("id")?)))
            .collect()
    }

    async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max: self.pool.options().get_max_connections(),
        })
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
