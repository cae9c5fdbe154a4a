//! Axum routes for the Flow Kernel service.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CacheStats;
use crate::engine::{FlowError, SubmitOutcome};
use crate::store::{FlowStore, StoreError};
use crate::types::form::FormDefinition;
use crate::types::{Form, FormId, Question, QuestionId, ResponseSession, SessionId, SessionStatus};
use crate::FLOW_KERNEL_SCHEMA_VERSION;

use super::middleware::{record_session_transition, record_submission};
use super::state::ServiceState;

type ApiError = (StatusCode, Json<ErrorResponse>);

// ============================================================================
// Request/Response Types
// ============================================================================

/// Response after registering a form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormRegisteredResponse {
    /// Registered form.
    pub form_id: FormId,
    /// Fingerprint of the stored definition.
    pub fingerprint: String,
    /// Number of questions.
    pub question_count: usize,
}

/// Response after starting a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStartedResponse {
    /// The new session.
    pub session_id: SessionId,
    /// First question to present.
    pub current_question: Option<Question>,
}

/// Current question of a session.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentQuestionResponse {
    /// Session queried.
    pub session_id: SessionId,
    /// Question to present, `None` when there is nothing left to ask.
    pub current_question: Option<Question>,
}

/// Answer submission body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAnswerRequest {
    /// Question being answered.
    pub question_id: String,
    /// Raw answer as entered.
    #[serde(default)]
    pub value: Value,
}

/// Body for abandon / close.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasonRequest {
    /// Free-form reason, stored on the session.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Session status after a transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// Session changed.
    pub session_id: SessionId,
    /// Its new status.
    pub status: SessionStatus,
}

/// Service health response (detailed).
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub schema_version: String,
    /// Store backend in use.
    pub backend: String,
    /// Database connectivity status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseHealth>,
    /// Form cache occupancy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_cache: Option<CacheStats>,
}

/// Database health information.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    pub connected: bool,
    pub pool_size: u32,
    pub pool_idle: usize,
    pub pool_max: u32,
}

/// Simple liveness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub status: String,
}

/// Readiness response with dependency status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub database: bool,
    pub details: Option<String>,
}

/// Structured error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
    /// Additional error details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response with code and message.
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
        }
    }

    /// Add details to the error.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Map an engine error to its HTTP status and error code.
fn flow_error(err: FlowError) -> ApiError {
    let (status, code) = match &err {
        FlowError::FormNotFound(_) => (StatusCode::NOT_FOUND, "FORM_NOT_FOUND"),
        FlowError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
        FlowError::QuestionNotFound { .. } => (StatusCode::NOT_FOUND, "QUESTION_NOT_FOUND"),
        FlowError::SessionNotActive { .. } => (StatusCode::CONFLICT, "SESSION_NOT_ACTIVE"),
        FlowError::InvalidTransition(_) => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
        FlowError::Form(_) => (StatusCode::BAD_REQUEST, "INVALID_FORM"),
        FlowError::Rule(_) => (StatusCode::BAD_REQUEST, "INVALID_RULE"),
        FlowError::Store(StoreError::Conflict { .. }) => (StatusCode::CONFLICT, "VERSION_CONFLICT"),
        FlowError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
    };

    if status.is_server_error() {
        tracing::error!(code, error = %err, "Request failed");
    } else {
        tracing::warn!(code, error = %err, "Request error");
    }
    (status, Json(ErrorResponse::new(code, err.to_string())))
}

fn parse_id<T>(raw: &str, what: &str, parse: impl Fn(&str) -> Result<T, uuid::Error>) -> Result<T, ApiError> {
    parse(raw).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("INVALID_ID", format!("Invalid {what}: {e}")).with_details(raw.to_string())),
        )
    })
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Register or replace a form.
async fn register_form_handler<S: FlowStore + 'static>(
    State(state): State<ServiceState<S>>,
    Json(definition): Json<FormDefinition>,
) -> Result<Json<FormRegisteredResponse>, ApiError> {
    let form = Form::try_from(definition).map_err(|e| flow_error(e.into()))?;
    let response = FormRegisteredResponse {
        form_id: form.id(),
        fingerprint: form.fingerprint().to_string(),
        question_count: form.len(),
    };
    state.engine.register_form(form).await.map_err(flow_error)?;
    Ok(Json(response))
}

/// Fetch a form definition.
async fn get_form_handler<S: FlowStore + 'static>(
    State(state): State<ServiceState<S>>,
    Path(form_id): Path<String>,
) -> Result<Json<FormDefinition>, ApiError> {
    let form_id = parse_id(&form_id, "form id", FormId::parse)?;
    let form = state.engine.get_form(&form_id).await.map_err(flow_error)?;
    Ok(Json(FormDefinition::from(Form::clone(&form))))
}

/// Start a session and return its first question.
async fn start_session_handler<S: FlowStore + 'static>(
    State(state): State<ServiceState<S>>,
    Path(form_id): Path<String>,
) -> Result<(StatusCode, Json<SessionStartedResponse>), ApiError> {
    let form_id = parse_id(&form_id, "form id", FormId::parse)?;
    let session = state.engine.start_session(&form_id).await.map_err(flow_error)?;
    let current_question = state.engine.get_current_question(&session.id).await.map_err(flow_error)?;
    record_session_transition("start");
    Ok((
        StatusCode::CREATED,
        Json(SessionStartedResponse { session_id: session.id, current_question }),
    ))
}

/// Session snapshot with all answer records.
async fn get_session_handler<S: FlowStore + 'static>(
    State(state): State<ServiceState<S>>,
    Path(session_id): Path<String>,
) -> Result<Json<ResponseSession>, ApiError> {
    let session_id = parse_id(&session_id, "session id", SessionId::parse)?;
    let session = state.engine.get_session(&session_id).await.map_err(flow_error)?;
    Ok(Json(session))
}

/// Current question of a session.
async fn current_question_handler<S: FlowStore + 'static>(
    State(state): State<ServiceState<S>>,
    Path(session_id): Path<String>,
) -> Result<Json<CurrentQuestionResponse>, ApiError> {
    let session_id = parse_id(&session_id, "session id", SessionId::parse)?;
    let current_question = state.engine.get_current_question(&session_id).await.map_err(flow_error)?;
    Ok(Json(CurrentQuestionResponse { session_id, current_question }))
}

/// Submit an answer.
///
/// Validation failures come back as 422 with the outcome body.
async fn submit_answer_handler<S: FlowStore + 'static>(
    State(state): State<ServiceState<S>>,
    Path(session_id): Path<String>,
    Json(request): Json<SubmitAnswerRequest>,
) -> Result<(StatusCode, Json<SubmitOutcome>), ApiError> {
    let session_id = parse_id(&session_id, "session id", SessionId::parse)?;
    let question_id = parse_id(&request.question_id, "question id", QuestionId::parse)?;

    let outcome = state
        .engine
        .submit_answer(&session_id, &question_id, request.value)
        .await
        .map_err(flow_error)?;

    let invalid = !outcome.errors.is_empty();
    record_submission(outcome.corrected, invalid, outcome.invalidated.len(), outcome.completed);
    let status = if invalid { StatusCode::UNPROCESSABLE_ENTITY } else { StatusCode::OK };
    Ok((status, Json(outcome)))
}

/// Pause a session.
async fn abandon_handler<S: FlowStore + 'static>(
    State(state): State<ServiceState<S>>,
    Path(session_id): Path<String>,
    Json(request): Json<ReasonRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let session_id = parse_id(&session_id, "session id", SessionId::parse)?;
    let reason = request.reason.as_deref().unwrap_or("user_left");
    state.engine.abandon(&session_id, reason).await.map_err(flow_error)?;
    record_session_transition("abandon");
    Ok(Json(StatusResponse { session_id, status: SessionStatus::Paused }))
}

/// Resume a paused session.
async fn resume_handler<S: FlowStore + 'static>(
    State(state): State<ServiceState<S>>,
    Path(session_id): Path<String>,
) -> Result<Json<CurrentQuestionResponse>, ApiError> {
    let session_id = parse_id(&session_id, "session id", SessionId::parse)?;
    let current_question = state.engine.resume(&session_id).await.map_err(flow_error)?;
    record_session_transition("resume");
    Ok(Json(CurrentQuestionResponse { session_id, current_question }))
}

/// Close a session for good.
async fn close_handler<S: FlowStore + 'static>(
    State(state): State<ServiceState<S>>,
    Path(session_id): Path<String>,
    Json(request): Json<ReasonRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let session_id = parse_id(&session_id, "session id", SessionId::parse)?;
    let reason = request.reason.as_deref().unwrap_or("closed");
    state.engine.close(&session_id, reason).await.map_err(flow_error)?;
    record_session_transition("close");
    Ok(Json(StatusResponse { session_id, status: SessionStatus::Abandoned }))
}

/// Health check endpoint (detailed).
async fn health_handler<S: FlowStore + 'static>(State(state): State<ServiceState<S>>) -> Json<HealthResponse> {
    let store = state.engine.store();
    let db_healthy = store.is_healthy().await;
    let database = store.pool_stats().map(|stats| DatabaseHealth {
        connected: db_healthy,
        pool_size: stats.size,
        pool_idle: stats.idle,
        pool_max: stats.max,
    });

    Json(HealthResponse {
        status: if db_healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: FLOW_KERNEL_SCHEMA_VERSION.to_string(),
        backend: store.backend_name().to_string(),
        database,
        form_cache: state.engine.form_cache_stats(),
    })
}

/// Liveness probe endpoint. Does NOT check dependencies.
async fn liveness_handler() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive".to_string(),
    })
}

/// Readiness probe endpoint.
///
/// Returns 200 if the store is reachable, 503 otherwise.
async fn readiness_handler<S: FlowStore + 'static>(
    State(state): State<ServiceState<S>>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    if state.engine.store().is_healthy().await {
        Ok(Json(ReadinessResponse {
            ready: true,
            database: true,
            details: None,
        }))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                ready: false,
                database: false,
                details: Some("Store unreachable".to_string()),
            }),
        ))
    }
}

// ============================================================================
// Router Construction
// ============================================================================

/// Create the Axum router for the Flow Kernel service.
pub fn create_router<S: FlowStore + 'static>(state: ServiceState<S>) -> Router {
    Router::new()
        // Forms
        .route("/api/forms", put(register_form_handler::<S>))
        .route("/api/forms/:form_id", get(get_form_handler::<S>))
        .route("/api/forms/:form_id/sessions", post(start_session_handler::<S>))
        // Sessions
        .route("/api/sessions/:session_id", get(get_session_handler::<S>))
        .route("/api/sessions/:session_id/current", get(current_question_handler::<S>))
        .route("/api/sessions/:session_id/answers", post(submit_answer_handler::<S>))
        .route("/api/sessions/:session_id/abandon", post(abandon_handler::<S>))
        .route("/api/sessions/:session_id/resume", post(resume_handler::<S>))
        .route("/api/sessions/:session_id/close", post(close_handler::<S>))
        // Health checks
        .route("/health", get(health_handler::<S>))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler::<S>))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FlowEngine;
    use crate::store::InMemoryFlowStore;
    use crate::types::{FormError, TransitionError};
    use std::sync::Arc;

    fn status_of(err: FlowError) -> StatusCode {
        flow_error(err).0
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_of(FlowError::FormNotFound(FormId::generate())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(FlowError::SessionNotFound(SessionId::generate())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(FlowError::SessionNotActive {
                session_id: SessionId::generate(),
                status: SessionStatus::Paused,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(FlowError::InvalidTransition(TransitionError {
                from: SessionStatus::Completed,
                action: "resume",
            })),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(FlowError::Form(FormError::Empty(FormId::generate()))), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(FlowError::Store(StoreError::Backend("down".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_parse_id_rejects_garbage() {
        let err = parse_id("not-a-uuid", "session id", SessionId::parse).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert_eq!(err.1.code, "INVALID_ID");
    }

    #[tokio::test]
    async fn test_router_builds_over_memory_store() {
        let engine = FlowEngine::new(Arc::new(InMemoryFlowStore::new()));
        let _router = create_router(ServiceState::new(engine));
    }
}
