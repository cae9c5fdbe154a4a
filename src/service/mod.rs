//! Flow Kernel REST Service
//!
//! Exposes the flow engine as a REST API.
//!
//! ## Endpoints
//!
//! - `PUT /api/forms` - Register or replace a form
//! - `GET /api/forms/:form_id` - Fetch a form
//! - `POST /api/forms/:form_id/sessions` - Start a session
//! - `GET /api/sessions/:session_id` - Session snapshot
//! - `GET /api/sessions/:session_id/current` - Current question
//! - `POST /api/sessions/:session_id/answers` - Submit an answer
//! - `POST /api/sessions/:session_id/abandon` - Pause a session
//! - `POST /api/sessions/:session_id/resume` - Resume a paused session
//! - `POST /api/sessions/:session_id/close` - Close a session for good
//! - `GET /health` - Detailed service health check
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe

pub mod middleware;
pub mod routes;
pub mod state;

pub use middleware::{metrics_middleware, record_session_transition, record_submission};
pub use routes::{create_router, ErrorResponse};
pub use state::ServiceState;
