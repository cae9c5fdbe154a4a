//! Flow Kernel Service Binary
//!
//! Runs the flow engine as a REST API service:
//! - Structured JSON logging
//! - Request tracing with correlation IDs
//! - Graceful shutdown handling
//! - Health check endpoints
//! - Optional idle-session expiry sweep
//!
//! ## Configuration
//!
//! Environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string. When unset, sessions live in memory.
//! - `PORT`: Service port (default: 8002)
//! - `HOST`: Service host (default: 0.0.0.0)
//! - `RUST_LOG`: Log level filter (default: info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: json)
//! - `FLOW_SESSION_IDLE_MINUTES`: Close sessions idle for this long (default: disabled)
//! - `FLOW_*`: engine settings, see `EngineConfig::from_env`
//!
//! ## Usage
//!
//! ```bash
//! DATABASE_URL=postgresql://... cargo run --bin flow_kernel_service --features service
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use form_flow_kernel::service::{create_router, metrics_middleware, ServiceState};
use form_flow_kernel::{EngineConfig, FlowEngine, FlowStore, InMemoryFlowStore, PostgresFlowStore};

/// How often the idle-session sweep runs.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Initialize the tracing subscriber with JSON or pretty format
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "flow_kernel_service=info,form_flow_kernel=info,flow_kernel=info,tower_http=info,sqlx=warn".into());

    if log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE)
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true)
            )
            .init();
    }
}

/// Request logging middleware that adds correlation ID and timing
async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let trace_id = request
        .headers()
        .get("X-Request-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let method = request.method().clone();
    let uri = request.uri().path().to_string();

    let span = info_span!(
        "request",
        trace_id = %trace_id,
        method = %method,
        path = %uri,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    let response = next.run(request).instrument(span.clone()).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    span.record("status", status);
    span.record("latency_ms", latency.as_millis() as u64);

    info!(
        target: "flow_kernel_service::access",
        trace_id = %trace_id,
        method = %method,
        path = %uri,
        status = status,
        latency_ms = latency.as_millis() as u64,
        "request completed"
    );

    response
}

/// Resolves when Ctrl+C or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

/// Periodically close idle sessions.
fn spawn_expiry_sweep<S: FlowStore + 'static>(engine: Arc<FlowEngine<S>>, idle_for: chrono::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = engine.expire_idle_sessions(idle_for).await {
                warn!(error = %e, "Idle session sweep failed");
            }
        }
    });
}

async fn serve<S: FlowStore + 'static>(store: S, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::from_env();
    info!(
        backend = store.backend_name(),
        enrichment_enabled = config.enrichment_enabled,
        enrichment_timeout_ms = config.enrichment_timeout.as_millis() as u64,
        max_commit_attempts = config.max_commit_attempts,
        form_cache_size = config.form_cache_size,
        "Engine configured"
    );

    let engine = Arc::new(FlowEngine::new(Arc::new(store)).with_config(config));

    let idle_minutes = std::env::var("FLOW_SESSION_IDLE_MINUTES")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|m| *m > 0);
    if let Some(minutes) = idle_minutes {
        info!(idle_minutes = minutes, "Idle session expiry enabled");
        spawn_expiry_sweep(Arc::clone(&engine), chrono::Duration::minutes(minutes));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(ServiceState::from_shared(engine))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    info!(address = %addr, version = env!("CARGO_PKG_VERSION"), "Flow Kernel Service listening");
    let listener = TcpListener::bind(addr).await?;

    info!("Ready to accept connections");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let version = env!("CARGO_PKG_VERSION");
    let build_sha = option_env!("BUILD_SHA").unwrap_or("dev");
    info!(version = version, build_sha = build_sha, "Starting Flow Kernel Service");

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8002);
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    if std::env::var("DATABASE_URL").map_or(true, |url| url.is_empty()) {
        warn!("DATABASE_URL not set, sessions are kept in memory and lost on restart");
        serve(InMemoryFlowStore::new(), addr).await?;
    } else {
        info!("Connecting to PostgreSQL...");
        let connect_start = Instant::now();

        let store = match tokio::time::timeout(Duration::from_secs(30), PostgresFlowStore::from_env()).await {
            Ok(Ok(store)) => store,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                return Err(e.into());
            }
            Err(_) => {
                tracing::error!("PostgreSQL connection timeout after 30s");
                return Err("Database connection timeout".into());
            }
        };
        store.migrate().await?;

        info!(
            latency_ms = connect_start.elapsed().as_millis() as u64,
            "PostgreSQL connection established"
        );
        serve(store, addr).await?;
    }

    info!("Flow Kernel Service shutdown complete");
    Ok(())
}
