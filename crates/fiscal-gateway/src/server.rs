//! [`GatewayServer`] – HTTP front door for the correlator.
//!
//! Listens on `0.0.0.0:8000` (configurable via [`GatewayServer::with_port`]).
//!
//! | Route | Behaviour |
//! |---|---|
//! | `GET /` | Service name, version, addressing mode. |
//! | `GET /health` | Correlator health; 200 when healthy, 503 otherwise. |
//! | `POST /api/v1/devices/{device_id}/commands/{operation}` | Body becomes `kwargs`; `?timeout=<secs>` raises the call timeout. |
//!
//! The four call outcomes map to HTTP as: success → 200, worker failure →
//! 400, transport unavailable → 503, timeout → 504.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fiscal_bridge::{Correlator, Reply};
use fiscal_types::{Arguments, BridgeError};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Default TCP port for the gateway.
pub const DEFAULT_PORT: u16 = 8000;

/// Upper bound for a caller-supplied `?timeout=`.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// GatewayServer
// ---------------------------------------------------------------------------

pub struct GatewayServer {
    correlator: Correlator,
    port: u16,
    max_timeout: Duration,
}

#[derive(Clone)]
struct AppState {
    correlator: Correlator,
    max_timeout: Duration,
}

impl GatewayServer {
    /// Create a server backed by `correlator` on the [`DEFAULT_PORT`].
    pub fn new(correlator: Correlator) -> Self {
        Self {
            correlator,
            port: DEFAULT_PORT,
            max_timeout: DEFAULT_MAX_TIMEOUT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            correlator: self.correlator.clone(),
            max_timeout: self.max_timeout,
        };
        Router::new()
            .route("/", get(serve_root))
            .route("/health", get(health))
            .route("/api/v1/devices/{device_id}/commands/{operation}", post(run_command))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Bind`] if the port cannot be bound.
    pub async fn run<F>(self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;

        info!(%addr, "gateway listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("gateway stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn serve_root(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "name": "fiscal-bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "addressing": state.correlator.addressing(),
        "links": {
            "health": "/health",
            "commands": "/api/v1/devices/{device_id}/commands/{operation}",
        }
    }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.correlator.health();
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": health,
        "pending_calls": state.correlator.pending_calls(),
        "subscribed_topics": state.correlator.subscribed_topics(),
    });
    (status, Json(body))
}

#[derive(Debug, Default, Deserialize)]
struct CommandQuery {
    timeout: Option<f64>,
}

async fn run_command(
    State(state): State<AppState>,
    Path((device_id, operation)): Path<(String, String)>,
    Query(query): Query<CommandQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let arguments = parse_arguments(&body)?;
    let timeout = resolve_timeout(query.timeout, state.correlator.default_timeout(), state.max_timeout);

    info!(device_id = %device_id, operation = %operation, timeout_ms = millis(timeout), "command requested");
    let reply = state
        .correlator
        .call(&device_id, &operation, arguments, timeout)
        .await?;
    Ok(reply_response(reply))
}

fn parse_arguments(body: &[u8]) -> Result<Arguments, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Arguments::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(arguments)) => Ok(arguments),
        Ok(Value::Null) => Ok(Arguments::new()),
        Ok(_) => Err(ApiError::InvalidBody("request body must be a JSON object".to_string())),
        Err(e) => Err(ApiError::InvalidBody(format!("request body is not valid JSON: {e}"))),
    }
}

/// Caller timeout in seconds, falling back to `default` and capped at `max`.
fn resolve_timeout(requested: Option<f64>, default: Duration, max: Duration) -> Duration {
    let timeout = match requested {
        Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs.min(max.as_secs_f64())),
        _ => default,
    };
    timeout.min(max)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn reply_response(reply: Reply) -> Response {
    match reply.data {
        Some(data) => Json(data).into_response(),
        None => Json(json!({"success": true, "message": reply.message})).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("{0}")]
    InvalidBody(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Bridge(BridgeError::WorkerReportedFailure { message, data }) => (
                StatusCode::BAD_REQUEST,
                json!({"detail": message, "data": data, "type": "worker_failure"}),
            ),
            ApiError::Bridge(err @ BridgeError::Timeout { .. }) => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({"detail": err.to_string(), "type": "timeout"}),
            ),
            ApiError::Bridge(err @ BridgeError::TransportUnavailable(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"detail": err.to_string(), "type": "transport_unavailable"}),
            ),
            ApiError::Bridge(err) => {
                warn!(error = %err, "unexpected bridge error at the HTTP boundary");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"detail": err.to_string(), "type": "internal"}),
                )
            }
            ApiError::InvalidBody(detail) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({"detail": detail, "type": "invalid_request"}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
