//! HTTP gateway using Axum.
//!
//! A thin adapter: decode the request, call [`ShellService`], encode the
//! outcome in the wire format the browser terminal expects.

use crate::config::ServiceConfig;
use crate::error::ShellError;
use crate::janitor::SessionJanitor;
use crate::sandbox::ExecOutput;
use crate::shell::{ShellService, StatusReport};
use axum::{
    extract::State,
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Conventional shell exit status for a command killed by a timeout.
const TIMEOUT_EXIT_STATUS: i32 = 124;

// Request/Response types
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    command: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndSessionRequest {
    #[serde(default)]
    session_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionResponse {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct CommandResponse {
    stdout: String,
    stderr: String,
    status: i32,
}

impl From<ExecOutput> for CommandResponse {
    fn from(output: ExecOutput) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            status: output.exit_code,
        }
    }
}

impl IntoResponse for ShellError {
    fn into_response(self) -> Response {
        match self {
            ShellError::Rejected { reason } => (
                StatusCode::FORBIDDEN,
                Json(CommandResponse {
                    stdout: String::new(),
                    stderr: reason,
                    status: 1,
                }),
            )
                .into_response(),
            ShellError::Timeout(_) => (
                StatusCode::REQUEST_TIMEOUT,
                Json(CommandResponse {
                    stdout: String::new(),
                    stderr: "Command execution timed out".to_string(),
                    status: TIMEOUT_EXIT_STATUS,
                }),
            )
                .into_response(),
            ShellError::SessionNotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Session not found" })),
            )
                .into_response(),
            ShellError::Provision(e) => {
                error!(error = %e, "Failed to create container");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Failed to create container" })),
                )
                    .into_response()
            }
            ShellError::Execution(e) => {
                error!(error = %e, "Command execution failed");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "error": "Command execution failed" })),
                )
                    .into_response()
            }
        }
    }
}

/// Builds the router with tracing and CORS for `allowed_origins`.
pub fn router(service: ShellService, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/start-session", post(start_session))
        .route("/api/command", post(run_command))
        .route("/api/end-session", post(end_session))
        .route("/health", get(health))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

/// Runs the gateway until `shutdown` resolves, with the janitor sweeping in
/// the background. All remaining sessions are torn down before returning.
pub async fn run_server(
    addr: SocketAddr,
    service: ShellService,
    config: &ServiceConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let janitor = SessionJanitor::new(
        service.registry().clone(),
        config.sweep_interval,
        config.idle_timeout,
    )
    .spawn();

    let app = router(service.clone(), &config.allowed_origins);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);
    info!("Available endpoints:");
    info!("- GET  /api/status");
    info!("- POST /api/start-session");
    info!("- POST /api/command");
    info!("- POST /api/end-session");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    janitor.abort();
    let drained = service.shutdown().await;
    info!(drained, "Server stopped");
    served
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(service): State<ShellService>) -> Json<StatusReport> {
    Json(service.status().await)
}

async fn start_session(
    State(service): State<ShellService>,
) -> Result<Json<StartSessionResponse>, ShellError> {
    let session_id = service.start_session().await?;
    Ok(Json(StartSessionResponse { session_id }))
}

async fn run_command(
    State(service): State<ShellService>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, ShellError> {
    let output = service.run_command(&req.session_id, &req.command).await?;
    Ok(Json(output.into()))
}

async fn end_session(
    State(service): State<ShellService>,
    Json(req): Json<EndSessionRequest>,
) -> Result<Json<serde_json::Value>, ShellError> {
    service.end_session(&req.session_id).await?;
    Ok(Json(json!({ "success": true })))
}
