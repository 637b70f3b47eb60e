//! Control API for GPU mode management.
//!
//! ## Endpoints
//!
//! | Method | Path            | Description                                        |
//! |--------|-----------------|----------------------------------------------------|
//! | GET    | `/api/gpu-mode` | Current mode, registry, training, containers, health |
//! | POST   | `/api/gpu-mode` | Switch mode: `{"mode": "training"}`                |
//! | PUT    | `/api/gpu-mode` | Restart a container: `{"container": "ollama"}`     |
//!
//! Responses are meant to be read by an operator, so errors are plain
//! messages rather than codes.

use crate::status;
use crate::switcher::{ModeSwitcher, RestartOutcome};
use crate::types::{SwitchError, SwitchResult};
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

pub const MODE_PATH: &str = "/api/gpu-mode";

/// Build the control API router.
pub fn control_router(switcher: ModeSwitcher) -> Router {
    Router::new()
        .route(
            MODE_PATH,
            get(get_status).post(switch_mode).put(restart_container),
        )
        .with_state(switcher)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SwitchRequest {
    mode: String,
}

#[derive(Deserialize)]
struct RestartRequest {
    container: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_status(State(switcher): State<ModeSwitcher>) -> impl IntoResponse {
    Json(status::collect(&switcher).await)
}

async fn switch_mode(
    State(switcher): State<ModeSwitcher>,
    Json(body): Json<SwitchRequest>,
) -> Result<Json<SwitchResult>, ApiError> {
    match switcher.switch_to(&body.mode).await {
        Ok(result) if result.success => Ok(Json(result)),
        Ok(result) => {
            error!(mode = %body.mode, message = %result.message, "Mode switch failed");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, result.message))
        }
        Err(e @ SwitchError::InvalidMode(_)) => {
            warn!(mode = %body.mode, "Rejected invalid mode");
            Err(api_error(StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Mode switch failed: {}", e),
        )),
    }
}

async fn restart_container(
    State(switcher): State<ModeSwitcher>,
    Json(body): Json<RestartRequest>,
) -> Result<Json<RestartOutcome>, ApiError> {
    match switcher.restart_container(&body.container).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e @ SwitchError::UnknownContainer(_)) => {
            Err(api_error(StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e) => {
            error!(container = %body.container, error = %e, "Container restart failed");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to restart {}: {}", body.container, e),
            ))
        }
    }
}
