//! HTTP surface of the daemon.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/status` | Peer states, current leader, registry view |
//! | GET | `/metrics` | Prometheus exposition |
//! | POST | `/call/{method}` | Call a method on the group (JSON params) |
//! | POST | `/peers/{instance_id}/stop` | Stop one peer |

use std::sync::Arc;

use anchor_core::ErrorKind;
use anchor_rpc::RpcError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::group::PeerGroup;

#[derive(Clone)]
pub struct ApiState {
    pub group: Arc<PeerGroup>,
}

pub fn build_router(group: Arc<PeerGroup>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/metrics", get(prometheus_metrics))
        .route("/call/{method}", post(call))
        .route("/peers/{instance_id}/stop", post(stop_peer))
        .with_state(ApiState { group })
}

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// GET /status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.group.status().await)
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = anchor_metrics::render_prometheus(&state.group.metrics().snapshot());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct CallQuery {
    /// Pin the call to one peer instead of the whole group.
    pub instance: Option<String>,
}

/// POST /call/{method}
pub async fn call(
    State(state): State<ApiState>,
    Path(method): Path<String>,
    Query(query): Query<CallQuery>,
    Json(params): Json<Value>,
) -> axum::response::Response {
    match state.group.call(&method, params, query.instance.as_deref()).await {
        Ok(value) => ApiResponse::ok(value).into_response(),
        Err(e) => {
            warn!(%method, error = %e, "call failed");
            error_response(&e.to_string(), status_for(&e)).into_response()
        }
    }
}

/// POST /peers/{instance_id}/stop
pub async fn stop_peer(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> axum::response::Response {
    match state.group.stop_peer(&instance_id).await {
        Some(Ok(())) => {
            info!(%instance_id, "peer stopped via API");
            ApiResponse::ok(instance_id).into_response()
        }
        Some(Err(e)) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
        None => error_response(&format!("no peer named {instance_id}"), StatusCode::NOT_FOUND).into_response(),
    }
}

fn status_for(e: &RpcError) -> StatusCode {
    match e.kind() {
        ErrorKind::MethodNotFound => StatusCode::NOT_FOUND,
        ErrorKind::NotActive | ErrorKind::NoInstances | ErrorKind::RetriesExhausted => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Transport | ErrorKind::Handler => StatusCode::BAD_GATEWAY,
        ErrorKind::InvalidPolicy => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
