//! HTTP routes

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use ks_core::types::{ConnectionInfo, Environment, PodSummary};
use ks_core::{ConnectionId, ErrorKind, GatewayError, ImageRef};

use super::ws::ws_upgrade;
use crate::state::GatewayState;

/// Build the gateway router
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/api/environments", post(create_environment))
        .route("/api/namespaces/:namespace/pods", get(list_pods))
        .route("/api/connections", get(list_connections))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// A [`GatewayError`] rendered as `{kind, message}` with a matching status
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(GatewayError::Invalid(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists | ErrorKind::ConnectionClosed => StatusCode::CONFLICT,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        };
        let body = json!({ "kind": kind, "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct EnvironmentRequest {
    username: String,
    password: String,
    image: ImageRef,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    username: String,
}

#[derive(Debug, Serialize)]
struct ConnectionsResponse {
    next_id: ConnectionId,
    open: usize,
    connections: Vec<ConnectionInfo>,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn login(
    State(state): State<Arc<GatewayState>>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(credentials) = payload?;
    let identity = state
        .identity
        .verify(&credentials.username, &credentials.password)
        .await?;

    tracing::info!("User {} logged in", identity);
    Ok(Json(LoginResponse {
        username: identity.username().to_string(),
    }))
}

async fn create_environment(
    State(state): State<Arc<GatewayState>>,
    payload: Result<Json<EnvironmentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Environment>), ApiError> {
    let Json(request) = payload?;
    let identity = state
        .identity
        .verify(&request.username, &request.password)
        .await?;

    let environment = state
        .provisioner
        .ensure_environment(&identity, &request.image)
        .await?;

    Ok((StatusCode::CREATED, Json(environment)))
}

async fn list_pods(
    State(state): State<Arc<GatewayState>>,
    Path(namespace): Path<String>,
) -> Result<Json<Vec<PodSummary>>, ApiError> {
    Ok(Json(state.provisioner.list_pods(&namespace).await?))
}

async fn list_connections(State(state): State<Arc<GatewayState>>) -> Json<ConnectionsResponse> {
    let snapshot = state.connections.snapshot().await;
    Json(ConnectionsResponse {
        next_id: state.connections.next_id().await,
        open: snapshot.iter().filter(|c| c.is_open).count(),
        connections: snapshot.to_vec(),
    })
}
