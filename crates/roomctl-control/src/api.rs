use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use roomctl_manager::{ErrorKind, ManagerError, RoomId, RoomStatus, StartRequest};
use serde::{Deserialize, Serialize};

use crate::{request_meta::RequestMeta, state::AppState};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    request_id: Option<String>,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
            request_id: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: message.into(),
            request_id: None,
        }
    }

    /// Tags the error body so callers can match it against service logs.
    fn for_request(mut self, meta: &RequestMeta) -> Self {
        tracing::debug!(code = self.kind.code(), error = %self.message, "request failed");
        self.request_id = Some(meta.request_id.clone());
        self
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Execution => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            request_id: None,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rej: JsonRejection) -> Self {
        Self::validation(format!("invalid request body: {}", rej.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.kind.code(),
            request_id: self.request_id,
        };
        (status_for(self.kind), Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct StartBody {
    pub url: Option<String>,
    pub room_number: Option<String>,
    pub autoconnect: Option<bool>,
}

impl StartBody {
    fn into_request(self) -> Result<StartRequest, ApiError> {
        let url = self
            .url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ApiError::validation("URL parameter is required"))?;
        let room_id = self
            .room_number
            .map(|r| RoomId::parse(&r))
            .transpose()
            .map_err(|e| ApiError::validation(e.to_string()))?;
        Ok(StartRequest {
            server_url: url,
            room_id,
            autoconnect: self.autoconnect.unwrap_or(true),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct StopBody {
    pub room_number: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub status: &'static str,
    pub room_number: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub active_connections: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub status: &'static str,
    pub room: RoomStatus,
}

#[derive(Debug, Serialize)]
pub struct HealthzResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub client_executable: String,
    pub client_executable_present: bool,
    pub active_count: usize,
}

pub async fn start(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    body: Result<Json<StartBody>, JsonRejection>,
) -> Result<Json<StartResponse>, ApiError> {
    start_room(&state, body)
        .await
        .map(Json)
        .map_err(|e| e.for_request(&meta))
}

async fn start_room(
    state: &AppState,
    body: Result<Json<StartBody>, JsonRejection>,
) -> Result<StartResponse, ApiError> {
    let Json(body) = body?;
    let req = body.into_request()?;
    let room_id = state.manager.start(req).await?;
    Ok(StartResponse {
        status: "success",
        room_number: room_id.into_string(),
        message: "Connection started successfully".to_string(),
    })
}

pub async fn stop(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    body: Result<Json<StopBody>, JsonRejection>,
) -> Result<Json<StopResponse>, ApiError> {
    stop_room(&state, body)
        .await
        .map(Json)
        .map_err(|e| e.for_request(&meta))
}

async fn stop_room(
    state: &AppState,
    body: Result<Json<StopBody>, JsonRejection>,
) -> Result<StopResponse, ApiError> {
    let Json(body) = body?;
    let room_number = body
        .room_number
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ApiError::validation("Room number is required"))?;

    state.manager.stop(&room_number).await?;
    Ok(StopResponse {
        status: "success",
        message: format!("Connection {room_number} stopped successfully"),
    })
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let active_connections: Vec<String> = state
        .manager
        .status()
        .await
        .into_iter()
        .map(RoomId::into_string)
        .collect();
    Json(StatusResponse {
        status: "success",
        count: active_connections.len(),
        active_connections,
    })
}

pub async fn room_status(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(room_number): Path<String>,
) -> Result<Json<RoomResponse>, ApiError> {
    let Some(room) = state.manager.describe(&room_number).await else {
        let message = format!("no active connection found for room {room_number}");
        return Err(ApiError::not_found(message).for_request(&meta));
    };
    Ok(Json(RoomResponse {
        status: "success",
        room,
    }))
}

/// Read-only: reports the registry size without reaping exited clients.
pub async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    let manager = &state.manager;
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        client_executable: manager.config().client_executable.display().to_string(),
        client_executable_present: manager.client_executable_present(),
        active_count: manager.active_count().await,
    })
}
