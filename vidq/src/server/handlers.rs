//! Request handlers. Each maps one route onto one scheduler operation.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

use super::error::{ApiError, ApiResult};
use super::ServerState;
use crate::models::{Job, JobNotification, LogLine, TranscodeRequest, VideoFormat};
use crate::transcoder::ffmpeg_available;

type AppState = State<Arc<ServerState>>;

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

pub async fn submit(
    State(state): AppState,
    payload: Result<Json<TranscodeRequest>, JsonRejection>,
) -> ApiResult<Json<Job>> {
    let request = json_body(payload)?;
    Ok(Json(state.scheduler.submit(request).await?))
}

pub async fn status(State(state): AppState, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    Ok(Json(state.scheduler.status(&id).await?))
}

pub async fn list_active(State(state): AppState) -> Json<Vec<Job>> {
    Json(state.scheduler.list_active().await)
}

pub async fn list_queued(State(state): AppState) -> Json<Vec<Job>> {
    Json(state.scheduler.list_queued().await)
}

pub async fn cancel(State(state): AppState, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.scheduler.cancel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn logs(State(state): AppState, Path(id): Path<String>) -> ApiResult<Json<Vec<LogLine>>> {
    Ok(Json(state.scheduler.logs(&id).await?))
}

pub async fn resubmit(State(state): AppState, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    Ok(Json(state.scheduler.retry(&id).await?))
}

#[derive(Debug, Serialize)]
pub struct RequeueResponse {
    pub requeued: usize,
}

pub async fn resubmit_failed(State(state): AppState) -> ApiResult<Json<RequeueResponse>> {
    let requeued = state.scheduler.retry_failed().await?;
    Ok(Json(RequeueResponse { requeued }))
}

pub async fn pause(State(state): AppState, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    Ok(Json(state.scheduler.pause(&id).await?))
}

pub async fn resume(State(state): AppState, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    Ok(Json(state.scheduler.resume(&id).await?))
}

pub async fn set_priority(
    State(state): AppState,
    Path((id, priority)): Path<(String, String)>,
) -> ApiResult<Json<Job>> {
    let priority: i32 = priority
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("priority must be an integer, got '{priority}'")))?;
    Ok(Json(state.scheduler.set_priority(&id, priority).await?))
}

pub async fn formats() -> Json<Vec<VideoFormat>> {
    Json(VideoFormat::ALL.to_vec())
}

pub async fn webhook(
    State(state): AppState,
    payload: Result<Json<JobNotification>, JsonRejection>,
) -> ApiResult<Json<Job>> {
    let notification = json_body(payload)?;
    debug!(job_id = %notification.job_id, "Webhook received");
    Ok(Json(state.scheduler.apply_notification(notification).await?))
}

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub workers: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub active_jobs: usize,
    /// Whether the transcoder executable resolves on `PATH`.
    pub ffmpeg: bool,
}

/// Liveness probe. Reports "degraded" when FFmpeg cannot be found.
pub async fn health(State(state): AppState) -> Json<HealthResponse> {
    let stats = state.scheduler.stats().await;
    let ffmpeg = ffmpeg_available(&state.ffmpeg_program);
    Json(HealthResponse {
        status: if ffmpeg { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        workers: stats.workers,
        queue_depth: stats.queue_depth,
        queue_capacity: stats.queue_capacity,
        active_jobs: stats.active_jobs,
        ffmpeg,
    })
}

pub async fn websocket(ws: WebSocketUpgrade, State(state): AppState) -> impl IntoResponse {
    ws.on_upgrade(|socket| stream_events(socket, state))
}

/// Forward every job event to the socket until the client goes away.
async fn stream_events(mut socket: WebSocket, state: Arc<ServerState>) {
    // Lagged receivers skip what they missed
    let mut events = BroadcastStream::new(state.scheduler.subscribe()).filter_map(Result::ok);

    while let Some(event) = events.next().await {
        let Ok(json) = serde_json::to_string(&event) else {
            continue;
        };
        if socket.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
}
