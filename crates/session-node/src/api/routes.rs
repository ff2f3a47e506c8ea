use axum::extract::State;
use axum::http::StatusCode;
use axum::{response::IntoResponse, Json};
use common::session::SessionConfig;
use serde_json::{json, Value};
use tracing::{error, info};

use super::{apply_default_save_dir, AppState, ModeRequest, ShutterRequest, VideoSettingsRequest};
use crate::error::SessionError;
use crate::metrics as node_metrics;

pub async fn healthz() -> impl IntoResponse {
  (StatusCode::OK, "ok")
}

pub async fn metrics() -> impl IntoResponse {
  node_metrics::render()
}

/// POST /v1/connect - identify the camera without starting anything
pub async fn connect(State(state): State<AppState>) -> Result<impl IntoResponse, SessionError> {
  let connection = state.controller.connect().await?;
  Ok(Json(connection))
}

/// GET /v1/session
pub async fn session(State(state): State<AppState>) -> impl IntoResponse {
  Json(state.controller.snapshot())
}

/// POST /v1/session/start - body is a session config, e.g. `{"mode":"save","format":"mp4"}`
pub async fn start_session(
  State(state): State<AppState>,
  Json(mut body): Json<Value>,
) -> Result<impl IntoResponse, SessionError> {
  apply_default_save_dir(&mut body, &state.save_dir);
  let config: SessionConfig =
    serde_json::from_value(body).map_err(|e| SessionError::InvalidParameter(e.to_string()))?;

  // Run on its own task so a dropped connection can't abandon a half-started session.
  let controller = state.controller.clone();
  let snapshot = match tokio::spawn(async move { controller.start(config).await }).await {
    Ok(result) => result?,
    Err(e) => {
      error!(error = %e, "session start task failed");
      return Err(SessionError::PipelineFailed(format!("start task failed: {}", e)));
    }
  };
  info!(phase = %snapshot.phase, "session start requested");
  Ok(Json(snapshot))
}

/// POST /v1/session/stop
pub async fn stop_session(State(state): State<AppState>) -> Result<impl IntoResponse, SessionError> {
  let controller = state.controller.clone();
  let snapshot = match tokio::spawn(async move { controller.stop().await }).await {
    Ok(result) => result?,
    Err(e) => {
      error!(error = %e, "session stop task failed");
      return Err(SessionError::PipelineFailed(format!("stop task failed: {}", e)));
    }
  };
  Ok(Json(snapshot))
}

/// GET /v1/camera/status
pub async fn camera_status(State(state): State<AppState>) -> Result<impl IntoResponse, SessionError> {
  let status = state.controller.camera_status().await?;
  Ok(Json(status))
}

/// POST /v1/camera/shutter
pub async fn shutter(
  State(state): State<AppState>,
  Json(req): Json<ShutterRequest>,
) -> Result<impl IntoResponse, SessionError> {
  let camera = state.controller.camera();
  let result = if req.on {
    camera.start_shutter().await
  } else {
    camera.stop_shutter().await
  };
  result.map_err(|e| SessionError::camera("shutter", e))?;
  Ok(Json(json!({ "shutter": req.on })))
}

/// POST /v1/camera/mode
pub async fn set_mode(
  State(state): State<AppState>,
  Json(req): Json<ModeRequest>,
) -> Result<impl IntoResponse, SessionError> {
  state
    .controller
    .camera()
    .set_mode(&req.mode)
    .await
    .map_err(|e| SessionError::camera("set mode", e))?;
  info!(mode = %req.mode, "camera mode changed");
  Ok(Json(json!({ "mode": req.mode })))
}

/// POST /v1/camera/video-settings
pub async fn set_video_settings(
  State(state): State<AppState>,
  Json(req): Json<VideoSettingsRequest>,
) -> Result<impl IntoResponse, SessionError> {
  state
    .controller
    .camera()
    .set_video_settings(&req.resolution, &req.fps, &req.fov)
    .await
    .map_err(|e| SessionError::camera("video settings", e))?;
  info!(resolution = %req.resolution, fps = %req.fps, fov = %req.fov, "video settings applied");
  Ok(Json(json!({
    "resolution": req.resolution,
    "fps": req.fps,
    "fov": req.fov,
  })))
}
