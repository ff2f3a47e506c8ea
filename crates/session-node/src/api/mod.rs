mod dto;
mod routes;

pub use dto::{apply_default_save_dir, ModeRequest, ShutterRequest, VideoSettingsRequest};

use axum::{
  http::StatusCode,
  middleware,
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use serde_json::json;
use std::path::PathBuf;
use telemetry::trace_http_request;
use tower::ServiceBuilder;

use crate::controller::SessionController;
use crate::error::SessionError;

#[derive(Clone)]
pub struct AppState {
  pub controller: SessionController,
  /// Applied to Save requests that don't name a directory.
  pub save_dir: PathBuf,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/healthz", get(routes::healthz))
    .route("/metrics", get(routes::metrics))
    .route("/v1/connect", post(routes::connect))
    .route("/v1/session", get(routes::session))
    .route("/v1/session/start", post(routes::start_session))
    .route("/v1/session/stop", post(routes::stop_session))
    .route("/v1/camera/status", get(routes::camera_status))
    .route("/v1/camera/shutter", post(routes::shutter))
    .route("/v1/camera/mode", post(routes::set_mode))
    .route("/v1/camera/video-settings", post(routes::set_video_settings))
    .layer(ServiceBuilder::new().layer(middleware::from_fn(trace_http_request)))
    .with_state(state)
}

impl IntoResponse for SessionError {
  fn into_response(self) -> Response {
    let status = match &self {
      SessionError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
      SessionError::AlreadyActive(_) | SessionError::Cancelled => StatusCode::CONFLICT,
      SessionError::UnsupportedCamera { .. } => StatusCode::UNPROCESSABLE_ENTITY,
      SessionError::CameraUnreachable(_) => StatusCode::GATEWAY_TIMEOUT,
      SessionError::CameraRejected { .. } => StatusCode::BAD_GATEWAY,
      SessionError::CameraNotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
      SessionError::SpawnFailed { .. } | SessionError::PipelineFailed(_) | SessionError::Io(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
    };

    let body = Json(json!({
      "error": self.kind(),
      "message": self.to_string(),
      "retryable": self.is_retryable(),
    }));

    (status, body).into_response()
  }
}
