use camera_control::{CameraError, ResolveError};
use common::session::SessionPhase;
use std::io;
use thiserror::Error;

/// Why a session could not be started or why a running session failed.
#[derive(Debug, Error)]
pub enum SessionError {
  #[error("invalid parameter: {0}")]
  InvalidParameter(String),

  #[error("a session is already {0}")]
  AlreadyActive(SessionPhase),

  #[error("camera unreachable: {0}")]
  CameraUnreachable(#[source] CameraError),

  #[error("camera rejected {command}: {source}")]
  CameraRejected {
    command: &'static str,
    #[source]
    source: CameraError,
  },

  #[error("unsupported camera (model '{model}', firmware '{firmware}')")]
  UnsupportedCamera { model: String, firmware: String },

  #[error("camera not ready after {attempts} status polls")]
  CameraNotReady { attempts: u32 },

  #[error("failed to spawn {program}: {source}")]
  SpawnFailed {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("pipeline failed: {0}")]
  PipelineFailed(String),

  #[error("session start cancelled by a stop request")]
  Cancelled,

  #[error("i/o error: {0}")]
  Io(#[from] io::Error),
}

impl SessionError {
  /// Maps a camera failure for the named command.
  pub fn camera(command: &'static str, err: CameraError) -> Self {
    match err {
      CameraError::Unreachable { .. } => Self::CameraUnreachable(err),
      CameraError::InvalidParameter(msg) => Self::InvalidParameter(msg),
      other => Self::CameraRejected { command, source: other },
    }
  }

  /// Whether calling `start` again may succeed without operator action.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Self::CameraUnreachable(_) | Self::CameraNotReady { .. } | Self::PipelineFailed(_) | Self::Cancelled
    )
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Self::InvalidParameter(_) => "invalid_parameter",
      Self::AlreadyActive(_) => "already_active",
      Self::CameraUnreachable(_) => "camera_unreachable",
      Self::CameraRejected { .. } => "camera_rejected",
      Self::UnsupportedCamera { .. } => "unsupported_camera",
      Self::CameraNotReady { .. } => "camera_not_ready",
      Self::SpawnFailed { .. } => "spawn_failed",
      Self::PipelineFailed(_) => "pipeline_failed",
      Self::Cancelled => "cancelled",
      Self::Io(_) => "io",
    }
  }
}

impl From<ResolveError> for SessionError {
  fn from(err: ResolveError) -> Self {
    match err {
      ResolveError::UnsupportedCamera { model, firmware } => Self::UnsupportedCamera { model, firmware },
      ResolveError::CameraNotReady { attempts, .. } => Self::CameraNotReady { attempts },
    }
  }
}
