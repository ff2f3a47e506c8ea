use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::validation;

pub const DEFAULT_SAVE_NAME: &str = "goprofeed3";
pub const DEFAULT_SAVE_DIR: &str = "/tmp";
pub const DEFAULT_RESTREAM_SINK: &str = "udp://localhost:10000";

/// What the transcoder does with the camera feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SessionMode {
  /// Live preview, either as a rolling HLS playlist or straight into a player window.
  Preview {
    #[serde(default)]
    target: PreviewTarget,
  },
  /// Re-broadcast the raw transport stream to a local UDP sink.
  Restream {
    #[serde(default = "default_sink")]
    sink: String,
  },
  /// Record the feed to `<dir>/<name>.<format>`.
  Save {
    #[serde(default)]
    format: SaveFormat,
    #[serde(default = "default_save_name")]
    name: String,
    #[serde(default = "default_save_dir")]
    dir: PathBuf,
  },
}

fn default_sink() -> String {
  DEFAULT_RESTREAM_SINK.to_string()
}
fn default_save_name() -> String {
  DEFAULT_SAVE_NAME.to_string()
}
fn default_save_dir() -> PathBuf {
  PathBuf::from(DEFAULT_SAVE_DIR)
}

impl SessionMode {
  pub fn preview() -> Self {
    SessionMode::Preview {
      target: PreviewTarget::Segmented,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      SessionMode::Preview { .. } => "preview",
      SessionMode::Restream { .. } => "restream",
      SessionMode::Save { .. } => "save",
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PreviewTarget {
  /// ffmpeg re-encodes into `stream.m3u8` + `stream*.ts` segments.
  #[default]
  Segmented,
  /// ffplay renders the feed directly.
  Player,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
  #[default]
  Ts,
  Mp4,
  Mkv,
}

impl SaveFormat {
  pub fn extension(&self) -> &'static str {
    match self {
      SaveFormat::Ts => "ts",
      SaveFormat::Mp4 => "mp4",
      SaveFormat::Mkv => "mkv",
    }
  }
}

impl fmt::Display for SaveFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.extension())
  }
}

/// Caller-supplied parameters for one session. Immutable once the session starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
  #[serde(flatten)]
  pub mode: SessionMode,
  /// Press the camera shutter once the stream is up, release it on stop.
  #[serde(default)]
  pub record_on_camera: bool,
  #[serde(default)]
  pub verbose: bool,
}

impl SessionConfig {
  pub fn new(mode: SessionMode) -> Self {
    Self {
      mode,
      record_on_camera: false,
      verbose: false,
    }
  }

  pub fn with_record_on_camera(mut self, record: bool) -> Self {
    self.record_on_camera = record;
    self
  }

  pub fn with_verbose(mut self, verbose: bool) -> Self {
    self.verbose = verbose;
    self
  }

  pub fn validate(&self) -> Result<()> {
    match &self.mode {
      SessionMode::Preview { .. } => Ok(()),
      SessionMode::Restream { sink } => validation::validate_uri(sink, "restream sink"),
      SessionMode::Save { name, dir, .. } => {
        validation::validate_file_name(name, "save name")?;
        validation::validate_dir(dir, "save dir")
      }
    }
  }

  /// Recording destination for Save sessions.
  pub fn save_path(&self) -> Option<PathBuf> {
    match &self.mode {
      SessionMode::Save { format, name, dir } => {
        Some(dir.join(format!("{}.{}", name, format.extension())))
      }
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
  Idle,
  Starting,
  Running,
  Stopping,
  Failed,
}

impl SessionPhase {
  /// Phases from which a new session may not be started.
  pub fn is_active(&self) -> bool {
    matches!(
      self,
      SessionPhase::Starting | SessionPhase::Running | SessionPhase::Stopping
    )
  }
}

impl fmt::Display for SessionPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      SessionPhase::Idle => "idle",
      SessionPhase::Starting => "starting",
      SessionPhase::Running => "running",
      SessionPhase::Stopping => "stopping",
      SessionPhase::Failed => "failed",
    };
    f.write_str(s)
  }
}

/// Read-only view of the controller state handed to operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
  pub phase: SessionPhase,
  pub config: Option<SessionConfig>,
  pub camera: Option<crate::camera::CameraProfile>,
  pub heartbeat_active: bool,
  pub pipeline_pid: Option<u32>,
  pub input_url: Option<String>,
  pub last_error: Option<String>,
}
