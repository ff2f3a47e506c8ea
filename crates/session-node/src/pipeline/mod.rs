//! Transcoder invocation: argument sets per session mode, and the scratch
//! files each mode leaves behind.

mod process;

pub use process::{PipelineEvent, PipelineHandle, ProcessExit, ReadyError};

use common::camera::StreamProtocol;
use common::session::{PreviewTarget, SaveFormat, SessionConfig, SessionMode};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

pub const PLAYLIST_NAME: &str = "stream.m3u8";
pub const SEGMENT_PREFIX: &str = "stream";

const LATENCY_FLAGS: [&str; 8] = [
  "-fflags",
  "nobuffer",
  "-flags",
  "low_delay",
  "-max_delay",
  "0",
  "-probesize",
  "32",
];

/// Case-insensitive substrings that mark a diagnostic line as fatal. Decode
/// glitches on a lossy feed are logged at error level too, so only terminal
/// conditions are listed; anything else that kills ffmpeg shows up as an exit.
pub fn default_fatal_patterns() -> Vec<String> {
  [
    "conversion failed",
    "invalid data found when processing input",
    "could not write header",
    "connection refused",
    "no such file or directory",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

/// Size and modification time of a file, used to tell whether the transcoder
/// wrote to a path or something else left it there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
  len: u64,
  modified: Option<SystemTime>,
}

impl FileStamp {
  /// `None` when nothing is at `path`.
  pub async fn read(path: &Path) -> Option<Self> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some(Self {
      len: meta.len(),
      modified: meta.modified().ok(),
    })
  }
}

/// Where the transcoder binaries live and where preview scratch goes.
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
  pub ffmpeg_bin: PathBuf,
  pub ffplay_bin: PathBuf,
  pub preview_dir: PathBuf,
  pub fatal_patterns: Vec<String>,
  /// Diagnostic lines kept for `PipelineHandle::diagnostics`.
  pub diagnostics_capacity: usize,
}

impl Default for TranscoderConfig {
  fn default() -> Self {
    Self {
      ffmpeg_bin: PathBuf::from("ffmpeg"),
      ffplay_bin: PathBuf::from("ffplay"),
      preview_dir: PathBuf::from("./data/preview"),
      fatal_patterns: default_fatal_patterns(),
      diagnostics_capacity: 64,
    }
  }
}

/// Fully resolved transcoder invocation for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePlan {
  pub program: PathBuf,
  pub args: Vec<String>,
  pub input_url: String,
  /// File whose appearance means the transcoder is producing output.
  pub ready_artifact: Option<PathBuf>,
  /// Directory holding `stream.m3u8` / `stream*.ts` scratch files.
  pub scratch_dir: Option<PathBuf>,
  /// Recording kept after a completed session, removed after an aborted start.
  pub recording: Option<PathBuf>,
}

impl PipelinePlan {
  pub fn build(
    config: &SessionConfig,
    input_url: &str,
    protocol: StreamProtocol,
    transcoder: &TranscoderConfig,
  ) -> Self {
    let mut args: Vec<String> = Vec::new();
    if !config.verbose {
      args.extend(["-loglevel".to_string(), "error".to_string()]);
    }
    args.extend(LATENCY_FLAGS.iter().map(|s| s.to_string()));
    // The legacy feed is an HLS playlist, let the demuxer probe it.
    if protocol == StreamProtocol::Modern {
      args.extend(["-f".to_string(), "mpegts".to_string()]);
    }
    args.extend(["-i".to_string(), input_url.to_string()]);

    let mut plan = PipelinePlan {
      program: transcoder.ffmpeg_bin.clone(),
      args,
      input_url: input_url.to_string(),
      ready_artifact: None,
      scratch_dir: None,
      recording: None,
    };

    match &config.mode {
      SessionMode::Preview { target: PreviewTarget::Segmented } => {
        let dir = transcoder.preview_dir.clone();
        let playlist = dir.join(PLAYLIST_NAME);
        let segments = dir.join(format!("{}%d.ts", SEGMENT_PREFIX));
        push_all(
          &mut plan.args,
          &[
            "-pix_fmt",
            "yuv420p",
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-f",
            "hls",
            "-hls_time",
            "1",
            "-hls_list_size",
            "3",
            "-hls_flags",
            "delete_segments+omit_endlist",
            "-hls_segment_type",
            "mpegts",
            "-hls_segment_filename",
          ],
        );
        plan.args.push(segments.to_string_lossy().into_owned());
        plan.args.push("-y".into());
        plan.args.push(playlist.to_string_lossy().into_owned());
        plan.ready_artifact = Some(playlist);
        plan.scratch_dir = Some(dir);
      }
      SessionMode::Preview { target: PreviewTarget::Player } => {
        plan.program = transcoder.ffplay_bin.clone();
      }
      SessionMode::Restream { sink } => {
        push_all(&mut plan.args, &["-f", "mpegts", "-vcodec", "copy"]);
        plan.args.push(sink.clone());
      }
      SessionMode::Save { format, .. } => {
        if *format == SaveFormat::Ts {
          push_all(&mut plan.args, &["-acodec", "copy", "-vcodec", "copy"]);
        }
        if let Some(path) = config.save_path() {
          plan.args.push("-y".into());
          plan.args.push(path.to_string_lossy().into_owned());
          plan.ready_artifact = Some(path.clone());
          plan.recording = Some(path);
        }
      }
    }

    plan
  }

  pub fn program_name(&self) -> String {
    self.program.to_string_lossy().into_owned()
  }

  /// Creates the directories the transcoder writes into.
  pub async fn prepare_dirs(&self) -> io::Result<()> {
    if let Some(dir) = &self.scratch_dir {
      tokio::fs::create_dir_all(dir).await?;
    }
    if let Some(parent) = self.recording.as_deref().and_then(Path::parent) {
      if !parent.as_os_str().is_empty() {
        tokio::fs::create_dir_all(parent).await?;
      }
    }
    Ok(())
  }

  /// Removes preview scratch files. Missing files are not an error.
  pub async fn remove_scratch(&self) -> io::Result<usize> {
    match &self.scratch_dir {
      Some(dir) => remove_scratch_files(dir).await,
      None => Ok(0),
    }
  }

  /// Stamp of whatever sits at the ready artifact before the transcoder runs.
  pub async fn artifact_stamp(&self) -> Option<FileStamp> {
    match &self.ready_artifact {
      Some(path) => FileStamp::read(path).await,
      None => None,
    }
  }

  /// Removes the partial recording of a session that never reached Running.
  /// A file that still matches `prior` was not written by this session and
  /// is left alone.
  pub async fn discard_recording(&self, prior: Option<FileStamp>) {
    if let Some(path) = &self.recording {
      let current = FileStamp::read(path).await;
      if current.is_none() {
        return;
      }
      if current == prior {
        info!(path = ?path, "keeping existing recording untouched by this session");
        return;
      }
      match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = ?path, "removed partial recording"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "failed to remove partial recording"),
      }
    }
  }
}

fn push_all(args: &mut Vec<String>, items: &[&str]) {
  args.extend(items.iter().map(|s| s.to_string()));
}

fn is_scratch_file(name: &str) -> bool {
  name.starts_with(SEGMENT_PREFIX)
    && (name.ends_with(".ts") || name.ends_with(".m3u8") || name.ends_with(".m3u8.tmp"))
}

/// Deletes `stream.m3u8` and `stream*.ts` in `dir`, returning how many were removed.
pub async fn remove_scratch_files(dir: &Path) -> io::Result<usize> {
  let mut entries = match tokio::fs::read_dir(dir).await {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
    Err(e) => return Err(e),
  };

  let mut removed = 0;
  while let Some(entry) = entries.next_entry().await? {
    let name = entry.file_name();
    let Some(name) = name.to_str() else { continue };
    if !is_scratch_file(name) {
      continue;
    }
    match tokio::fs::remove_file(entry.path()).await {
      Ok(()) => removed += 1,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => return Err(e),
    }
  }
  if removed > 0 {
    debug!(dir = ?dir, removed, "removed preview scratch files");
  }
  Ok(removed)
}
