#![allow(dead_code)]

use anyhow::Result;
use axum::{
  extract::State,
  http::Uri,
  response::{IntoResponse, Response},
  Json, Router,
};
use camera_control::{HttpCameraClient, ModelResolver};
use common::camera::StreamTarget;
use serde_json::json;
use session_node::{ControllerSettings, SessionController, TranscoderConfig};
use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::{net::TcpListener, task::JoinHandle, time::Duration};

/// In-process stand-in for the camera's HTTP control endpoint. Records every
/// request path (with query) it receives.
pub struct FakeCamera {
  pub model: String,
  pub firmware: String,
  /// Answer `gp/gpControl` with something that isn't JSON.
  pub legacy: bool,
  pub ready: AtomicBool,
  requests: Mutex<Vec<String>>,
}

impl FakeCamera {
  pub fn modern(model: &str, firmware: &str) -> Self {
    Self {
      model: model.into(),
      firmware: firmware.into(),
      legacy: false,
      ready: AtomicBool::new(true),
      requests: Mutex::new(Vec::new()),
    }
  }

  pub fn legacy(firmware: &str) -> Self {
    Self {
      legacy: true,
      ..Self::modern("", firmware)
    }
  }

  pub fn not_ready(mut self) -> Self {
    self.ready = AtomicBool::new(false);
    self
  }

  pub fn requests(&self) -> Vec<String> {
    self.requests.lock().unwrap().clone()
  }

  pub fn saw(&self, fragment: &str) -> bool {
    self.requests().iter().any(|r| r.contains(fragment))
  }

  pub fn count(&self, fragment: &str) -> usize {
    self.requests().iter().filter(|r| r.contains(fragment)).count()
  }
}

async fn camera_handler(State(camera): State<Arc<FakeCamera>>, uri: Uri) -> Response {
  let path = uri
    .path_and_query()
    .map(|p| p.as_str())
    .unwrap_or("/")
    .trim_start_matches('/')
    .to_string();
  camera.requests.lock().unwrap().push(path);

  match uri.path() {
    "/gp/gpControl" if camera.legacy => "<html>unknown</html>".into_response(),
    "/gp/gpControl" => Json(json!({
      "info": {
        "model_name": camera.model,
        "firmware_version": camera.firmware,
        "serial_number": "C3000000000000",
      }
    }))
    .into_response(),
    "/gp/gpControl/status" => {
      let ready = i64::from(camera.ready.load(Ordering::SeqCst));
      Json(json!({ "status": { "31": ready, "8": 0 }, "settings": {} })).into_response()
    }
    "/camera/cv" => format!("\u{0}\u{c}{}\u{0}", camera.firmware).into_response(),
    "/bacpac/sd" => "\u{0}\u{8}pass-word!".into_response(),
    _ => Json(json!({})).into_response(),
  }
}

pub async fn spawn_router(router: Router) -> Result<(SocketAddr, JoinHandle<()>)> {
  let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
  let addr = listener.local_addr()?;
  let handle = tokio::spawn(async move {
    axum::serve(listener, router.into_make_service())
      .await
      .expect("server failed");
  });
  Ok((addr, handle))
}

pub async fn spawn_camera(camera: Arc<FakeCamera>) -> Result<SocketAddr> {
  let router = Router::new().fallback(camera_handler).with_state(camera);
  let (addr, _handle) = spawn_router(router).await?;
  Ok(addr)
}

/// What the stand-in transcoder does once launched.
#[derive(Debug, Clone, Copy)]
pub enum Transcoder {
  /// Creates its output file (last argument) and keeps running.
  Produce,
  /// Keeps running without writing anything.
  Idle,
  /// Produces output, then reports a terminal failure while still running.
  FailAfterStart,
  /// Produces output, then logs a recoverable decode error and keeps running.
  Glitchy,
  /// Complains about its input and exits before producing anything.
  ExitEarly,
  /// Not installed: the configured binary does not exist.
  Missing,
}

pub fn fake_transcoder(dir: &Path, behavior: Transcoder) -> Result<PathBuf> {
  let body = match behavior {
    Transcoder::Produce => "{ printf 'frames' > \"$last\"; } 2>/dev/null\nexec sleep 30\n",
    Transcoder::Idle => "exec sleep 30\n",
    Transcoder::FailAfterStart => {
      "{ printf 'frames' > \"$last\"; } 2>/dev/null\nsleep 0.3\necho '[mpegts @ 0x55] Could not write header for output file #0' >&2\necho 'Conversion failed!' >&2\nexec sleep 30\n"
    }
    Transcoder::Glitchy => {
      "{ printf 'frames' > \"$last\"; } 2>/dev/null\nsleep 0.2\necho '[h264 @ 0x55] error while decoding MB 12 7, bytestream -5' >&2\necho '[h264 @ 0x55] concealing 412 DC, 412 AC, 412 MV errors in P frame' >&2\nexec sleep 30\n"
    }
    Transcoder::ExitEarly => {
      "echo 'udp://10.5.5.100:8554: Invalid data found when processing input' >&2\nexit 1\n"
    }
    Transcoder::Missing => return Ok(dir.join("bin").join("ffmpeg")),
  };
  let script = format!(
    "#!/bin/sh\nlast=\"\"\nfor arg in \"$@\"; do last=\"$arg\"; done\n{}",
    body
  );

  let path = dir.join(format!("transcoder-{:?}.sh", behavior).to_lowercase());
  std::fs::write(&path, script)?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
  }
  Ok(path)
}

/// Everything an end-to-end session test needs, torn down with the tempdir.
pub struct Harness {
  pub controller: SessionController,
  pub camera: Arc<FakeCamera>,
  /// Receives the controller's keep-alive datagrams.
  pub heartbeat_sink: UdpSocket,
  pub dir: TempDir,
}

impl Harness {
  pub async fn new(camera: FakeCamera, behavior: Transcoder) -> Result<Self> {
    Self::with_resolver(camera, behavior, ModelResolver::default()).await
  }

  pub async fn with_resolver(camera: FakeCamera, behavior: Transcoder, resolver: ModelResolver) -> Result<Self> {
    let dir = tempfile::tempdir()?;
    let camera = Arc::new(camera);
    let addr = spawn_camera(camera.clone()).await?;

    let heartbeat_sink = UdpSocket::bind("127.0.0.1:0")?;
    heartbeat_sink.set_nonblocking(true)?;

    let script = fake_transcoder(dir.path(), behavior)?;
    let settings = ControllerSettings {
      target: StreamTarget {
        control_ip: "127.0.0.1".parse()?,
        heartbeat_port: heartbeat_sink.local_addr()?.port(),
        ..StreamTarget::default()
      },
      heartbeat_interval: Duration::from_millis(50),
      pipeline_grace: Duration::from_secs(1),
      ready_timeout: Duration::from_secs(3),
      stream_reset_settle: Duration::ZERO,
      stream_start_settle: Duration::ZERO,
      transcoder: TranscoderConfig {
        ffmpeg_bin: script.clone(),
        ffplay_bin: script,
        preview_dir: dir.path().join("preview"),
        ..TranscoderConfig::default()
      },
    };

    let client = HttpCameraClient::new(&format!("http://{}", addr), Duration::from_secs(2))?;
    let controller = SessionController::new(Arc::new(client), resolver, settings);

    Ok(Self {
      controller,
      camera,
      heartbeat_sink,
      dir,
    })
  }

  pub fn preview_dir(&self) -> PathBuf {
    self.dir.path().join("preview")
  }

  pub fn recordings_dir(&self) -> PathBuf {
    self.dir.path().join("recordings")
  }

  /// Keep-alive datagrams received since the last call.
  pub fn drain_heartbeats(&self) -> Vec<String> {
    let mut frames = Vec::new();
    let mut buf = [0u8; 128];
    while let Ok(n) = self.heartbeat_sink.recv(&mut buf) {
      frames.push(String::from_utf8_lossy(&buf[..n]).to_string());
    }
    frames
  }

  /// Names of preview scratch files still on disk.
  pub fn scratch_files(&self) -> Vec<String> {
    match std::fs::read_dir(self.preview_dir()) {
      Ok(entries) => entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("stream"))
        .collect(),
      Err(_) => Vec::new(),
    }
  }
}
