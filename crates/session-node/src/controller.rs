use camera_control::{CameraClient, CameraInfo, CameraStatus, ModelResolver};
use common::camera::{CameraProfile, StreamProtocol, StreamTarget};
use common::session::{SessionConfig, SessionPhase, SessionSnapshot};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::camera::SerializedCamera;
use crate::error::SessionError;
use crate::heartbeat::Heartbeat;
use crate::metrics;
use crate::pipeline::{FileStamp, PipelineEvent, PipelineHandle, PipelinePlan, TranscoderConfig};

/// Timing and external-tool settings for a controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
  pub target: StreamTarget,
  pub heartbeat_interval: Duration,
  pub pipeline_grace: Duration,
  pub ready_timeout: Duration,
  /// Pause after the stale-stream stop before asking for a restart.
  pub stream_reset_settle: Duration,
  /// Pause after the restart before polling or pressing the shutter.
  pub stream_start_settle: Duration,
  pub transcoder: TranscoderConfig,
}

impl Default for ControllerSettings {
  fn default() -> Self {
    Self {
      target: StreamTarget::default(),
      heartbeat_interval: Duration::from_millis(2500),
      pipeline_grace: Duration::from_secs(5),
      ready_timeout: Duration::from_secs(10),
      stream_reset_settle: Duration::from_secs(2),
      stream_start_settle: Duration::from_secs(3),
      transcoder: TranscoderConfig::default(),
    }
  }
}

/// Result of probing the camera without starting a session.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
  pub info: CameraInfo,
  pub profile: Option<CameraProfile>,
  pub unsupported_reason: Option<String>,
}

/// Everything a session holds on to. Filled in step by step while starting,
/// so a failed or cancelled start releases exactly what it acquired.
#[derive(Default)]
struct SessionParts {
  profile: Option<CameraProfile>,
  input_url: Option<String>,
  stream_requested: bool,
  shutter_pressed: bool,
  heartbeat: Option<Heartbeat>,
  plan: Option<PipelinePlan>,
  /// What sat at the output path before the transcoder was spawned.
  prior_output: Option<FileStamp>,
  pipeline: Option<PipelineHandle>,
  events: Option<mpsc::Receiver<PipelineEvent>>,
}

impl SessionParts {
  async fn stop_heartbeat(&mut self) {
    if let Some(mut heartbeat) = self.heartbeat.take() {
      heartbeat.stop().await;
    }
  }
}

struct SessionState {
  phase: SessionPhase,
  /// Bumped on every start so late pipeline events from an older session are ignored.
  generation: u64,
  config: Option<SessionConfig>,
  profile: Option<CameraProfile>,
  input_url: Option<String>,
  /// Present only while Running or Stopping.
  active: Option<SessionParts>,
  pipeline_pid: Option<u32>,
  starting: Option<CancellationToken>,
  last_error: Option<String>,
}

struct Inner {
  camera: Arc<dyn CameraClient>,
  resolver: ModelResolver,
  settings: ControllerSettings,
  state: Mutex<SessionState>,
  snapshot_tx: watch::Sender<SessionSnapshot>,
}

/// Owns the lifecycle of one live-stream session: camera commands, the
/// keep-alive heartbeat and the transcoder process. All transitions are
/// serialized behind a single lock.
#[derive(Clone)]
pub struct SessionController {
  inner: Arc<Inner>,
}

impl SessionController {
  pub fn new(camera: Arc<dyn CameraClient>, resolver: ModelResolver, settings: ControllerSettings) -> Self {
    let state = SessionState {
      phase: SessionPhase::Idle,
      generation: 0,
      config: None,
      profile: None,
      input_url: None,
      active: None,
      pipeline_pid: None,
      starting: None,
      last_error: None,
    };
    let (snapshot_tx, _) = watch::channel(snapshot_of(&state));

    Self {
      inner: Arc::new(Inner {
        camera: Arc::new(SerializedCamera::new(camera)),
        resolver,
        settings,
        state: Mutex::new(state),
        snapshot_tx,
      }),
    }
  }

  pub fn settings(&self) -> &ControllerSettings {
    &self.inner.settings
  }

  /// Camera client shared with the session; requests are serialized.
  pub fn camera(&self) -> &Arc<dyn CameraClient> {
    &self.inner.camera
  }

  /// Latest published state. Never waits on an in-progress transition.
  pub fn snapshot(&self) -> SessionSnapshot {
    self.inner.snapshot_tx.borrow().clone()
  }

  pub fn phase(&self) -> SessionPhase {
    self.inner.snapshot_tx.borrow().phase
  }

  pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
    self.inner.snapshot_tx.subscribe()
  }

  /// Identifies the camera and reports how a session would stream from it.
  pub async fn connect(&self) -> Result<Connection, SessionError> {
    let info = self.inner.camera.info().await.map_err(SessionError::CameraUnreachable)?;
    info!(model = %info.model_name, firmware = %info.firmware_version, legacy = info.legacy, "camera connected");

    let control_ip = self.inner.settings.target.control_ip;
    let (profile, unsupported_reason) = match self.inner.resolver.resolve(&info, control_ip) {
      Ok(profile) => (Some(profile), None),
      Err(e) => {
        warn!(error = %e, "camera cannot be streamed from");
        (None, Some(e.to_string()))
      }
    };
    Ok(Connection {
      info,
      profile,
      unsupported_reason,
    })
  }

  pub async fn camera_status(&self) -> Result<CameraStatus, SessionError> {
    self
      .inner
      .camera
      .status()
      .await
      .map_err(|e| SessionError::camera("status", e))
  }

  /// Brings a session up: identify, resolve, start the camera feed, start the
  /// heartbeat, spawn the transcoder and wait for its first output.
  ///
  /// The returned future must be driven to completion; callers that may be
  /// cancelled (request handlers) should run it on its own task.
  pub async fn start(&self, config: SessionConfig) -> Result<SessionSnapshot, SessionError> {
    config
      .validate()
      .map_err(|e| SessionError::InvalidParameter(e.to_string()))?;

    let (generation, cancel) = {
      let mut state = self.inner.state.lock().await;
      if state.phase.is_active() {
        return Err(SessionError::AlreadyActive(state.phase));
      }
      if state.phase == SessionPhase::Failed {
        info!(last_error = ?state.last_error, "clearing failed session before start");
      }
      state.generation += 1;
      state.phase = SessionPhase::Starting;
      state.config = Some(config.clone());
      state.profile = None;
      state.input_url = None;
      state.last_error = None;
      let cancel = CancellationToken::new();
      state.starting = Some(cancel.clone());
      self.inner.publish(&state);
      (state.generation, cancel)
    };
    metrics::SESSIONS_STARTED_TOTAL.inc();
    info!(generation, mode = config.mode.name(), record_on_camera = config.record_on_camera, "starting session");

    let mut parts = SessionParts::default();
    let outcome = tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(SessionError::Cancelled),
      result = self.inner.bring_up(&config, &mut parts) => result,
    };

    let mut state = self.inner.state.lock().await;
    state.starting = None;
    let outcome = match outcome {
      Ok(()) if cancel.is_cancelled() => Err(SessionError::Cancelled),
      other => other,
    };

    match outcome {
      Ok(()) => {
        if let Some(events) = parts.events.take() {
          tokio::spawn(watch_pipeline(Arc::downgrade(&self.inner), generation, events));
        }
        state.profile = parts.profile.clone();
        state.input_url = parts.input_url.clone();
        state.pipeline_pid = parts.pipeline.as_ref().and_then(|p| p.pid());
        state.active = Some(parts);
        state.phase = SessionPhase::Running;
        self.inner.publish(&state);
        info!(generation, input = ?state.input_url, "session running");
        Ok(snapshot_of(&state))
      }
      Err(err) => {
        self.inner.release(&mut parts, false).await;
        if matches!(err, SessionError::Cancelled) {
          info!(generation, "session start cancelled");
          state.phase = SessionPhase::Idle;
        } else {
          error!(generation, error = %err, kind = err.kind(), "session start failed");
          metrics::SESSIONS_FAILED_TOTAL.inc();
          state.phase = SessionPhase::Failed;
          state.last_error = Some(err.to_string());
        }
        self.inner.publish(&state);
        Err(err)
      }
    }
  }

  /// Stops whatever is running and returns once the controller is Idle.
  /// Calling it when Idle does nothing; calling it when Failed clears the
  /// failure. A stop during Starting cancels the start and waits for its cleanup.
  pub async fn stop(&self) -> Result<SessionSnapshot, SessionError> {
    loop {
      let mut state = self.inner.state.lock().await;
      match state.phase {
        SessionPhase::Idle => return Ok(snapshot_of(&state)),
        SessionPhase::Failed => {
          info!(last_error = ?state.last_error, "clearing failed session");
          state.phase = SessionPhase::Idle;
          self.inner.publish(&state);
          return Ok(snapshot_of(&state));
        }
        SessionPhase::Starting | SessionPhase::Stopping => {
          if let Some(cancel) = &state.starting {
            info!("cancelling session start");
            cancel.cancel();
          }
          drop(state);
          let mut rx = self.subscribe();
          let _ = rx
            .wait_for(|s| !matches!(s.phase, SessionPhase::Starting | SessionPhase::Stopping))
            .await;
        }
        SessionPhase::Running => {
          info!(generation = state.generation, "stopping session");
          state.phase = SessionPhase::Stopping;
          let mut parts = state.active.take().unwrap_or_default();
          parts.stop_heartbeat().await;
          self.inner.publish(&state);

          self.inner.release(&mut parts, true).await;
          state.pipeline_pid = None;
          state.phase = SessionPhase::Idle;
          self.inner.publish(&state);
          info!(generation = state.generation, "session stopped");
          return Ok(snapshot_of(&state));
        }
      }
    }
  }

  /// Alias of `stop`, for clearing a Failed session.
  pub async fn reset(&self) -> Result<SessionSnapshot, SessionError> {
    self.stop().await
  }
}

impl Inner {
  fn publish(&self, state: &SessionState) {
    metrics::SESSION_RUNNING.set(i64::from(state.phase == SessionPhase::Running));
    self.snapshot_tx.send_replace(snapshot_of(state));
  }

  async fn bring_up(&self, config: &SessionConfig, parts: &mut SessionParts) -> Result<(), SessionError> {
    let settings = &self.settings;

    let info = self.camera.info().await.map_err(SessionError::CameraUnreachable)?;
    info!(model = %info.model_name, firmware = %info.firmware_version, "camera identified");

    let profile = self.resolver.resolve(&info, settings.target.control_ip)?;
    let input_url = settings.target.input_url(&profile);
    parts.profile = Some(profile.clone());
    parts.input_url = Some(input_url.clone());

    match profile.protocol {
      StreamProtocol::Modern => {
        // A stream left running by an earlier client blocks the restart.
        if let Err(e) = self.camera.stop_stream().await {
          debug!(error = %e, "stale stream reset failed");
        }
        settle(settings.stream_reset_settle).await;
        parts.stream_requested = true;
        self
          .camera
          .start_stream()
          .await
          .map_err(|e| SessionError::camera("stream start", e))?;
        settle(settings.stream_start_settle).await;

        if profile.requires_readiness_poll {
          let polls = self.resolver.await_ready(self.camera.as_ref()).await?;
          debug!(polls, "camera feed ready");
        }

        if config.record_on_camera {
          parts.shutter_pressed = true;
          self
            .camera
            .start_shutter()
            .await
            .map_err(|e| SessionError::camera("shutter", e))?;
        }
      }
      StreamProtocol::Legacy => {
        self
          .camera
          .enable_legacy_preview()
          .await
          .map_err(|e| SessionError::camera("legacy preview", e))?;
        if config.record_on_camera {
          warn!("recording on camera is not available on legacy cameras");
        }
      }
    }

    let heartbeat = Heartbeat::start(settings.target.heartbeat_addr(), settings.heartbeat_interval).await?;
    parts.heartbeat = Some(heartbeat);

    let plan = PipelinePlan::build(config, &input_url, profile.protocol, &settings.transcoder);
    plan.prepare_dirs().await?;
    plan.remove_scratch().await?;
    parts.prior_output = plan.artifact_stamp().await;
    parts.plan = Some(plan.clone());

    let (tx, rx) = mpsc::channel(8);
    let pipeline = PipelineHandle::spawn(&plan, &settings.transcoder, config.verbose, tx)?;
    parts.events = Some(rx);
    let pipeline = parts.pipeline.insert(pipeline);

    if let Some(artifact) = &plan.ready_artifact {
      if let Err(e) = pipeline.wait_ready(artifact, parts.prior_output, settings.ready_timeout).await {
        let tail = pipeline.diagnostics_tail(3);
        let reason = if tail.is_empty() { e.to_string() } else { format!("{}: {}", e, tail) };
        return Err(SessionError::PipelineFailed(reason));
      }
    }

    Ok(())
  }

  /// Tears down whatever `parts` holds: heartbeat first, then camera
  /// commands, then the transcoder, then scratch files.
  async fn release(&self, parts: &mut SessionParts, keep_recording: bool) {
    parts.stop_heartbeat().await;

    if parts.shutter_pressed {
      parts.shutter_pressed = false;
      if let Err(e) = self.camera.stop_shutter().await {
        warn!(error = %e, "failed to release camera shutter");
      }
    }

    if parts.stream_requested {
      parts.stream_requested = false;
      match self.camera.stop_stream().await {
        Ok(_) => debug!("camera stream stopped"),
        Err(e) => warn!(error = %e, "failed to stop camera stream"),
      }
    }

    if let Some(mut pipeline) = parts.pipeline.take() {
      pipeline.stop(self.settings.pipeline_grace).await;
    }
    parts.events = None;

    if let Some(plan) = &parts.plan {
      if let Err(e) = plan.remove_scratch().await {
        warn!(error = %e, "failed to remove preview scratch files");
      }
      if !keep_recording {
        plan.discard_recording(parts.prior_output).await;
      }
    }
  }

  /// Handles a transcoder event for `generation`. Returns false once the
  /// session it belongs to is gone.
  async fn on_pipeline_event(&self, generation: u64, event: PipelineEvent) -> bool {
    let mut state = self.state.lock().await;
    if state.generation != generation || state.phase != SessionPhase::Running {
      debug!(generation, ?event, "ignoring event for inactive session");
      return false;
    }

    let reason = match &event {
      PipelineEvent::Fatal { line } => format!("transcoder reported: {}", line),
      PipelineEvent::Exited { code } => match code {
        Some(code) => format!("transcoder exited unexpectedly with code {}", code),
        None => "transcoder exited unexpectedly".to_string(),
      },
    };
    let err = SessionError::PipelineFailed(reason);
    error!(generation, error = %err, "session failed");

    if let Some(mut parts) = state.active.take() {
      self.release(&mut parts, true).await;
    }
    metrics::SESSIONS_FAILED_TOTAL.inc();
    state.pipeline_pid = None;
    state.phase = SessionPhase::Failed;
    state.last_error = Some(err.to_string());
    self.publish(&state);
    false
  }
}

async fn settle(pause: Duration) {
  if !pause.is_zero() {
    tokio::time::sleep(pause).await;
  }
}

/// Feeds transcoder events of one session into the controller, one at a time.
async fn watch_pipeline(inner: Weak<Inner>, generation: u64, mut events: mpsc::Receiver<PipelineEvent>) {
  while let Some(event) = events.recv().await {
    let Some(inner) = inner.upgrade() else { return };
    if !inner.on_pipeline_event(generation, event).await {
      return;
    }
  }
}

fn snapshot_of(state: &SessionState) -> SessionSnapshot {
  let active = state.active.as_ref();
  SessionSnapshot {
    phase: state.phase,
    config: state.config.clone(),
    camera: state.profile.clone(),
    heartbeat_active: state.phase == SessionPhase::Running
      && active
        .and_then(|a| a.heartbeat.as_ref())
        .is_some_and(|h| h.is_active()),
    pipeline_pid: state.pipeline_pid,
    input_url: state.input_url.clone(),
    last_error: state.last_error.clone(),
  }
}
