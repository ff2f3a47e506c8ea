use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FileStamp, PipelinePlan, TranscoderConfig};
use crate::error::SessionError;
use crate::metrics;

const READY_POLL: Duration = Duration::from_millis(100);

/// State-affecting news from the transcoder watcher. At most one of each is
/// sent per process, and none after `stop` has been requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
  Fatal { line: String },
  Exited { code: Option<i32> },
}

#[derive(Debug, thiserror::Error)]
pub enum ReadyError {
  #[error("transcoder exited before producing output ({status})")]
  Exited { status: String },
  #[error("no output after {0:?}")]
  Timeout(Duration),
}

/// How the transcoder process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
  pub code: Option<i32>,
  pub description: String,
}

type DiagnosticsBuf = Arc<Mutex<VecDeque<String>>>;
type StderrLines = Lines<BufReader<ChildStderr>>;

/// A running transcoder process. The child itself is owned by a watcher task
/// that reads stderr, reports fatal lines and publishes the exit status.
pub struct PipelineHandle {
  pid: Option<u32>,
  program: String,
  exit_rx: watch::Receiver<Option<ProcessExit>>,
  diagnostics: DiagnosticsBuf,
  stopping: CancellationToken,
  force_kill: CancellationToken,
  task: Option<JoinHandle<()>>,
}

struct Watcher {
  program: String,
  verbose: bool,
  fatal_patterns: Vec<String>,
  capacity: usize,
  diagnostics: DiagnosticsBuf,
  stopping: CancellationToken,
  force_kill: CancellationToken,
  exit_tx: watch::Sender<Option<ProcessExit>>,
  events: mpsc::Sender<PipelineEvent>,
}

impl PipelineHandle {
  pub fn spawn(
    plan: &PipelinePlan,
    transcoder: &TranscoderConfig,
    verbose: bool,
    events: mpsc::Sender<PipelineEvent>,
  ) -> Result<Self, SessionError> {
    let program = plan.program_name();
    info!(program = %program, args = ?plan.args, "launching transcoder");

    let mut child = Command::new(&plan.program)
      .args(&plan.args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| SessionError::SpawnFailed {
        program: program.clone(),
        source,
      })?;
    metrics::PIPELINE_SPAWNS_TOTAL.inc();

    let pid = child.id();
    let stderr = child.stderr.take();
    let (exit_tx, exit_rx) = watch::channel(None);
    let diagnostics: DiagnosticsBuf = Arc::new(Mutex::new(VecDeque::new()));
    let stopping = CancellationToken::new();
    let force_kill = CancellationToken::new();

    let watcher = Watcher {
      program: program.clone(),
      verbose,
      fatal_patterns: transcoder.fatal_patterns.iter().map(|p| p.to_lowercase()).collect(),
      capacity: transcoder.diagnostics_capacity.max(1),
      diagnostics: diagnostics.clone(),
      stopping: stopping.clone(),
      force_kill: force_kill.clone(),
      exit_tx,
      events,
    };
    let task = tokio::spawn(watcher.run(child, stderr.map(|s| BufReader::new(s).lines())));

    info!(program = %program, pid = ?pid, "transcoder started");
    Ok(Self {
      pid,
      program,
      exit_rx,
      diagnostics,
      stopping,
      force_kill,
      task: Some(task),
    })
  }

  pub fn pid(&self) -> Option<u32> {
    self.pid
  }

  pub fn is_alive(&self) -> bool {
    self.exit_rx.borrow().is_none()
  }

  pub fn exit_status(&self) -> Option<ProcessExit> {
    self.exit_rx.borrow().clone()
  }

  /// Snapshot of the most recent diagnostic lines, oldest first. Never blocks
  /// on the process.
  pub fn diagnostics(&self) -> impl Iterator<Item = String> {
    let lines: Vec<String> = match self.diagnostics.lock() {
      Ok(buf) => buf.iter().cloned().collect(),
      Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
    };
    lines.into_iter()
  }

  /// Last few diagnostic lines joined for an error message.
  pub fn diagnostics_tail(&self, n: usize) -> String {
    let lines: Vec<String> = self.diagnostics().collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..].join(" | ")
  }

  /// Waits until `artifact` exists and differs from `prior`, the stamp taken
  /// before the process was spawned. Fails if the process exits first or the
  /// timeout elapses.
  pub async fn wait_ready(
    &self,
    artifact: &Path,
    prior: Option<FileStamp>,
    timeout: Duration,
  ) -> Result<(), ReadyError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      let current = FileStamp::read(artifact).await;
      if current.is_some() && current != prior {
        debug!(artifact = ?artifact, "transcoder output ready");
        return Ok(());
      }
      if let Some(status) = self.exit_status() {
        return Err(ReadyError::Exited {
          status: status.description,
        });
      }
      if tokio::time::Instant::now() >= deadline {
        return Err(ReadyError::Timeout(timeout));
      }
      tokio::time::sleep(READY_POLL).await;
    }
  }

  /// Asks the process to terminate, escalating to a kill after `grace`.
  /// Suppresses the exit notification. Safe to call more than once.
  pub async fn stop(&mut self, grace: Duration) -> Option<ProcessExit> {
    self.stopping.cancel();

    if self.is_alive() {
      self.terminate();
      let mut exit_rx = self.exit_rx.clone();
      let exited = tokio::time::timeout(grace, exit_rx.wait_for(|s| s.is_some()))
        .await
        .is_ok();
      if !exited {
        warn!(program = %self.program, pid = ?self.pid, grace_ms = grace.as_millis() as u64,
          "transcoder ignored termination request, killing");
        self.force_kill.cancel();
      }
    }

    if let Some(task) = self.task.take() {
      if let Err(e) = task.await {
        warn!(program = %self.program, error = %e, "transcoder watcher ended abnormally");
      }
    }

    let status = self.exit_status();
    info!(program = %self.program, pid = ?self.pid, status = ?status, "transcoder stopped");
    status
  }

  #[cfg(unix)]
  fn terminate(&self) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
      self.force_kill.cancel();
      return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
      debug!(pid, error = %e, "SIGTERM failed, killing");
      self.force_kill.cancel();
    }
  }

  #[cfg(not(unix))]
  fn terminate(&self) {
    self.force_kill.cancel();
  }
}

impl Drop for PipelineHandle {
  fn drop(&mut self) {
    self.stopping.cancel();
    self.force_kill.cancel();
  }
}

impl Watcher {
  async fn run(self, mut child: Child, mut lines: Option<StderrLines>) {
    let mut reported_fatal = false;

    let status = loop {
      tokio::select! {
        _ = self.force_kill.cancelled() => {
          if let Err(e) = child.kill().await {
            warn!(program = %self.program, error = %e, "failed to kill transcoder");
          }
          break child.wait().await;
        }
        status = child.wait() => break status,
        line = next_line(&mut lines) => match line {
          Some(line) => {
            if self.record(&line) && !reported_fatal && !self.stopping.is_cancelled() {
              reported_fatal = true;
              let _ = self.events.send(PipelineEvent::Fatal { line }).await;
            }
          }
          None => lines = None,
        },
      }
    };

    // Pick up whatever the process printed on its way out.
    if let Some(mut rest) = lines {
      while let Ok(Ok(Some(line))) = tokio::time::timeout(READY_POLL, rest.next_line()).await {
        self.record(&line);
      }
    }

    let exit = match status {
      Ok(status) => ProcessExit {
        code: status.code(),
        description: status.to_string(),
      },
      Err(e) => ProcessExit {
        code: None,
        description: format!("wait failed: {}", e),
      },
    };
    let code = exit.code;
    self.exit_tx.send_replace(Some(exit));
    if !self.stopping.is_cancelled() {
      warn!(program = %self.program, code = ?code, "transcoder exited unexpectedly");
      let _ = self.events.send(PipelineEvent::Exited { code }).await;
    }
  }

  /// Stores a diagnostic line and reports whether it matches a fatal pattern.
  fn record(&self, line: &str) -> bool {
    if self.verbose {
      info!(program = %self.program, "{}", line);
    } else {
      debug!(program = %self.program, "{}", line);
    }

    let mut buf = match self.diagnostics.lock() {
      Ok(buf) => buf,
      Err(poisoned) => poisoned.into_inner(),
    };
    if buf.len() == self.capacity {
      buf.pop_front();
    }
    buf.push_back(line.to_string());
    drop(buf);

    let lower = line.to_lowercase();
    let fatal = self.fatal_patterns.iter().any(|p| lower.contains(p.as_str()));
    if fatal {
      metrics::PIPELINE_FATAL_LINES_TOTAL.inc();
      warn!(program = %self.program, line = %line, "transcoder reported a fatal condition");
    }
    fatal
  }
}

async fn next_line(lines: &mut Option<StderrLines>) -> Option<String> {
  match lines {
    Some(lines) => lines.next_line().await.ok().flatten(),
    None => std::future::pending().await,
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use std::path::PathBuf;

  fn plan(script: &str) -> PipelinePlan {
    PipelinePlan {
      program: PathBuf::from("sh"),
      args: vec!["-c".into(), script.into()],
      input_url: "udp://127.0.0.1:8554".into(),
      ready_artifact: None,
      scratch_dir: None,
      recording: None,
    }
  }

  fn spawn(script: &str) -> (PipelineHandle, mpsc::Receiver<PipelineEvent>) {
    let (tx, rx) = mpsc::channel(8);
    let handle = PipelineHandle::spawn(&plan(script), &TranscoderConfig::default(), false, tx).unwrap();
    (handle, rx)
  }

  #[tokio::test]
  async fn test_spawn_failure_is_reported() {
    let (tx, _rx) = mpsc::channel(1);
    let mut bad = plan("true");
    bad.program = PathBuf::from("/nonexistent/ffmpeg");
    let err = PipelineHandle::spawn(&bad, &TranscoderConfig::default(), false, tx).err().unwrap();
    assert!(matches!(err, SessionError::SpawnFailed { .. }));
  }

  #[tokio::test]
  async fn test_fatal_line_is_reported_once() {
    let (handle, mut rx) = spawn(
      "echo '[h264 @ 0x55] error while decoding MB 3 9' >&2; echo 'Conversion failed!' >&2; echo 'Conversion failed!' >&2; sleep 5",
    );
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(
      event,
      Some(PipelineEvent::Fatal {
        line: "Conversion failed!".into()
      })
    );
    assert!(handle.is_alive());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.diagnostics().count(), 3);
  }

  #[tokio::test]
  async fn test_unexpected_exit_is_reported() {
    let (handle, mut rx) = spawn("echo 'frame=1' >&2; exit 3");
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(event, Some(PipelineEvent::Exited { code: Some(3) }));
    assert!(!handle.is_alive());
    assert_eq!(handle.diagnostics().collect::<Vec<_>>(), vec!["frame=1".to_string()]);
  }

  #[tokio::test]
  async fn test_stop_is_graceful_and_silent() {
    let (mut handle, mut rx) = spawn("sleep 30");
    let status = handle.stop(Duration::from_secs(2)).await;
    assert!(status.is_some());
    assert!(!handle.is_alive());
    assert!(rx.recv().await.is_none());
    // second stop is a no-op
    handle.stop(Duration::from_secs(2)).await;
  }

  #[tokio::test]
  async fn test_stop_escalates_to_kill() {
    let (mut handle, _rx) = spawn("trap '' TERM; sleep 30");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = std::time::Instant::now();
    handle.stop(Duration::from_millis(300)).await;
    assert!(!handle.is_alive());
    assert!(started.elapsed() < Duration::from_secs(5));
  }

  #[tokio::test]
  async fn test_wait_ready() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.ts");
    let (mut handle, _rx) = spawn(&format!("sleep 0.2; touch {}; sleep 30", out.display()));
    handle.wait_ready(&out, None, Duration::from_secs(3)).await.unwrap();
    handle.stop(Duration::from_secs(1)).await;

    let (handle, _rx) = spawn("exit 1");
    let err = handle
      .wait_ready(&dir.path().join("never"), None, Duration::from_secs(3))
      .await
      .err()
      .unwrap();
    assert!(matches!(err, ReadyError::Exited { .. }));

    let (mut handle, _rx) = spawn("sleep 30");
    let err = handle
      .wait_ready(&dir.path().join("never"), None, Duration::from_millis(200))
      .await
      .err()
      .unwrap();
    assert!(matches!(err, ReadyError::Timeout(_)));
    handle.stop(Duration::from_secs(1)).await;
  }

  #[tokio::test]
  async fn test_wait_ready_ignores_leftover_output() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("ride.ts");
    std::fs::write(&out, b"earlier session").unwrap();
    let prior = FileStamp::read(&out).await;

    let (mut handle, _rx) = spawn("sleep 30");
    let err = handle
      .wait_ready(&out, prior, Duration::from_millis(300))
      .await
      .err()
      .unwrap();
    assert!(matches!(err, ReadyError::Timeout(_)));
    handle.stop(Duration::from_secs(1)).await;

    let (mut handle, _rx) = spawn(&format!("sleep 0.2; printf 'new output' > {}; sleep 30", out.display()));
    handle.wait_ready(&out, prior, Duration::from_secs(3)).await.unwrap();
    handle.stop(Duration::from_secs(1)).await;
  }
}
