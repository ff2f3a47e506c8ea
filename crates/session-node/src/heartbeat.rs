//! UDP keep-alive sender. The camera drops its live feed unless it receives
//! a command frame on its control port every few seconds.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;

/// Command id the camera treats as "keep the stream alive".
pub const KEEP_ALIVE_COMMAND: u32 = 2;

/// Text frame understood by the camera's UDP control port.
pub fn command_frame(command: u32, param: f64) -> String {
  format!("_GPHD_:{}:{}:{}:{:.6}\n", 0, 0, command, param)
}

pub fn keep_alive_frame() -> String {
  command_frame(KEEP_ALIVE_COMMAND, 0.0)
}

pub struct Heartbeat {
  target: SocketAddr,
  cancel: CancellationToken,
  task: Option<JoinHandle<()>>,
  sent: Arc<AtomicU64>,
}

impl Heartbeat {
  /// Binds an ephemeral socket and sends the first frame immediately, then
  /// one per `interval` until stopped.
  pub async fn start(target: SocketAddr, interval: Duration) -> io::Result<Self> {
    let bind: SocketAddr = if target.is_ipv4() {
      SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
      SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    let cancel = CancellationToken::new();
    let sent = Arc::new(AtomicU64::new(0));

    let task = tokio::spawn(send_loop(
      socket,
      target,
      interval.max(Duration::from_millis(1)),
      cancel.clone(),
      sent.clone(),
    ));

    info!(addr = %target, interval_ms = interval.as_millis() as u64, "heartbeat started");
    Ok(Self {
      target,
      cancel,
      task: Some(task),
      sent,
    })
  }

  pub fn is_active(&self) -> bool {
    !self.cancel.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
  }

  /// Frames successfully handed to the socket so far.
  pub fn sent(&self) -> u64 {
    self.sent.load(Ordering::Relaxed)
  }

  /// Stops sending and waits for the sender task to exit. No frame is sent
  /// after this returns.
  pub async fn stop(&mut self) {
    self.cancel.cancel();
    if let Some(task) = self.task.take() {
      if let Err(e) = task.await {
        warn!(addr = %self.target, error = %e, "heartbeat task ended abnormally");
      }
      info!(addr = %self.target, sent = self.sent(), "heartbeat stopped");
    }
  }
}

impl Drop for Heartbeat {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

async fn send_loop(
  socket: UdpSocket,
  target: SocketAddr,
  interval: Duration,
  cancel: CancellationToken,
  sent: Arc<AtomicU64>,
) {
  let frame = keep_alive_frame();
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      _ = ticker.tick() => {
        // Send failures never end the loop; the next tick tries again.
        match socket.send_to(frame.as_bytes(), target).await {
          Ok(_) => {
            sent.fetch_add(1, Ordering::Relaxed);
            metrics::HEARTBEATS_SENT_TOTAL.inc();
            debug!(addr = %target, "heartbeat sent");
          }
          Err(e) => {
            metrics::HEARTBEAT_SEND_ERRORS_TOTAL.inc();
            warn!(addr = %target, error = %e, "heartbeat send failed");
          }
        }
      }
    }
  }
}
