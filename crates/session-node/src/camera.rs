use async_trait::async_trait;
use camera_control::{Ack, CameraClient, CameraError, CameraInfo, CameraStatus};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Wraps a camera client so that at most one request is in flight at a time.
/// The camera's HTTP server gives no guarantees under concurrent commands.
pub struct SerializedCamera {
  inner: Arc<dyn CameraClient>,
  gate: Mutex<()>,
}

impl SerializedCamera {
  pub fn new(inner: Arc<dyn CameraClient>) -> Self {
    Self {
      inner,
      gate: Mutex::new(()),
    }
  }
}

#[async_trait]
impl CameraClient for SerializedCamera {
  async fn send_command(&self, path: &str) -> Result<Ack, CameraError> {
    let _gate = self.gate.lock().await;
    self.inner.send_command(path).await
  }

  async fn info(&self) -> Result<CameraInfo, CameraError> {
    let _gate = self.gate.lock().await;
    self.inner.info().await
  }

  async fn status(&self) -> Result<CameraStatus, CameraError> {
    let _gate = self.gate.lock().await;
    self.inner.status().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[derive(Default)]
  struct SlowCamera {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
  }

  #[async_trait]
  impl CameraClient for SlowCamera {
    async fn send_command(&self, path: &str) -> Result<Ack, CameraError> {
      let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.max_in_flight.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      self.in_flight.fetch_sub(1, Ordering::SeqCst);
      Ok(Ack { body: path.to_string() })
    }

    async fn info(&self) -> Result<CameraInfo, CameraError> {
      Ok(CameraInfo::default())
    }

    async fn status(&self) -> Result<CameraStatus, CameraError> {
      Ok(CameraStatus::default())
    }
  }

  #[tokio::test]
  async fn test_commands_never_overlap() {
    let slow = Arc::new(SlowCamera::default());
    let camera = Arc::new(SerializedCamera::new(slow.clone()));

    let mut tasks = Vec::new();
    for _ in 0..5 {
      let camera = camera.clone();
      tasks.push(tokio::spawn(async move {
        camera.start_stream().await.unwrap();
        camera.stop_stream().await.unwrap();
      }));
    }
    for task in tasks {
      task.await.unwrap();
    }

    assert_eq!(slow.max_in_flight.load(Ordering::SeqCst), 1);
  }
}
