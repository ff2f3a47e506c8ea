use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<M: prometheus::core::Collector + Clone + 'static>(metric: M) -> M {
  REGISTRY.register(Box::new(metric.clone())).ok();
  metric
}

fn counter(name: &str, help: &str) -> IntCounter {
  match IntCounter::new(name, help) {
    Ok(c) => register(c),
    Err(e) => panic!("invalid counter {name}: {e}"),
  }
}

pub static SESSIONS_STARTED_TOTAL: Lazy<IntCounter> =
  Lazy::new(|| counter("sessions_started_total", "Total session start requests accepted"));

pub static SESSIONS_FAILED_TOTAL: Lazy<IntCounter> =
  Lazy::new(|| counter("sessions_failed_total", "Total sessions that ended in the Failed phase"));

pub static SESSION_RUNNING: Lazy<IntGauge> = Lazy::new(|| match IntGauge::new("session_running", "1 while a session is running") {
  Ok(g) => register(g),
  Err(e) => panic!("invalid gauge session_running: {e}"),
});

pub static HEARTBEATS_SENT_TOTAL: Lazy<IntCounter> =
  Lazy::new(|| counter("heartbeats_sent_total", "Total keep-alive datagrams sent"));

pub static HEARTBEAT_SEND_ERRORS_TOTAL: Lazy<IntCounter> =
  Lazy::new(|| counter("heartbeat_send_errors_total", "Total keep-alive datagrams that failed to send"));

pub static PIPELINE_SPAWNS_TOTAL: Lazy<IntCounter> =
  Lazy::new(|| counter("pipeline_spawns_total", "Total transcoder processes spawned"));

pub static PIPELINE_FATAL_LINES_TOTAL: Lazy<IntCounter> =
  Lazy::new(|| counter("pipeline_fatal_lines_total", "Total transcoder diagnostic lines matching a fatal pattern"));

pub fn render() -> String {
  let mut buf = Vec::new();
  let encoder = TextEncoder::new();
  let mfs = REGISTRY.gather();
  encoder.encode(&mfs, &mut buf).ok();
  String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_render_includes_registered_metrics() {
    SESSIONS_STARTED_TOTAL.inc();
    SESSION_RUNNING.set(0);
    let text = render();
    assert!(text.contains("sessions_started_total"));
    assert!(text.contains("session_running"));
  }
}
