use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const DEFAULT_CONTROL_IP: Ipv4Addr = Ipv4Addr::new(10, 5, 5, 9);
pub const DEFAULT_HEARTBEAT_PORT: u16 = 8554;
pub const DEFAULT_VIDEO_PORT: u16 = 8554;
pub const DEFAULT_UDP_OPTIONS: &str = "?fifo_size=0";
pub const LEGACY_PREVIEW_PORT: u16 = 8080;

/// How the camera is told to start its live feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamProtocol {
  /// `gpStream` restart command, feed is MPEG-TS over UDP, kept alive by heartbeat.
  Modern,
  /// Password-gated preview, feed is an HLS playlist served by the camera.
  Legacy,
}

/// What the controller learned about the camera at session start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CameraProfile {
  pub firmware_version: String,
  pub model_name: String,
  pub supports_modern_protocol: bool,
  pub stream_target_ip: IpAddr,
  pub protocol: StreamProtocol,
  /// Firmware families that need a status poll before the feed is usable.
  pub requires_readiness_poll: bool,
}

/// Fixed network coordinates of the camera.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamTarget {
  pub control_ip: IpAddr,
  pub heartbeat_port: u16,
  pub video_port: u16,
  pub udp_options: String,
}

impl Default for StreamTarget {
  fn default() -> Self {
    Self {
      control_ip: IpAddr::V4(DEFAULT_CONTROL_IP),
      heartbeat_port: DEFAULT_HEARTBEAT_PORT,
      video_port: DEFAULT_VIDEO_PORT,
      udp_options: DEFAULT_UDP_OPTIONS.to_string(),
    }
  }
}

impl StreamTarget {
  pub fn heartbeat_addr(&self) -> SocketAddr {
    SocketAddr::new(self.control_ip, self.heartbeat_port)
  }

  /// Transcoder input for the given profile.
  pub fn input_url(&self, profile: &CameraProfile) -> String {
    match profile.protocol {
      StreamProtocol::Modern => format!(
        "udp://{}:{}{}",
        profile.stream_target_ip, self.video_port, self.udp_options
      ),
      StreamProtocol::Legacy => format!(
        "http://{}:{}/live/amba.m3u8",
        self.control_ip, LEGACY_PREVIEW_PORT
      ),
    }
  }
}
