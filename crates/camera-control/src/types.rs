use crate::error::CameraError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;

/// Identification block returned by `gp/gpControl`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CameraInfo {
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub firmware_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// True when the info came from the plain-text legacy endpoint.
    #[serde(default)]
    pub legacy: bool,
}

#[derive(Deserialize)]
struct InfoEnvelope {
    info: CameraInfo,
}

impl CameraInfo {
    /// Parse the JSON capability payload. Returns `None` for anything that is
    /// not an object carrying an `info` block with a firmware version.
    pub fn from_json(body: &str) -> Option<Self> {
        let envelope: InfoEnvelope = serde_json::from_str(body).ok()?;
        if envelope.info.firmware_version.trim().is_empty() {
            return None;
        }
        Some(envelope.info)
    }

    /// Parse the legacy `camera/cv` payload, which carries the firmware string
    /// among non-printable framing bytes.
    pub fn from_legacy_text(body: &[u8]) -> Option<Self> {
        let firmware: String = String::from_utf8_lossy(body)
            .chars()
            .filter(|c| c.is_ascii_graphic())
            .collect();
        if firmware.is_empty() {
            return None;
        }
        Some(Self {
            model_name: String::new(),
            firmware_version: firmware,
            serial_number: None,
            legacy: true,
        })
    }
}

/// Payload of `gp/gpControl/status`: numbered status and setting flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CameraStatus {
    #[serde(default)]
    pub status: HashMap<String, JsonValue>,
    #[serde(default)]
    pub settings: HashMap<String, JsonValue>,
}

impl CameraStatus {
    pub fn flag(&self, id: &str) -> Option<i64> {
        self.status.get(id).and_then(|v| match v {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::Bool(b) => Some(i64::from(*b)),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }
}

/// Body of a successful command request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    Video,
    Photo,
    Burst,
    Timelapse,
}

impl CameraMode {
    pub fn code(&self) -> u8 {
        match self {
            CameraMode::Video => 0,
            CameraMode::Photo => 1,
            CameraMode::Burst | CameraMode::Timelapse => 2,
        }
    }
}

impl FromStr for CameraMode {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "video" => Ok(CameraMode::Video),
            "photo" => Ok(CameraMode::Photo),
            "burst" => Ok(CameraMode::Burst),
            "timelapse" => Ok(CameraMode::Timelapse),
            other => Err(CameraError::invalid(format!("unknown camera mode '{}'", other))),
        }
    }
}

/// Resolution / frame rate / field of view, already mapped to setting codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSettings {
    pub resolution: u8,
    pub fps: u8,
    pub fov: u8,
}

impl VideoSettings {
    pub fn parse(resolution: &str, fps: &str, fov: &str) -> Result<Self, CameraError> {
        let resolution = match resolution.trim() {
            "4K" | "4k" => 1,
            "1080p" => 9,
            "720p" => 12,
            other => return Err(CameraError::invalid(format!("unknown resolution '{}'", other))),
        };
        let fps = match fps.trim() {
            "30fps" | "30" => 5,
            "60fps" | "60" => 6,
            other => return Err(CameraError::invalid(format!("unknown frame rate '{}'", other))),
        };
        let fov = match fov.trim().to_lowercase().as_str() {
            "wide" => 0,
            "medium" => 1,
            "narrow" => 2,
            "linear" => 4,
            other => return Err(CameraError::invalid(format!("unknown field of view '{}'", other))),
        };
        Ok(Self { resolution, fps, fov })
    }

    /// Setting paths in the order the camera expects them.
    pub fn command_paths(&self) -> [String; 3] {
        [
            format!("gp/gpControl/setting/2/{}", self.resolution),
            format!("gp/gpControl/setting/3/{}", self.fps),
            format!("gp/gpControl/setting/4/{}", self.fov),
        ]
    }
}
