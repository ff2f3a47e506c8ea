//! Model / firmware classification.
//!
//! The decision table is data: built-in defaults cover the camera strings seen
//! in the field, and a YAML file can extend or replace them without a rebuild.

use crate::client::CameraClient;
use crate::error::{CameraError, ResolveError};
use crate::types::CameraInfo;
use anyhow::Context;
use common::camera::{CameraProfile, StreamProtocol};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Status poll required by some firmware families before the feed is usable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReadinessRule {
    /// Firmware substring selecting cameras that need the poll.
    pub firmware_marker: String,
    /// Status flag id in the `gp/gpControl/status` payload.
    pub status_flag: String,
    /// Feed is usable once the flag is at least this value.
    pub threshold: i64,
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for ReadinessRule {
    fn default() -> Self {
        Self {
            firmware_marker: "HX".to_string(),
            status_flag: "31".to_string(),
            threshold: 1,
            max_attempts: 30,
            poll_interval_ms: 1000,
        }
    }
}

impl ReadinessRule {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResolverRules {
    /// Models matching any of these stream from `secondary_stream_ip`.
    pub secondary_ip_model_markers: Vec<String>,
    pub secondary_stream_ip: IpAddr,
    pub modern_firmware_markers: Vec<String>,
    pub modern_model_markers: Vec<String>,
    pub legacy_firmware_markers: Vec<String>,
    pub readiness: ReadinessRule,
}

impl Default for ResolverRules {
    fn default() -> Self {
        Self {
            secondary_ip_model_markers: vec!["Session".to_string()],
            secondary_stream_ip: IpAddr::V4(Ipv4Addr::new(10, 5, 5, 100)),
            modern_firmware_markers: ["HD4", "HD3.2", "HD5", "HD6", "HD7", "H18", "HX"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            modern_model_markers: vec!["HERO5".to_string()],
            legacy_firmware_markers: vec!["Hero3".to_string(), "HERO3+".to_string()],
            readiness: ReadinessRule::default(),
        }
    }
}

fn contains_any(haystack: &str, markers: &[String]) -> bool {
    markers
        .iter()
        .any(|m| !m.is_empty() && haystack.contains(m.as_str()))
}

/// Resolve the rules file path from env (`CAMERA_RULES_FILE`), if set.
pub fn rules_file() -> Option<PathBuf> {
    std::env::var("CAMERA_RULES_FILE").ok().map(PathBuf::from)
}

/// Decides protocol, video IP and readiness needs from identification strings.
#[derive(Debug, Clone, Default)]
pub struct ModelResolver {
    rules: ResolverRules,
}

impl ModelResolver {
    pub fn new(rules: ResolverRules) -> Self {
        Self { rules }
    }

    /// Load rules from YAML. Keys missing from the file keep their defaults.
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read camera rules {:?}", path))?;
        let rules: ResolverRules = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid camera rules {:?}", path))?;
        info!(path = ?path, "loaded camera rules");
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &ResolverRules {
        &self.rules
    }

    /// Pure classification of the camera; no I/O.
    pub fn resolve(
        &self,
        info: &CameraInfo,
        control_ip: IpAddr,
    ) -> Result<CameraProfile, ResolveError> {
        let rules = &self.rules;
        let firmware = info.firmware_version.as_str();
        let model = info.model_name.as_str();

        let stream_target_ip = if contains_any(model, &rules.secondary_ip_model_markers) {
            rules.secondary_stream_ip
        } else {
            control_ip
        };

        let modern = contains_any(firmware, &rules.modern_firmware_markers)
            || contains_any(model, &rules.modern_model_markers);

        let profile = if modern {
            let marker = &rules.readiness.firmware_marker;
            CameraProfile {
                firmware_version: firmware.to_string(),
                model_name: model.to_string(),
                supports_modern_protocol: true,
                stream_target_ip,
                protocol: StreamProtocol::Modern,
                requires_readiness_poll: !marker.is_empty() && firmware.contains(marker.as_str()),
            }
        } else if contains_any(firmware, &rules.legacy_firmware_markers) {
            CameraProfile {
                firmware_version: firmware.to_string(),
                model_name: model.to_string(),
                supports_modern_protocol: false,
                stream_target_ip,
                protocol: StreamProtocol::Legacy,
                requires_readiness_poll: false,
            }
        } else {
            return Err(ResolveError::UnsupportedCamera {
                model: model.to_string(),
                firmware: firmware.to_string(),
            });
        };

        debug!(
            model = %profile.model_name,
            firmware = %profile.firmware_version,
            protocol = ?profile.protocol,
            stream_ip = %profile.stream_target_ip,
            readiness_poll = profile.requires_readiness_poll,
            "resolved camera profile"
        );

        Ok(profile)
    }

    /// Poll the camera status until the readiness flag reaches its threshold.
    ///
    /// Returns the number of polls it took. Individual poll failures count as
    /// attempts and are retried.
    pub async fn await_ready(&self, camera: &dyn CameraClient) -> Result<u32, ResolveError> {
        let rule = &self.rules.readiness;
        let mut last_error: Option<CameraError> = None;

        for attempt in 1..=rule.max_attempts {
            match camera.status().await {
                Ok(status) => match status.flag(&rule.status_flag) {
                    Some(value) if value >= rule.threshold => {
                        info!(attempt, flag = %rule.status_flag, value, "camera feed ready");
                        return Ok(attempt);
                    }
                    value => {
                        debug!(attempt, flag = %rule.status_flag, ?value, "camera feed not ready yet");
                        last_error = None;
                    }
                },
                Err(e) => {
                    warn!(attempt, error = %e, "readiness poll failed");
                    last_error = Some(e);
                }
            }

            if attempt < rule.max_attempts {
                tokio::time::sleep(rule.poll_interval()).await;
            }
        }

        Err(ResolveError::CameraNotReady {
            attempts: rule.max_attempts,
            last_error,
        })
    }
}
