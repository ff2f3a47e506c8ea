use anyhow::{bail, Context};
use common::camera::StreamTarget;
use common::validation;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::controller::ControllerSettings;
use crate::pipeline::TranscoderConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub camera_base_url: String,
    pub camera_timeout: Duration,
    /// Default directory for Save sessions that don't name one.
    pub save_dir: PathBuf,
    pub rules_file: Option<PathBuf>,
    pub controller: ControllerSettings,
}

fn env_or(key: &str, def: &str) -> String {
    env::var(key).unwrap_or_else(|_| def.to_string())
}

fn env_u64(key: &str, def: u64) -> anyhow::Result<u64> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, v)),
        Err(_) => Ok(def),
    }
}

fn env_u16(key: &str, def: u16) -> anyhow::Result<u16> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{} must be a port number, got '{}'", key, v)),
        Err(_) => Ok(def),
    }
}

fn env_millis(key: &str, def: u64) -> anyhow::Result<Duration> {
    env_u64(key, def).map(Duration::from_millis)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env_or("SESSION_NODE_ADDR", "0.0.0.0:8090");
        let camera_base_url = env_or("CAMERA_BASE_URL", "http://10.5.5.9");
        validation::validate_uri(&camera_base_url, "CAMERA_BASE_URL")?;

        let control_ip: IpAddr = env_or("CAMERA_CONTROL_IP", "10.5.5.9")
            .parse()
            .context("CAMERA_CONTROL_IP must be an IP address")?;
        let heartbeat_port = env_u16("CAMERA_HEARTBEAT_PORT", 8554)?;
        let video_port = env_u16("CAMERA_VIDEO_PORT", 8554)?;
        validation::validate_port(heartbeat_port, "CAMERA_HEARTBEAT_PORT")?;
        validation::validate_port(video_port, "CAMERA_VIDEO_PORT")?;

        let heartbeat_interval = env_millis("HEARTBEAT_INTERVAL_MS", 2500)?;
        if heartbeat_interval.is_zero() {
            bail!("HEARTBEAT_INTERVAL_MS must be greater than zero");
        }

        let save_dir = PathBuf::from(env_or("SAVE_DIR", "/tmp"));
        validation::validate_dir(&save_dir, "SAVE_DIR")?;
        let preview_dir = PathBuf::from(env_or("PREVIEW_DIR", "./data/preview"));
        validation::validate_dir(&preview_dir, "PREVIEW_DIR")?;

        let controller = ControllerSettings {
            target: StreamTarget {
                control_ip,
                heartbeat_port,
                video_port,
                ..StreamTarget::default()
            },
            heartbeat_interval,
            pipeline_grace: env_millis("PIPELINE_GRACE_MS", 5000)?,
            ready_timeout: env_millis("PIPELINE_READY_TIMEOUT_MS", 10000)?,
            stream_reset_settle: env_millis("STREAM_RESET_SETTLE_MS", 2000)?,
            stream_start_settle: env_millis("STREAM_START_SETTLE_MS", 3000)?,
            transcoder: TranscoderConfig {
                ffmpeg_bin: PathBuf::from(env_or("FFMPEG_BIN", "ffmpeg")),
                ffplay_bin: PathBuf::from(env_or("FFPLAY_BIN", "ffplay")),
                preview_dir,
                ..TranscoderConfig::default()
            },
        };

        Ok(Config {
            bind_addr,
            camera_base_url,
            camera_timeout: env_millis("CAMERA_HTTP_TIMEOUT_MS", 5000)?,
            save_dir,
            rules_file: camera_control::resolver::rules_file(),
            controller,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment is process-global; keep these tests from interleaving.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 8] = [
        "SESSION_NODE_ADDR",
        "CAMERA_CONTROL_IP",
        "HEARTBEAT_INTERVAL_MS",
        "CAMERA_VIDEO_PORT",
        "PREVIEW_DIR",
        "PIPELINE_GRACE_MS",
        "STREAM_RESET_SETTLE_MS",
        "STREAM_START_SETTLE_MS",
    ];

    fn clear() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8090");
        assert_eq!(config.camera_base_url, "http://10.5.5.9");
        assert_eq!(config.controller.heartbeat_interval, Duration::from_millis(2500));
        assert_eq!(config.controller.target.heartbeat_addr().to_string(), "10.5.5.9:8554");
        assert_eq!(config.controller.pipeline_grace, Duration::from_secs(5));
        assert_eq!(config.controller.stream_reset_settle, Duration::from_secs(2));
        assert_eq!(config.controller.stream_start_settle, Duration::from_secs(3));
    }

    #[test]
    fn test_overrides_and_rejections() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        env::set_var("CAMERA_CONTROL_IP", "192.168.1.20");
        env::set_var("PIPELINE_GRACE_MS", "750");
        env::set_var("STREAM_START_SETTLE_MS", "0");
        let config = Config::from_env().unwrap();
        assert_eq!(config.controller.target.control_ip.to_string(), "192.168.1.20");
        assert_eq!(config.controller.pipeline_grace, Duration::from_millis(750));
        assert!(config.controller.stream_start_settle.is_zero());

        env::set_var("HEARTBEAT_INTERVAL_MS", "0");
        assert!(Config::from_env().is_err());
        env::set_var("HEARTBEAT_INTERVAL_MS", "fast");
        assert!(Config::from_env().is_err());
        env::remove_var("HEARTBEAT_INTERVAL_MS");

        env::set_var("CAMERA_VIDEO_PORT", "0");
        assert!(Config::from_env().is_err());
        env::remove_var("CAMERA_VIDEO_PORT");

        env::set_var("PREVIEW_DIR", "../../etc");
        assert!(Config::from_env().is_err());
        clear();
    }
}
