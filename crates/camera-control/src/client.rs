use crate::error::CameraError;
use crate::types::{Ack, CameraInfo, CameraMode, CameraStatus, VideoSettings};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Control endpoint paths, relative to the camera base URL.
pub mod paths {
    pub const INFO: &str = "gp/gpControl";
    pub const STATUS: &str = "gp/gpControl/status";
    pub const LEGACY_INFO: &str = "camera/cv";
    pub const STREAM_RESTART: &str = "gp/gpControl/execute?p1=gpStream&a1=proto_v2&c1=restart";
    pub const STREAM_STOP: &str = "gp/gpControl/execute?p1=gpStream&c1=stop";
    pub const SHUTTER_ON: &str = "gp/gpControl/command/shutter?p=1";
    pub const SHUTTER_OFF: &str = "gp/gpControl/command/shutter?p=0";
    pub const LEGACY_PASSWORD: &str = "bacpac/sd";
    pub const LEGACY_PREVIEW: &str = "camera/PV";
}

/// Operations against the camera's HTTP control API.
///
/// Implementors provide the three raw queries; the typed command wrappers are
/// built on `send_command` and validate their input before anything is sent.
#[async_trait]
pub trait CameraClient: Send + Sync {
    /// Issue a GET for `path` and return the body on a 2xx response.
    async fn send_command(&self, path: &str) -> Result<Ack, CameraError>;

    /// Identify the camera (model and firmware).
    async fn info(&self) -> Result<CameraInfo, CameraError>;

    /// Read the numbered status flags.
    async fn status(&self) -> Result<CameraStatus, CameraError>;

    async fn start_stream(&self) -> Result<Ack, CameraError> {
        self.send_command(paths::STREAM_RESTART).await
    }

    async fn stop_stream(&self) -> Result<Ack, CameraError> {
        self.send_command(paths::STREAM_STOP).await
    }

    async fn start_shutter(&self) -> Result<Ack, CameraError> {
        self.send_command(paths::SHUTTER_ON).await
    }

    async fn stop_shutter(&self) -> Result<Ack, CameraError> {
        self.send_command(paths::SHUTTER_OFF).await
    }

    /// Single photo; the camera must already be in photo mode.
    async fn take_photo(&self) -> Result<Ack, CameraError> {
        self.send_command(paths::SHUTTER_ON).await
    }

    async fn set_mode(&self, mode: &str) -> Result<Ack, CameraError> {
        let mode: CameraMode = mode.parse()?;
        self.send_command(&format!("gp/gpControl/command/mode?p={}", mode.code()))
            .await
    }

    async fn set_video_settings(
        &self,
        resolution: &str,
        fps: &str,
        fov: &str,
    ) -> Result<(), CameraError> {
        let settings = VideoSettings::parse(resolution, fps, fov)?;
        for path in settings.command_paths() {
            self.send_command(&path).await?;
        }
        Ok(())
    }

    /// Unlock the preview feed on password-gated cameras.
    async fn enable_legacy_preview(&self) -> Result<Ack, CameraError> {
        let secret = self.send_command(paths::LEGACY_PASSWORD).await?;
        let token = sanitize_secret(&secret.body);
        if token.is_empty() {
            return Err(CameraError::BadResponse {
                url: paths::LEGACY_PASSWORD.to_string(),
                reason: "empty preview secret".to_string(),
            });
        }
        self.send_command(&format!("{}?t={}&p=%02", paths::LEGACY_PREVIEW, token))
            .await
    }
}

/// Strip everything but word characters from the shared preview secret.
pub fn sanitize_secret(raw: &str) -> String {
    static NON_WORD: OnceLock<Option<Regex>> = OnceLock::new();
    match NON_WORD.get_or_init(|| Regex::new(r"\W+").ok()) {
        Some(re) => re.replace_all(raw, "").into_owned(),
        None => raw.chars().filter(|c| c.is_alphanumeric() || *c == '_').collect(),
    }
}

/// reqwest-backed client for the camera's control endpoint.
#[derive(Clone)]
pub struct HttpCameraClient {
    base_url: Url,
    http_client: reqwest::Client,
}

impl HttpCameraClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?;

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            base_url,
            http_client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, CameraError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| CameraError::invalid(format!("bad command path '{}': {}", path, e)))?;

        debug!(url = %url, "camera request");

        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| CameraError::Unreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CameraError::HttpError {
                url: url.to_string(),
                code: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                CameraError::Unreachable {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            } else {
                CameraError::BadResponse {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        Ok(body.to_vec())
    }
}

#[async_trait]
impl CameraClient for HttpCameraClient {
    async fn send_command(&self, path: &str) -> Result<Ack, CameraError> {
        let body = self.get_bytes(path).await?;
        Ok(Ack {
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    async fn info(&self) -> Result<CameraInfo, CameraError> {
        // Some firmwares answer gp/gpControl with a broken or non-JSON body;
        // those still expose the firmware string on the legacy endpoint.
        match self.get_bytes(paths::INFO).await {
            Ok(body) => {
                if let Some(info) = CameraInfo::from_json(&String::from_utf8_lossy(&body)) {
                    return Ok(info);
                }
                warn!("malformed capability response, falling back to legacy endpoint");
            }
            Err(e @ CameraError::Unreachable { .. }) => return Err(e),
            Err(e) => {
                warn!(error = %e, "capability query failed, falling back to legacy endpoint");
            }
        }

        let body = self.get_bytes(paths::LEGACY_INFO).await?;
        CameraInfo::from_legacy_text(&body).ok_or_else(|| CameraError::BadResponse {
            url: paths::LEGACY_INFO.to_string(),
            reason: "no firmware string in legacy response".to_string(),
        })
    }

    async fn status(&self) -> Result<CameraStatus, CameraError> {
        let body = self.get_bytes(paths::STATUS).await?;
        serde_json::from_slice(&body).map_err(|e| CameraError::BadResponse {
            url: paths::STATUS.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Request, http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    async fn spawn_camera(router: Router) -> SocketAddr {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn client(addr: SocketAddr) -> HttpCameraClient {
        HttpCameraClient::new(&format!("http://{}", addr), Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_sanitize_secret() {
        assert_eq!(sanitize_secret("\u{0}\u{8}goprohero3\n"), "goprohero3");
        assert_eq!(sanitize_secret("my pass-word!"), "mypassword");
    }

    #[tokio::test]
    async fn test_info_json() {
        let router = Router::new().route(
            "/gp/gpControl",
            get(|| async {
                r#"{"info":{"model_name":"HERO5 Black","firmware_version":"HD5.02.02.51.00"}}"#
            }),
        );
        let addr = spawn_camera(router).await;

        let info = client(addr).info().await.unwrap();
        assert_eq!(info.model_name, "HERO5 Black");
        assert_eq!(info.firmware_version, "HD5.02.02.51.00");
    }

    #[tokio::test]
    async fn test_info_falls_back_to_legacy_endpoint() {
        let router = Router::new()
            .route("/gp/gpControl", get(|| async { "garbage" }))
            .route("/camera/cv", get(|| async { "\u{0}Hero3-Black\u{0}" }));
        let addr = spawn_camera(router).await;

        let info = client(addr).info().await.unwrap();
        assert_eq!(info.firmware_version, "Hero3-Black");
        assert!(info.model_name.is_empty());
        assert!(info.legacy);
    }

    #[tokio::test]
    async fn test_http_error_code() {
        let router = Router::new().route(
            "/gp/gpControl/execute",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "busy") }),
        );
        let addr = spawn_camera(router).await;

        match client(addr).start_stream().await {
            Err(CameraError::HttpError { code, .. }) => assert_eq!(code, 500),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_camera() {
        // Bind and immediately drop a listener to get a port nobody serves.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(addr).status().await.unwrap_err();
        assert!(err.is_unreachable(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_timeout_is_unreachable() {
        let router = Router::new().route(
            "/gp/gpControl/status",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "{}"
            }),
        );
        let addr = spawn_camera(router).await;
        let client =
            HttpCameraClient::new(&format!("http://{}", addr), Duration::from_millis(200)).unwrap();

        let err = client.status().await.unwrap_err();
        assert!(err.is_unreachable(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_invalid_parameters_are_never_sent() {
        let hits = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = hits.clone();
        let router = Router::new().fallback(move |req: Request| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(req.uri().to_string());
                "{}"
            }
        });
        let addr = spawn_camera(router).await;
        let client = client(addr);

        assert!(matches!(
            client.set_mode("hyperlapse").await,
            Err(CameraError::InvalidParameter(_))
        ));
        assert!(matches!(
            client.set_video_settings("2.7K", "30fps", "Wide").await,
            Err(CameraError::InvalidParameter(_))
        ));
        assert!(hits.lock().unwrap().is_empty());

        client.set_mode("photo").await.unwrap();
        client.set_video_settings("720p", "30fps", "Narrow").await.unwrap();
        assert_eq!(
            *hits.lock().unwrap(),
            vec![
                "/gp/gpControl/command/mode?p=1".to_string(),
                "/gp/gpControl/setting/2/12".to_string(),
                "/gp/gpControl/setting/3/5".to_string(),
                "/gp/gpControl/setting/4/2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_legacy_preview_uses_sanitized_secret() {
        let hits = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = hits.clone();
        let router = Router::new()
            .route("/bacpac/sd", get(|| async { "\u{0}\u{9}s3cr3t!\n" }))
            .fallback(move |req: Request| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(req.uri().to_string());
                    ""
                }
            });
        let addr = spawn_camera(router).await;

        client(addr).enable_legacy_preview().await.unwrap();
        assert_eq!(
            *hits.lock().unwrap(),
            vec!["/camera/PV?t=s3cr3t&p=%02".to_string()]
        );
    }
}
