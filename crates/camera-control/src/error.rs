use thiserror::Error;

/// Failures talking to the camera's HTTP control endpoint.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Connection refused, DNS failure or timeout. Callers may retry.
    #[error("camera unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("bad response from {url}: {reason}")]
    BadResponse { url: String, reason: String },

    #[error("camera returned HTTP {code} for {url}")]
    HttpError { url: String, code: u16 },

    /// Rejected locally; nothing was sent to the camera.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl CameraError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// Failures deciding how to stream from a particular camera.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unsupported camera (model '{model}', firmware '{firmware}')")]
    UnsupportedCamera { model: String, firmware: String },

    #[error("camera not ready after {attempts} status polls")]
    CameraNotReady {
        attempts: u32,
        #[source]
        last_error: Option<CameraError>,
    },
}
