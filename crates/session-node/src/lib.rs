pub mod api;
pub mod camera;
pub mod config;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod pipeline;

pub use api::{router, AppState};
pub use config::Config;
pub use controller::{Connection, ControllerSettings, SessionController};
pub use error::SessionError;
pub use heartbeat::Heartbeat;
pub use pipeline::{PipelineEvent, PipelineHandle, PipelinePlan, TranscoderConfig};
