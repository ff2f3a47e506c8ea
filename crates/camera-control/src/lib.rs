pub mod client;
pub mod error;
pub mod resolver;
pub mod types;

pub use client::{paths, CameraClient, HttpCameraClient};
pub use error::{CameraError, ResolveError};
pub use resolver::{ModelResolver, ReadinessRule, ResolverRules};
pub use types::*;
