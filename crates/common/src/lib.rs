pub mod camera;
pub mod session;
pub mod validation;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
