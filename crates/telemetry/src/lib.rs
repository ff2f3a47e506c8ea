pub mod http_tracing;
pub mod logging;

pub use http_tracing::{trace_http_request, X_REQUEST_ID};
pub use logging::{init_structured_logging, LogConfig, LogFormat};
