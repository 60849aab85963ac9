pub mod error;
pub mod logging;
pub mod time;

pub use error::ConfigError;
pub use logging::{TraceId, annotate_span, child_span, init_tracing, root_span, warn_if_slow};
pub use time::now_ms;
