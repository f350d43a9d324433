//! Built-in hook handlers

mod logging;
mod metrics;

pub use self::logging::{LogFormat, LoggingHandler};
pub use self::metrics::{HookCounter, MetricsHandler};
