//! Logging setup and step instrumentation.

pub mod instrument;
pub mod logging;

pub use instrument::Instrumented;
pub use logging::{init_from_env, init_logging, LogFormat};
