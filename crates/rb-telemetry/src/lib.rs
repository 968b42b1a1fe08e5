//! Logging setup and trace/span identifiers shared by the runbox binaries.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Tracing**: OpenTelemetry-shaped trace and span ids for correlating
//!   the log lines of one operation

pub mod logging;
pub mod tracing_setup;

pub use logging::{init_logging, init_logging_json, LogFormat};
