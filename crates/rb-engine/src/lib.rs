//! Run lifecycle orchestration: drives a run through clone, setup, MCP
//! registration, the agent container, repository-state capture and
//! auto-push, then tears everything down.

pub mod build;
pub mod error;
pub mod events;
pub mod executor;

pub use build::ImageBuilder;
pub use error::{Result, RunError};
pub use events::{EventBus, RunEvent};
pub use executor::{RunExecutor, RunSettings};
