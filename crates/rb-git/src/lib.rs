//! Git operations executed inside short-lived containers bound to a task's
//! workspace volume.

pub mod credentials;
pub mod errors;
pub mod operations;

pub use credentials::{Credentials, RemoteKind};
pub use errors::{enhance_error, GitError, Result};
pub use operations::GitOperations;
