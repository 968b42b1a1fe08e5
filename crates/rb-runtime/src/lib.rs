pub mod builder;
pub mod docker;
pub mod files;
pub mod runtime;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use builder::{ContainerConfigBuilder, ContainerPurpose};
pub use docker::DockerRuntime;
pub use runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, DockerEndpoint, ExecOutput, ExitStatus,
    Result, RuntimeError,
};
