use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    container::LogOutput,
    errors::Error as BollardError,
    exec::{StartExecOptions, StartExecResults},
    models::{ContainerCreateBody, ExecConfig, HostConfig},
    query_parameters::{
        BuildImageOptionsBuilder, CreateContainerOptionsBuilder,
        DownloadFromContainerOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
        RemoveImageOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
        WaitContainerOptionsBuilder,
    },
    Docker, API_DEFAULT_VERSION,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, DockerEndpoint, ExecOutput, ExitStatus,
    Result, RuntimeError,
};

const STOP_GRACE_SECS: i32 = 10;

/// [`ContainerRuntime`] backed by the Docker Engine API.
///
/// One client is kept per endpoint and created on first use.
pub struct DockerRuntime {
    clients: DashMap<DockerEndpoint, Docker>,
    connect_timeout_secs: u64,
}

impl DockerRuntime {
    pub fn new(connect_timeout_secs: u64) -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout_secs,
        }
    }

    fn client(&self, endpoint: &DockerEndpoint) -> Result<Docker> {
        if let Some(docker) = self.clients.get(endpoint) {
            return Ok(docker.clone());
        }
        let docker = connect(endpoint, self.connect_timeout_secs)?;
        debug!(endpoint = %endpoint, "connected docker client");
        self.clients.insert(endpoint.clone(), docker.clone());
        Ok(docker)
    }
}

fn connect(endpoint: &DockerEndpoint, timeout_secs: u64) -> Result<Docker> {
    let connected = match endpoint {
        DockerEndpoint::Local => Docker::connect_with_local_defaults(),
        DockerEndpoint::UnixSocket(path) => {
            Docker::connect_with_socket(path, timeout_secs, API_DEFAULT_VERSION)
        }
        DockerEndpoint::Tcp(addr) => Docker::connect_with_http(
            &format!("http://{addr}"),
            timeout_secs,
            API_DEFAULT_VERSION,
        ),
    };
    connected.map_err(|source| RuntimeError::Connect {
        endpoint: endpoint.label(),
        message: source.to_string(),
    })
}

fn is_not_found_error(error: &BollardError) -> bool {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => *status_code == 404,
        _ => false,
    }
}

fn docker_operation_error(
    endpoint: &DockerEndpoint,
    operation: &'static str,
    target: &str,
    source: BollardError,
) -> RuntimeError {
    if is_not_found_error(&source) {
        return RuntimeError::NotFound {
            target: target.to_owned(),
        };
    }
    RuntimeError::Operation {
        endpoint: endpoint.label(),
        operation,
        target: target.to_owned(),
        message: source.to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let docker = self.client(&spec.endpoint)?;
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            entrypoint: spec.entrypoint.clone(),
            cmd: Some(spec.cmd.clone()),
            working_dir: spec.working_dir.clone(),
            user: spec.user.clone(),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            labels: if spec.labels.is_empty() {
                None
            } else {
                Some(spec.labels.clone().into_iter().collect())
            },
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let options = spec
            .name
            .as_deref()
            .map(|name| CreateContainerOptionsBuilder::new().name(name).build());
        let target = spec.name.as_deref().unwrap_or(&spec.image);
        let created = docker
            .create_container(options, config)
            .await
            .map_err(|source| {
                docker_operation_error(&spec.endpoint, "create_container", target, source)
            })?;

        info!(
            container_id = %created.id,
            image = %spec.image,
            endpoint = %spec.endpoint,
            env_vars = spec.env.len(),
            binds = spec.binds.len(),
            "container created"
        );
        Ok(ContainerHandle::new(created.id, spec.endpoint.clone()))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        let docker = self.client(&handle.endpoint)?;
        docker
            .start_container(&handle.id, None::<StartContainerOptions>)
            .await
            .map_err(|source| {
                docker_operation_error(&handle.endpoint, "start_container", &handle.id, source)
            })
    }

    async fn wait(
        &self,
        handle: &ContainerHandle,
        timeout: Option<Duration>,
    ) -> Result<ExitStatus> {
        let docker = self.client(&handle.endpoint)?;
        let waiting = async {
            let mut stream = docker.wait_container(
                &handle.id,
                Some(
                    WaitContainerOptionsBuilder::new()
                        .condition("not-running")
                        .build(),
                ),
            );
            match stream.next().await {
                Some(Ok(response)) => Ok(ExitStatus {
                    code: response.status_code,
                }),
                // bollard reports a non-zero exit as an error carrying the code.
                Some(Err(BollardError::DockerContainerWaitError { code, .. })) => {
                    Ok(ExitStatus { code })
                }
                Some(Err(source)) => Err(docker_operation_error(
                    &handle.endpoint,
                    "wait_container",
                    &handle.id,
                    source,
                )),
                None => Err(RuntimeError::Operation {
                    endpoint: handle.endpoint.label(),
                    operation: "wait_container",
                    target: handle.id.clone(),
                    message: "wait stream ended without a status".into(),
                }),
            }
        };

        match timeout {
            None => waiting.await,
            Some(after) => tokio::time::timeout(after, waiting)
                .await
                .map_err(|_| RuntimeError::Timeout {
                    operation: "wait_container",
                    target: handle.id.clone(),
                    after,
                })?,
        }
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<Vec<u8>> {
        let docker = self.client(&handle.endpoint)?;
        let chunks: Vec<LogOutput> = docker
            .logs(
                &handle.id,
                Some(LogsOptionsBuilder::new().stdout(true).stderr(true).build()),
            )
            .try_collect()
            .await
            .map_err(|source| {
                docker_operation_error(&handle.endpoint, "logs", &handle.id, source)
            })?;

        let mut out = Vec::new();
        for chunk in chunks {
            match chunk {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => out.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(out)
    }

    async fn exec(&self, handle: &ContainerHandle, argv: &[String]) -> Result<ExecOutput> {
        let docker = self.client(&handle.endpoint)?;
        let created = docker
            .create_exec(
                &handle.id,
                ExecConfig {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(argv.to_vec()),
                    ..ExecConfig::default()
                },
            )
            .await
            .map_err(|source| {
                docker_operation_error(&handle.endpoint, "create_exec", &handle.id, source)
            })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let started = docker
            .start_exec(&created.id, None::<StartExecOptions>)
            .await
            .map_err(|source| {
                docker_operation_error(&handle.endpoint, "start_exec", &handle.id, source)
            })?;
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                let chunk = chunk.map_err(|source| {
                    docker_operation_error(&handle.endpoint, "exec_output", &handle.id, source)
                })?;
                match chunk {
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        stdout.extend_from_slice(&message)
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let inspected = docker.inspect_exec(&created.id).await.map_err(|source| {
            docker_operation_error(&handle.endpoint, "inspect_exec", &handle.id, source)
        })?;

        Ok(ExecOutput {
            exit_code: inspected.exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        let docker = self.client(&handle.endpoint)?;
        docker
            .stop_container(
                &handle.id,
                Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
            )
            .await
            .map_err(|source| {
                docker_operation_error(&handle.endpoint, "stop_container", &handle.id, source)
            })
    }

    async fn delete(&self, handle: &ContainerHandle, force: bool) -> Result<()> {
        let docker = self.client(&handle.endpoint)?;
        docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptionsBuilder::new().force(force).build()),
            )
            .await
            .map_err(|source| {
                docker_operation_error(&handle.endpoint, "remove_container", &handle.id, source)
            })
    }

    async fn archive_out(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>> {
        let docker = self.client(&handle.endpoint)?;
        let chunks: Vec<Bytes> = docker
            .download_from_container(
                &handle.id,
                Some(DownloadFromContainerOptionsBuilder::new().path(path).build()),
            )
            .try_collect()
            .await
            .map_err(|source| {
                docker_operation_error(&handle.endpoint, "download_from_container", path, source)
            })?;
        Ok(chunks.concat())
    }

    async fn build_image(
        &self,
        endpoint: &DockerEndpoint,
        context_tar: Vec<u8>,
        dockerfile: &str,
        tag: &str,
    ) -> Result<()> {
        let docker = self.client(endpoint)?;
        let options = BuildImageOptionsBuilder::new()
            .dockerfile(dockerfile)
            .t(tag)
            .rm(true)
            .build();
        let mut progress = docker.build_image(
            options,
            None,
            Some(bollard::body_full(Bytes::from(context_tar))),
        );
        while let Some(item) = progress.next().await {
            let info = item
                .map_err(|source| docker_operation_error(endpoint, "build_image", tag, source))?;
            if let Some(message) = info.error_detail.and_then(|d| d.message) {
                return Err(RuntimeError::Operation {
                    endpoint: endpoint.label(),
                    operation: "build_image",
                    target: tag.to_owned(),
                    message,
                });
            }
            if let Some(line) = info.stream.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
                debug!(tag, "{line}");
            }
        }
        info!(tag, endpoint = %endpoint, "image built");
        Ok(())
    }

    async fn remove_image(&self, endpoint: &DockerEndpoint, tag: &str) -> Result<()> {
        let docker = self.client(endpoint)?;
        docker
            .remove_image(
                tag,
                Some(RemoveImageOptionsBuilder::new().force(true).build()),
                None,
            )
            .await
            .map(|_| ())
            .map_err(|source| docker_operation_error(endpoint, "remove_image", tag, source))
    }
}
