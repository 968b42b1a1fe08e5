//! Scriptable in-memory [`ContainerRuntime`] for tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, DockerEndpoint, ExecOutput, ExitStatus,
    Result, RuntimeError,
};

/// Everything the fake was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    Create { id: String, purpose: String },
    Start(String),
    Wait(String),
    Exec { id: String, argv: Vec<String> },
    Stop(String),
    Delete(String),
    ArchiveOut { id: String, path: String },
    BuildImage { tag: String, dockerfile: String },
    RemoveImage(String),
}

/// Canned outcome for containers of one purpose.
#[derive(Debug, Clone, Default)]
pub struct ContainerScript {
    pub exit_code: i64,
    pub logs: Vec<u8>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    events: Vec<FakeEvent>,
    specs: Vec<(String, ContainerSpec)>,
    by_purpose: HashMap<String, ContainerScript>,
    exec_rules: Vec<(String, ExecOutput)>,
    fail_create: Vec<String>,
    stop_not_found: bool,
    archive: Vec<u8>,
    build_error: Option<String>,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Containers labelled with `purpose` exit with `exit_code` and `logs`.
    pub fn script_container(&self, purpose: &str, exit_code: i64, logs: impl Into<Vec<u8>>) {
        self.state().by_purpose.insert(
            purpose.to_string(),
            ContainerScript {
                exit_code,
                logs: logs.into(),
            },
        );
    }

    /// Exec calls whose joined argv contains `needle` return `output`. Later
    /// rules win over earlier ones.
    pub fn script_exec(&self, needle: &str, output: ExecOutput) {
        self.state().exec_rules.push((needle.to_string(), output));
    }

    pub fn fail_create_for(&self, purpose: &str) {
        self.state().fail_create.push(purpose.to_string());
    }

    pub fn stop_reports_not_found(&self) {
        self.state().stop_not_found = true;
    }

    pub fn set_archive(&self, bytes: impl Into<Vec<u8>>) {
        self.state().archive = bytes.into();
    }

    pub fn fail_builds(&self, message: &str) {
        self.state().build_error = Some(message.to_string());
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.state().events.clone()
    }

    /// Specs passed to `create`, in order.
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state().specs.iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn created_with_purpose(&self, purpose: &str) -> Vec<ContainerSpec> {
        self.created()
            .into_iter()
            .filter(|s| s.labels.get("runbox.purpose").map(String::as_str) == Some(purpose))
            .collect()
    }

    pub fn exec_calls(&self) -> Vec<Vec<String>> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                FakeEvent::Exec { argv, .. } => Some(argv.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                FakeEvent::Delete(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn script_for(state: &State, id: &str) -> ContainerScript {
        state
            .specs
            .iter()
            .find(|(cid, _)| cid == id)
            .and_then(|(_, spec)| spec.labels.get("runbox.purpose"))
            .and_then(|purpose| state.by_purpose.get(purpose))
            .cloned()
            .unwrap_or_default()
    }

    fn known(state: &State, id: &str) -> Result<()> {
        if state.specs.iter().any(|(cid, _)| cid == id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound {
                target: id.to_string(),
            })
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let mut state = self.state();
        let purpose = spec
            .labels
            .get("runbox.purpose")
            .cloned()
            .unwrap_or_default();
        if state.fail_create.contains(&purpose) {
            return Err(RuntimeError::Operation {
                endpoint: spec.endpoint.label(),
                operation: "create_container",
                target: spec.image.clone(),
                message: "scripted create failure".into(),
            });
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.specs.push((id.clone(), spec.clone()));
        state.events.push(FakeEvent::Create {
            id: id.clone(),
            purpose,
        });
        Ok(ContainerHandle::new(id, spec.endpoint.clone()))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        let mut state = self.state();
        Self::known(&state, &handle.id)?;
        state.events.push(FakeEvent::Start(handle.id.clone()));
        Ok(())
    }

    async fn wait(
        &self,
        handle: &ContainerHandle,
        _timeout: Option<Duration>,
    ) -> Result<ExitStatus> {
        let mut state = self.state();
        Self::known(&state, &handle.id)?;
        state.events.push(FakeEvent::Wait(handle.id.clone()));
        Ok(ExitStatus {
            code: Self::script_for(&state, &handle.id).exit_code,
        })
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<Vec<u8>> {
        let state = self.state();
        Self::known(&state, &handle.id)?;
        Ok(Self::script_for(&state, &handle.id).logs)
    }

    async fn exec(&self, handle: &ContainerHandle, argv: &[String]) -> Result<ExecOutput> {
        let mut state = self.state();
        Self::known(&state, &handle.id)?;
        state.events.push(FakeEvent::Exec {
            id: handle.id.clone(),
            argv: argv.to_vec(),
        });
        let joined = argv.join(" ");
        Ok(state
            .exec_rules
            .iter()
            .rev()
            .find(|(needle, _)| joined.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        let mut state = self.state();
        state.events.push(FakeEvent::Stop(handle.id.clone()));
        if state.stop_not_found {
            return Err(RuntimeError::NotFound {
                target: handle.id.clone(),
            });
        }
        Self::known(&state, &handle.id)
    }

    async fn delete(&self, handle: &ContainerHandle, _force: bool) -> Result<()> {
        let mut state = self.state();
        state.events.push(FakeEvent::Delete(handle.id.clone()));
        Self::known(&state, &handle.id)
    }

    async fn archive_out(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>> {
        let mut state = self.state();
        Self::known(&state, &handle.id)?;
        state.events.push(FakeEvent::ArchiveOut {
            id: handle.id.clone(),
            path: path.to_string(),
        });
        Ok(state.archive.clone())
    }

    async fn build_image(
        &self,
        endpoint: &DockerEndpoint,
        _context_tar: Vec<u8>,
        dockerfile: &str,
        tag: &str,
    ) -> Result<()> {
        let mut state = self.state();
        state.events.push(FakeEvent::BuildImage {
            tag: tag.to_string(),
            dockerfile: dockerfile.to_string(),
        });
        match &state.build_error {
            Some(message) => Err(RuntimeError::Operation {
                endpoint: endpoint.label(),
                operation: "build_image",
                target: tag.to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn remove_image(&self, _endpoint: &DockerEndpoint, tag: &str) -> Result<()> {
        self.state()
            .events
            .push(FakeEvent::RemoveImage(tag.to_string()));
        Ok(())
    }
}
