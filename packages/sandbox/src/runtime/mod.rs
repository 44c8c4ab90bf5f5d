// ABOUTME: Container runtime trait and the error taxonomy callers branch on
// ABOUTME: Docker implementation lives in docker.rs, an in-memory one in mock.rs

use async_trait::async_trait;
use sandkeep_config::ResourceLimits;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use docker::DockerRuntime;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockRuntime;

pub const LABEL_SESSION_ID: &str = "sandkeep.session_id";
pub const LABEL_CALLER_ID: &str = "sandkeep.caller_id";
pub const LABEL_NAME: &str = "sandkeep.name";

/// Runtime failures, classified once by the implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Transport or daemon failure.
    #[error("Runtime API error: {0}")]
    Api(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Unexpected runtime error: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeBinding {
    pub fn to_bind_string(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path,
            self.container_path,
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

/// Everything needed to create and start one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub limits: ResourceLimits,
    pub network_mode: String,
    pub volumes: Vec<VolumeBinding>,
    pub labels: HashMap<String, String>,
    /// Keeps the container alive between executions.
    pub command: Vec<String>,
}

pub fn keep_alive_command() -> Vec<String> {
    vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Parse the state string reported by the daemon.
    pub fn parse(state: &str) -> Option<Self> {
        match state.to_lowercase().as_str() {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "restarting" => Some(Self::Restarting),
            "removing" => Some(Self::Removing),
            "exited" => Some(Self::Exited),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
}

/// Raw result of one exec round trip. Streams are kept apart.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Low-level container runtime operations.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the daemon is reachable.
    async fn ping(&self) -> Result<()>;

    /// Make an image available locally. `Ok(false)` when the registry has no such image.
    async fn pull_image(&self, image: &str) -> Result<bool>;

    /// Create and start a detached container.
    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    async fn restart_container(&self, container_id: &str) -> Result<()>;

    /// Run a command to completion inside a running container.
    async fn exec(&self, container_id: &str, argv: Vec<String>) -> Result<ExecOutput>;

    /// `None` when the runtime does not know the container.
    async fn container_status(&self, container_id: &str) -> Result<Option<ContainerState>>;

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerHandle>>;

    /// All containers, running or not, carrying `key=value`.
    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<ContainerHandle>>;

    /// Stop with a bounded grace period, then force-remove with anonymous volumes.
    /// A container that is already gone is not an error.
    async fn stop_and_remove(&self, container_id: &str) -> Result<()>;
}
