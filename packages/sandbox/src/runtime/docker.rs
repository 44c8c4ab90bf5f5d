// ABOUTME: Docker runtime implementation for persistent sandbox containers
// ABOUTME: Uses bollard to pull images, start, probe, exec into and remove containers

use super::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, Result,
    RuntimeError,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
        RestartContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    network::{CreateNetworkOptions, InspectNetworkOptions},
    models::{ContainerSummary, HostConfig, RestartPolicy, RestartPolicyNameEnum},
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct DockerRuntime {
    client: Docker,
    /// Label key marking containers this service owns.
    managed_label: String,
    /// Images pulled by this process, keyed by name.
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    pull_timeout: Duration,
    stop_grace: Duration,
}

impl DockerRuntime {
    /// Connect using the local defaults (DOCKER_HOST or the unix socket).
    pub fn connect(managed_label: &str, pull_timeout: Duration, stop_grace: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Api(format!("Failed to connect to Docker: {}", e)))?;

        Ok(Self::with_client(client, managed_label, pull_timeout, stop_grace))
    }

    pub fn with_client(
        client: Docker,
        managed_label: &str,
        pull_timeout: Duration,
        stop_grace: Duration,
    ) -> Self {
        Self {
            client,
            managed_label: managed_label.to_string(),
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout,
            stop_grace,
        }
    }

    fn to_bollard_config(&self, spec: &ContainerSpec) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.insert(self.managed_label.clone(), "true".to_string());

        let host_config = HostConfig {
            binds: Some(spec.volumes.iter().map(|v| v.to_bind_string()).collect()),
            memory: Some(spec.limits.memory_bytes()),
            cpu_period: Some(spec.limits.cpu_period),
            cpu_quota: Some(spec.limits.cpu_quota),
            pids_limit: Some(spec.limits.pids_limit),
            network_mode: Some(spec.network_mode.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(classify(e, image)),
        }
    }

    /// Create a named bridge network on first use. Built-in modes are left alone.
    async fn ensure_network(&self, mode: &str) -> Result<()> {
        if is_builtin_network(mode) {
            return Ok(());
        }

        match self
            .client
            .inspect_network(mode, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(classify(e, mode)),
        }

        info!(network = mode, "Creating sandbox network");
        let options = CreateNetworkOptions {
            name: mode.to_string(),
            driver: "bridge".to_string(),
            labels: HashMap::from([(self.managed_label.clone(), "true".to_string())]),
            ..Default::default()
        };
        match self.client.create_network(options).await {
            Ok(_) => Ok(()),
            // Another process created it first
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, mode)),
        }
    }

    fn to_handle(summary: ContainerSummary) -> Option<ContainerHandle> {
        let id = summary.id?;
        let state = summary
            .state
            .as_deref()
            .and_then(ContainerState::parse)
            .unwrap_or(ContainerState::Dead);
        let name = summary
            .names
            .unwrap_or_default()
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();

        Some(ContainerHandle {
            id,
            name,
            state,
            labels: summary.labels.unwrap_or_default(),
        })
    }

    async fn list_with_filter(&self, key: &str, value: String) -> Result<Vec<ContainerHandle>> {
        let mut filters = HashMap::new();
        filters.insert(key.to_string(), vec![value]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| classify(e, "list containers"))?;

        Ok(containers.into_iter().filter_map(Self::to_handle).collect())
    }
}

/// Map a bollard error onto the four kinds callers branch on.
fn classify(err: BollardError, subject: &str) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::ContainerNotFound(format!("{}: {}", subject, message)),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api(format!("{} ({}): {}", subject, status_code, message)),
        e @ (BollardError::RequestTimeoutError
        | BollardError::IOError { .. }
        | BollardError::HyperResponseError { .. }) => {
            RuntimeError::Api(format!("{}: {}", subject, e))
        }
        e => RuntimeError::Unexpected(format!("{}: {}", subject, e)),
    }
}

fn is_builtin_network(mode: &str) -> bool {
    matches!(mode, "none" | "bridge" | "host" | "default") || mode.starts_with("container:")
}

fn is_missing_image_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("not found")
        || message.contains("manifest unknown")
        || message.contains("pull access denied")
        || message.contains("repository does not exist")
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Api(format!("Docker not available: {}", e)))
    }

    async fn pull_image(&self, image: &str) -> Result<bool> {
        {
            let cache = self.image_cache.read().await;
            if cache.contains_key(image) {
                if self.image_exists(image).await? {
                    debug!(image, "Image found in cache, skipping pull");
                    return Ok(true);
                }
                drop(cache);
                self.image_cache.write().await.remove(image);
                info!(image, "Cached image was removed from Docker");
            }
        }

        if self.image_exists(image).await? {
            self.image_cache
                .write()
                .await
                .insert(image.to_string(), chrono::Utc::now());
            return Ok(true);
        }

        info!(image, timeout = ?self.pull_timeout, "Pulling image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(info) => {
                        if let Some(status) = &info.status {
                            if status != &last_status {
                                debug!(image, "Pull status: {}", status);
                                last_status = status.clone();
                            }
                        }
                        if let Some(error) = info.error {
                            if is_missing_image_message(&error) {
                                return Ok(false);
                            }
                            return Err(RuntimeError::Api(format!(
                                "Failed to pull image {}: {}",
                                image, error
                            )));
                        }
                    }
                    Err(BollardError::DockerResponseServerError {
                        status_code: 404, ..
                    }) => return Ok(false),
                    Err(BollardError::DockerResponseServerError { message, .. })
                        if is_missing_image_message(&message) =>
                    {
                        return Ok(false)
                    }
                    Err(e) => return Err(classify(e, image)),
                }
            }

            Ok(true)
        })
        .await;

        match result {
            Ok(Ok(true)) => {
                info!(image, "Successfully pulled image");
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(true)
            }
            Ok(Ok(false)) => {
                warn!(image, "Image not found in registry");
                Ok(false)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::Api(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        info!(name = %spec.name, image = %spec.image, "Creating container");
        self.ensure_network(&spec.network_mode).await?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .client
            .create_container(Some(options), self.to_bollard_config(spec))
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 404,
                    message,
                } => RuntimeError::ImageNotFound(message),
                e => classify(e, &spec.name),
            })?;

        if let Err(e) = self
            .client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // The created container would otherwise block the name
            warn!(container_id = %created.id, "Start failed, removing created container");
            if let Err(cleanup) = self.stop_and_remove(&created.id).await {
                warn!(container_id = %created.id, "Failed to remove container: {}", cleanup);
            }
            return Err(classify(e, &spec.name));
        }

        debug!(container_id = %created.id, "Started container");

        let mut labels = spec.labels.clone();
        labels.insert(self.managed_label.clone(), "true".to_string());
        Ok(ContainerHandle {
            id: created.id,
            name: spec.name.clone(),
            state: ContainerState::Running,
            labels,
        })
    }

    async fn restart_container(&self, container_id: &str) -> Result<()> {
        info!(container_id, "Restarting container");

        let options = RestartContainerOptions {
            t: self.stop_grace.as_secs() as isize,
        };

        self.client
            .restart_container(container_id, Some(options))
            .await
            .map_err(|e| classify(e, container_id))
    }

    async fn exec(&self, container_id: &str, argv: Vec<String>) -> Result<ExecOutput> {
        debug!(container_id, program = ?argv.first(), "Executing command");

        let exec_config = CreateExecOptions {
            cmd: Some(argv),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| classify(e, container_id))?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify(e, container_id))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => return Err(classify(e, container_id)),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Unexpected(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify(e, container_id))?;

        Ok(ExecOutput {
            exit_code: exec_inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn container_status(&self, container_id: &str) -> Result<Option<ContainerState>> {
        let inspect = match self.client.inspect_container(container_id, None).await {
            Ok(inspect) => inspect,
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(classify(e, container_id)),
        };

        let state = inspect.state.ok_or_else(|| {
            RuntimeError::Unexpected(format!("Container {} has no state", container_id))
        })?;

        let raw = state
            .status
            .as_ref()
            .map(|s| s.as_ref().to_string())
            .unwrap_or_default();

        ContainerState::parse(&raw).map(Some).ok_or_else(|| {
            RuntimeError::Unexpected(format!(
                "Unknown state '{}' for container {}",
                raw, container_id
            ))
        })
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerHandle>> {
        // The name filter matches substrings, so confirm the exact name
        let candidates = self
            .list_with_filter("name", format!("^/{}$", name))
            .await?;
        Ok(candidates.into_iter().find(|c| c.name == name))
    }

    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<ContainerHandle>> {
        self.list_with_filter("label", format!("{}={}", key, value))
            .await
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: self.stop_grace.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!(container_id, "Container already stopped"),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container already removed");
                return Ok(());
            }
            Err(e) => {
                warn!(container_id, "Stop failed, forcing removal: {}", e);
            }
        }

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Removed container");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(classify(e, container_id)),
        }
    }
}
