// ABOUTME: Session reconciler keeping recorded sessions and live containers coherent
// ABOUTME: Resolves, verifies, provisions and executes per caller; owns the repair and eviction sweeps

use crate::client::{ExecOutcome, RuntimeClient};
use crate::runtime::{
    keep_alive_command, ContainerRuntime, ContainerSpec, ContainerState, RuntimeError,
    VolumeBinding, LABEL_CALLER_ID, LABEL_NAME, LABEL_SESSION_ID,
};
use crate::storage::{
    ExecutionRecord, SandboxSession, SessionStatus, SessionStore, StatusUpdate, StorageError,
};
use sandkeep_config::{ResourceLimits, SandkeepConfig, SharedMount};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

pub const PROVISIONED_MESSAGE: &str = "Sandbox session started.";
pub const NO_OUTPUT: &str = "No output.";

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Provisioning error: {reason}")]
    Provisioning { session_id: String, reason: String },

    #[error("Container runtime unreachable: {0}")]
    RuntimeUnreachable(String),

    #[error("Session not found: {0}")]
    RecordNotFound(String),

    #[error("No live sandbox for caller: {0}")]
    NoLiveSession(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Plain values the reconciler needs from configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub default_image: String,
    pub limits: ResourceLimits,
    pub network_mode: String,
    pub shared_mount: SharedMount,
    pub exec_timeout: Duration,
    pub managed_label: String,
    /// Serialize requests per caller with an in-process lock.
    pub serialize_callers: bool,
}

impl ReconcilerSettings {
    pub fn from_config(config: &SandkeepConfig) -> Self {
        Self {
            default_image: config.default_base_image.clone(),
            limits: config.resource_limits.clone(),
            network_mode: config.network_mode.clone(),
            shared_mount: config.shared_mount.clone(),
            exec_timeout: config.exec_timeout,
            managed_label: config.container_label.clone(),
            serialize_callers: config.serialize_callers,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub examined: usize,
    pub restored: usize,
    pub retired: usize,
    /// Left untouched because the runtime could not be reached.
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub records_deleted: usize,
    pub containers_removed: usize,
    pub orphans_removed: usize,
    pub failures: usize,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Pick the reconciliation anchor: the most recently updated session.
/// Ties go to the earlier element.
pub fn select_current(sessions: &[SandboxSession]) -> Option<&SandboxSession> {
    sessions.iter().fold(None, |best, s| match best {
        Some(b) if b.last_updated_at >= s.last_updated_at => Some(b),
        _ => Some(s),
    })
}

/// Deterministic container name for a caller.
///
/// Characters Docker rejects are replaced; a hash suffix keeps distinct
/// callers distinct once replaced.
pub fn container_name(caller_id: &str) -> String {
    let sanitized: String = caller_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    if sanitized == caller_id && !caller_id.is_empty() {
        format!("sandkeep-{}", sanitized)
    } else {
        format!("sandkeep-{}-{:016x}", sanitized, fnv1a(caller_id.as_bytes()))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf29ce484222325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x100000001b3)
    })
}

/// Record status after an execution, given whether the container survived it.
pub fn status_after_execution(container_alive: bool, outcome: &ExecOutcome) -> SessionStatus {
    if container_alive && outcome.succeeded() {
        SessionStatus::Running
    } else {
        SessionStatus::Failed
    }
}

enum Probe {
    Running,
    Stopped(ContainerState),
    Unknown,
    Unreachable(RuntimeError),
}

pub struct Reconciler {
    store: Arc<SessionStore>,
    client: RuntimeClient,
    settings: ReconcilerSettings,
    caller_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<SessionStore>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: ReconcilerSettings,
    ) -> Self {
        let client = RuntimeClient::new(
            runtime,
            &settings.shared_mount.container_path,
            settings.exec_timeout,
        );
        Self {
            store,
            client,
            settings,
            caller_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        self.client.runtime()
    }

    /// Run `code` in the caller's persistent sandbox, creating or repairing it as needed.
    pub async fn resolve_and_run(
        &self,
        caller_id: &str,
        code: &str,
        image: Option<&str>,
    ) -> Result<SandboxSession> {
        let image = image
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .unwrap_or(&self.settings.default_image)
            .to_string();
        let _guard = self.lock_caller(caller_id).await;

        let (session, container_id) = match self.reuse_existing(caller_id, &image).await? {
            Some(found) => found,
            None => self.provision(caller_id, &image, code).await?,
        };

        info!(
            caller_id,
            session_id = %session.id,
            container_id = %container_id,
            "Executing code"
        );
        let outcome = self
            .client
            .exec_code_in_container(&container_id, code, &image)
            .await;

        self.finalize(&session.id, &container_id, code, outcome).await
    }

    pub async fn get_session(&self, id: &str) -> Result<SandboxSession> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ReconcileError::RecordNotFound(id.to_string()))
    }

    pub async fn list_sessions(&self) -> Result<Vec<SandboxSession>> {
        Ok(self.store.list_all().await?)
    }

    /// Run a literal shell command in the caller's current live sandbox.
    /// Never provisions and never changes the session status.
    pub async fn exec_command(&self, caller_id: &str, command: &str) -> Result<ExecOutcome> {
        let _guard = self.lock_caller(caller_id).await;

        let sessions = self.store.list_for_caller(caller_id).await?;
        let container_id = select_current(&sessions)
            .and_then(|s| s.runtime_container_id.clone())
            .ok_or_else(|| ReconcileError::NoLiveSession(caller_id.to_string()))?;

        match self.probe(&container_id).await {
            Probe::Running => Ok(self
                .client
                .exec_command_in_container(&container_id, command)
                .await),
            Probe::Unreachable(e) => Err(ReconcileError::RuntimeUnreachable(e.to_string())),
            _ => Err(ReconcileError::NoLiveSession(caller_id.to_string())),
        }
    }

    // ========================================================================
    // LOOKUP AND VERIFY
    // ========================================================================

    /// Find a live container for the caller, collapsing duplicate records.
    async fn reuse_existing(
        &self,
        caller_id: &str,
        image: &str,
    ) -> Result<Option<(SandboxSession, String)>> {
        let candidates = self.store.list_for_caller(caller_id).await?;
        let anchor = match select_current(&candidates) {
            Some(anchor) => anchor.clone(),
            None => return Ok(None),
        };

        for duplicate in candidates.iter().filter(|s| s.id != anchor.id) {
            info!(caller_id, session_id = %duplicate.id, "Retiring superseded session");
            self.retire(duplicate).await?;
        }

        if anchor.base_image != image {
            info!(
                caller_id,
                session_id = %anchor.id,
                from = %anchor.base_image,
                to = image,
                "Image changed, replacing session"
            );
            self.retire(&anchor).await?;
            if let Some(container_id) = &anchor.runtime_container_id {
                self.remove_best_effort(container_id).await;
            }
            return Ok(None);
        }

        let container_id = match &anchor.runtime_container_id {
            Some(id) => id.clone(),
            None => {
                debug!(caller_id, session_id = %anchor.id, "Session never got a container");
                self.retire(&anchor).await?;
                return Ok(None);
            }
        };

        let alive = match self.probe(&container_id).await {
            Probe::Running => true,
            Probe::Stopped(state) => {
                info!(caller_id, container_id = %container_id, ?state, "Container not running, restarting");
                self.restart(&container_id).await
            }
            Probe::Unreachable(e) => {
                warn!(caller_id, container_id = %container_id, "Status probe failed, treating as not running: {}", e);
                self.restart(&container_id).await
            }
            Probe::Unknown => {
                info!(caller_id, container_id = %container_id, "Container unknown to runtime");
                self.retire(&anchor).await?;
                self.remove_best_effort(&container_id).await;
                return Ok(None);
            }
        };

        if !alive {
            self.retire(&anchor).await?;
            return Ok(None);
        }

        match self
            .store
            .update_status(&anchor.id, SessionStatus::Running, StatusUpdate::default())
            .await?
        {
            Some(session) => {
                debug!(caller_id, session_id = %session.id, "Reusing session");
                Ok(Some((session, container_id)))
            }
            None => Ok(None),
        }
    }

    async fn probe(&self, container_id: &str) -> Probe {
        match self.runtime().container_status(container_id).await {
            Ok(Some(state)) if state.is_running() => Probe::Running,
            Ok(Some(state)) => Probe::Stopped(state),
            Ok(None) => Probe::Unknown,
            Err(e) => Probe::Unreachable(e),
        }
    }

    /// Single restart attempt, confirmed by a fresh probe.
    async fn restart(&self, container_id: &str) -> bool {
        if let Err(e) = self.runtime().restart_container(container_id).await {
            warn!(container_id, "Restart failed: {}", e);
            return false;
        }
        matches!(self.probe(container_id).await, Probe::Running)
    }

    /// Deactivate a session and mark it stopped. The container is left for eviction.
    async fn retire(&self, session: &SandboxSession) -> Result<()> {
        self.store
            .update_status(&session.id, SessionStatus::Stopped, StatusUpdate::default())
            .await?;
        match self.store.deactivate(&session.id).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_best_effort(&self, container_id: &str) -> bool {
        match self.runtime().stop_and_remove(container_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(container_id, "Failed to remove container: {}", e);
                false
            }
        }
    }

    // ========================================================================
    // PROVISION AND FINALIZE
    // ========================================================================

    async fn provision(
        &self,
        caller_id: &str,
        image: &str,
        code: &str,
    ) -> Result<(SandboxSession, String)> {
        let name = container_name(caller_id);

        match self.runtime().find_by_name(&name).await {
            Ok(Some(existing)) => {
                warn!(caller_id, container_id = %existing.id, name = %name, "Removing container holding the sandbox name");
                self.remove_best_effort(&existing.id).await;
            }
            Ok(None) => {}
            Err(e) => return Err(ReconcileError::RuntimeUnreachable(e.to_string())),
        }

        match self.runtime().pull_image(image).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(ReconcileError::ImagePull {
                    image: image.to_string(),
                    reason: "image not found".to_string(),
                })
            }
            Err(e) => {
                return Err(ReconcileError::ImagePull {
                    image: image.to_string(),
                    reason: e.to_string(),
                })
            }
        }

        let session = self
            .store
            .create(caller_id, Some(code), image, &self.settings.limits)
            .await?;

        let spec = ContainerSpec {
            image: image.to_string(),
            name: name.clone(),
            limits: self.settings.limits.clone(),
            network_mode: self.settings.network_mode.clone(),
            volumes: vec![VolumeBinding {
                host_path: self.settings.shared_mount.host_path.display().to_string(),
                container_path: self.settings.shared_mount.container_path.clone(),
                read_only: false,
            }],
            labels: HashMap::from([
                (self.settings.managed_label.clone(), "true".to_string()),
                (LABEL_SESSION_ID.to_string(), session.id.clone()),
                (LABEL_CALLER_ID.to_string(), caller_id.to_string()),
                (LABEL_NAME.to_string(), name),
            ]),
            command: keep_alive_command(),
        };

        match self.runtime().start_container(&spec).await {
            Ok(handle) => {
                info!(caller_id, session_id = %session.id, container_id = %handle.id, "Provisioned sandbox");
                let update = StatusUpdate {
                    runtime_container_id: Some(handle.id.clone()),
                    execution_result: Some(PROVISIONED_MESSAGE.to_string()),
                    exit_code: Some(0),
                    ..Default::default()
                };
                let session = self
                    .store
                    .update_status(&session.id, SessionStatus::Running, update)
                    .await?
                    .ok_or_else(|| ReconcileError::RecordNotFound(session.id.clone()))?;
                Ok((session, handle.id))
            }
            Err(e) => {
                error!(caller_id, session_id = %session.id, "Provisioning failed: {}", e);
                let reason = e.to_string();
                self.store
                    .update_status(
                        &session.id,
                        SessionStatus::Failed,
                        StatusUpdate::error(format!("Provisioning error: {}", reason)),
                    )
                    .await?;
                Err(ReconcileError::Provisioning {
                    session_id: session.id,
                    reason,
                })
            }
        }
    }

    async fn finalize(
        &self,
        session_id: &str,
        container_id: &str,
        code: &str,
        outcome: ExecOutcome,
    ) -> Result<SandboxSession> {
        let alive = match self.probe(container_id).await {
            Probe::Running => true,
            Probe::Unreachable(e) => {
                warn!(container_id, "Post-execution probe failed: {}", e);
                false
            }
            _ => false,
        };
        let status = status_after_execution(alive, &outcome);
        if !alive {
            warn!(session_id, container_id, "Container is not running after execution");
        }

        let record = ExecutionRecord {
            status,
            code: code.to_string(),
            result: Some(outcome.stdout.unwrap_or_else(|| NO_OUTPUT.to_string())),
            error: outcome.stderr,
            exit_code: Some(outcome.exit_code),
        };

        let session = self
            .store
            .record_execution(session_id, &record)
            .await?
            .ok_or_else(|| ReconcileError::RecordNotFound(session_id.to_string()))?;

        info!(
            session_id,
            status = %session.status,
            exit_code = outcome.exit_code,
            timed_out = outcome.timed_out,
            "Execution recorded"
        );
        Ok(session)
    }

    // ========================================================================
    // SWEEPS
    // ========================================================================

    /// Restore a usable container for sessions marked failed. Never re-runs code.
    pub async fn repair_broken(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();

        for session in self.store.list_broken().await? {
            report.examined += 1;
            let _guard = self.lock_caller(&session.caller_id).await;

            let container_id = match &session.runtime_container_id {
                Some(id) => id.clone(),
                None => {
                    info!(session_id = %session.id, "Broken session has no container, retiring");
                    self.retire(&session).await?;
                    report.retired += 1;
                    continue;
                }
            };

            self.store
                .update_status(&session.id, SessionStatus::Regenerating, StatusUpdate::default())
                .await?;

            let alive = match self.probe(&container_id).await {
                Probe::Running => true,
                Probe::Stopped(state) => {
                    debug!(session_id = %session.id, ?state, "Restarting broken session");
                    self.restart(&container_id).await
                }
                Probe::Unknown => false,
                Probe::Unreachable(e) => {
                    warn!(session_id = %session.id, "Runtime unreachable during repair: {}", e);
                    self.store
                        .update_status(&session.id, SessionStatus::Failed, StatusUpdate::default())
                        .await?;
                    report.skipped += 1;
                    continue;
                }
            };

            if alive {
                info!(session_id = %session.id, container_id = %container_id, "Session restored");
                self.store
                    .update_status(&session.id, SessionStatus::Running, StatusUpdate::default())
                    .await?;
                report.restored += 1;
            } else {
                info!(session_id = %session.id, container_id = %container_id, "Session unrecoverable, retiring");
                self.retire(&session).await?;
                self.remove_best_effort(&container_id).await;
                report.retired += 1;
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                restored = report.restored,
                retired = report.retired,
                skipped = report.skipped,
                "Repair sweep finished"
            );
        }
        Ok(report)
    }

    /// Delete inactive records and remove containers nothing active refers to.
    pub async fn evict_inactive(&self) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();

        let all = self.store.list_all().await?;
        let referenced: HashSet<String> = all
            .iter()
            .filter(|s| s.is_active)
            .filter_map(|s| s.runtime_container_id.clone())
            .collect();

        for session in all.iter().filter(|s| !s.is_active) {
            if let Some(container_id) = &session.runtime_container_id {
                if !referenced.contains(container_id) {
                    if self.runtime().container_status(container_id).await == Ok(None) {
                        debug!(container_id = %container_id, "Container already gone");
                    } else if self.remove_best_effort(container_id).await {
                        report.containers_removed += 1;
                    } else {
                        // Keep the record so the next sweep retries the removal
                        report.failures += 1;
                        continue;
                    }
                }
            }

            if self.store.delete(&session.id).await? {
                debug!(session_id = %session.id, "Deleted inactive session");
                report.records_deleted += 1;
            }
        }

        // Containers first: provisioning writes the record before starting the
        // container, so every listed container has its record in the later snapshot.
        let labeled = self
            .runtime()
            .list_by_label(&self.settings.managed_label, "true")
            .await?;
        let known: HashSet<String> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();

        for handle in labeled {
            let orphaned = match handle.labels.get(LABEL_SESSION_ID) {
                Some(session_id) => !known.contains(session_id),
                None => false,
            };
            if !orphaned || referenced.contains(&handle.id) {
                continue;
            }
            info!(container_id = %handle.id, name = %handle.name, "Removing orphaned container");
            if self.remove_best_effort(&handle.id).await {
                report.orphans_removed += 1;
            } else {
                report.failures += 1;
            }
        }

        if !report.is_empty() {
            info!(
                records_deleted = report.records_deleted,
                containers_removed = report.containers_removed,
                orphans_removed = report.orphans_removed,
                failures = report.failures,
                "Eviction sweep finished"
            );
        }
        Ok(report)
    }

    async fn lock_caller(&self, caller_id: &str) -> Option<OwnedMutexGuard<()>> {
        if !self.settings.serialize_callers {
            return None;
        }

        let lock = {
            let mut locks = self.caller_locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(caller_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        Some(lock.lock_owned().await)
    }
}
