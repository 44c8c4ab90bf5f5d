// ABOUTME: In-memory container runtime used by tests and dry runs
// ABOUTME: Simulates containers, the shared mount and a tiny script interpreter

use super::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, Result,
    RuntimeError,
};
use crate::protocol::{APPEND_SCRIPT, KILL_SCRIPT, WRITE_SCRIPT};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct MockContainer {
    name: String,
    image: String,
    state: ContainerState,
    labels: HashMap<String, String>,
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    /// Files in the shared mount, keyed by in-container path.
    files: BTreeMap<String, Vec<u8>>,
    missing_images: HashSet<String>,
    exec_log: Vec<Vec<String>>,
    next_id: usize,
}

/// Fake runtime with the same observable behaviour as the Docker one.
///
/// Scripts are interpreted line by line: `print(..)`, `console.log(..)` and
/// `echo ..` write to stdout; `sys.exit(n)`, `process.exit(n)` and `exit n`
/// set the exit code; `raise ..` and `throw ..` fail with stderr;
/// `time.sleep(..)`, `while True` and `sleep ..` hang; `os.kill(1, 9)` kills
/// the container.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    started: AtomicUsize,
    unreachable: AtomicBool,
    fail_start: AtomicBool,
    fail_restart: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with an API error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_restart(&self, fail: bool) {
        self.fail_restart.store(fail, Ordering::SeqCst);
    }

    pub async fn add_missing_image(&self, image: &str) {
        self.state.lock().await.missing_images.insert(image.to_string());
    }

    /// Number of containers ever started.
    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Simulate the process inside the container dying.
    pub async fn kill(&self, container_id: &str) {
        if let Some(c) = self.state.lock().await.containers.get_mut(container_id) {
            c.state = ContainerState::Exited;
        }
    }

    /// Simulate someone removing the container behind our back.
    pub async fn remove_externally(&self, container_id: &str) {
        self.state.lock().await.containers.remove(container_id);
    }

    /// Insert a container that was not started through this runtime.
    pub async fn insert_container(
        &self,
        name: &str,
        image: &str,
        state: ContainerState,
        labels: HashMap<String, String>,
    ) -> String {
        let mut guard = self.state.lock().await;
        guard.next_id += 1;
        let id = format!("mock-{:04}", guard.next_id);
        guard.containers.insert(
            id.clone(),
            MockContainer {
                name: name.to_string(),
                image: image.to_string(),
                state,
                labels,
            },
        );
        id
    }

    pub async fn state_of(&self, container_id: &str) -> Option<ContainerState> {
        self.state
            .lock()
            .await
            .containers
            .get(container_id)
            .map(|c| c.state)
    }

    pub async fn image_of(&self, container_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .containers
            .get(container_id)
            .map(|c| c.image.clone())
    }

    pub async fn container_ids(&self) -> Vec<String> {
        self.state.lock().await.containers.keys().cloned().collect()
    }

    /// Paths currently present in the shared mount.
    pub async fn files(&self) -> Vec<String> {
        self.state.lock().await.files.keys().cloned().collect()
    }

    pub async fn exec_log(&self) -> Vec<Vec<String>> {
        self.state.lock().await.exec_log.clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("mock daemon unreachable".to_string()));
        }
        Ok(())
    }
}

enum ScriptEffect {
    Finished(ExecOutput),
    Hang,
    KillContainer,
}

fn interpret(source: &str) -> ScriptEffect {
    let mut out = ExecOutput::default();

    for line in source.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with("import ") {
            continue;
        }
        if line.starts_with("while True") || line.starts_with("time.sleep(") || line.starts_with("sleep ") {
            return ScriptEffect::Hang;
        }
        if line.starts_with("os.kill(1") {
            return ScriptEffect::KillContainer;
        }
        if let Some(arg) = call_argument(line, "print").or_else(|| call_argument(line, "console.log")) {
            out.stdout.extend_from_slice(unquote(arg).as_bytes());
            out.stdout.push(b'\n');
            continue;
        }
        if let Some(arg) = line.strip_prefix("echo ") {
            out.stdout.extend_from_slice(unquote(arg.trim()).as_bytes());
            out.stdout.push(b'\n');
            continue;
        }
        let exit = call_argument(line, "sys.exit")
            .or_else(|| call_argument(line, "process.exit"))
            .or_else(|| line.strip_prefix("exit "));
        if let Some(code) = exit {
            out.exit_code = code.trim().parse().unwrap_or(1);
            return ScriptEffect::Finished(out);
        }
        if let Some(error) = line.strip_prefix("raise ").or_else(|| line.strip_prefix("throw ")) {
            out.stderr.extend_from_slice(format!("Error: {}\n", error).as_bytes());
            out.exit_code = 1;
            return ScriptEffect::Finished(out);
        }
        out.stderr
            .extend_from_slice(format!("unsupported statement: {}\n", line).as_bytes());
        out.exit_code = 1;
        return ScriptEffect::Finished(out);
    }

    ScriptEffect::Finished(out)
}

fn call_argument<'a>(line: &'a str, function: &str) -> Option<&'a str> {
    line.strip_prefix(function)?
        .strip_prefix('(')?
        .trim_end_matches(';')
        .strip_suffix(')')
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn pull_image(&self, image: &str) -> Result<bool> {
        self.check_reachable()?;
        Ok(!self.state.lock().await.missing_images.contains(image))
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.check_reachable()?;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("mock start failure".to_string()));
        }

        let mut guard = self.state.lock().await;
        if guard.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Api(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }

        guard.next_id += 1;
        let id = format!("mock-{:04}", guard.next_id);
        let labels = spec.labels.clone();
        let container = MockContainer {
            name: spec.name.clone(),
            image: spec.image.clone(),
            state: ContainerState::Running,
            labels: labels.clone(),
        };
        guard.containers.insert(id.clone(), container);
        self.started.fetch_add(1, Ordering::SeqCst);

        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
            state: ContainerState::Running,
            labels,
        })
    }

    async fn restart_container(&self, container_id: &str) -> Result<()> {
        self.check_reachable()?;
        if self.fail_restart.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("mock restart failure".to_string()));
        }
        match self.state.lock().await.containers.get_mut(container_id) {
            Some(c) => {
                c.state = ContainerState::Running;
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn exec(&self, container_id: &str, argv: Vec<String>) -> Result<ExecOutput> {
        self.check_reachable()?;

        let source = {
            let mut guard = self.state.lock().await;
            guard.exec_log.push(argv.clone());

            match guard.containers.get(container_id) {
                None => return Err(RuntimeError::ContainerNotFound(container_id.to_string())),
                Some(c) if !c.state.is_running() => {
                    return Err(RuntimeError::Api(format!(
                        "Container {} is not running",
                        container_id
                    )))
                }
                Some(_) => {}
            }

            match argv.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                ["sh", "-c", script, payload, path]
                    if *script == WRITE_SCRIPT || *script == APPEND_SCRIPT =>
                {
                    let bytes = match BASE64.decode(payload) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            return Ok(ExecOutput {
                                exit_code: 1,
                                stdout: Vec::new(),
                                stderr: format!("base64: invalid input: {}\n", e).into_bytes(),
                            })
                        }
                    };
                    let file = guard.files.entry(path.to_string()).or_default();
                    if *script == WRITE_SCRIPT {
                        file.clear();
                    }
                    file.extend(bytes);
                    return Ok(ExecOutput::default());
                }
                ["sh", "-c", script, _] if *script == KILL_SCRIPT => {
                    return Ok(ExecOutput::default());
                }
                ["rm", "-f", path] => {
                    guard.files.remove(*path);
                    return Ok(ExecOutput::default());
                }
                ["sh", "-c", command] => command.to_string(),
                [_, path] => match guard.files.get(*path) {
                    Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    None => {
                        return Ok(ExecOutput {
                            exit_code: 2,
                            stdout: Vec::new(),
                            stderr: format!("can't open file '{}'\n", path).into_bytes(),
                        })
                    }
                },
                _ => {
                    return Ok(ExecOutput {
                        exit_code: 127,
                        stdout: Vec::new(),
                        stderr: b"command not found\n".to_vec(),
                    })
                }
            }
        };

        match interpret(&source) {
            ScriptEffect::Finished(output) => Ok(output),
            ScriptEffect::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Ok(ExecOutput::default())
            }
            ScriptEffect::KillContainer => {
                if let Some(c) = self.state.lock().await.containers.get_mut(container_id) {
                    c.state = ContainerState::Exited;
                }
                Err(RuntimeError::Api(format!(
                    "Container {} exited during exec",
                    container_id
                )))
            }
        }
    }

    async fn container_status(&self, container_id: &str) -> Result<Option<ContainerState>> {
        self.check_reachable()?;
        Ok(self
            .state
            .lock()
            .await
            .containers
            .get(container_id)
            .map(|c| c.state))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerHandle>> {
        self.check_reachable()?;
        Ok(self
            .state
            .lock()
            .await
            .containers
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, c)| ContainerHandle {
                id: id.clone(),
                name: c.name.clone(),
                state: c.state,
                labels: c.labels.clone(),
            }))
    }

    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<ContainerHandle>> {
        self.check_reachable()?;
        Ok(self
            .state
            .lock()
            .await
            .containers
            .iter()
            .filter(|(_, c)| c.labels.get(key).map(String::as_str) == Some(value))
            .map(|(id, c)| ContainerHandle {
                id: id.clone(),
                name: c.name.clone(),
                state: c.state,
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        self.check_reachable()?;
        self.state.lock().await.containers.remove(container_id);
        Ok(())
    }
}
