// ABOUTME: Persistent sandbox sessions reconciled between a SQLite record store and a container runtime
// ABOUTME: Exposes the store, runtime client, reconciler, background sweeper and tool command builders

pub mod client;
pub mod protocol;
pub mod reconciler;
pub mod runtime;
pub mod storage;
pub mod sweeper;
pub mod tools;

pub use client::{ExecOutcome, RuntimeClient};
pub use reconciler::{
    EvictionReport, ReconcileError, Reconciler, ReconcilerSettings, RepairReport,
};
pub use runtime::{ContainerRuntime, DockerRuntime, RuntimeError};
#[cfg(any(test, feature = "test-util"))]
pub use runtime::MockRuntime;
pub use storage::{SandboxSession, SessionStatus, SessionStore, StorageError};
pub use sweeper::Sweeper;
