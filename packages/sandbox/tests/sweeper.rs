// ABOUTME: Integration tests for the background sweeper task
// ABOUTME: Verifies the immediate first sweep, idempotent start and clean shutdown

use sandkeep_config::{ResourceLimits, SharedMount};
use sandkeep_sandbox::{
    MockRuntime, Reconciler, ReconcilerSettings, SessionStatus, SessionStore, Sweeper,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;

async fn setup_reconciler() -> (Arc<Reconciler>, Arc<MockRuntime>) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    let store = Arc::new(SessionStore::new(pool));
    store.migrate().await.expect("Failed to run migrations");

    let settings = ReconcilerSettings {
        default_image: "python:3.10".to_string(),
        limits: ResourceLimits::default(),
        network_mode: "none".to_string(),
        shared_mount: SharedMount {
            host_path: std::env::temp_dir().join("sandkeep-shared"),
            container_path: "/share_area".to_string(),
        },
        exec_timeout: Duration::from_secs(5),
        managed_label: "sandkeep.managed".to_string(),
        serialize_callers: false,
    };

    let runtime = Arc::new(MockRuntime::new());
    let reconciler = Arc::new(Reconciler::new(store, runtime.clone(), settings));
    (reconciler, runtime)
}

/// Test that the sweeper repairs immediately on start instead of waiting an interval
#[tokio::test]
async fn test_first_sweep_runs_at_start() {
    let (reconciler, _runtime) = setup_reconciler().await;
    let broken = reconciler
        .resolve_and_run("A", "raise KeyError('k')", None)
        .await
        .unwrap();
    assert_eq!(broken.status, SessionStatus::Failed);

    let sweeper = Sweeper::new(reconciler.clone(), Duration::from_secs(3600));
    sweeper.start().await;

    let mut repaired = false;
    for _ in 0..100 {
        let session = reconciler.get_session(&broken.id).await.unwrap();
        if session.status == SessionStatus::Running {
            repaired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    sweeper.stop().await;

    assert!(repaired, "sweeper should have repaired the session");
}

/// Test start/stop lifecycle and that a second start is a no-op
#[tokio::test]
async fn test_start_is_idempotent_and_stop_waits() {
    let (reconciler, _runtime) = setup_reconciler().await;
    let sweeper = Sweeper::new(reconciler, Duration::from_millis(10));

    assert!(!sweeper.is_running().await);
    sweeper.start().await;
    sweeper.start().await;
    assert!(sweeper.is_running().await);

    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(5), sweeper.stop())
        .await
        .expect("stop should not hang");
    assert!(!sweeper.is_running().await);

    // Stopping again is harmless
    sweeper.stop().await;
}

/// Test that a single sweep reports both passes
#[tokio::test]
async fn test_sweep_once_reports() {
    let (reconciler, runtime) = setup_reconciler().await;
    let session = reconciler.resolve_and_run("A", "print(1)", None).await.unwrap();
    runtime
        .remove_externally(session.runtime_container_id.as_deref().unwrap())
        .await;
    runtime.set_fail_restart(true);
    reconciler.resolve_and_run("A", "print(2)", None).await.unwrap();

    let (repair, eviction) = Sweeper::sweep_once(&reconciler).await;
    assert_eq!(repair.unwrap().examined, 0);
    assert_eq!(eviction.unwrap().records_deleted, 1);

    // Unreachable runtime: repair still reports, eviction logs and gives up
    runtime.set_unreachable(true);
    let (repair, eviction) = Sweeper::sweep_once(&reconciler).await;
    assert!(repair.is_some());
    assert!(eviction.is_none());
}
