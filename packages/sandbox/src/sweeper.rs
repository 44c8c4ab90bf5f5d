// ABOUTME: Background task running the repair and eviction sweeps on a fixed interval
// ABOUTME: Runs once at start; stop() waits for the in-flight iteration to finish

use crate::reconciler::{EvictionReport, Reconciler, RepairReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info};

pub struct Sweeper {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
    wake: Arc<Notify>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
            running: Arc::new(RwLock::new(false)),
            wake: Arc::new(Notify::new()),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Run both sweeps once, repair first. Failures are logged, not returned.
    pub async fn sweep_once(reconciler: &Reconciler) -> (Option<RepairReport>, Option<EvictionReport>) {
        let repair = match reconciler.repair_broken().await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("Repair sweep failed: {}", e);
                None
            }
        };

        let eviction = match reconciler.evict_inactive().await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("Eviction sweep failed: {}", e);
                None
            }
        };

        (repair, eviction)
    }

    /// Start the periodic task. Calling it again while running does nothing.
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let reconciler = self.reconciler.clone();
        let running_flag = self.running.clone();
        let wake = self.wake.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            info!(interval = ?interval, "Sweeper started");

            loop {
                if !*running_flag.read().await {
                    break;
                }

                Self::sweep_once(&reconciler).await;

                tokio::select! {
                    _ = time::sleep(interval) => {}
                    _ = wake.notified() => {}
                }
            }

            info!("Sweeper stopped");
        });

        *self.handle.lock().await = Some(handle);
    }

    /// Signal the task and wait for it to exit after the current iteration.
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            *running = false;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            self.wake.notify_one();
            if let Err(e) = handle.await {
                error!("Sweeper task ended abnormally: {}", e);
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
