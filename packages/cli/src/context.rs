// ABOUTME: Builds the session store, Docker runtime and reconciler from configuration
// ABOUTME: Opens SQLite with migrations applied and prepares the shared host directory

use anyhow::{Context, Result};
use sandkeep_config::SandkeepConfig;
use sandkeep_sandbox::{DockerRuntime, Reconciler, ReconcilerSettings, SessionStore};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

const MAX_CONNECTIONS: u32 = 5;

pub async fn open_store(database_url: &str) -> Result<Arc<SessionStore>> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("Invalid database URL: {}", database_url))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", database_url))?;

    let store = SessionStore::new(pool);
    store
        .migrate()
        .await
        .context("Failed to run database migrations")?;
    debug!(database_url, "Session store ready");

    Ok(Arc::new(store))
}

/// Everything a subcommand needs, connected and migrated.
pub struct AppContext {
    pub config: SandkeepConfig,
    pub store: Arc<SessionStore>,
    pub reconciler: Arc<Reconciler>,
}

impl AppContext {
    pub async fn connect(config: SandkeepConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.shared_mount.host_path).with_context(|| {
            format!(
                "Failed to create shared directory {}",
                config.shared_mount.host_path.display()
            )
        })?;

        let store = open_store(&config.database_url).await?;

        let runtime = DockerRuntime::connect(
            &config.container_label,
            config.image_pull_timeout,
            config.stop_grace,
        )
        .context("Failed to connect to the container runtime")?;

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            Arc::new(runtime),
            ReconcilerSettings::from_config(&config),
        ));
        info!(
            image = %config.default_base_image,
            network = %config.network_mode,
            "Reconciler ready"
        );

        Ok(Self {
            config,
            store,
            reconciler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandkeep_config::ResourceLimits;

    #[tokio::test]
    async fn test_open_store_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let url = format!("sqlite://{}", path.display());

        let store = open_store(&url).await.unwrap();
        assert!(path.exists());

        let session = store
            .create("agent", Some("print(1)"), "python:3.10", &ResourceLimits::default())
            .await
            .unwrap();
        assert!(store.get(&session.id).await.unwrap().is_some());

        // Reopening runs migrations again without complaint
        drop(store);
        let reopened = open_store(&url).await.unwrap();
        assert_eq!(reopened.list_all().await.unwrap().len(), 1);
    }
}
