// ABOUTME: Storage layer for sandbox session records and their status state machine
// ABOUTME: Pure data access over SQLite; every call is atomic at the record level

use chrono::{DateTime, SecondsFormat, Utc};
use sandkeep_config::ResourceLimits;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Record created, container not yet confirmed started.
    Pending,
    /// Container confirmed alive.
    Running,
    Success,
    Failed,
    /// Intentionally torn down.
    Stopped,
    /// Mid-repair.
    Regenerating,
}

impl SessionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Regenerating => "regenerating",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            "regenerating" => Ok(Self::Regenerating),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One caller's sandbox instance and the outcome of its most recent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSession {
    pub id: String,
    pub caller_id: String,
    /// Set once a backing container has been started for this record.
    pub runtime_container_id: Option<String>,
    pub status: SessionStatus,
    pub is_active: bool,
    pub base_image: String,

    // Last execution
    pub code_to_execute: Option<String>,
    pub execution_result: Option<String>,
    pub error_message: Option<String>,
    pub exit_code: Option<i64>,

    pub resource_limits_applied: ResourceLimits,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// Optional fields for [`SessionStore::update_status`]. Empty values are skipped.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub runtime_container_id: Option<String>,
    pub execution_result: Option<String>,
    pub error_message: Option<String>,
    pub exit_code: Option<i64>,
}

impl StatusUpdate {
    pub fn container(container_id: impl Into<String>) -> Self {
        Self {
            runtime_container_id: Some(container_id.into()),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Full outcome of one execution, written unconditionally.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub status: SessionStatus,
    pub code: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
}

const SESSION_COLUMNS: &str = r#"
    id, caller_id, runtime_container_id, status, is_active, base_image,
    code_to_execute, execution_result, error_message, exit_code,
    resource_limits_applied, created_at, last_updated_at
"#;

/// Microsecond precision keeps lexical and chronological ordering identical.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp(raw.to_string()))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn create(
        &self,
        caller_id: &str,
        code: Option<&str>,
        base_image: &str,
        limits: &ResourceLimits,
    ) -> Result<SandboxSession> {
        let now = Utc::now();
        let session = SandboxSession {
            id: format!("ses_{}", uuid::Uuid::new_v4().simple()),
            caller_id: caller_id.to_string(),
            runtime_container_id: None,
            status: SessionStatus::Pending,
            is_active: true,
            base_image: base_image.to_string(),
            code_to_execute: code.map(str::to_string),
            execution_result: None,
            error_message: None,
            exit_code: None,
            resource_limits_applied: limits.clone(),
            created_at: now,
            last_updated_at: now,
        };

        let limits_json = serde_json::to_string(&session.resource_limits_applied)?;

        sqlx::query(
            r#"
            INSERT INTO sandbox_sessions (
                id, caller_id, runtime_container_id, status, is_active, base_image,
                code_to_execute, execution_result, error_message, exit_code,
                resource_limits_applied, created_at, last_updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&session.id)
        .bind(&session.caller_id)
        .bind(&session.runtime_container_id)
        .bind(session.status.as_str())
        .bind(session.is_active)
        .bind(&session.base_image)
        .bind(&session.code_to_execute)
        .bind(&session.execution_result)
        .bind(&session.error_message)
        .bind(session.exit_code)
        .bind(&limits_json)
        .bind(format_timestamp(session.created_at))
        .bind(format_timestamp(session.last_updated_at))
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<Option<SandboxSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sandbox_sessions WHERE id = ?1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| self.row_to_session(row)).transpose()
    }

    /// Set the status and apply whichever optional fields are non-empty.
    ///
    /// Returns `None` when no record has this id.
    pub async fn update_status(
        &self,
        id: &str,
        status: SessionStatus,
        update: StatusUpdate,
    ) -> Result<Option<SandboxSession>> {
        let mut query = String::from("UPDATE sandbox_sessions SET status = ?1, last_updated_at = ?2");
        let mut bind_index = 3;

        let container_id = non_empty(&update.runtime_container_id);
        let result = non_empty(&update.execution_result);
        let error = non_empty(&update.error_message);

        if container_id.is_some() {
            query.push_str(&format!(", runtime_container_id = ?{}", bind_index));
            bind_index += 1;
        }
        if result.is_some() {
            query.push_str(&format!(", execution_result = ?{}", bind_index));
            bind_index += 1;
        }
        if error.is_some() {
            query.push_str(&format!(", error_message = ?{}", bind_index));
            bind_index += 1;
        }
        if update.exit_code.is_some() {
            query.push_str(&format!(", exit_code = ?{}", bind_index));
            bind_index += 1;
        }
        query.push_str(&format!(" WHERE id = ?{}", bind_index));

        let mut q = sqlx::query(&query)
            .bind(status.as_str())
            .bind(format_timestamp(Utc::now()));
        if let Some(container_id) = container_id {
            q = q.bind(container_id);
        }
        if let Some(result) = result {
            q = q.bind(result);
        }
        if let Some(error) = error {
            q = q.bind(error);
        }
        if let Some(exit_code) = update.exit_code {
            q = q.bind(exit_code);
        }

        let outcome = q.bind(id).execute(&self.pool).await?;
        if outcome.rows_affected() == 0 {
            return Ok(None);
        }

        self.get(id).await
    }

    /// Overwrite the outcome of the last execution, clearing stale values.
    pub async fn record_execution(
        &self,
        id: &str,
        record: &ExecutionRecord,
    ) -> Result<Option<SandboxSession>> {
        let outcome = sqlx::query(
            r#"
            UPDATE sandbox_sessions
            SET status = ?1, code_to_execute = ?2, execution_result = ?3,
                error_message = ?4, exit_code = ?5, last_updated_at = ?6
            WHERE id = ?7
            "#,
        )
        .bind(record.status.as_str())
        .bind(&record.code)
        .bind(&record.result)
        .bind(&record.error)
        .bind(record.exit_code)
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Ok(None);
        }

        self.get(id).await
    }

    /// Active sessions that still claim a live or soon-to-be-live container.
    pub async fn list_active(&self) -> Result<Vec<SandboxSession>> {
        self.list_where(
            "is_active = 1 AND status IN ('pending', 'running', 'regenerating')",
            None,
        )
        .await
    }

    /// Active sessions whose last recorded outcome is a failure.
    pub async fn list_broken(&self) -> Result<Vec<SandboxSession>> {
        self.list_where("is_active = 1 AND status = 'failed'", None)
            .await
    }

    pub async fn list_inactive(&self) -> Result<Vec<SandboxSession>> {
        self.list_where("is_active = 0", None).await
    }

    pub async fn list_all(&self) -> Result<Vec<SandboxSession>> {
        self.list_where("1 = 1", None).await
    }

    /// Active records for one caller, most recently updated first.
    pub async fn list_for_caller(&self, caller_id: &str) -> Result<Vec<SandboxSession>> {
        self.list_where("is_active = 1 AND caller_id = ?1", Some(caller_id))
            .await
    }

    pub async fn deactivate(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sandbox_sessions SET is_active = 0, last_updated_at = ?1 WHERE id = ?2",
        )
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(())
    }

    /// Delete a record. Returns false when it did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sandbox_sessions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // HELPER METHODS
    // ========================================================================

    async fn list_where(&self, filter: &str, param: Option<&str>) -> Result<Vec<SandboxSession>> {
        let query = format!(
            "SELECT {} FROM sandbox_sessions WHERE {} ORDER BY last_updated_at DESC, rowid DESC",
            SESSION_COLUMNS, filter
        );

        let mut q = sqlx::query(&query);
        if let Some(param) = param {
            q = q.bind(param);
        }

        let rows = q.fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| self.row_to_session(row))
            .collect()
    }

    fn row_to_session(&self, row: sqlx::sqlite::SqliteRow) -> Result<SandboxSession> {
        Ok(SandboxSession {
            id: row.get("id"),
            caller_id: row.get("caller_id"),
            runtime_container_id: row.get("runtime_container_id"),
            status: SessionStatus::from_str(&row.get::<String, _>("status"))?,
            is_active: row.get("is_active"),
            base_image: row.get("base_image"),
            code_to_execute: row.get("code_to_execute"),
            execution_result: row.get("execution_result"),
            error_message: row.get("error_message"),
            exit_code: row.get("exit_code"),
            resource_limits_applied: serde_json::from_str(
                &row.get::<String, _>("resource_limits_applied"),
            )?,
            created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            last_updated_at: parse_timestamp(&row.get::<String, _>("last_updated_at"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_store() -> SessionStore {
        // A single connection keeps every query on the same in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");

        let store = SessionStore::new(pool);
        store.migrate().await.expect("Failed to run migrations");
        store
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let store = setup_test_store().await;

        let created = store
            .create("agent-1", Some("print(1)"), "python:3.10", &ResourceLimits::default())
            .await
            .unwrap();
        assert!(created.id.starts_with("ses_"));
        assert_eq!(created.status, SessionStatus::Pending);
        assert!(created.is_active);

        let fetched = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.caller_id, "agent-1");
        assert_eq!(fetched.base_image, "python:3.10");
        assert_eq!(fetched.code_to_execute.as_deref(), Some("print(1)"));
        assert_eq!(fetched.resource_limits_applied, ResourceLimits::default());
        assert_eq!(fetched.runtime_container_id, None);

        assert!(store.get("ses_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_is_partial() {
        let store = setup_test_store().await;
        let session = store
            .create("agent-1", None, "python:3.10", &ResourceLimits::default())
            .await
            .unwrap();

        let updated = store
            .update_status(
                &session.id,
                SessionStatus::Running,
                StatusUpdate {
                    runtime_container_id: Some("c-1".to_string()),
                    execution_result: Some("Sandbox session started.".to_string()),
                    exit_code: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Running);
        assert_eq!(updated.runtime_container_id.as_deref(), Some("c-1"));
        assert_eq!(updated.exit_code, Some(0));

        // Empty strings and missing fields leave existing values alone
        let updated = store
            .update_status(
                &session.id,
                SessionStatus::Failed,
                StatusUpdate {
                    runtime_container_id: Some(String::new()),
                    error_message: Some("boom".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Failed);
        assert_eq!(updated.runtime_container_id.as_deref(), Some("c-1"));
        assert_eq!(updated.execution_result.as_deref(), Some("Sandbox session started."));
        assert_eq!(updated.error_message.as_deref(), Some("boom"));

        let missing = store
            .update_status("ses_missing", SessionStatus::Running, StatusUpdate::default())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_record_execution_clears_previous_error() {
        let store = setup_test_store().await;
        let session = store
            .create("agent-1", None, "python:3.10", &ResourceLimits::default())
            .await
            .unwrap();
        store
            .update_status(&session.id, SessionStatus::Failed, StatusUpdate::error("old"))
            .await
            .unwrap();

        let recorded = store
            .record_execution(
                &session.id,
                &ExecutionRecord {
                    status: SessionStatus::Running,
                    code: "print(2)".to_string(),
                    result: Some("2\n".to_string()),
                    error: None,
                    exit_code: Some(0),
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(recorded.status, SessionStatus::Running);
        assert_eq!(recorded.code_to_execute.as_deref(), Some("print(2)"));
        assert_eq!(recorded.execution_result.as_deref(), Some("2\n"));
        assert_eq!(recorded.error_message, None);
    }

    #[tokio::test]
    async fn test_active_and_broken_listings() {
        let store = setup_test_store().await;
        let limits = ResourceLimits::default();

        let pending = store.create("a", None, "img", &limits).await.unwrap();
        let failed = store.create("b", None, "img", &limits).await.unwrap();
        let stopped = store.create("c", None, "img", &limits).await.unwrap();
        let success = store.create("d", None, "img", &limits).await.unwrap();

        store
            .update_status(&failed.id, SessionStatus::Failed, StatusUpdate::default())
            .await
            .unwrap();
        store
            .update_status(&stopped.id, SessionStatus::Stopped, StatusUpdate::default())
            .await
            .unwrap();
        store.deactivate(&stopped.id).await.unwrap();
        store
            .update_status(&success.id, SessionStatus::Success, StatusUpdate::default())
            .await
            .unwrap();

        let active: Vec<String> = store
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(active, vec![pending.id.clone()]);

        let broken: Vec<String> = store
            .list_broken()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(broken, vec![failed.id.clone()]);

        let inactive = store.list_inactive().await.unwrap();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].id, stopped.id);

        assert_eq!(store.list_all().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_list_for_caller_orders_newest_first() {
        let store = setup_test_store().await;
        let limits = ResourceLimits::default();

        let older = store.create("agent-1", None, "img", &limits).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = store.create("agent-1", None, "img", &limits).await.unwrap();
        store.create("agent-2", None, "img", &limits).await.unwrap();

        let ids: Vec<String> = store
            .list_for_caller("agent-1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![newer.id.clone(), older.id.clone()]);

        // Touching the older record moves it to the front
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .update_status(&older.id, SessionStatus::Running, StatusUpdate::default())
            .await
            .unwrap();
        let first = store.list_for_caller("agent-1").await.unwrap().remove(0);
        assert_eq!(first.id, older.id);

        // Inactive records are not candidates
        store.deactivate(&older.id).await.unwrap();
        let remaining = store.list_for_caller("agent-1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, newer.id);
    }

    #[tokio::test]
    async fn test_deactivate_and_delete() {
        let store = setup_test_store().await;
        let session = store
            .create("agent-1", None, "img", &ResourceLimits::default())
            .await
            .unwrap();

        store.deactivate(&session.id).await.unwrap();
        assert!(!store.get(&session.id).await.unwrap().unwrap().is_active);
        assert!(matches!(
            store.deactivate("ses_missing").await,
            Err(StorageError::NotFound(_))
        ));

        assert!(store.delete(&session.id).await.unwrap());
        assert!(!store.delete(&session.id).await.unwrap());
    }

    #[test]
    fn test_status_round_trip_and_rejection() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Running,
            SessionStatus::Success,
            SessionStatus::Failed,
            SessionStatus::Stopped,
            SessionStatus::Regenerating,
        ] {
            assert_eq!(SessionStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(matches!(
            SessionStatus::from_str("exploded"),
            Err(StorageError::InvalidStatus(_))
        ));
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let (a, b) = (format_timestamp(early), format_timestamp(late));
        assert_eq!(a, "2024-01-01T00:00:00.500000Z");
        assert!(b < a);
    }
}
