use crate::core::config::StoreConfig;
use crate::core::errors::{StoreError, StoreResult, TaskError, TaskResult};
use crate::core::model::{RawTask, TaskId, TaskRecord, TaskState};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Persistence for task records.
///
/// Implementations keep records keyed by id, list them by source URL and
/// serialize writes so that at most one writer touches a given id at a time.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persists a new record and returns it with its assigned id. Inserting a
    /// second record for the same (source url, destination, file name) returns
    /// the row that already exists.
    async fn insert(&self, record: TaskRecord) -> StoreResult<TaskRecord>;

    async fn get(&self, id: TaskId) -> StoreResult<Option<TaskRecord>>;

    /// Writes the mutable fields of an already persisted record. The write is
    /// rejected when it is not a legal successor of the stored row, so a stale
    /// copy can never undo a transition or lose progress.
    async fn update(&self, record: &TaskRecord) -> StoreResult<()>;

    /// Loads a record, applies `f` and saves the result under the per-id write
    /// lock. Nothing is written when `f` fails.
    async fn modify<F>(&self, id: TaskId, f: F) -> StoreResult<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord) -> TaskResult<()> + Send;

    async fn delete(&self, id: TaskId) -> StoreResult<bool>;

    /// Records for one URL, newest first.
    async fn list_by_source_url(&self, source_url: &str) -> StoreResult<Vec<TaskRecord>>;

    /// Every record, ordered by source URL descending.
    async fn list_all(&self) -> StoreResult<Vec<TaskRecord>>;

    /// Tasks that are neither completed nor cancelled, newest first.
    async fn list_active(&self) -> StoreResult<Vec<TaskRecord>>;

    /// Completed tasks, most recently finished first.
    async fn list_finished(&self) -> StoreResult<Vec<TaskRecord>>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    write_locks: Arc<Mutex<HashMap<TaskId, Arc<Mutex<()>>>>>,
}

const COLUMNS: &str = "id, source_url, destination_path, file_name, resumable, downloaded_bytes, \
    total_bytes, last_modified_tag, state, error_code, created_at, updated_at";

impl SqliteStore {
    pub async fn open(config: &StoreConfig) -> anyhow::Result<Self> {
        let db_path = &config.db_path;
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        let abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            std::env::current_dir()
                .with_context(|| "current_dir")?
                .join(db_path)
        };

        let mut p = abs.to_string_lossy().to_string();
        if cfg!(windows) {
            p = p.replace('\\', "/");
        }

        // mode=rwc creates the file when it does not exist yet
        let url = if p.starts_with('/') {
            format!("sqlite://{}?mode=rwc", p)
        } else {
            format!("sqlite:///{}?mode=rwc", p)
        };

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&url)
            .await
            .with_context(|| format!("connect sqlite url={} (file={})", url, abs.display()))?;

        let store = Self {
            pool,
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        };
        store.migrate().await.context("migrate task schema")?;
        tracing::info!(path = %abs.display(), "task store opened");
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              source_url TEXT NOT NULL,
              destination_path TEXT NOT NULL,
              file_name TEXT NOT NULL,
              resumable INTEGER NOT NULL DEFAULT 0,
              downloaded_bytes INTEGER NOT NULL DEFAULT 0,
              total_bytes INTEGER NULL,
              last_modified_tag TEXT NOT NULL DEFAULT '',
              -- 0 Pending,1 Running,2 Paused,3 Completed,4 Failed,5 Cancelled
              state INTEGER NOT NULL,
              error_code INTEGER NOT NULL DEFAULT 0,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_source_url
            ON tasks(source_url DESC);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_target
            ON tasks(source_url, destination_path, file_name);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn lock_for(&self, id: TaskId) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn forget_lock(&self, id: TaskId) {
        self.write_locks.lock().await.remove(&id);
    }

    /// Loads the row a write is about to replace. Drops the id's lock entry
    /// when there is no such row.
    async fn load_for_write(&self, id: TaskId) -> StoreResult<TaskRecord> {
        match self.get(id).await? {
            Some(record) => Ok(record),
            None => {
                self.forget_lock(id).await;
                Err(StoreError::TaskNotFound(id))
            }
        }
    }

    async fn find_target(&self, record: &TaskRecord) -> StoreResult<Option<TaskRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tasks \
             WHERE source_url = ? AND destination_path = ? AND file_name = ?;"
        ))
        .bind(record.source_url())
        .bind(path_text(record))
        .bind(record.file_name())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn write_row(&self, record: &TaskRecord, id: TaskId) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET resumable = ?,
                downloaded_bytes = ?,
                total_bytes = ?,
                last_modified_tag = ?,
                state = ?,
                error_code = ?,
                updated_at = ?
            WHERE id = ?;
            "#,
        )
        .bind(if record.resumable() { 1i64 } else { 0i64 })
        .bind(record.downloaded_bytes() as i64)
        .bind(record.total_bytes().map(|t| t as i64))
        .bind(record.last_modified_tag())
        .bind(record.state().code() as i64)
        .bind(record.error_code())
        .bind(record.updated_at().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        tracing::debug!(
            id,
            state = record.state().as_str(),
            downloaded = record.downloaded_bytes(),
            "task updated"
        );
        Ok(())
    }

    async fn fetch_list(&self, sql: &str) -> StoreResult<Vec<TaskRecord>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert(&self, record: TaskRecord) -> StoreResult<TaskRecord> {
        if let Some(id) = record.id() {
            let detail = format!("task {id} is already persisted");
            return Err(TaskError::InvalidArgument(detail).into());
        }

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tasks
              (source_url, destination_path, file_name, resumable, downloaded_bytes, total_bytes,
               last_modified_tag, state, error_code, created_at, updated_at)
            VALUES
              (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(record.source_url())
        .bind(path_text(&record))
        .bind(record.file_name())
        .bind(if record.resumable() { 1i64 } else { 0i64 })
        .bind(record.downloaded_bytes() as i64)
        .bind(record.total_bytes().map(|t| t as i64))
        .bind(record.last_modified_tag())
        .bind(record.state().code() as i64)
        .bind(record.error_code())
        .bind(record.created_at().timestamp_millis())
        .bind(record.updated_at().timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let existing = self
                .find_target(&record)
                .await?
                .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
            tracing::warn!(
                id = ?existing.id(),
                url = record.source_url(),
                "duplicate task target, keeping existing record"
            );
            return Ok(existing);
        }

        let id = result.last_insert_rowid();
        tracing::debug!(id, url = record.source_url(), "task inserted");
        Ok(record.with_id(id))
    }

    async fn get(&self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM tasks WHERE id = ?;"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn update(&self, record: &TaskRecord) -> StoreResult<()> {
        let id = record
            .id()
            .ok_or_else(|| TaskError::InvalidArgument("task has not been inserted yet".into()))?;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let stored = self.load_for_write(id).await?;
        if let Err(e) = stored.check_successor(record) {
            tracing::warn!(id, error = %e, "rejected task update");
            return Err(e.into());
        }
        self.write_row(record, id).await
    }

    async fn modify<F>(&self, id: TaskId, f: F) -> StoreResult<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord) -> TaskResult<()> + Send,
    {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut record = self.load_for_write(id).await?;
        f(&mut record)?;
        self.write_row(&record, id).await?;
        Ok(record)
    }

    async fn delete(&self, id: TaskId) -> StoreResult<bool> {
        let lock = self.lock_for(id).await;
        let deleted = {
            let _guard = lock.lock().await;
            sqlx::query(r#"DELETE FROM tasks WHERE id = ?"#)
                .bind(id)
                .execute(&self.pool)
                .await?
                .rows_affected()
                > 0
        };
        self.forget_lock(id).await;

        tracing::debug!(id, deleted, "task delete");
        Ok(deleted)
    }

    async fn list_by_source_url(&self, source_url: &str) -> StoreResult<Vec<TaskRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tasks WHERE source_url = ? ORDER BY id DESC;"
        ))
        .bind(source_url)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn list_all(&self) -> StoreResult<Vec<TaskRecord>> {
        self.fetch_list(&format!(
            "SELECT {COLUMNS} FROM tasks ORDER BY source_url DESC, id DESC;"
        ))
        .await
    }

    async fn list_active(&self) -> StoreResult<Vec<TaskRecord>> {
        self.fetch_list(&format!(
            "SELECT {COLUMNS} FROM tasks WHERE state NOT IN ({}, {}) \
             ORDER BY created_at DESC, id DESC;",
            TaskState::Completed.code(),
            TaskState::Cancelled.code()
        ))
        .await
    }

    async fn list_finished(&self) -> StoreResult<Vec<TaskRecord>> {
        self.fetch_list(&format!(
            "SELECT {COLUMNS} FROM tasks WHERE state = {} ORDER BY updated_at DESC, id DESC;",
            TaskState::Completed.code()
        ))
        .await
    }
}

fn path_text(record: &TaskRecord) -> String {
    record.destination_path().to_string_lossy().to_string()
}

fn task_from_row(row: &SqliteRow) -> StoreResult<TaskRecord> {
    let id: TaskId = row.try_get("id")?;
    let corrupt = |detail: String| StoreError::Corrupt { id, detail };

    let state_code: i64 = row.try_get("state")?;
    let state = u8::try_from(state_code)
        .ok()
        .and_then(TaskState::from_code)
        .ok_or_else(|| corrupt(format!("unknown state code {state_code}")))?;

    let downloaded: i64 = row.try_get("downloaded_bytes")?;
    let downloaded_bytes = u64::try_from(downloaded)
        .map_err(|_| corrupt(format!("negative downloaded_bytes {downloaded}")))?;
    let total: Option<i64> = row.try_get("total_bytes")?;
    let total_bytes = total
        .map(|t| u64::try_from(t).map_err(|_| corrupt(format!("negative total_bytes {t}"))))
        .transpose()?;

    let created_at = millis_to_time(row.try_get("created_at")?)
        .ok_or_else(|| corrupt("bad created_at".into()))?;
    let updated_at = millis_to_time(row.try_get("updated_at")?)
        .ok_or_else(|| corrupt("bad updated_at".into()))?;

    let raw = RawTask {
        id: Some(id),
        source_url: row.try_get("source_url")?,
        destination_path: PathBuf::from(row.try_get::<String, _>("destination_path")?),
        file_name: row.try_get("file_name")?,
        resumable: row.try_get::<i64, _>("resumable")? != 0,
        downloaded_bytes,
        total_bytes,
        last_modified_tag: row.try_get("last_modified_tag")?,
        state,
        error_code: row.try_get("error_code")?,
    };

    TaskRecord::from_raw(raw, created_at, updated_at).map_err(|e| corrupt(e.to_string()))
}

fn millis_to_time(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}
