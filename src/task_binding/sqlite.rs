//! SQLite-backed binding store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::{AsyncTaskBinding, BindingError, BindingStore, NewBinding, TaskType};
use crate::channel::ChannelType;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS async_task_bindings (
    task_id TEXT PRIMARY KEY NOT NULL,
    task_type TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    token_id INTEGER NOT NULL,
    channel_id INTEGER NOT NULL,
    channel_type TEXT NOT NULL,
    origin_model TEXT NOT NULL,
    actual_model TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bindings_channel ON async_task_bindings(channel_id);
"#;

const SELECT_COLUMNS: &str = "SELECT task_id, task_type, user_id, token_id, channel_id, channel_type,
        origin_model, actual_model, created_at, updated_at, last_accessed_at
     FROM async_task_bindings WHERE task_id = ?1";

pub struct SqliteBindingStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBindingStore {
    pub async fn open(db_path: PathBuf) -> Result<Self, BindingError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BindingError::Storage(format!("Failed to create db dir: {}", e)))?;
        }

        let path_for_log = db_path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| BindingError::Storage(format!("Task join error: {}", e)))?
        .map_err(BindingError::Storage)?;

        tracing::info!(path = %path_for_log.display(), "Opened task binding database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn row_to_binding(row: &Row<'_>) -> rusqlite::Result<AsyncTaskBinding> {
    let task_type: String = row.get(1)?;
    let channel_type: String = row.get(5)?;
    let bad_text = |idx: usize, value: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown value '{}'", value).into(),
        )
    };
    Ok(AsyncTaskBinding {
        task_id: row.get(0)?,
        task_type: TaskType::parse(&task_type).ok_or_else(|| bad_text(1, &task_type))?,
        user_id: row.get(2)?,
        token_id: row.get(3)?,
        channel_id: row.get(4)?,
        channel_type: ChannelType::from_id(&channel_type)
            .ok_or_else(|| bad_text(5, &channel_type))?,
        origin_model: row.get(6)?,
        actual_model: row.get(7)?,
        created_at: from_millis(row.get(8)?),
        updated_at: from_millis(row.get(9)?),
        last_accessed_at: from_millis(row.get(10)?),
    })
}

#[async_trait]
impl BindingStore for SqliteBindingStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create(&self, binding: NewBinding) -> Result<AsyncTaskBinding, BindingError> {
        let conn = Arc::clone(&self.conn);
        let binding = binding.into_binding(Utc::now());
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let inserted = conn.execute(
                "INSERT INTO async_task_bindings (task_id, task_type, user_id, token_id, channel_id,
                     channel_type, origin_model, actual_model, created_at, updated_at, last_accessed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    binding.task_id,
                    binding.task_type.as_str(),
                    binding.user_id,
                    binding.token_id,
                    binding.channel_id,
                    binding.channel_type.id(),
                    binding.origin_model,
                    binding.actual_model,
                    millis(binding.created_at),
                    millis(binding.updated_at),
                    millis(binding.last_accessed_at),
                ],
            );
            match inserted {
                Ok(_) => Ok(binding),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(BindingError::Conflict(binding.task_id))
                }
                Err(e) => Err(BindingError::Storage(e.to_string())),
            }
        })
        .await
        .map_err(|e| BindingError::Storage(format!("Task join error: {}", e)))?
    }

    async fn resolve(&self, task_id: &str) -> Result<AsyncTaskBinding, BindingError> {
        let conn = Arc::clone(&self.conn);
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let changed = conn
                .execute(
                    "UPDATE async_task_bindings
                     SET last_accessed_at = MAX(last_accessed_at, ?2)
                     WHERE task_id = ?1",
                    params![task_id, millis(Utc::now())],
                )
                .map_err(|e| BindingError::Storage(e.to_string()))?;
            if changed == 0 {
                return Err(BindingError::NotFound(task_id));
            }
            conn.query_row(SELECT_COLUMNS, params![task_id], row_to_binding)
                .map_err(|e| BindingError::Storage(e.to_string()))
        })
        .await
        .map_err(|e| BindingError::Storage(format!("Task join error: {}", e)))?
    }

    async fn get(&self, task_id: &str) -> Result<Option<AsyncTaskBinding>, BindingError> {
        let conn = Arc::clone(&self.conn);
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(SELECT_COLUMNS, params![task_id], row_to_binding)
                .optional()
                .map_err(|e| BindingError::Storage(e.to_string()))
        })
        .await
        .map_err(|e| BindingError::Storage(format!("Task join error: {}", e)))?
    }
}
