//! SQLite-backed [`EventStore`] — the production persistence target per §6
//! ("a single embedded relational database file, SQLite-family"). Grounded
//! on the teacher's `PostgresProcessStore` (`store_postgres.rs`): a thin
//! wrapper around a connection pool, embedded migrations run once at
//! startup, plain `sqlx::query` (no compile-time-checked macros, since this
//! crate must build without a live `DATABASE_URL`).
//!
//! §1 calls for "fsync-on-commit" durability with no stronger guarantee;
//! WAL journal mode with `synchronous = FULL` on the single writer
//! connection satisfies that without needing a connection-per-request pool.

#![cfg(feature = "sqlite")]

use crate::events::AgUiEvent;
use crate::instance::InstanceId;
use crate::store::{
    EventStore, MessageId, MessageStatus, StoredMessage, StoredThinkingEvent,
    StoredToolExecution, ThreadHistory, ThreadId, ToolExecutionId,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations. Call once at startup before serving traffic.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run bpmn-engine migrations")?;
        Ok(())
    }
}

fn status_str(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Streaming => "streaming",
        MessageStatus::Complete => "complete",
        MessageStatus::Cancelled => "cancelled",
    }
}

fn status_from_str(s: &str) -> MessageStatus {
    match s {
        "complete" => MessageStatus::Complete,
        "cancelled" => MessageStatus::Cancelled,
        _ => MessageStatus::Streaming,
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn ensure_thread(&self, element_id: &str) -> Result<ThreadId> {
        if let Some(row) = sqlx::query("SELECT thread_id FROM threads WHERE element_id = ?1")
            .bind(element_id)
            .fetch_optional(&self.pool)
            .await?
        {
            let id: String = row.try_get("thread_id")?;
            return Uuid::parse_str(&id).context("corrupt thread_id in store");
        }
        let thread_id = Uuid::now_v7();
        let now = crate::events::now_ms();
        sqlx::query(
            "INSERT INTO threads (element_id, thread_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
        )
        .bind(element_id)
        .bind(thread_id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(thread_id)
    }

    async fn append_event(&self, instance_id: InstanceId, event: &AgUiEvent) -> Result<u64> {
        if !event.is_persistent() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let next_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM raw_events WHERE instance_id = ?1",
        )
        .bind(instance_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        let event_type = serde_json::to_value(event)?
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let data = serde_json::to_string(event)?;

        sqlx::query(
            "INSERT INTO raw_events (seq, instance_id, event_type, event_data, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(next_seq)
        .bind(instance_id.to_string())
        .bind(&event_type)
        .bind(&data)
        .bind(event.timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(next_seq as u64)
    }

    async fn read_events(
        &self,
        instance_id: InstanceId,
        from_seq: u64,
    ) -> Result<Vec<(u64, AgUiEvent)>> {
        let rows = sqlx::query(
            "SELECT seq, event_data FROM raw_events WHERE instance_id = ?1 AND seq >= ?2 ORDER BY seq",
        )
        .bind(instance_id.to_string())
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let seq: i64 = row.try_get("seq")?;
                let data: String = row.try_get("event_data")?;
                let event: AgUiEvent = serde_json::from_str(&data)?;
                Ok((seq as u64, event))
            })
            .collect()
    }

    async fn store_message_start(
        &self,
        element_id: &str,
        message_id: MessageId,
        role: &str,
        timestamp: i64,
    ) -> Result<()> {
        let thread_id = self.ensure_thread(element_id).await?;
        sqlx::query(
            "INSERT INTO messages (message_id, thread_id, role, content, status, timestamp, cancellation_reason) VALUES (?1, ?2, ?3, '', 'streaming', ?4, NULL)",
        )
        .bind(message_id.to_string())
        .bind(thread_id.to_string())
        .bind(role)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_message_content(&self, message_id: MessageId, cumulative_text: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET content = ?1 WHERE message_id = ?2")
            .bind(cumulative_text)
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_message_complete(&self, message_id: MessageId) -> Result<()> {
        sqlx::query("UPDATE messages SET status = 'complete' WHERE message_id = ?1")
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_message_cancelled(&self, message_id: MessageId, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET status = 'cancelled', cancellation_reason = ?1 WHERE message_id = ?2",
        )
        .bind(reason)
        .bind(message_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_tool_start(
        &self,
        element_id: &str,
        tool_execution_id: ToolExecutionId,
        tool_name: &str,
        args: serde_json::Value,
        timestamp: i64,
    ) -> Result<()> {
        let thread_id = self.ensure_thread(element_id).await?;
        sqlx::query(
            "INSERT INTO tool_executions (id, thread_id, tool_name, args, result, status, start_time, end_time) VALUES (?1, ?2, ?3, ?4, NULL, 'streaming', ?5, NULL)",
        )
        .bind(tool_execution_id.to_string())
        .bind(thread_id.to_string())
        .bind(tool_name)
        .bind(args.to_string())
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_tool_end(
        &self,
        tool_execution_id: ToolExecutionId,
        result: serde_json::Value,
        timestamp: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tool_executions SET result = ?1, status = 'complete', end_time = ?2 WHERE id = ?3",
        )
        .bind(result.to_string())
        .bind(timestamp)
        .bind(tool_execution_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_thinking(&self, element_id: &str, message: &str, timestamp: i64) -> Result<()> {
        let thread_id = self.ensure_thread(element_id).await?;
        sqlx::query(
            "INSERT INTO thinking_events (id, thread_id, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(Uuid::now_v7().to_string())
        .bind(thread_id.to_string())
        .bind(message)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_thread_history(&self, element_id: &str) -> Result<ThreadHistory> {
        let Some(row) = sqlx::query("SELECT thread_id FROM threads WHERE element_id = ?1")
            .bind(element_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(ThreadHistory::default());
        };
        let thread_id_str: String = row.try_get("thread_id")?;
        let thread_id: ThreadId = Uuid::parse_str(&thread_id_str)?;

        let message_rows = sqlx::query(
            "SELECT message_id, role, content, status, timestamp, cancellation_reason FROM messages WHERE thread_id = ?1 ORDER BY timestamp",
        )
        .bind(&thread_id_str)
        .fetch_all(&self.pool)
        .await?;
        let messages = message_rows
            .into_iter()
            .map(|row| -> Result<StoredMessage> {
                Ok(StoredMessage {
                    message_id: Uuid::parse_str(&row.try_get::<String, _>("message_id")?)?,
                    thread_id,
                    role: row.try_get("role")?,
                    content: row.try_get("content")?,
                    status: status_from_str(&row.try_get::<String, _>("status")?),
                    timestamp: row.try_get("timestamp")?,
                    cancellation_reason: row.try_get("cancellation_reason")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let tool_rows = sqlx::query(
            "SELECT id, tool_name, args, result, status, start_time, end_time FROM tool_executions WHERE thread_id = ?1 ORDER BY start_time",
        )
        .bind(&thread_id_str)
        .fetch_all(&self.pool)
        .await?;
        let tools = tool_rows
            .into_iter()
            .map(|row| -> Result<StoredToolExecution> {
                let args_str: String = row.try_get("args")?;
                let result_str: Option<String> = row.try_get("result")?;
                Ok(StoredToolExecution {
                    id: Uuid::parse_str(&row.try_get::<String, _>("id")?)?,
                    thread_id,
                    tool_name: row.try_get("tool_name")?,
                    args: serde_json::from_str(&args_str).unwrap_or(serde_json::Value::Null),
                    result: result_str
                        .map(|s| serde_json::from_str(&s))
                        .transpose()
                        .unwrap_or(None),
                    status: status_from_str(&row.try_get::<String, _>("status")?),
                    start_time: row.try_get("start_time")?,
                    end_time: row.try_get("end_time")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let thinking_rows = sqlx::query(
            "SELECT id, message, timestamp FROM thinking_events WHERE thread_id = ?1 ORDER BY timestamp",
        )
        .bind(&thread_id_str)
        .fetch_all(&self.pool)
        .await?;
        let thinking = thinking_rows
            .into_iter()
            .map(|row| -> Result<StoredThinkingEvent> {
                Ok(StoredThinkingEvent {
                    id: Uuid::parse_str(&row.try_get::<String, _>("id")?)?,
                    thread_id,
                    message: row.try_get("message")?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ThreadHistory { messages, thinking, tools })
    }

    async fn clear_element_history(&self, element_id: &str) -> Result<()> {
        let Some(row) = sqlx::query("SELECT thread_id FROM threads WHERE element_id = ?1")
            .bind(element_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(());
        };
        let thread_id: String = row.try_get("thread_id")?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE thread_id = ?1").bind(&thread_id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM tool_executions WHERE thread_id = ?1").bind(&thread_id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM thinking_events WHERE thread_id = ?1").bind(&thread_id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM threads WHERE element_id = ?1").bind(element_id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Open (creating if absent) a WAL-mode SQLite pool at `path`, matching the
/// durability contract in §1 ("fsync-on-commit only").
pub async fn open_sqlite_store(path: &str) -> Result<SqliteEventStore> {
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    let options = SqliteConnectOptions::from_str(path)
        .with_context(|| format!("invalid sqlite path: {path}"))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Full);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| anyhow!("failed to open sqlite store at {path}: {e}"))?;

    let store = SqliteEventStore::new(pool);
    store.migrate().await?;
    Ok(store)
}
