//! Durable event store port (§3 "Event Log", §4.6). The scheduler,
//! broadcaster, and webhook/replay surface operate exclusively through this
//! trait, so `MemoryStore` (tests, POC) and `SqliteEventStore` (production)
//! are interchangeable — the same split the teacher draws between
//! `store_memory.rs` and `store_postgres.rs` behind `ProcessStore`.

use crate::events::AgUiEvent;
use crate::instance::InstanceId;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type ThreadId = uuid::Uuid;
pub type MessageId = uuid::Uuid;
pub type ToolExecutionId = uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Streaming,
    Complete,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub role: String,
    pub content: String,
    pub status: MessageStatus,
    pub timestamp: i64,
    pub cancellation_reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredToolExecution {
    pub id: ToolExecutionId,
    pub thread_id: ThreadId,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub status: MessageStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredThinkingEvent {
    pub id: uuid::Uuid,
    pub thread_id: ThreadId,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ThreadHistory {
    pub messages: Vec<StoredMessage>,
    pub thinking: Vec<StoredThinkingEvent>,
    pub tools: Vec<StoredToolExecution>,
}

/// Persistence trait for the durable audit trail. Every method must be
/// usable from multiple concurrent writers (§5: "single writer discipline"
/// means serialized, not single-threaded-only — an `RwLock`/mutex-guarded
/// in-memory store or a WAL-mode single-connection SQL store both satisfy
/// it).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Idempotent: returns the existing thread id if one is already mapped
    /// to `element_id`.
    async fn ensure_thread(&self, element_id: &str) -> Result<ThreadId>;

    async fn append_event(&self, instance_id: InstanceId, event: &AgUiEvent) -> Result<u64>;

    async fn read_events(
        &self,
        instance_id: InstanceId,
        from_seq: u64,
    ) -> Result<Vec<(u64, AgUiEvent)>>;

    async fn store_message_start(
        &self,
        element_id: &str,
        message_id: MessageId,
        role: &str,
        timestamp: i64,
    ) -> Result<()>;

    async fn update_message_content(&self, message_id: MessageId, cumulative_text: &str) -> Result<()>;

    async fn mark_message_complete(&self, message_id: MessageId) -> Result<()>;

    async fn mark_message_cancelled(&self, message_id: MessageId, reason: &str) -> Result<()>;

    async fn store_tool_start(
        &self,
        element_id: &str,
        tool_execution_id: ToolExecutionId,
        tool_name: &str,
        args: serde_json::Value,
        timestamp: i64,
    ) -> Result<()>;

    async fn update_tool_end(
        &self,
        tool_execution_id: ToolExecutionId,
        result: serde_json::Value,
        timestamp: i64,
    ) -> Result<()>;

    async fn store_thinking(&self, element_id: &str, message: &str, timestamp: i64) -> Result<()>;

    async fn get_thread_history(&self, element_id: &str) -> Result<ThreadHistory>;

    async fn clear_element_history(&self, element_id: &str) -> Result<()>;
}
