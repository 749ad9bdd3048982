//! In-memory [`EventStore`] for tests and single-process POC deployments.
//! Grounded directly on the teacher's `MemoryStore` (`store_memory.rs`):
//! one `RwLock`-guarded `Inner` struct, one method per trait operation.

use crate::events::{now_ms, AgUiEvent};
use crate::instance::InstanceId;
use crate::store::{
    EventStore, MessageId, MessageStatus, StoredMessage, StoredThinkingEvent,
    StoredToolExecution, ThreadHistory, ThreadId, ToolExecutionId,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Inner {
    threads: HashMap<String, ThreadId>,
    events: HashMap<InstanceId, Vec<(u64, AgUiEvent)>>,
    event_seq: HashMap<InstanceId, u64>,
    messages: HashMap<MessageId, StoredMessage>,
    thread_messages: HashMap<ThreadId, Vec<MessageId>>,
    tools: HashMap<ToolExecutionId, StoredToolExecution>,
    thread_tools: HashMap<ThreadId, Vec<ToolExecutionId>>,
    thread_thinking: HashMap<ThreadId, Vec<StoredThinkingEvent>>,
}

pub struct MemoryEventStore {
    inner: RwLock<Inner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                threads: HashMap::new(),
                events: HashMap::new(),
                event_seq: HashMap::new(),
                messages: HashMap::new(),
                thread_messages: HashMap::new(),
                tools: HashMap::new(),
                thread_tools: HashMap::new(),
                thread_thinking: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn ensure_thread(&self, element_id: &str) -> Result<ThreadId> {
        let mut w = self.inner.write().await;
        if let Some(&id) = w.threads.get(element_id) {
            return Ok(id);
        }
        let id = Uuid::now_v7();
        w.threads.insert(element_id.to_string(), id);
        Ok(id)
    }

    async fn append_event(&self, instance_id: InstanceId, event: &AgUiEvent) -> Result<u64> {
        let mut w = self.inner.write().await;
        let seq_counter = w.event_seq.entry(instance_id).or_insert(0);
        *seq_counter += 1;
        let seq = *seq_counter;
        if event.is_persistent() {
            w.events.entry(instance_id).or_default().push((seq, event.clone()));
        }
        Ok(seq)
    }

    async fn read_events(
        &self,
        instance_id: InstanceId,
        from_seq: u64,
    ) -> Result<Vec<(u64, AgUiEvent)>> {
        let r = self.inner.read().await;
        Ok(r.events
            .get(&instance_id)
            .map(|evts| evts.iter().filter(|(seq, _)| *seq >= from_seq).cloned().collect())
            .unwrap_or_default())
    }

    async fn store_message_start(
        &self,
        element_id: &str,
        message_id: MessageId,
        role: &str,
        timestamp: i64,
    ) -> Result<()> {
        let thread_id = self.ensure_thread(element_id).await?;
        let mut w = self.inner.write().await;
        w.messages.insert(
            message_id,
            StoredMessage {
                message_id,
                thread_id,
                role: role.to_string(),
                content: String::new(),
                status: MessageStatus::Streaming,
                timestamp,
                cancellation_reason: None,
            },
        );
        w.thread_messages.entry(thread_id).or_default().push(message_id);
        Ok(())
    }

    async fn update_message_content(&self, message_id: MessageId, cumulative_text: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        let msg = w
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| anyhow!("message not found: {message_id}"))?;
        msg.content = cumulative_text.to_string();
        Ok(())
    }

    async fn mark_message_complete(&self, message_id: MessageId) -> Result<()> {
        let mut w = self.inner.write().await;
        let msg = w
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| anyhow!("message not found: {message_id}"))?;
        msg.status = MessageStatus::Complete;
        Ok(())
    }

    async fn mark_message_cancelled(&self, message_id: MessageId, reason: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        let msg = w
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| anyhow!("message not found: {message_id}"))?;
        msg.status = MessageStatus::Cancelled;
        msg.cancellation_reason = Some(reason.to_string());
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
        let mut w = self.inner.write().await;
        w.tools.insert(
            tool_execution_id,
            StoredToolExecution {
                id: tool_execution_id,
                thread_id,
                tool_name: tool_name.to_string(),
                args,
                result: None,
                status: MessageStatus::Streaming,
                start_time: timestamp,
                end_time: None,
            },
        );
        w.thread_tools.entry(thread_id).or_default().push(tool_execution_id);
        Ok(())
    }

    async fn update_tool_end(
        &self,
        tool_execution_id: ToolExecutionId,
        result: serde_json::Value,
        timestamp: i64,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let tool = w
            .tools
            .get_mut(&tool_execution_id)
            .ok_or_else(|| anyhow!("tool execution not found: {tool_execution_id}"))?;
        tool.result = Some(result);
        tool.status = MessageStatus::Complete;
        tool.end_time = Some(timestamp);
        Ok(())
    }

    async fn store_thinking(&self, element_id: &str, message: &str, timestamp: i64) -> Result<()> {
        let thread_id = self.ensure_thread(element_id).await?;
        let mut w = self.inner.write().await;
        w.thread_thinking.entry(thread_id).or_default().push(StoredThinkingEvent {
            id: Uuid::now_v7(),
            thread_id,
            message: message.to_string(),
            timestamp,
        });
        Ok(())
    }

    async fn get_thread_history(&self, element_id: &str) -> Result<ThreadHistory> {
        let r = self.inner.read().await;
        let Some(&thread_id) = r.threads.get(element_id) else {
            return Ok(ThreadHistory::default());
        };
        let mut messages: Vec<StoredMessage> = r
            .thread_messages
            .get(&thread_id)
            .map(|ids| ids.iter().filter_map(|id| r.messages.get(id).cloned()).collect())
            .unwrap_or_default();
        messages.sort_by_key(|m| m.timestamp);

        let mut tools: Vec<StoredToolExecution> = r
            .thread_tools
            .get(&thread_id)
            .map(|ids| ids.iter().filter_map(|id| r.tools.get(id).cloned()).collect())
            .unwrap_or_default();
        tools.sort_by_key(|t| t.start_time);

        let mut thinking = r.thread_thinking.get(&thread_id).cloned().unwrap_or_default();
        thinking.sort_by_key(|t| t.timestamp);

        Ok(ThreadHistory { messages, thinking, tools })
    }

    async fn clear_element_history(&self, element_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(thread_id) = w.threads.remove(element_id) {
            if let Some(ids) = w.thread_messages.remove(&thread_id) {
                for id in ids {
                    w.messages.remove(&id);
                }
            }
            if let Some(ids) = w.thread_tools.remove(&thread_id) {
                for id in ids {
                    w.tools.remove(&id);
                }
            }
            w.thread_thinking.remove(&thread_id);
        }
        Ok(())
    }
}

/// Convenience helper used by call sites that just want "now" without
/// importing `events::now_ms` directly.
pub fn current_time_ms() -> i64 {
    now_ms()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::WorkflowOutcome;

    #[tokio::test]
    async fn thread_lookup_is_idempotent() {
        let store = MemoryEventStore::new();
        let a = store.ensure_thread("task-1").await.unwrap();
        let b = store.ensure_thread("task-1").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn event_log_append_and_read_from_seq() {
        let store = MemoryEventStore::new();
        let instance_id = Uuid::now_v7();
        for i in 0..5 {
            store
                .append_event(
                    instance_id,
                    &AgUiEvent::ElementActivated {
                        element_id: format!("e{i}"),
                        timestamp: i,
                    },
                )
                .await
                .unwrap();
        }
        let events = store.read_events(instance_id, 3).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0, 3);
    }

    #[tokio::test]
    async fn ephemeral_events_are_not_persisted() {
        let store = MemoryEventStore::new();
        let instance_id = Uuid::now_v7();
        store.append_event(instance_id, &AgUiEvent::Ping { timestamp: 1 }).await.unwrap();
        store
            .append_event(
                instance_id,
                &AgUiEvent::WorkflowCompleted {
                    instance_id,
                    outcome: WorkflowOutcome::Success,
                    reason: None,
                    timestamp: 2,
                },
            )
            .await
            .unwrap();
        let events = store.read_events(instance_id, 0).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn message_lifecycle_round_trip() {
        let store = MemoryEventStore::new();
        let message_id = Uuid::now_v7();
        store.store_message_start("agent-1", message_id, "assistant", 0).await.unwrap();
        store.update_message_content(message_id, "hello").await.unwrap();
        store.update_message_content(message_id, "hello world").await.unwrap();
        store.mark_message_complete(message_id).await.unwrap();

        let history = store.get_thread_history("agent-1").await.unwrap();
        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.messages[0].content, "hello world");
        assert_eq!(history.messages[0].status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn clear_history_removes_thread_contents() {
        let store = MemoryEventStore::new();
        let message_id = Uuid::now_v7();
        store.store_message_start("agent-1", message_id, "assistant", 0).await.unwrap();
        store.clear_element_history("agent-1").await.unwrap();
        let history = store.get_thread_history("agent-1").await.unwrap();
        assert!(history.messages.is_empty());
    }
}
