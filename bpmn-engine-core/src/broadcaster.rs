//! Event broadcaster (§4.5): fan-out of `AgUiEvent`s to live subscribers,
//! plus synchronous persistence on every `publish`.
//!
//! Grounded on the reference event-bus implementation's
//! `channels: Arc<RwLock<HashMap<String, broadcast::Sender<WorkflowEvent>>>>`
//! pattern (see DESIGN.md): a channel per subscription key, `parking_lot`
//! for the registry lock (uncontended fast path, no `.await` while held),
//! `tokio::sync::broadcast` for fan-out so a slow subscriber only loses its
//! own backlog rather than blocking publishers.

use crate::events::{now_ms, AgUiEvent, EventCategory, MessageStatus};
use crate::instance::InstanceId;
use crate::store::{EventStore, MessageId};
use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// A task's declared category filter (§4.5 "per-task filter registration").
/// `None` means no filter is registered: everything broadcasts. `Some(set)`
/// restricts broadcast to the given categories; unmatched events are still
/// persisted (filters only gate the live fan-out, never the event log).
pub type CategoryFilter = Option<Vec<EventCategory>>;

struct Channel {
    sender: broadcast::Sender<AgUiEvent>,
    filter: CategoryFilter,
}

struct Registry {
    channels: HashMap<InstanceId, Channel>,
}

/// Fan-out + persistence facade. One broadcaster per engine, shared via
/// `Arc` across the scheduler, webhook surface, and any transport layer.
pub struct Broadcaster {
    registry: RwLock<Registry>,
    store: Arc<dyn EventStore>,
    /// §4.5 per-subscriber bounded buffer size, from [`crate::config::EngineConfig::subscriber_buffer`].
    subscriber_buffer: usize,
    /// Cumulative text per in-flight streamed message, so `text.message.chunk`
    /// deltas can be folded into the single cumulative write
    /// `EventStore::update_message_content` expects (§10.6 replay
    /// reconstruction). Cleared on `text.message.end`.
    message_buffers: tokio::sync::RwLock<HashMap<MessageId, String>>,
}

pub struct Subscription {
    pub instance_id: InstanceId,
    receiver: broadcast::Receiver<AgUiEvent>,
}

impl Subscription {
    /// Await the next event for this instance. Returns `Ok(None)` when the
    /// channel has been torn down (instance finished and unsubscribed).
    pub async fn recv(&mut self) -> Option<AgUiEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(instance_id = %self.instance_id, skipped, "subscriber lagged, events dropped");
                    return Some(AgUiEvent::SubscriberLagged {
                        skipped,
                        timestamp: now_ms(),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Broadcaster {
    pub fn new(store: Arc<dyn EventStore>, subscriber_buffer: usize) -> Self {
        Self {
            registry: RwLock::new(Registry { channels: HashMap::new() }),
            store,
            subscriber_buffer,
            message_buffers: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Publish an event: persist synchronously (§4.5 "persistence is
    /// synchronous within publish"), fan the structured ones out into the
    /// event store's cumulative message/tool tables so replay (§4.8, §10.6)
    /// has something to reconstruct from, then fan out to subscribers of
    /// this instance, applying each subscriber's category filter. A closed
    /// or absent channel (no subscribers yet) is not an error.
    pub async fn publish(&self, instance_id: InstanceId, event: AgUiEvent) -> Result<()> {
        self.store.append_event(instance_id, &event).await?;
        self.fan_into_structured_tables(&event).await?;

        let sender = {
            let registry = self.registry.read();
            registry.channels.get(&instance_id).map(|c| (c.sender.clone(), c.filter.clone()))
        };
        if let Some((sender, filter)) = sender {
            let category = event.category();
            let allowed = match &filter {
                None => true,
                Some(categories) => categories.contains(&category),
            };
            if allowed {
                // `send` only errors when there are zero receivers, which is
                // expected before the first subscriber connects.
                let _ = sender.send(event);
            }
        }
        Ok(())
    }

    /// Fold a just-persisted event into the event store's cumulative
    /// message/tool/thinking tables so replay (§4.8) can reconstruct a
    /// thread's conversation state without re-streaming every delta (§10.6).
    /// Events outside this set (lifecycle, gateway, state, ping/pong, ...)
    /// are left to the raw append log alone.
    async fn fan_into_structured_tables(&self, event: &AgUiEvent) -> Result<()> {
        match event {
            AgUiEvent::TextMessageStart { element_id, message_id, role, timestamp } => {
                let Some(message_id) = parse_id("message_id", message_id) else { return Ok(()) };
                self.message_buffers.write().await.insert(message_id, String::new());
                self.store.store_message_start(element_id, message_id, role, *timestamp).await?;
            }
            AgUiEvent::TextMessageChunk { message_id, delta, .. } => {
                let Some(message_id) = parse_id("message_id", message_id) else { return Ok(()) };
                let cumulative = {
                    let mut buffers = self.message_buffers.write().await;
                    let entry = buffers.entry(message_id).or_default();
                    entry.push_str(delta);
                    entry.clone()
                };
                self.store.update_message_content(message_id, &cumulative).await?;
            }
            AgUiEvent::TextMessageEnd { message_id, status, .. } => {
                let Some(message_id) = parse_id("message_id", message_id) else { return Ok(()) };
                self.message_buffers.write().await.remove(&message_id);
                match status {
                    MessageStatus::Complete => self.store.mark_message_complete(message_id).await?,
                    MessageStatus::Cancelled => {
                        self.store.mark_message_cancelled(message_id, "cancelled by runner").await?
                    }
                    MessageStatus::Streaming => {}
                }
            }
            AgUiEvent::TaskToolStart { element_id, tool_execution_id, tool_name, args, timestamp } => {
                let Some(id) = parse_id("tool_execution_id", tool_execution_id) else { return Ok(()) };
                self.store.store_tool_start(element_id, id, tool_name, args.clone(), *timestamp).await?;
            }
            AgUiEvent::TaskToolEnd { tool_execution_id, result, timestamp, .. } => {
                let Some(id) = parse_id("tool_execution_id", tool_execution_id) else { return Ok(()) };
                self.store.update_tool_end(id, result.clone(), *timestamp).await?;
            }
            AgUiEvent::TaskThinking { element_id, message, timestamp } => {
                self.store.store_thinking(element_id, message, *timestamp).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Create or reuse the broadcast channel for `instance_id` and return a
    /// new subscription to it, optionally filtered by category.
    pub fn subscribe(&self, instance_id: InstanceId, filter: CategoryFilter) -> Subscription {
        let mut registry = self.registry.write();
        let channel = registry.channels.entry(instance_id).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.subscriber_buffer);
            Channel { sender, filter: None }
        });
        if filter.is_some() {
            channel.filter = filter;
        }
        Subscription {
            instance_id,
            receiver: channel.sender.subscribe(),
        }
    }

    /// Drop the channel for a finished instance. Idempotent.
    pub fn unsubscribe_all(&self, instance_id: InstanceId) {
        self.registry.write().channels.remove(&instance_id);
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }
}

/// Parse a wire-level id string into the uuid the structured tables key on.
/// A malformed id is a runner bug, not a store failure: log and let the
/// caller skip the structured write rather than failing the whole publish.
fn parse_id(field: &str, value: &str) -> Option<Uuid> {
    match Uuid::parse_str(value) {
        Ok(id) => Some(id),
        Err(error) => {
            warn!(field, value, %error, "event carried a non-uuid id, skipping structured-table write");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryEventStore;
    use uuid::Uuid;

    #[tokio::test]
    async fn publish_without_subscriber_still_persists() {
        let broadcaster = Broadcaster::new(Arc::new(MemoryEventStore::new()), 256);
        let instance_id = Uuid::now_v7();
        broadcaster
            .publish(instance_id, AgUiEvent::WorkflowStarted { instance_id, timestamp: 1 })
            .await
            .unwrap();
        let events = broadcaster.store().read_events(instance_id, 0).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let broadcaster = Broadcaster::new(Arc::new(MemoryEventStore::new()), 256);
        let instance_id = Uuid::now_v7();
        let mut sub = broadcaster.subscribe(instance_id, None);
        broadcaster
            .publish(instance_id, AgUiEvent::WorkflowStarted { instance_id, timestamp: 1 })
            .await
            .unwrap();
        let event = sub.recv().await.unwrap();
        assert!(matches!(event, AgUiEvent::WorkflowStarted { .. }));
    }

    #[tokio::test]
    async fn category_filter_gates_broadcast_not_persistence() {
        let broadcaster = Broadcaster::new(Arc::new(MemoryEventStore::new()), 256);
        let instance_id = Uuid::now_v7();
        let mut sub = broadcaster.subscribe(instance_id, Some(vec![EventCategory::Messaging]));
        broadcaster
            .publish(instance_id, AgUiEvent::WorkflowStarted { instance_id, timestamp: 1 })
            .await
            .unwrap();
        broadcaster
            .publish(
                instance_id,
                AgUiEvent::TextMessageStart {
                    element_id: "task-1".into(),
                    message_id: "m1".into(),
                    role: "assistant".into(),
                    timestamp: 2,
                },
            )
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert!(matches!(event, AgUiEvent::TextMessageStart { .. }));

        let persisted = broadcaster.store().read_events(instance_id, 0).await.unwrap();
        assert_eq!(persisted.len(), 2);
    }
}
