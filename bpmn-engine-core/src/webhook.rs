//! Webhook/Replay Surface (§4.8): the two thin operations at the boundary
//! between external collaborators and the message queue / event store.

use crate::broadcaster::Broadcaster;
use crate::events::{now_ms, AgUiEvent};
use crate::instance::InstanceId;
use crate::message_queue::MessageQueue;
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

pub struct IngestResult {
    pub delivered: bool,
    pub message_ref: String,
    pub correlation_key: String,
}

/// `ingest(message_ref, correlation_key, payload)` → calls `deliver` and
/// returns delivery status (§4.8).
pub async fn ingest(
    queue: &MessageQueue,
    message_ref: &str,
    correlation_key: &str,
    payload: Value,
) -> IngestResult {
    let delivered = queue.deliver(message_ref, correlation_key, payload).await;
    IngestResult {
        delivered,
        message_ref: message_ref.to_string(),
        correlation_key: correlation_key.to_string(),
    }
}

/// `replay(element_id)` → fetches `get_thread_history` and emits a single
/// `messages.snapshot` envelope to the requesting subscriber (§4.8: "for
/// on-demand reconstruction after reconnect"). `instance_id` scopes which
/// broadcaster channel the snapshot is published on; a replaying client is
/// expected to already hold a subscription to that instance.
pub async fn replay(broadcaster: &Broadcaster, instance_id: InstanceId, element_id: &str) -> Result<()> {
    let history = broadcaster.store().get_thread_history(element_id).await?;
    broadcaster
        .publish(
            instance_id,
            AgUiEvent::MessagesSnapshot {
                element_id: element_id.to_string(),
                history: serde_json::to_value(&history)?,
                timestamp: now_ms(),
            },
        )
        .await?;
    Ok(())
}

pub async fn clear_history(
    broadcaster: &Broadcaster,
    instance_id: InstanceId,
    element_id: &str,
) -> Result<()> {
    broadcaster.store().clear_element_history(element_id).await?;
    broadcaster
        .publish(
            instance_id,
            AgUiEvent::ClearHistory { element_id: element_id.to_string(), timestamp: now_ms() },
        )
        .await?;
    Ok(())
}

pub type SharedMessageQueue = Arc<MessageQueue>;
