//! Correlation-keyed message queue (§4.7): pairs inbound webhook payloads
//! with waiting receive-tasks by `(message_ref, correlation_key)`.
//!
//! Shape mirrors `MemoryEventStore`: one `RwLock`-guarded `Inner`, the
//! two maps `waiters`/`mailbox` named directly after §4.7's state
//! description. Suspension is a `tokio::sync::oneshot` per waiter rather
//! than a condvar, matching the scheduler's own async-suspension idiom.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("timed out waiting for correlated message")]
    Timeout,
    #[error("waiter channel closed before delivery")]
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct QueuedMessage {
    pub message_ref: String,
    pub payload: Value,
}

struct Waiter {
    message_ref: String,
    sender: oneshot::Sender<QueuedMessage>,
}

#[derive(Default)]
struct Inner {
    waiters: HashMap<String, VecDeque<Waiter>>,
    mailbox: HashMap<String, VecDeque<QueuedMessage>>,
}

pub struct MessageQueue {
    inner: RwLock<Inner>,
    /// §4.7 mailbox-size warning threshold, from
    /// [`crate::config::EngineConfig::mailbox_warning_threshold`].
    mailbox_warning_threshold: usize,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct QueueStats {
    pub queued_counts: HashMap<String, usize>,
    pub waiting_counts: HashMap<String, usize>,
    pub keys: Vec<String>,
}

impl MessageQueue {
    pub fn new(mailbox_warning_threshold: usize) -> Self {
        Self { inner: RwLock::new(Inner::default()), mailbox_warning_threshold }
    }

    /// Register a wait for `(message_ref, correlation_key)`. If a matching
    /// message is already mailboxed, returns it immediately. Otherwise
    /// suspends until delivery or `timeout` elapses (`None` = unbounded,
    /// §5 "Receive-task timeouts ... default unbounded").
    pub async fn wait(
        &self,
        message_ref: &str,
        correlation_key: &str,
        timeout: Option<Duration>,
    ) -> Result<QueuedMessage, QueueError> {
        let rx = {
            let mut inner = self.inner.write().await;
            if let Some(queue) = inner.mailbox.get_mut(correlation_key) {
                if let Some(pos) = queue.iter().position(|m| m.message_ref == message_ref) {
                    return Ok(queue.remove(pos).expect("position just found"));
                }
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(correlation_key.to_string()).or_default().push_back(Waiter {
                message_ref: message_ref.to_string(),
                sender: tx,
            });
            rx
        };

        let result = match timeout {
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(Ok(message)) => Ok(message),
                Ok(Err(_)) => Err(QueueError::Cancelled),
                Err(_) => Err(QueueError::Timeout),
            },
            None => rx.await.map_err(|_| QueueError::Cancelled),
        };

        if result.is_err() {
            // Deregister on timeout/cancel so the registry entry is not
            // leaked (§5: "timers and receive-task waits must release their
            // registry entries on cancellation").
            let mut inner = self.inner.write().await;
            if let Some(queue) = inner.waiters.get_mut(correlation_key) {
                queue.retain(|w| !w.sender.is_closed());
            }
        }
        result
    }

    /// Deliver an inbound message. Wakes the oldest matching waiter if one
    /// is registered; otherwise mailboxes the message for a future `wait`.
    pub async fn deliver(&self, message_ref: &str, correlation_key: &str, payload: Value) -> bool {
        let message = QueuedMessage { message_ref: message_ref.to_string(), payload };
        let mut inner = self.inner.write().await;

        if let Some(queue) = inner.waiters.get_mut(correlation_key) {
            if let Some(pos) = queue.iter().position(|w| w.message_ref == message_ref) {
                let waiter = queue.remove(pos).expect("position just found");
                if queue.is_empty() {
                    inner.waiters.remove(correlation_key);
                }
                // If the receiver already dropped (e.g. timed out a moment
                // ago) fall through and mailbox the message instead of
                // losing it.
                if waiter.sender.send(message.clone()).is_ok() {
                    return true;
                }
            }
        }

        let mailbox = inner.mailbox.entry(correlation_key.to_string()).or_default();
        mailbox.push_back(message);
        if mailbox.len() > self.mailbox_warning_threshold {
            warn!(correlation_key, size = mailbox.len(), "message queue mailbox exceeds warning threshold");
        }
        false
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.read().await;
        let mut keys: Vec<String> = inner
            .mailbox
            .keys()
            .chain(inner.waiters.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        QueueStats {
            queued_counts: inner.mailbox.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
            waiting_counts: inner.waiters.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
            keys,
        }
    }

    pub async fn clear(&self, correlation_key: &str) {
        let mut inner = self.inner.write().await;
        inner.mailbox.remove(correlation_key);
        inner.waiters.remove(correlation_key);
    }
}
