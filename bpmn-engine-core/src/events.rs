//! AG-UI wire events — the durable, broadcastable audit trail for every
//! process instance (§3 "Event Log", §4.5 "Event Broadcaster").
//!
//! `AgUiEvent` is the tagged union that crosses the wire to subscribers and
//! is what gets appended to the event log; `EventCategory` is the dimension
//! the broadcaster's per-task filters operate on.

use crate::instance::InstanceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Messaging,
    Tool,
    State,
    Lifecycle,
    Special,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Streaming,
    Complete,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Success,
    Failed,
    Cancelled,
}

/// The tagged envelope that flows through the broadcaster and the event
/// store. `type` matches the dotted wire names in §4.5 verbatim so the
/// modeler's subscriber (outside this engine's scope) needs no translation
/// layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgUiEvent {
    #[serde(rename = "workflow.started")]
    WorkflowStarted {
        instance_id: InstanceId,
        timestamp: i64,
    },
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted {
        instance_id: InstanceId,
        outcome: WorkflowOutcome,
        reason: Option<String>,
        timestamp: i64,
    },
    #[serde(rename = "element.activated")]
    ElementActivated {
        element_id: String,
        timestamp: i64,
    },
    #[serde(rename = "element.completed")]
    ElementCompleted {
        element_id: String,
        duration_ms: i64,
        timestamp: i64,
    },
    #[serde(rename = "task.progress")]
    TaskProgress {
        element_id: String,
        message: String,
        timestamp: i64,
    },
    #[serde(rename = "task.error")]
    TaskError {
        element_id: String,
        error_code: String,
        message: String,
        timestamp: i64,
    },
    #[serde(rename = "task.cancelled")]
    TaskCancelled {
        element_id: String,
        reason: String,
        partial_result: Option<Value>,
        timestamp: i64,
    },
    #[serde(rename = "boundary.triggered")]
    BoundaryTriggered {
        boundary_id: String,
        reason: String,
        timestamp: i64,
    },
    #[serde(rename = "gateway.forked")]
    GatewayForked {
        element_id: String,
        count: usize,
        timestamp: i64,
    },
    #[serde(rename = "gateway.path_taken")]
    GatewayPathTaken {
        element_id: String,
        flow_id: String,
        timestamp: i64,
    },
    #[serde(rename = "gateway.deadlock")]
    GatewayDeadlock {
        gateway_id: String,
        arrived: usize,
        expected: usize,
        missing_predecessors: Vec<String>,
        timestamp: i64,
    },
    #[serde(rename = "text.message.start")]
    TextMessageStart {
        element_id: String,
        message_id: String,
        role: String,
        timestamp: i64,
    },
    #[serde(rename = "text.message.chunk")]
    TextMessageChunk {
        element_id: String,
        message_id: String,
        delta: String,
        timestamp: i64,
    },
    #[serde(rename = "text.message.end")]
    TextMessageEnd {
        element_id: String,
        message_id: String,
        status: MessageStatus,
        timestamp: i64,
    },
    #[serde(rename = "task.tool.start")]
    TaskToolStart {
        element_id: String,
        tool_execution_id: String,
        tool_name: String,
        args: Value,
        timestamp: i64,
    },
    #[serde(rename = "task.tool.end")]
    TaskToolEnd {
        element_id: String,
        tool_execution_id: String,
        result: Value,
        timestamp: i64,
    },
    #[serde(rename = "messages.snapshot")]
    MessagesSnapshot {
        element_id: String,
        history: Value,
        timestamp: i64,
    },
    #[serde(rename = "state.snapshot")]
    StateSnapshot {
        instance_id: InstanceId,
        context: Value,
        timestamp: i64,
    },
    #[serde(rename = "state.delta")]
    StateDelta {
        instance_id: InstanceId,
        patch: Value,
        timestamp: i64,
    },
    #[serde(rename = "task.thinking")]
    TaskThinking {
        element_id: String,
        message: String,
        timestamp: i64,
    },
    #[serde(rename = "userTask.created")]
    UserTaskCreated {
        element_id: String,
        timestamp: i64,
    },
    #[serde(rename = "userTask.complete")]
    UserTaskComplete {
        element_id: String,
        decision: String,
        comments: Option<String>,
        timestamp: i64,
    },
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
    #[serde(rename = "replay.request")]
    ReplayRequest {
        element_id: String,
        timestamp: i64,
    },
    #[serde(rename = "clear.history")]
    ClearHistory {
        element_id: String,
        timestamp: i64,
    },
    /// Emitted when a subscriber's bounded buffer overflows and the oldest
    /// queued event was dropped to keep the engine non-blocking (§4.5).
    #[serde(rename = "subscriber.lagged")]
    SubscriberLagged { skipped: u64, timestamp: i64 },
}

impl AgUiEvent {
    /// Element this event is about, when it is element-scoped. Used by the
    /// event store to file the event under the right thread, and by
    /// per-task category filters.
    pub fn element_id(&self) -> Option<&str> {
        use AgUiEvent::*;
        match self {
            ElementActivated { element_id, .. }
            | ElementCompleted { element_id, .. }
            | TaskProgress { element_id, .. }
            | TaskError { element_id, .. }
            | TaskCancelled { element_id, .. }
            | GatewayForked { element_id, .. }
            | GatewayPathTaken { element_id, .. }
            | TextMessageStart { element_id, .. }
            | TextMessageChunk { element_id, .. }
            | TextMessageEnd { element_id, .. }
            | TaskToolStart { element_id, .. }
            | TaskToolEnd { element_id, .. }
            | MessagesSnapshot { element_id, .. }
            | TaskThinking { element_id, .. }
            | UserTaskCreated { element_id, .. }
            | UserTaskComplete { element_id, .. }
            | ReplayRequest { element_id, .. }
            | ClearHistory { element_id, .. } => Some(element_id),
            BoundaryTriggered { boundary_id, .. } => Some(boundary_id),
            GatewayDeadlock { gateway_id, .. } => Some(gateway_id),
            _ => None,
        }
    }

    /// Category used by the broadcaster's per-task filter (§4.5).
    pub fn category(&self) -> EventCategory {
        use AgUiEvent::*;
        match self {
            WorkflowStarted { .. }
            | WorkflowCompleted { .. }
            | ElementActivated { .. }
            | ElementCompleted { .. }
            | TaskProgress { .. }
            | TaskError { .. }
            | TaskCancelled { .. }
            | BoundaryTriggered { .. }
            | GatewayForked { .. }
            | GatewayPathTaken { .. }
            | GatewayDeadlock { .. } => EventCategory::Lifecycle,
            TextMessageStart { .. } | TextMessageChunk { .. } | TextMessageEnd { .. } => {
                EventCategory::Messaging
            }
            TaskToolStart { .. } | TaskToolEnd { .. } => EventCategory::Tool,
            MessagesSnapshot { .. } | StateSnapshot { .. } | StateDelta { .. } => {
                EventCategory::State
            }
            TaskThinking { .. }
            | UserTaskCreated { .. }
            | UserTaskComplete { .. }
            | Ping { .. }
            | Pong { .. }
            | ReplayRequest { .. }
            | ClearHistory { .. }
            | SubscriberLagged { .. } => EventCategory::Special,
        }
    }

    /// Whether this event carries a durable, replayable fact versus being a
    /// purely ephemeral broadcast signal (grounded on the `is_persistent`
    /// distinction in the reference event-bus implementation this engine's
    /// broadcaster borrows its shape from — see DESIGN.md). `Ping`/`Pong`
    /// keepalives and lag warnings are never persisted.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, AgUiEvent::Ping { .. } | AgUiEvent::Pong { .. } | AgUiEvent::SubscriberLagged { .. })
    }

    pub fn timestamp(&self) -> i64 {
        use AgUiEvent::*;
        match self {
            WorkflowStarted { timestamp, .. }
            | WorkflowCompleted { timestamp, .. }
            | ElementActivated { timestamp, .. }
            | ElementCompleted { timestamp, .. }
            | TaskProgress { timestamp, .. }
            | TaskError { timestamp, .. }
            | TaskCancelled { timestamp, .. }
            | BoundaryTriggered { timestamp, .. }
            | GatewayForked { timestamp, .. }
            | GatewayPathTaken { timestamp, .. }
            | GatewayDeadlock { timestamp, .. }
            | TextMessageStart { timestamp, .. }
            | TextMessageChunk { timestamp, .. }
            | TextMessageEnd { timestamp, .. }
            | TaskToolStart { timestamp, .. }
            | TaskToolEnd { timestamp, .. }
            | MessagesSnapshot { timestamp, .. }
            | StateSnapshot { timestamp, .. }
            | StateDelta { timestamp, .. }
            | TaskThinking { timestamp, .. }
            | UserTaskCreated { timestamp, .. }
            | UserTaskComplete { timestamp, .. }
            | Ping { timestamp }
            | Pong { timestamp }
            | ReplayRequest { timestamp, .. }
            | ClearHistory { timestamp, .. }
            | SubscriberLagged { timestamp, .. } => *timestamp,
        }
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
