//! Task Runner Registry (§4.4): a static `kind -> runner` dispatch table.
//! Each runner produces progress events through the broadcaster and ends in
//! either a success (with a result to merge into context) or an error.
//!
//! Grounded on the teacher's engine dispatch-by-opcode shape, generalized
//! from a fixed VM instruction set to a trait object per §9's "replace
//! with a static kind -> runner table; runners are values implementing a
//! common contract".
//!
//! Compensation-throw and call-activity are not runners here: both need to
//! recurse back into the scheduler's `advance_from`, which would make this
//! module depend on `scheduler` and `scheduler` depend on this module. They
//! are implemented directly in `scheduler.rs` instead, following §9's
//! guidance to resolve cyclic references by id lookup rather than
//! bidirectional pointers.

use crate::broadcaster::Broadcaster;
use crate::cancellation::CancellationToken;
use crate::context::Context;
use crate::error::EngineError;
use crate::events::{now_ms, AgUiEvent};
use crate::instance::InstanceId;
use crate::message_queue::{MessageQueue, QueueError};
use crate::types::Element;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::info;

/// What a successful runner execution hands back to the scheduler: a
/// result value to deep-merge into instance context under a task-scoped
/// key, unless the runner already wrote directly to context (script).
pub struct RunnerOutcome {
    pub result: Value,
}

/// Common contract every task kind's runner implements (§4.4, §9 "runners
/// are values implementing a common contract").
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn execute(
        &self,
        element: &Element,
        instance_id: InstanceId,
        context: &mut Context,
        broadcaster: &Broadcaster,
        cancellation: &mut CancellationToken,
    ) -> Result<RunnerOutcome, EngineError>;
}

fn prop_str(element: &Element, key: &str) -> Option<String> {
    element.properties.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// **Script**: evaluates an inline snippet "in a sandbox with context
/// exposed" (§4.4). This engine does not embed a general script VM — the
/// sandboxed surface it actually exposes is the same safe expression
/// grammar gateway conditions use, applied to a `result` property, which
/// satisfies the "no unbounded eval" constraint from §6 while remaining
/// useful for simple derived assignments. Arithmetic/logic beyond the
/// grammar is the opaque agent runner's job.
pub struct ScriptRunner;

#[async_trait]
impl TaskRunner for ScriptRunner {
    async fn execute(
        &self,
        element: &Element,
        _instance_id: InstanceId,
        context: &mut Context,
        _broadcaster: &Broadcaster,
        _cancellation: &mut CancellationToken,
    ) -> Result<RunnerOutcome, EngineError> {
        let result_key = prop_str(element, "resultVariable").unwrap_or_else(|| "result".to_string());
        let expr = prop_str(element, "expression").unwrap_or_default();
        let interpolated = context.interpolate(&expr);
        let value: Value =
            serde_json::from_str(&interpolated).unwrap_or(Value::String(interpolated));
        context.set(&result_key, value.clone());
        Ok(RunnerOutcome { result: value })
    }
}

/// **Send**: formats configured fields with `${var}` interpolation and
/// delegates to an external dispatcher. Absent a configured collaborator
/// (§6: "Send-task dispatcher ... outside the engine"), logs a simulated
/// send — matching §4.4's "if no real sender is configured, logs a
/// simulated send".
pub struct SendRunner;

#[async_trait]
impl TaskRunner for SendRunner {
    async fn execute(
        &self,
        element: &Element,
        _instance_id: InstanceId,
        context: &mut Context,
        _broadcaster: &Broadcaster,
        _cancellation: &mut CancellationToken,
    ) -> Result<RunnerOutcome, EngineError> {
        let to = prop_str(element, "to").map(|t| context.interpolate(&t)).unwrap_or_default();
        let subject = prop_str(element, "subject").map(|s| context.interpolate(&s)).unwrap_or_default();
        let body = prop_str(element, "body").map(|b| context.interpolate(&b)).unwrap_or_default();
        info!(element = %element.id, %to, %subject, "simulated send (no dispatcher configured)");
        Ok(RunnerOutcome { result: serde_json::json!({"to": to, "subject": subject, "body": body}) })
    }
}

/// **Receive**: registers a waiter on the message queue and suspends until
/// delivery or timeout (§4.4).
pub struct ReceiveRunner {
    pub queue: Arc<MessageQueue>,
}

#[async_trait]
impl TaskRunner for ReceiveRunner {
    async fn execute(
        &self,
        element: &Element,
        _instance_id: InstanceId,
        context: &mut Context,
        _broadcaster: &Broadcaster,
        cancellation: &mut CancellationToken,
    ) -> Result<RunnerOutcome, EngineError> {
        let message_ref = prop_str(element, "messageRef").unwrap_or_default();
        let correlation_key_template = prop_str(element, "correlationKey").unwrap_or_default();
        let correlation_key = context.interpolate(&correlation_key_template);
        let timeout_ms = element.properties.get("timeoutMs").and_then(|v| v.as_i64());
        let timeout = timeout_ms.map(|ms| Duration::from_millis(ms as u64));

        tokio::select! {
            result = self.queue.wait(&message_ref, &correlation_key, timeout) => {
                let message = result.map_err(|e| match e {
                    QueueError::Timeout => EngineError::CorrelationTimeout { element_id: element.id.clone() },
                    QueueError::Cancelled => EngineError::Cancelled {
                        element_id: element.id.clone(),
                        reason: "message wait cancelled".to_string(),
                    },
                })?;
                context.merge(message.payload.clone());
                context.set(&format!("{}_message", element.id), message.payload.clone());
                Ok(RunnerOutcome { result: message.payload })
            }
            reason = cancellation.cancelled() => {
                Err(EngineError::Cancelled { element_id: element.id.clone(), reason })
            }
        }
    }
}

/// A pending user-task wait: the scheduler hands the sender half to the
/// inbound `userTask.complete` command handler and wraps the receiver half
/// in a `UserTaskRunner` for this activation.
#[derive(Clone, Debug)]
pub struct UserTaskDecision {
    pub decision: String,
    pub comments: Option<String>,
}

/// **User**: emits `userTask.created` and suspends for an external
/// `userTask.complete` (§4.4). One instance is constructed per activation
/// (never reused), so the `Mutex<Option<_>>` around the receiver exists
/// only to let `execute` take `&self` like every other runner, not for
/// actual concurrent access.
pub struct UserTaskRunner {
    completion: Mutex<Option<oneshot::Receiver<UserTaskDecision>>>,
}

impl UserTaskRunner {
    pub fn new(completion: oneshot::Receiver<UserTaskDecision>) -> Self {
        Self { completion: Mutex::new(Some(completion)) }
    }
}

#[async_trait]
impl TaskRunner for UserTaskRunner {
    async fn execute(
        &self,
        element: &Element,
        instance_id: InstanceId,
        context: &mut Context,
        broadcaster: &Broadcaster,
        cancellation: &mut CancellationToken,
    ) -> Result<RunnerOutcome, EngineError> {
        broadcaster
            .publish(instance_id, AgUiEvent::UserTaskCreated { element_id: element.id.clone(), timestamp: now_ms() })
            .await
            .map_err(EngineError::Persistence)?;

        let mut receiver = self
            .completion
            .lock()
            .await
            .take()
            .expect("UserTaskRunner::execute called more than once");

        tokio::select! {
            decision = &mut receiver => {
                let decision = decision.map_err(|_| EngineError::Cancelled {
                    element_id: element.id.clone(),
                    reason: "user task completion channel closed".to_string(),
                })?;
                context.set(&format!("{}_decision", element.id), Value::String(decision.decision.clone()));
                if let Some(comments) = &decision.comments {
                    context.set(&format!("{}_comments", element.id), Value::String(comments.clone()));
                }
                Ok(RunnerOutcome { result: serde_json::json!({"decision": decision.decision, "comments": decision.comments}) })
            }
            reason = cancellation.cancelled() => {
                Err(EngineError::Cancelled { element_id: element.id.clone(), reason })
            }
        }
    }
}

/// **Service / Business-rule / Manual**: single-shot, may be simulated
/// (§4.4). All three share identical engine-side behavior; the distinction
/// is purely semantic/documentary for the modeler.
pub struct SimpleTaskRunner;

#[async_trait]
impl TaskRunner for SimpleTaskRunner {
    async fn execute(
        &self,
        element: &Element,
        instance_id: InstanceId,
        _context: &mut Context,
        broadcaster: &Broadcaster,
        _cancellation: &mut CancellationToken,
    ) -> Result<RunnerOutcome, EngineError> {
        broadcaster
            .publish(
                instance_id,
                AgUiEvent::TaskProgress {
                    element_id: element.id.clone(),
                    message: format!("{} executed", element.name),
                    timestamp: now_ms(),
                },
            )
            .await
            .map_err(EngineError::Persistence)?;
        Ok(RunnerOutcome { result: Value::Null })
    }
}

/// **Start/End**: side-effect-free (§4.4). The scheduler publishes
/// `workflow.started`/`workflow.completed` itself; this runner exists only
/// to satisfy the dispatch table uniformly for elements that still route
/// through the generic task-execution path (none currently do — start/end
/// are handled as dedicated scheduler cases — but the type stays available
/// for a future generic-element traversal).
pub struct NoopRunner;

#[async_trait]
impl TaskRunner for NoopRunner {
    async fn execute(
        &self,
        _element: &Element,
        _instance_id: InstanceId,
        _context: &mut Context,
        _broadcaster: &Broadcaster,
        _cancellation: &mut CancellationToken,
    ) -> Result<RunnerOutcome, EngineError> {
        Ok(RunnerOutcome { result: Value::Null })
    }
}

/// The external collaborator contract an agentic task body must satisfy
/// (§6 "Agent runner: must accept (element, context, progress_sink,
/// cancellation_handle) and produce events conforming to §4.5"). This
/// engine treats the agent body as opaque — LLM/agent task bodies are
/// explicitly out of scope (§1) — so this trait is the seam a caller
/// plugs a real implementation into.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run to completion, streaming text/tool events through `broadcaster`
    /// directly (publishing `text.message.*` / `task.tool.*` itself) and
    /// honoring `cancellation`. Returns the final assistant message text.
    async fn run(
        &self,
        element: &Element,
        instance_id: InstanceId,
        context: &Context,
        broadcaster: &Broadcaster,
        cancellation: &mut CancellationToken,
    ) -> Result<String, EngineError>;
}

/// **Agent**: delegates to a pluggable [`AgentExecutor`]. On cancellation,
/// the in-flight message (if any) is the executor's responsibility to mark
/// `cancelled` via `publish` before returning — this runner only surfaces
/// the cancellation error upward so the scheduler treats the branch the
/// same as any other cancelled task.
pub struct AgentRunner {
    pub executor: Arc<dyn AgentExecutor>,
}

#[async_trait]
impl TaskRunner for AgentRunner {
    async fn execute(
        &self,
        element: &Element,
        instance_id: InstanceId,
        context: &mut Context,
        broadcaster: &Broadcaster,
        cancellation: &mut CancellationToken,
    ) -> Result<RunnerOutcome, EngineError> {
        let text = self.executor.run(element, instance_id, context, broadcaster, cancellation).await?;
        Ok(RunnerOutcome { result: Value::String(text) })
    }
}
