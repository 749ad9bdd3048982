//! Execution Scheduler (§4.1) and the Cancellation & Deadlock Subsystem
//! (§4.9): the `Engine` that walks a [`ProcessGraph`] from its start element,
//! recursing through gateways, tasks, boundaries, and compensation, fanning
//! true-concurrent branches out with `tokio::spawn` + `FuturesUnordered` and
//! failing fast on the first sibling error (§7 default policy).
//!
//! The teacher's engine drives a fixed bytecode program with a fiber
//! scheduler; this engine instead walks a graph recursively, so the
//! recursion is the new part. Everything it recurses *into* — runner
//! dispatch, boundary supervision, gateway routing, persistence — reuses the
//! shape the teacher already established in its own dispatch loop: locate
//! the element, find its handler, publish progress, advance.

use crate::broadcaster::Broadcaster;
use crate::cancellation::CancellationHandle;
use crate::context::Context;
use crate::error::EngineError;
use crate::events::{now_ms, AgUiEvent, WorkflowOutcome};
use crate::gateway::{self, JoinArrival};
use crate::instance::{Instance, InstanceId, InstanceOutcome};
use crate::message_queue::MessageQueue;
use crate::runners::{
    AgentExecutor, AgentRunner, ReceiveRunner, ScriptRunner, SendRunner, SimpleTaskRunner,
    TaskRunner, UserTaskDecision, UserTaskRunner,
};
use crate::{boundary, config::EngineConfig};
use crate::types::{BoundaryKind, Element, ElementKind, GatewayKind, IntermediateEventKind, ProcessGraph, TaskKind};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tracing::{error, info, warn};

/// Agent body used when no real [`AgentExecutor`] has been configured
/// (§6: agent runners are pluggable, not bundled). Any agentic task
/// activated against a bare engine fails with a catchable error rather than
/// silently no-op-ing.
struct UnconfiguredAgentExecutor;

#[async_trait]
impl AgentExecutor for UnconfiguredAgentExecutor {
    async fn run(
        &self,
        element: &Element,
        _instance_id: InstanceId,
        _context: &Context,
        _broadcaster: &Broadcaster,
        _cancellation: &mut crate::cancellation::CancellationToken,
    ) -> Result<String, EngineError> {
        Err(EngineError::TaskExecution {
            element_id: element.id.clone(),
            error_code: "AgentNotConfigured".to_string(),
            message: "no AgentExecutor registered on this engine".to_string(),
        })
    }
}

struct InstanceHandle {
    state: Mutex<Instance>,
    completion: Notify,
}

/// The scheduler plus its ambient registries (§3 "Instance State",
/// §4.9 cancellation/deadlock subsystem). One `Engine` per process,
/// shared via `Arc` across the HTTP/websocket transport, the webhook
/// surface, and any background watchers it spawns.
pub struct Engine {
    broadcaster: Arc<Broadcaster>,
    queue: Arc<MessageQueue>,
    agent_executor: Arc<dyn AgentExecutor>,
    config: EngineConfig,
    instances: RwLock<HashMap<InstanceId, Arc<InstanceHandle>>>,
    graphs: RwLock<HashMap<InstanceId, Arc<ProcessGraph>>>,
    cancellations: RwLock<HashMap<(InstanceId, String), CancellationHandle>>,
    pending_user_tasks: RwLock<HashMap<(InstanceId, String), oneshot::Sender<UserTaskDecision>>>,
    /// A self-referential `Weak` so `&self` methods that need to recurse
    /// through `Arc<Self>`-receiver helpers (the `advance_*`/`process_next_set`
    /// family) can obtain one without every caller threading an `Arc` through.
    /// Populated via `Arc::new_cyclic` at construction.
    self_ref: Weak<Engine>,
}

impl Engine {
    pub fn new(broadcaster: Arc<Broadcaster>, queue: Arc<MessageQueue>, config: EngineConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            broadcaster,
            queue,
            agent_executor: Arc::new(UnconfiguredAgentExecutor),
            config,
            instances: RwLock::new(HashMap::new()),
            graphs: RwLock::new(HashMap::new()),
            cancellations: RwLock::new(HashMap::new()),
            pending_user_tasks: RwLock::new(HashMap::new()),
            self_ref: weak.clone(),
        })
    }

    /// Swap in a real agent body. Must be called before the engine is
    /// shared (panics otherwise) since `Engine` has no interior mutability
    /// over this field — agentic tasks are rare enough that paying for a
    /// `RwLock` on every other task's hot path isn't worth it.
    pub fn with_agent_executor(self: Arc<Self>, executor: Arc<dyn AgentExecutor>) -> Arc<Self> {
        let mut inner = Arc::try_unwrap(self)
            .unwrap_or_else(|_| panic!("with_agent_executor must be called before the engine is shared"));
        inner.agent_executor = executor;
        Arc::new_cyclic(move |weak| {
            inner.self_ref = weak.clone();
            inner
        })
    }

    fn arc_self(&self) -> Arc<Engine> {
        self.self_ref.upgrade().expect("engine dropped while a method on it was still executing")
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a new instance of `graph` and return immediately; the run
    /// itself proceeds on a spawned task. Callers that need to block until
    /// completion (e.g. a synchronous call-activity) use
    /// [`Self::wait_for_instance`].
    pub async fn start_instance(
        self: Arc<Self>,
        graph: Arc<ProcessGraph>,
        initial_context: Value,
    ) -> Result<InstanceId, EngineError> {
        let instance = Instance::new(graph.process_key.clone(), initial_context);
        let instance_id = instance.instance_id;
        let handle = Arc::new(InstanceHandle { state: Mutex::new(instance), completion: Notify::new() });
        self.instances.write().await.insert(instance_id, handle);
        self.graphs.write().await.insert(instance_id, graph.clone());

        self.broadcaster
            .publish(instance_id, AgUiEvent::WorkflowStarted { instance_id, timestamp: now_ms() })
            .await
            .map_err(EngineError::Persistence)?;

        self.clone().spawn_deadlock_watcher(graph.clone(), instance_id);

        let start_id = graph
            .start_element()
            .ok_or_else(|| EngineError::GraphInvalid("process graph has no Start element".to_string()))?
            .id
            .clone();

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(error) = engine.advance_one(graph, instance_id, start_id, None).await {
                error!(%instance_id, %error, "instance execution terminated with an unhandled error");
            }
        });

        Ok(instance_id)
    }

    /// Block until `instance_id` reaches a terminal outcome. A no-op if the
    /// instance is unknown (already completed and evicted, or never existed).
    pub async fn wait_for_instance(&self, instance_id: InstanceId) {
        loop {
            let handle = {
                let instances = self.instances.read().await;
                match instances.get(&instance_id) {
                    Some(h) => h.clone(),
                    None => return,
                }
            };
            let notified = handle.completion.notified();
            if handle.state.lock().await.outcome.is_some() {
                return;
            }
            notified.await;
        }
    }

    pub async fn instance_outcome(&self, instance_id: InstanceId) -> Option<InstanceOutcome> {
        let instances = self.instances.read().await;
        let handle = instances.get(&instance_id)?;
        handle.state.lock().await.outcome.clone()
    }

    pub async fn instance_context(&self, instance_id: InstanceId) -> Option<Value> {
        let instances = self.instances.read().await;
        let handle = instances.get(&instance_id)?;
        Some(handle.state.lock().await.context.as_value().clone())
    }

    /// External cancel request (§6). Cancels every active branch, drains
    /// and runs registered compensations, then finishes the instance with
    /// `Cancelled` — unless it has already reached a terminal outcome.
    pub async fn cancel_instance(self: Arc<Self>, instance_id: InstanceId, reason: String) -> Result<(), EngineError> {
        let graph = self
            .graphs
            .read()
            .await
            .get(&instance_id)
            .cloned()
            .ok_or(EngineError::InstanceNotFound(instance_id))?;

        if self.already_finished(instance_id).await {
            return Ok(());
        }
        self.cancel_all_active(instance_id, &reason).await;
        let entries = self.drain_compensations(instance_id).await;
        self.run_compensations(&graph, instance_id, &entries).await;
        if self.finish_instance_if_first(instance_id, InstanceOutcome::Cancelled).await {
            self.broadcaster
                .publish(
                    instance_id,
                    AgUiEvent::WorkflowCompleted {
                        instance_id,
                        outcome: WorkflowOutcome::Cancelled,
                        reason: Some(reason),
                        timestamp: now_ms(),
                    },
                )
                .await
                .map_err(EngineError::Persistence)?;
            self.broadcaster.unsubscribe_all(instance_id);
        }
        Ok(())
    }

    /// Resolve a pending `userTask.complete` (§6). Errors if the user task
    /// is not currently awaiting completion (already completed, cancelled,
    /// or never activated).
    pub async fn complete_user_task(
        &self,
        instance_id: InstanceId,
        element_id: &str,
        decision: UserTaskDecision,
    ) -> Result<(), EngineError> {
        let sender = self
            .pending_user_tasks
            .write()
            .await
            .remove(&(instance_id, element_id.to_string()))
            .ok_or_else(|| EngineError::ElementNotFound(element_id.to_string()))?;

        let published = decision.clone();
        sender.send(decision).map_err(|_| EngineError::Cancelled {
            element_id: element_id.to_string(),
            reason: "user task runner no longer awaiting completion".to_string(),
        })?;

        self.broadcaster
            .publish(
                instance_id,
                AgUiEvent::UserTaskComplete {
                    element_id: element_id.to_string(),
                    decision: published.decision,
                    comments: published.comments,
                    timestamp: now_ms(),
                },
            )
            .await
            .map_err(EngineError::Persistence)?;
        Ok(())
    }

    // ---- internal recursion ------------------------------------------------

    /// Advance execution from `element_id`, recursing through the graph
    /// until every reachable branch either suspends (join, receive, user
    /// task) or terminates (End, error, cancellation). Boxed because this
    /// function and the helpers it calls (`advance_task`, `advance_gateway`,
    /// `process_next_set`, ...) are mutually recursive — an unboxed `async
    /// fn` cycle here would produce an infinitely-sized future type.
    fn advance_one(
        self: Arc<Self>,
        graph: Arc<ProcessGraph>,
        instance_id: InstanceId,
        element_id: String,
        incoming_connection_id: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send>> {
        Box::pin(async move {
            let element = graph
                .element(&element_id)
                .cloned()
                .ok_or_else(|| EngineError::ElementNotFound(element_id.clone()))?;

            match element.kind.clone() {
                ElementKind::Start => self.advance_start(graph, instance_id, element_id).await,
                ElementKind::End => self.advance_end(graph, instance_id, element_id).await,
                ElementKind::Task(kind) => self.advance_task(graph, instance_id, element_id, kind).await,
                ElementKind::Gateway(kind) => {
                    self.advance_gateway(graph, instance_id, element_id, incoming_connection_id, kind).await
                }
                ElementKind::Boundary(_) => {
                    // Boundaries are normally entered only via the outgoing
                    // flows `boundary::supervise` hands back, never through
                    // ordinary token flow; this arm only covers a malformed
                    // graph that routes a connection directly at one.
                    let targets = out_targets(&graph, &element_id);
                    self.process_next_set(graph, instance_id, targets).await
                }
                ElementKind::IntermediateEvent(IntermediateEventKind::CompensationThrow) => {
                    self.advance_compensation_throw(graph, instance_id, element_id).await
                }
            }
        })
    }

    async fn advance_start(
        self: Arc<Self>,
        graph: Arc<ProcessGraph>,
        instance_id: InstanceId,
        element_id: String,
    ) -> Result<(), EngineError> {
        self.mark_completed(instance_id, &element_id).await;
        self.publish_activated_and_completed(instance_id, &element_id, 0).await?;
        let targets = out_targets(&graph, &element_id);
        self.process_next_set(graph, instance_id, targets).await
    }

    async fn advance_end(
        self: Arc<Self>,
        _graph: Arc<ProcessGraph>,
        instance_id: InstanceId,
        element_id: String,
    ) -> Result<(), EngineError> {
        self.mark_completed(instance_id, &element_id).await;
        self.publish_activated_and_completed(instance_id, &element_id, 0).await?;
        if self.finish_instance_if_first(instance_id, InstanceOutcome::Success).await {
            self.broadcaster
                .publish(
                    instance_id,
                    AgUiEvent::WorkflowCompleted {
                        instance_id,
                        outcome: WorkflowOutcome::Success,
                        reason: None,
                        timestamp: now_ms(),
                    },
                )
                .await
                .map_err(EngineError::Persistence)?;
            self.broadcaster.unsubscribe_all(instance_id);
        }
        Ok(())
    }

    async fn advance_gateway(
        self: Arc<Self>,
        graph: Arc<ProcessGraph>,
        instance_id: InstanceId,
        element_id: String,
        incoming_connection_id: Option<String>,
        kind: GatewayKind,
    ) -> Result<(), EngineError> {
        if graph.incoming(&element_id).len() > 1 {
            let conn_id = incoming_connection_id.unwrap_or_default();
            let arrival = {
                let handle = self.instance_handle(instance_id).await?;
                let mut guard = handle.state.lock().await;
                gateway::arrive_at_join(&graph, &mut guard, &element_id, &conn_id, Some(kind))
            };
            match arrival {
                JoinArrival::Suspended | JoinArrival::AlreadyCommitted => return Ok(()),
                JoinArrival::Committed { cancel_predecessors } => {
                    self.cancel_elements(instance_id, &cancel_predecessors, "inclusive merge committed on another branch")
                        .await;
                }
                JoinArrival::Satisfied | JoinArrival::PassThrough => {}
            }
        }

        let context_snapshot = {
            let handle = self.instance_handle(instance_id).await?;
            handle.state.lock().await.context.clone()
        };
        let decision = gateway::evaluate_fork(&graph, &element_id, kind, &context_snapshot)?;

        {
            let handle = self.instance_handle(instance_id).await?;
            let mut guard = handle.state.lock().await;
            guard.mark_completed(&element_id);
            for skipped in &decision.skipped {
                guard.mark_skipped(skipped);
            }
        }

        if decision.taken.len() > 1 {
            self.broadcaster
                .publish(
                    instance_id,
                    AgUiEvent::GatewayForked { element_id: element_id.clone(), count: decision.taken.len(), timestamp: now_ms() },
                )
                .await
                .map_err(EngineError::Persistence)?;
        }
        let mut targets = Vec::with_capacity(decision.taken.len());
        for flow in &decision.taken {
            self.broadcaster
                .publish(
                    instance_id,
                    AgUiEvent::GatewayPathTaken { element_id: element_id.clone(), flow_id: flow.id.clone(), timestamp: now_ms() },
                )
                .await
                .map_err(EngineError::Persistence)?;
            targets.push((flow.id.clone(), flow.to.clone()));
        }
        self.process_next_set(graph, instance_id, targets).await
    }

    async fn advance_task(
        self: Arc<Self>,
        graph: Arc<ProcessGraph>,
        instance_id: InstanceId,
        element_id: String,
        task_kind: TaskKind,
    ) -> Result<(), EngineError> {
        if matches!(task_kind, TaskKind::CallActivity | TaskKind::Subprocess) {
            return self.run_call_activity(graph, instance_id, element_id).await;
        }

        let element = graph
            .element(&element_id)
            .cloned()
            .ok_or_else(|| EngineError::ElementNotFound(element_id.clone()))?;

        self.mark_active(instance_id, &element_id).await;
        self.broadcaster
            .publish(instance_id, AgUiEvent::ElementActivated { element_id: element_id.clone(), timestamp: now_ms() })
            .await
            .map_err(EngineError::Persistence)?;
        let started_at = now_ms();

        let (cancel_handle, mut cancel_token) = CancellationHandle::new();
        self.cancellations.write().await.insert((instance_id, element_id.clone()), cancel_handle.clone());

        let mut context = {
            let handle = self.instance_handle(instance_id).await?;
            handle.state.lock().await.context.clone()
        };

        let runner: Arc<dyn TaskRunner> = if matches!(task_kind, TaskKind::User) {
            let (tx, rx) = oneshot::channel();
            self.pending_user_tasks.write().await.insert((instance_id, element_id.clone()), tx);
            Arc::new(UserTaskRunner::new(rx))
        } else {
            self.runner_for(task_kind)
        };

        let (outcome, non_interrupting_timers) = boundary::supervise(
            &graph,
            &element,
            runner.as_ref(),
            instance_id,
            &mut context,
            &self.broadcaster,
            &cancel_handle,
            &mut cancel_token,
        )
        .await?;

        self.cancellations.write().await.remove(&(instance_id, element_id.clone()));
        for boundary_id in non_interrupting_timers {
            self.clone().spawn_non_interrupting_timer(graph.clone(), instance_id, boundary_id);
        }

        match outcome {
            boundary::SupervisedOutcome::Completed(runner_outcome) => {
                let compensation_boundaries = graph.boundaries_of_kind(&element_id, BoundaryKind::Compensation);
                {
                    let handle = self.instance_handle(instance_id).await?;
                    let mut guard = handle.state.lock().await;
                    guard.context.merge(context.as_value().clone());
                    guard.context.set(&format!("{element_id}_result"), runner_outcome.result.clone());
                    for cb in &compensation_boundaries {
                        guard.compensation_registry.push((element_id.clone(), cb.id.clone()));
                    }
                    guard.mark_completed(&element_id);
                }
                self.broadcaster
                    .publish(
                        instance_id,
                        AgUiEvent::ElementCompleted {
                            element_id: element_id.clone(),
                            duration_ms: now_ms() - started_at,
                            timestamp: now_ms(),
                        },
                    )
                    .await
                    .map_err(EngineError::Persistence)?;
                let targets = out_targets(&graph, &element_id);
                self.process_next_set(graph, instance_id, targets).await
            }
            boundary::SupervisedOutcome::TimerInterrupted { boundary_id }
            | boundary::SupervisedOutcome::ErrorCaught { boundary_id } => {
                self.mark_skipped(instance_id, &element_id).await;
                let targets = out_targets(&graph, &boundary_id);
                self.process_next_set(graph, instance_id, targets).await
            }
            // A runner's own cancellation-select branch won the race (either
            // an external cancel_instance, or an inclusive join committing
            // on a sibling and cancelling this one, per §4.2/§4.9). Whoever
            // triggered the cancellation already owns deciding the
            // instance's ultimate outcome, so this branch just stops quietly
            // rather than dragging the whole instance down as `Failed`.
            boundary::SupervisedOutcome::Unhandled(EngineError::Cancelled { element_id: _, reason }) => {
                self.mark_skipped(instance_id, &element_id).await;
                self.broadcaster
                    .publish(
                        instance_id,
                        AgUiEvent::TaskCancelled {
                            element_id: element_id.clone(),
                            reason,
                            partial_result: None,
                            timestamp: now_ms(),
                        },
                    )
                    .await
                    .map_err(EngineError::Persistence)?;
                Ok(())
            }
            boundary::SupervisedOutcome::Unhandled(error) => {
                self.mark_errored(instance_id, &element_id).await;
                self.broadcaster
                    .publish(
                        instance_id,
                        AgUiEvent::TaskError {
                            element_id: element_id.clone(),
                            error_code: error.error_code(),
                            message: error.message(),
                            timestamp: now_ms(),
                        },
                    )
                    .await
                    .map_err(EngineError::Persistence)?;
                self.fail_instance(&graph, instance_id, &error).await?;
                Err(error)
            }
        }
    }

    async fn advance_compensation_throw(
        self: Arc<Self>,
        graph: Arc<ProcessGraph>,
        instance_id: InstanceId,
        element_id: String,
    ) -> Result<(), EngineError> {
        self.mark_active(instance_id, &element_id).await;
        self.broadcaster
            .publish(instance_id, AgUiEvent::ElementActivated { element_id: element_id.clone(), timestamp: now_ms() })
            .await
            .map_err(EngineError::Persistence)?;

        let entries = self.drain_compensations(instance_id).await;
        self.run_compensations(&graph, instance_id, &entries).await;

        self.mark_completed(instance_id, &element_id).await;
        self.broadcaster
            .publish(instance_id, AgUiEvent::ElementCompleted { element_id: element_id.clone(), duration_ms: 0, timestamp: now_ms() })
            .await
            .map_err(EngineError::Persistence)?;

        let targets = out_targets(&graph, &element_id);
        self.process_next_set(graph, instance_id, targets).await
    }

    /// A call activity / subprocess runs its `calledElement` subprocess
    /// graph to completion as a fully separate [`Instance`] (own id, own
    /// event stream) before resuming the calling branch — §4.4's "runs the
    /// subprocess and blocks the calling branch until it terminates".
    async fn run_call_activity(
        self: Arc<Self>,
        graph: Arc<ProcessGraph>,
        instance_id: InstanceId,
        element_id: String,
    ) -> Result<(), EngineError> {
        let element = graph
            .element(&element_id)
            .cloned()
            .ok_or_else(|| EngineError::ElementNotFound(element_id.clone()))?;
        let called_element = element
            .properties
            .get("calledElement")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::GraphInvalid(format!("call activity {element_id} missing calledElement")))?
            .to_string();
        let subprocess = graph
            .subprocesses
            .get(&called_element)
            .ok_or_else(|| {
                EngineError::GraphInvalid(format!("call activity {element_id} references unknown subprocess {called_element}"))
            })?
            .clone();

        self.mark_active(instance_id, &element_id).await;
        self.broadcaster
            .publish(instance_id, AgUiEvent::ElementActivated { element_id: element_id.clone(), timestamp: now_ms() })
            .await
            .map_err(EngineError::Persistence)?;
        let started_at = now_ms();

        let parent_context = {
            let handle = self.instance_handle(instance_id).await?;
            handle.state.lock().await.context.clone()
        };
        let mut child_root = Context::new(serde_json::json!({}));
        for (child_key, template) in &subprocess.input_mappings {
            let raw = parent_context.interpolate(template);
            let value: Value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            child_root.set(child_key, value);
        }

        let child_graph = Arc::new(subprocess.graph.clone());
        let child_instance_id = self
            .clone()
            .start_instance(child_graph, child_root.as_value().clone())
            .await?;
        self.wait_for_instance(child_instance_id).await;

        let (child_outcome, child_context_value) = {
            let instances = self.instances.read().await;
            match instances.get(&child_instance_id) {
                Some(handle) => {
                    let guard = handle.state.lock().await;
                    (guard.outcome.clone(), guard.context.as_value().clone())
                }
                None => (Some(InstanceOutcome::Failed), Value::Null),
            }
        };
        self.instances.write().await.remove(&child_instance_id);
        self.graphs.write().await.remove(&child_instance_id);
        self.broadcaster.unsubscribe_all(child_instance_id);

        {
            let handle = self.instance_handle(instance_id).await?;
            let mut guard = handle.state.lock().await;
            let child_scratch = Context::new(child_context_value);
            for (parent_key, template) in &subprocess.output_mappings {
                let raw = child_scratch.interpolate(template);
                let value: Value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                guard.context.set(parent_key, value);
            }
            guard.mark_completed(&element_id);
        }
        self.broadcaster
            .publish(
                instance_id,
                AgUiEvent::ElementCompleted { element_id: element_id.clone(), duration_ms: now_ms() - started_at, timestamp: now_ms() },
            )
            .await
            .map_err(EngineError::Persistence)?;

        if matches!(child_outcome, Some(InstanceOutcome::Failed) | None) {
            let error = EngineError::TaskExecution {
                element_id: element_id.clone(),
                error_code: "SubprocessFailed".to_string(),
                message: format!("called subprocess {called_element} did not complete successfully"),
            };
            self.fail_instance(&graph, instance_id, &error).await?;
            return Err(error);
        }

        let targets = out_targets(&graph, &element_id);
        self.process_next_set(graph, instance_id, targets).await
    }

    /// Advance every element in `targets` concurrently. A single target is
    /// awaited inline; more than one is spawned as independent tasks so
    /// branches make true concurrent progress (§5), drained through a
    /// `FuturesUnordered` so the first sibling error can trigger cancellation
    /// of the rest without waiting for them to finish naturally (§7 default
    /// fail-fast policy).
    async fn process_next_set(
        self: Arc<Self>,
        graph: Arc<ProcessGraph>,
        instance_id: InstanceId,
        targets: Vec<(String, String)>,
    ) -> Result<(), EngineError> {
        if targets.is_empty() {
            return Ok(());
        }
        if targets.len() == 1 {
            let (conn_id, target) = targets.into_iter().next().expect("len checked above");
            return self.advance_one(graph, instance_id, target, Some(conn_id)).await;
        }

        let mut handles = FuturesUnordered::new();
        for (conn_id, target) in targets {
            let engine = self.clone();
            let graph = graph.clone();
            handles.push(tokio::spawn(async move { engine.advance_one(graph, instance_id, target, Some(conn_id)).await }));
        }

        let mut first_error: Option<EngineError> = None;
        while let Some(joined) = handles.next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => {
                    if first_error.is_none() {
                        first_error = Some(EngineError::GraphInvalid(format!("branch task panicked: {join_error}")));
                    }
                }
            }
            if first_error.is_some() {
                break;
            }
        }

        if let Some(error) = first_error {
            self.cancel_all_active(instance_id, &format!("sibling branch failed: {}", error.message())).await;
            // Drain the remaining spawned branches to completion before
            // returning so none are left running past this call.
            while handles.next().await.is_some() {}
            return Err(error);
        }
        Ok(())
    }

    fn spawn_non_interrupting_timer(self: Arc<Self>, graph: Arc<ProcessGraph>, instance_id: InstanceId, boundary_id: String) {
        tokio::spawn(async move {
            let boundary = match graph.element(&boundary_id).cloned() {
                Some(b) => b,
                None => return,
            };
            let duration_ms = boundary.properties.get("durationMs").and_then(|v| v.as_i64()).unwrap_or(0).max(0) as u64;
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            // No synchronous caller to propagate a persistence failure to
            // (this runs detached on its own `tokio::spawn`); the engine
            // already treats publish failures as fatal to the write path
            // everywhere reachable by `?`, so here the best available
            // substitute is to surface it loudly instead of swallowing it.
            if let Err(error) = self
                .broadcaster
                .publish(
                    instance_id,
                    AgUiEvent::BoundaryTriggered { boundary_id: boundary_id.clone(), reason: "timeout".to_string(), timestamp: now_ms() },
                )
                .await
            {
                error!(%instance_id, %boundary_id, %error, "failed to persist BoundaryTriggered event");
            }
            let targets = out_targets(&graph, &boundary_id);
            if let Err(error) = self.process_next_set(graph, instance_id, targets).await {
                error!(%instance_id, %boundary_id, %error, "non-interrupting timer branch failed");
            }
        });
    }

    fn spawn_deadlock_watcher(self: Arc<Self>, graph: Arc<ProcessGraph>, instance_id: InstanceId) {
        let threshold_ms = self.config.deadlock_threshold_ms;
        let poll_interval_ms = self.config.deadlock_poll_interval_ms.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(poll_interval_ms));
            loop {
                ticker.tick().await;
                let (events, finished) = {
                    let instances = self.instances.read().await;
                    match instances.get(&instance_id) {
                        Some(handle) => {
                            let guard = handle.state.lock().await;
                            (gateway::check_deadlocks(&graph, &guard, threshold_ms), guard.outcome.is_some())
                        }
                        None => (Vec::new(), true),
                    }
                };
                for event in events {
                    if let Err(error) = self.broadcaster.publish(instance_id, event).await {
                        error!(%instance_id, %error, "failed to persist deadlock-watcher event");
                    }
                }
                if finished {
                    break;
                }
            }
        });
    }

    fn runner_for(&self, kind: TaskKind) -> Arc<dyn TaskRunner> {
        match kind {
            TaskKind::Script => Arc::new(ScriptRunner),
            TaskKind::Send => Arc::new(SendRunner),
            TaskKind::Receive => Arc::new(ReceiveRunner { queue: self.queue.clone() }),
            TaskKind::Agentic => Arc::new(AgentRunner { executor: self.agent_executor.clone() }),
            TaskKind::Generic | TaskKind::Service | TaskKind::Manual | TaskKind::BusinessRule => Arc::new(SimpleTaskRunner),
            TaskKind::User | TaskKind::Subprocess | TaskKind::CallActivity => {
                unreachable!("User/Subprocess/CallActivity are dispatched before runner_for is consulted")
            }
        }
    }

    // ---- instance/registry bookkeeping helpers -----------------------------

    async fn instance_handle(&self, instance_id: InstanceId) -> Result<Arc<InstanceHandle>, EngineError> {
        self.instances
            .read()
            .await
            .get(&instance_id)
            .cloned()
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    async fn mark_active(&self, instance_id: InstanceId, element_id: &str) {
        if let Ok(handle) = self.instance_handle(instance_id).await {
            handle.state.lock().await.mark_active(element_id);
        }
    }

    async fn mark_completed(&self, instance_id: InstanceId, element_id: &str) {
        if let Ok(handle) = self.instance_handle(instance_id).await {
            handle.state.lock().await.mark_completed(element_id);
        }
    }

    async fn mark_skipped(&self, instance_id: InstanceId, element_id: &str) {
        if let Ok(handle) = self.instance_handle(instance_id).await {
            handle.state.lock().await.mark_skipped(element_id);
        }
    }

    async fn mark_errored(&self, instance_id: InstanceId, element_id: &str) {
        if let Ok(handle) = self.instance_handle(instance_id).await {
            handle.state.lock().await.mark_errored(element_id);
        }
    }

    async fn publish_activated_and_completed(
        &self,
        instance_id: InstanceId,
        element_id: &str,
        duration_ms: i64,
    ) -> Result<(), EngineError> {
        self.broadcaster
            .publish(instance_id, AgUiEvent::ElementActivated { element_id: element_id.to_string(), timestamp: now_ms() })
            .await
            .map_err(EngineError::Persistence)?;
        self.broadcaster
            .publish(instance_id, AgUiEvent::ElementCompleted { element_id: element_id.to_string(), duration_ms, timestamp: now_ms() })
            .await
            .map_err(EngineError::Persistence)?;
        Ok(())
    }

    async fn drain_compensations(&self, instance_id: InstanceId) -> Vec<(String, String)> {
        match self.instance_handle(instance_id).await {
            Ok(handle) => handle.state.lock().await.drain_compensations(),
            Err(_) => Vec::new(),
        }
    }

    /// Run drained `(task_id, compensation_boundary_id)` entries in the LIFO
    /// order they were drained in, one at a time (§4.4 invariant 5: "handlers
    /// execute exactly once, in reverse registration order"). Each handler is
    /// the boundary's outgoing flow chain, walked like any other task chain;
    /// it is expected not to reach an End element.
    async fn run_compensations(&self, graph: &Arc<ProcessGraph>, instance_id: InstanceId, entries: &[(String, String)]) {
        for (task_id, boundary_id) in entries {
            info!(%instance_id, %task_id, %boundary_id, "running compensation handler");
            // Compensation handlers run strictly sequentially, one outgoing
            // connection at a time, regardless of how many flows the
            // boundary has — never fanned out concurrently like a normal
            // next-set.
            for (conn_id, target) in out_targets(graph, boundary_id) {
                if let Err(error) = self.arc_self().advance_one(graph.clone(), instance_id, target, Some(conn_id)).await {
                    warn!(%instance_id, %boundary_id, %error, "compensation handler failed");
                    break;
                }
            }
        }
    }

    async fn cancel_elements(&self, instance_id: InstanceId, element_ids: &[String], reason: &str) {
        let registry = self.cancellations.read().await;
        for element_id in element_ids {
            if let Some(handle) = registry.get(&(instance_id, element_id.clone())) {
                handle.cancel(reason.to_string());
            }
        }
    }

    async fn cancel_all_active(&self, instance_id: InstanceId, reason: &str) {
        let active: Vec<String> = match self.instance_handle(instance_id).await {
            Ok(handle) => handle.state.lock().await.active_tasks.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };
        self.cancel_elements(instance_id, &active, reason).await;
    }

    async fn already_finished(&self, instance_id: InstanceId) -> bool {
        match self.instance_handle(instance_id).await {
            Ok(handle) => handle.state.lock().await.outcome.is_some(),
            Err(_) => true,
        }
    }

    async fn finish_instance_if_first(&self, instance_id: InstanceId, outcome: InstanceOutcome) -> bool {
        let handle = match self.instance_handle(instance_id).await {
            Ok(h) => h,
            Err(_) => return false,
        };
        let mut guard = handle.state.lock().await;
        if guard.outcome.is_some() {
            false
        } else {
            guard.outcome = Some(outcome);
            drop(guard);
            handle.completion.notify_waiters();
            true
        }
    }

    /// Cancel active branches, drain and run compensations, and finish the
    /// instance as `Failed` — unless another branch has already raced this
    /// instance to a terminal outcome. Returns the persistence error, if the
    /// `workflow.completed` publish itself fails to durably record, in
    /// preference to the task error that triggered the failure: a failure
    /// that could not even be recorded as failed is the more severe problem.
    async fn fail_instance(
        &self,
        graph: &Arc<ProcessGraph>,
        instance_id: InstanceId,
        error: &EngineError,
    ) -> Result<(), EngineError> {
        if self.already_finished(instance_id).await {
            return Ok(());
        }
        self.cancel_all_active(instance_id, &format!("task failed: {}", error.message())).await;
        let entries = self.drain_compensations(instance_id).await;
        self.run_compensations(graph, instance_id, &entries).await;
        if self.finish_instance_if_first(instance_id, InstanceOutcome::Failed).await {
            self.broadcaster
                .publish(
                    instance_id,
                    AgUiEvent::WorkflowCompleted {
                        instance_id,
                        outcome: WorkflowOutcome::Failed,
                        reason: Some(error.message()),
                        timestamp: now_ms(),
                    },
                )
                .await
                .map_err(EngineError::Persistence)?;
            self.broadcaster.unsubscribe_all(instance_id);
        }
        Ok(())
    }
}

fn out_targets(graph: &ProcessGraph, element_id: &str) -> Vec<(String, String)> {
    graph.outgoing(element_id).into_iter().map(|c| (c.id.clone(), c.to.clone())).collect()
}

/// Seed scenarios (§8): one process graph per scenario, built directly with
/// [`ProcessGraph::new`] rather than through JSON, exercising the scheduler
/// the same way the HTTP layer's `start_instance` handler does.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventStore;
    use crate::store_memory::MemoryEventStore;
    use crate::types::Connection;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration as StdDuration;

    fn test_engine() -> Arc<Engine> {
        let config = EngineConfig::default();
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let broadcaster = Arc::new(Broadcaster::new(store, config.subscriber_buffer));
        let queue = Arc::new(MessageQueue::new(config.mailbox_warning_threshold));
        Engine::new(broadcaster, queue, config)
    }

    fn el(id: &str, kind: ElementKind) -> Element {
        Element { id: id.to_string(), kind, name: id.to_string(), properties: BTreeMap::new(), attached_to: None }
    }

    fn el_props(id: &str, kind: ElementKind, properties: serde_json::Value) -> Element {
        Element {
            id: id.to_string(),
            kind,
            name: id.to_string(),
            properties: serde_json::from_value(properties).expect("test properties are a JSON object"),
            attached_to: None,
        }
    }

    fn boundary(id: &str, kind: BoundaryKind, attached_to: &str, properties: serde_json::Value) -> Element {
        Element {
            id: id.to_string(),
            kind: ElementKind::Boundary(kind),
            name: id.to_string(),
            properties: serde_json::from_value(properties).expect("test properties are a JSON object"),
            attached_to: Some(attached_to.to_string()),
        }
    }

    fn conn(id: &str, from: &str, to: &str) -> Connection {
        Connection { id: id.to_string(), from: from.to_string(), to: to.to_string(), name: String::new(), condition: None }
    }

    fn default_conn(id: &str, from: &str, to: &str) -> Connection {
        Connection { id: id.to_string(), from: from.to_string(), to: to.to_string(), name: "default".to_string(), condition: None }
    }

    fn cond_conn(id: &str, from: &str, to: &str, condition: &str) -> Connection {
        Connection {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            name: String::new(),
            condition: Some(condition.to_string()),
        }
    }

    /// Polls instead of sleeping (matching [`crate::message_queue`]'s own
    /// `yield_now`-based synchronization) until a receive task is parked
    /// waiting on `correlation_key`, bounding the spin so a real regression
    /// fails fast instead of hanging.
    async fn wait_until_waiting(queue: &MessageQueue, correlation_key: &str, max_iters: usize) {
        for _ in 0..max_iters {
            if queue.stats().await.waiting_counts.get(correlation_key).copied().unwrap_or(0) > 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("{correlation_key} never reached a waiting receive task after {max_iters} yields");
    }

    // ---- Scenario A: exclusive gateway, first matching path taken ---------

    #[tokio::test]
    async fn exclusive_gateway_takes_first_matching_flow() {
        let engine = test_engine();
        let graph = Arc::new(ProcessGraph::new(
            "scenario-a",
            vec![
                el("start", ElementKind::Start),
                el_props(
                    "script1",
                    ElementKind::Task(TaskKind::Script),
                    json!({"expression": "12", "resultVariable": "x"}),
                ),
                el("xor", ElementKind::Gateway(GatewayKind::Exclusive)),
                el("path_a", ElementKind::Task(TaskKind::Generic)),
                el("path_b", ElementKind::Task(TaskKind::Generic)),
                el("end", ElementKind::End),
            ],
            vec![
                conn("c1", "start", "script1"),
                conn("c2", "script1", "xor"),
                cond_conn("c3", "xor", "path_a", "${x} > 10"),
                default_conn("c4", "xor", "path_b"),
                conn("c5", "path_a", "end"),
                conn("c6", "path_b", "end"),
            ],
            BTreeMap::new(),
        ));

        let instance_id = engine.clone().start_instance(graph, json!({})).await.unwrap();
        engine.wait_for_instance(instance_id).await;

        assert_eq!(engine.instance_outcome(instance_id).await, Some(InstanceOutcome::Success));
        let context = engine.instance_context(instance_id).await.unwrap();
        assert_eq!(context["x"], json!(12));

        let handle = engine.instance_handle(instance_id).await.unwrap();
        let state = handle.state.lock().await;
        for expected in ["start", "script1", "xor", "path_a", "end"] {
            assert!(state.completed_elements.contains(expected), "{expected} should have completed");
        }
        assert!(!state.completed_elements.contains("path_b"), "the untaken branch must not complete");
        assert!(!state.active_tasks.contains("path_b"));
    }

    // ---- Scenario B: parallel fan-out and join -----------------------------

    #[tokio::test]
    async fn parallel_gateway_forks_and_joins_exactly_once() {
        let engine = test_engine();
        let graph = Arc::new(ProcessGraph::new(
            "scenario-b",
            vec![
                el("start", ElementKind::Start),
                el("fork", ElementKind::Gateway(GatewayKind::Parallel)),
                el("task_a", ElementKind::Task(TaskKind::Generic)),
                el("task_b", ElementKind::Task(TaskKind::Generic)),
                el("join", ElementKind::Gateway(GatewayKind::Parallel)),
                el("end", ElementKind::End),
            ],
            vec![
                conn("c1", "start", "fork"),
                conn("c2", "fork", "task_a"),
                conn("c3", "fork", "task_b"),
                conn("c4", "task_a", "join"),
                conn("c5", "task_b", "join"),
                conn("c6", "join", "end"),
            ],
            BTreeMap::new(),
        ));

        let instance_id = engine.clone().start_instance(graph, json!({})).await.unwrap();
        engine.wait_for_instance(instance_id).await;

        assert_eq!(engine.instance_outcome(instance_id).await, Some(InstanceOutcome::Success));
        let handle = engine.instance_handle(instance_id).await.unwrap();
        let state = handle.state.lock().await;
        for expected in ["start", "fork", "task_a", "task_b", "join", "end"] {
            assert!(state.completed_elements.contains(expected), "{expected} should have completed");
        }
        assert!(state.parallel_join_state.is_empty(), "join bookkeeping is cleared once satisfied");
    }

    // ---- Scenario C: inclusive merge commits on first arrival, cancels the
    // losing branch without failing the instance ----------------------------

    #[tokio::test]
    async fn inclusive_merge_cancels_losing_branch_without_failing_instance() {
        let engine = test_engine();
        let graph = Arc::new(ProcessGraph::new(
            "scenario-c",
            vec![
                el("start", ElementKind::Start),
                el("or_fork", ElementKind::Gateway(GatewayKind::Inclusive)),
                el_props(
                    "email_wait",
                    ElementKind::Task(TaskKind::Receive),
                    json!({"messageRef": "approval", "correlationKey": "${order_id}"}),
                ),
                el("user_wait", ElementKind::Task(TaskKind::User)),
                el("or_join", ElementKind::Gateway(GatewayKind::Inclusive)),
                el("end", ElementKind::End),
            ],
            vec![
                conn("c1", "start", "or_fork"),
                cond_conn("c2", "or_fork", "email_wait", "true"),
                cond_conn("c3", "or_fork", "user_wait", "true"),
                conn("c4", "email_wait", "or_join"),
                conn("c5", "user_wait", "or_join"),
                conn("c6", "or_join", "end"),
            ],
            BTreeMap::new(),
        ));

        let instance_id =
            engine.clone().start_instance(graph, json!({"order_id": "ORD-3"})).await.unwrap();
        wait_until_waiting(engine.queue(), "ORD-3", 10_000).await;

        let delivered = engine.queue().deliver("approval", "ORD-3", json!({"approved": true})).await;
        assert!(delivered);

        engine.wait_for_instance(instance_id).await;

        assert_eq!(engine.instance_outcome(instance_id).await, Some(InstanceOutcome::Success));
        let handle = engine.instance_handle(instance_id).await.unwrap();
        let state = handle.state.lock().await;
        assert!(state.completed_elements.contains("email_wait"));
        assert!(state.completed_elements.contains("or_join"));
        assert!(state.completed_elements.contains("end"));
        assert!(!state.completed_elements.contains("user_wait"), "the losing branch must not complete");
    }

    // ---- Scenario D: compensation rolls back in LIFO order on a caught
    // error, then the instance still finishes successfully ------------------

    #[tokio::test]
    async fn compensation_rolls_back_in_lifo_order_on_caught_error() {
        let engine = test_engine();
        let graph = Arc::new(ProcessGraph::new(
            "scenario-d",
            vec![
                el("start", ElementKind::Start),
                el("inventory", ElementKind::Task(TaskKind::Generic)),
                boundary("inv_comp", BoundaryKind::Compensation, "inventory", json!({})),
                el("release_inv", ElementKind::Task(TaskKind::Generic)),
                el("authorize", ElementKind::Task(TaskKind::Generic)),
                boundary("auth_comp", BoundaryKind::Compensation, "authorize", json!({})),
                el("release_pay", ElementKind::Task(TaskKind::Generic)),
                el("shipment", ElementKind::Task(TaskKind::Generic)),
                boundary("ship_comp", BoundaryKind::Compensation, "shipment", json!({})),
                el("cancel_ship", ElementKind::Task(TaskKind::Generic)),
                // Agentic with no configured executor always fails (§6) —
                // used here purely to force the error this scenario catches.
                el("capture", ElementKind::Task(TaskKind::Agentic)),
                boundary("err_capture", BoundaryKind::Error, "capture", json!({"errorCode": ""})),
                el("log_error", ElementKind::Task(TaskKind::Generic)),
                el("comp_throw", ElementKind::IntermediateEvent(IntermediateEventKind::CompensationThrow)),
                el("notify_failure", ElementKind::Task(TaskKind::Generic)),
                el("end", ElementKind::End),
            ],
            vec![
                conn("c1", "start", "inventory"),
                conn("c2", "inventory", "authorize"),
                conn("c3", "authorize", "shipment"),
                conn("c4", "shipment", "capture"),
                conn("c_inv_comp", "inv_comp", "release_inv"),
                conn("c_auth_comp", "auth_comp", "release_pay"),
                conn("c_ship_comp", "ship_comp", "cancel_ship"),
                conn("c_err", "err_capture", "log_error"),
                conn("c5", "log_error", "comp_throw"),
                conn("c6", "comp_throw", "notify_failure"),
                conn("c7", "notify_failure", "end"),
            ],
            BTreeMap::new(),
        ));

        let instance_id = engine.clone().start_instance(graph, json!({})).await.unwrap();
        engine.wait_for_instance(instance_id).await;

        assert_eq!(engine.instance_outcome(instance_id).await, Some(InstanceOutcome::Success));

        let handle = engine.instance_handle(instance_id).await.unwrap();
        {
            let state = handle.state.lock().await;
            for expected in [
                "inventory", "authorize", "shipment", "log_error", "comp_throw", "notify_failure", "end",
                "release_inv", "release_pay", "cancel_ship",
            ] {
                assert!(state.completed_elements.contains(expected), "{expected} should have completed");
            }
            assert!(state.skipped_elements.contains("capture"), "a caught error marks the task skipped, not errored");
            assert!(state.compensation_registry.is_empty(), "the registry is drained exactly once");
        }

        // LIFO order (§4.4 invariant 5): shipment's handler first, then
        // authorize's, then inventory's — the reverse of registration order.
        let events = engine.broadcaster().store().read_events(instance_id, 0).await.unwrap();
        let activation_index = |id: &str| {
            events
                .iter()
                .position(|(_, e)| matches!(e, AgUiEvent::ElementActivated { element_id, .. } if element_id == id))
                .unwrap_or_else(|| panic!("{id} was never activated"))
        };
        let cancel_ship_at = activation_index("cancel_ship");
        let release_pay_at = activation_index("release_pay");
        let release_inv_at = activation_index("release_inv");
        assert!(cancel_ship_at < release_pay_at, "cancel_ship must run before release_pay");
        assert!(release_pay_at < release_inv_at, "release_pay must run before release_inv");
    }

    // ---- Scenario E: interrupting timer boundary races a long-running task

    struct SlowAgent;

    #[async_trait]
    impl AgentExecutor for SlowAgent {
        async fn run(
            &self,
            _element: &Element,
            _instance_id: InstanceId,
            _context: &Context,
            _broadcaster: &Broadcaster,
            _cancellation: &mut crate::cancellation::CancellationToken,
        ) -> Result<String, EngineError> {
            tokio::time::sleep(StdDuration::from_secs(10)).await;
            Ok("done".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interrupting_timer_boundary_cancels_long_running_task() {
        let config = EngineConfig::default();
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let broadcaster = Arc::new(Broadcaster::new(store, config.subscriber_buffer));
        let queue = Arc::new(MessageQueue::new(config.mailbox_warning_threshold));
        let engine = Engine::new(broadcaster, queue, config).with_agent_executor(Arc::new(SlowAgent));

        let graph = Arc::new(ProcessGraph::new(
            "scenario-e",
            vec![
                el("start", ElementKind::Start),
                el("task1", ElementKind::Task(TaskKind::Agentic)),
                boundary("timer_b", BoundaryKind::Timer, "task1", json!({"interrupting": true, "durationMs": 3_000})),
                el("timeout_handler", ElementKind::Task(TaskKind::Generic)),
                el("merge", ElementKind::Task(TaskKind::Generic)),
                el("end", ElementKind::End),
            ],
            vec![
                conn("c1", "start", "task1"),
                conn("c2", "task1", "merge"),
                conn("c_timer", "timer_b", "timeout_handler"),
                conn("c3", "timeout_handler", "merge"),
                conn("c4", "merge", "end"),
            ],
            BTreeMap::new(),
        ));

        let instance_id = engine.clone().start_instance(graph, json!({})).await.unwrap();

        tokio::time::advance(StdDuration::from_millis(3_500)).await;
        engine.wait_for_instance(instance_id).await;

        assert_eq!(engine.instance_outcome(instance_id).await, Some(InstanceOutcome::Success));
        let handle = engine.instance_handle(instance_id).await.unwrap();
        let state = handle.state.lock().await;
        assert!(state.skipped_elements.contains("task1"), "task1 was interrupted by its timer boundary");
        assert!(state.completed_elements.contains("timeout_handler"));
        assert!(state.completed_elements.contains("merge"));
        assert!(state.completed_elements.contains("end"));
    }

    // ---- Scenario F: webhook correlation before and after instance arrival

    fn build_receive_graph() -> ProcessGraph {
        ProcessGraph::new(
            "scenario-f",
            vec![
                el("start", ElementKind::Start),
                el_props(
                    "receive",
                    ElementKind::Task(TaskKind::Receive),
                    json!({"messageRef": "payment", "correlationKey": "${order_id}"}),
                ),
                el("end", ElementKind::End),
            ],
            vec![conn("c1", "start", "receive"), conn("c2", "receive", "end")],
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn webhook_delivered_before_instance_reaches_receive_task() {
        let engine = test_engine();
        engine.queue().deliver("payment", "ORD-1", json!({"amount": 99})).await;

        let instance_id =
            engine.clone().start_instance(Arc::new(build_receive_graph()), json!({"order_id": "ORD-1"})).await.unwrap();
        engine.wait_for_instance(instance_id).await;

        assert_eq!(engine.instance_outcome(instance_id).await, Some(InstanceOutcome::Success));
        let context = engine.instance_context(instance_id).await.unwrap();
        assert_eq!(context["amount"], json!(99));
    }

    #[tokio::test]
    async fn webhook_delivered_while_receive_task_is_waiting_wakes_immediately() {
        let engine = test_engine();
        let instance_id =
            engine.clone().start_instance(Arc::new(build_receive_graph()), json!({"order_id": "ORD-2"})).await.unwrap();

        wait_until_waiting(engine.queue(), "ORD-2", 10_000).await;
        let delivered = engine.queue().deliver("payment", "ORD-2", json!({"amount": 50})).await;
        assert!(delivered);

        engine.wait_for_instance(instance_id).await;

        assert_eq!(engine.instance_outcome(instance_id).await, Some(InstanceOutcome::Success));
        let context = engine.instance_context(instance_id).await.unwrap();
        assert_eq!(context["amount"], json!(50));
    }
}
