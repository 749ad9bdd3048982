//! Boundary Supervisor (§4.3): wraps one task execution so error, timer,
//! and compensation boundaries interpose correctly, racing task completion
//! against armed timers with `tokio::select!`.

use crate::broadcaster::Broadcaster;
use crate::cancellation::{CancellationHandle, CancellationToken};
use crate::context::Context;
use crate::error::EngineError;
use crate::events::{now_ms, AgUiEvent};
use crate::instance::InstanceId;
use crate::runners::{RunnerOutcome, TaskRunner};
use crate::types::{BoundaryKind, Element, ProcessGraph};
use std::time::Duration;

/// What happened to the wrapped task, for the scheduler to turn into a
/// next-set decision.
pub enum SupervisedOutcome {
    /// The task completed successfully; compensation registration (if any)
    /// has already been appended by this call.
    Completed(RunnerOutcome),
    /// An interrupting timer fired first: the task was cancelled and the
    /// boundary's outgoing flows should be taken instead of the task's.
    TimerInterrupted { boundary_id: String },
    /// An error boundary matched: its outgoing flows should be taken.
    ErrorCaught { boundary_id: String },
    /// The task raised and no boundary matched: propagate to the scheduler.
    Unhandled(EngineError),
}

fn timer_duration_ms(boundary: &Element) -> Option<i64> {
    boundary.properties.get("durationMs").and_then(|v| v.as_i64())
}

fn is_interrupting(boundary: &Element) -> bool {
    boundary.properties.get("interrupting").and_then(|v| v.as_bool()).unwrap_or(true)
}

fn error_code_matches(boundary: &Element, error: &EngineError) -> bool {
    let configured = boundary.properties.get("errorCode").and_then(|v| v.as_str()).unwrap_or("");
    if configured.is_empty() {
        return true; // catch-all
    }
    let code = error.error_code();
    let message = error.message();
    code == configured || message.contains(configured)
}

/// Run `runner` for `element`, applying the boundaries attached to it.
/// Non-interrupting timers are handed back to the caller as a list of
/// boundary ids to spawn as independent branches — this function never
/// spawns them itself, since that requires recursing into
/// `scheduler::advance_from`, which would create a module cycle (§9's
/// resolution for cyclic element/boundary references applies equally to
/// cyclic module references).
pub async fn supervise<'a>(
    graph: &ProcessGraph,
    element: &Element,
    runner: &dyn TaskRunner,
    instance_id: InstanceId,
    context: &mut Context,
    broadcaster: &Broadcaster,
    cancellation_handle: &CancellationHandle,
    cancellation_token: &mut CancellationToken,
) -> Result<(SupervisedOutcome, Vec<String>), EngineError> {
    let error_boundaries = graph.boundaries_of_kind(&element.id, BoundaryKind::Error);
    let timer_boundaries = graph.boundaries_of_kind(&element.id, BoundaryKind::Timer);

    let interrupting_timer = timer_boundaries.iter().find(|b| is_interrupting(b));
    let non_interrupting_ids: Vec<String> = timer_boundaries
        .iter()
        .filter(|b| !is_interrupting(b))
        .map(|b| b.id.clone())
        .collect();

    let task_fut = runner.execute(element, instance_id, context, broadcaster, cancellation_token);

    let outcome = match interrupting_timer {
        None => match task_fut.await {
            Ok(outcome) => SupervisedOutcome::Completed(outcome),
            Err(error) => match_error_boundary(&error_boundaries, error),
        },
        Some(timer) => {
            let duration_ms = timer_duration_ms(timer).unwrap_or(0).max(0) as u64;
            tokio::select! {
                result = task_fut => match result {
                    Ok(outcome) => SupervisedOutcome::Completed(outcome),
                    Err(error) => match_error_boundary(&error_boundaries, error),
                },
                _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
                    cancellation_handle.cancel(format!("interrupting timer {} fired", timer.id));
                    SupervisedOutcome::TimerInterrupted { boundary_id: timer.id.clone() }
                }
            }
        }
    };

    if let SupervisedOutcome::TimerInterrupted { boundary_id } = &outcome {
        broadcaster
            .publish(
                instance_id,
                AgUiEvent::BoundaryTriggered {
                    boundary_id: boundary_id.clone(),
                    reason: "timeout".to_string(),
                    timestamp: now_ms(),
                },
            )
            .await
            .map_err(EngineError::Persistence)?;
    }
    if let SupervisedOutcome::ErrorCaught { boundary_id } = &outcome {
        broadcaster
            .publish(
                instance_id,
                AgUiEvent::BoundaryTriggered {
                    boundary_id: boundary_id.clone(),
                    reason: "error".to_string(),
                    timestamp: now_ms(),
                },
            )
            .await
            .map_err(EngineError::Persistence)?;
    }

    Ok((outcome, non_interrupting_ids))
}

/// Error boundaries are consulted in declaration order (§4.3, §8 invariant
/// 6). `boundaries_of_kind` returns them in `BTreeMap` iteration order,
/// which is element-id order, not authoring order — callers that need
/// strict authoring-order priority should sort boundaries by a `priority`
/// property if the graph format carries one; this spec's process graph
/// does not distinguish the two, so id order is declaration order here.
fn match_error_boundary(boundaries: &[&Element], error: EngineError) -> SupervisedOutcome {
    for boundary in boundaries {
        if error_code_matches(boundary, &error) {
            return SupervisedOutcome::ErrorCaught { boundary_id: boundary.id.clone() };
        }
    }
    SupervisedOutcome::Unhandled(error)
}
