//! Gateway evaluator (§4.2): decides the next-set of elements for
//! exclusive/inclusive/parallel gateways, and the join-side bookkeeping
//! (parallel fan-in counters, inclusive first-arrival-wins commit).

use crate::context::Context;
use crate::error::EngineError;
use crate::events::{now_ms, AgUiEvent};
use crate::instance::Instance;
use crate::types::{Connection, GatewayKind, ProcessGraph};
use std::collections::HashSet;

/// Outcome of evaluating a gateway's outgoing flows: which connections the
/// scheduler should now traverse, plus bookkeeping it already performed
/// (skipped-flow marking, event emission) so the scheduler does not need to
/// duplicate gateway-internal knowledge.
pub struct RoutingDecision {
    pub taken: Vec<Connection>,
    pub skipped: Vec<String>,
}

/// Evaluate a fork (the gateway side with a single incoming branch, or any
/// gateway acting as a splitting point). Per §4.2:
/// - exclusive: first truthy condition in declaration order, else default.
/// - inclusive: all matching; default if none match.
/// - parallel: all outgoing, unconditionally.
pub fn evaluate_fork(
    graph: &ProcessGraph,
    gateway_id: &str,
    kind: GatewayKind,
    context: &Context,
) -> Result<RoutingDecision, EngineError> {
    let outgoing = graph.outgoing(gateway_id);
    match kind {
        GatewayKind::Exclusive => evaluate_exclusive(gateway_id, &outgoing, context),
        GatewayKind::Inclusive => evaluate_inclusive(gateway_id, &outgoing, context),
        GatewayKind::Parallel => Ok(RoutingDecision {
            taken: outgoing.into_iter().cloned().collect(),
            skipped: Vec::new(),
        }),
    }
}

fn evaluate_condition(flow: &Connection, context: &Context) -> Result<bool, EngineError> {
    match &flow.condition {
        None => Ok(false),
        Some(expr) => {
            let interpolated = context.interpolate(expr);
            crate::expr::evaluate(&interpolated).map_err(|source| EngineError::ConditionEvaluation {
                flow_id: flow.id.clone(),
                source,
            })
        }
    }
}

fn evaluate_exclusive(
    gateway_id: &str,
    outgoing: &[&Connection],
    context: &Context,
) -> Result<RoutingDecision, EngineError> {
    let mut default_flow = None;
    for flow in outgoing {
        if flow.is_default() {
            default_flow = Some(*flow);
            continue;
        }
        if flow.condition.is_some() && evaluate_condition(flow, context)? {
            let skipped = outgoing
                .iter()
                .filter(|f| f.id != flow.id)
                .map(|f| f.to.clone())
                .collect();
            return Ok(RoutingDecision { taken: vec![(*flow).clone()], skipped });
        }
    }
    match default_flow {
        Some(flow) => {
            let skipped = outgoing.iter().filter(|f| f.id != flow.id).map(|f| f.to.clone()).collect();
            Ok(RoutingDecision { taken: vec![flow.clone()], skipped })
        }
        None => Err(EngineError::NoMatchingFlow { gateway_id: gateway_id.to_string() }),
    }
}

fn evaluate_inclusive(
    gateway_id: &str,
    outgoing: &[&Connection],
    context: &Context,
) -> Result<RoutingDecision, EngineError> {
    let mut matched = Vec::new();
    let mut default_flow = None;
    for flow in outgoing {
        if flow.is_default() {
            default_flow = Some(*flow);
            continue;
        }
        if evaluate_condition(flow, context)? {
            matched.push((*flow).clone());
        }
    }
    if matched.is_empty() {
        return match default_flow {
            Some(flow) => {
                let skipped = outgoing.iter().filter(|f| f.id != flow.id).map(|f| f.to.clone()).collect();
                Ok(RoutingDecision { taken: vec![flow.clone()], skipped })
            }
            None => Err(EngineError::NoMatchingFlow { gateway_id: gateway_id.to_string() }),
        };
    }
    let taken_ids: HashSet<&str> = matched.iter().map(|f| f.id.as_str()).collect();
    let skipped = outgoing
        .iter()
        .filter(|f| !taken_ids.contains(f.id.as_str()))
        .map(|f| f.to.clone())
        .collect();
    Ok(RoutingDecision { taken: matched, skipped })
}

/// Outcome of a branch arriving at a join gateway.
pub enum JoinArrival {
    /// Not a join (fan-in <= 1): proceed unconditionally.
    PassThrough,
    /// A parallel join still waiting on other branches: this branch
    /// terminates here without activating the downstream element.
    Suspended,
    /// A parallel join whose fan-in is now satisfied: proceed.
    Satisfied,
    /// An inclusive join that committed on an earlier arrival: this branch
    /// terminates without activating downstream.
    AlreadyCommitted,
    /// An inclusive join committing on this arrival: proceed, and the
    /// scheduler should cancel the listed still-active competing branches.
    Committed { cancel_predecessors: Vec<String> },
}

/// Record a branch's arrival at `element_id` via `incoming_connection_id`,
/// applying §4.2's join semantics. `kind` is `None` for non-gateway
/// elements and exclusive gateways, both of which are pass-throughs.
pub fn arrive_at_join(
    graph: &ProcessGraph,
    instance: &mut Instance,
    element_id: &str,
    incoming_connection_id: &str,
    kind: Option<GatewayKind>,
) -> JoinArrival {
    let incoming = graph.incoming(element_id);
    if incoming.len() <= 1 {
        return JoinArrival::PassThrough;
    }
    match kind {
        Some(GatewayKind::Parallel) => {
            let state = instance.parallel_join_state.entry(element_id.to_string()).or_default();
            if state.arrived.is_empty() {
                state.first_arrival_ms = Some(now_ms());
            }
            state.arrived.insert(incoming_connection_id.to_string());
            if state.arrived.len() >= incoming.len() {
                instance.parallel_join_state.remove(element_id);
                JoinArrival::Satisfied
            } else {
                JoinArrival::Suspended
            }
        }
        Some(GatewayKind::Inclusive) => {
            let state = instance.inclusive_merge_state.entry(element_id.to_string()).or_default();
            if state.committed {
                return JoinArrival::AlreadyCommitted;
            }
            if state.arrived.is_empty() {
                state.first_arrival_ms = Some(now_ms());
            }
            state.arrived.insert(incoming_connection_id.to_string());
            state.committed = true;

            let predecessors: HashSet<String> =
                incoming.iter().map(|c| c.from.clone()).filter(|p| p != element_id).collect();
            let cancel_predecessors: Vec<String> = instance
                .active_tasks
                .iter()
                .filter(|t| predecessors.contains(*t))
                .cloned()
                .collect();
            JoinArrival::Committed { cancel_predecessors }
        }
        // Exclusive join or plain merge with multiple incoming flows but no
        // gateway semantics: each arrival proceeds independently (§4.2).
        _ => JoinArrival::PassThrough,
    }
}

/// Check elapsed-time-based deadlock suspicion for joins that have been
/// entered but not completed (§4.9). Returns advisory events to publish;
/// never mutates instance state or terminates the instance.
pub fn check_deadlocks(graph: &ProcessGraph, instance: &Instance, threshold_ms: i64) -> Vec<AgUiEvent> {
    let now = now_ms();
    let mut events = Vec::new();

    for (gateway_id, state) in &instance.parallel_join_state {
        if let Some(first) = state.first_arrival_ms {
            let expected = graph.incoming(gateway_id).len();
            if now - first > threshold_ms && state.arrived.len() < expected {
                let missing_predecessors = graph
                    .incoming(gateway_id)
                    .iter()
                    .map(|c| c.from.clone())
                    .filter(|p| !instance.completed_elements.contains(p))
                    .collect();
                events.push(AgUiEvent::GatewayDeadlock {
                    gateway_id: gateway_id.clone(),
                    arrived: state.arrived.len(),
                    expected,
                    missing_predecessors,
                    timestamp: now,
                });
            }
        }
    }
    events
}
