//! Structural invariant checks (§3: "every connection endpoint resolves to
//! an element in the same graph or subprocess. Boundary elements have
//! `attached_to` pointing to a task element."). Grounded directly on the
//! teacher's `verify()`: exactly-one-start, at-least-one-end, reachability
//! via `petgraph::visit::Dfs` from start plus boundary entry points,
//! fork/join arity.

use crate::types::{BoundaryKind, ElementKind, GatewayKind, ProcessGraph};
use petgraph::visit::Dfs;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone)]
pub struct VerifyError {
    pub message: String,
    pub element_id: Option<String>,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.element_id {
            Some(id) => write!(f, "[{id}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Verify structural invariants. Returns an empty vec when the graph is
/// valid. Never mutates the graph.
pub fn verify(graph: &ProcessGraph) -> Vec<VerifyError> {
    let mut errors = Vec::new();

    let starts: Vec<_> = graph.elements().filter(|e| matches!(e.kind, ElementKind::Start)).collect();
    match starts.len() {
        0 => errors.push(VerifyError { message: "no Start element found".to_string(), element_id: None }),
        1 => {}
        n => errors.push(VerifyError {
            message: format!("multiple Start elements found ({n})"),
            element_id: None,
        }),
    }

    let has_end = graph.elements().any(|e| matches!(e.kind, ElementKind::End));
    if !has_end {
        errors.push(VerifyError { message: "no End element found".to_string(), element_id: None });
    }

    // Every connection endpoint resolves to an element in this graph.
    for conn in graph.connections() {
        if graph.element(&conn.from).is_none() {
            errors.push(VerifyError {
                message: format!("connection {} has unknown source {}", conn.id, conn.from),
                element_id: Some(conn.id.clone()),
            });
        }
        if graph.element(&conn.to).is_none() {
            errors.push(VerifyError {
                message: format!("connection {} has unknown target {}", conn.id, conn.to),
                element_id: Some(conn.id.clone()),
            });
        }
    }

    // Boundary elements must be attached to a Task element.
    for element in graph.elements() {
        if matches!(element.kind, ElementKind::Boundary(_)) {
            match &element.attached_to {
                None => errors.push(VerifyError {
                    message: "boundary element has no attached_to task".to_string(),
                    element_id: Some(element.id.clone()),
                }),
                Some(task_id) => match graph.element(task_id) {
                    Some(target) if matches!(target.kind, ElementKind::Task(_)) => {}
                    _ => errors.push(VerifyError {
                        message: format!("boundary attached_to {task_id} is not a task element"),
                        element_id: Some(element.id.clone()),
                    }),
                },
            }
        }
    }

    // Reachability from Start, plus boundary events as alternative entry
    // points (a timer/error boundary's downstream is only reached by
    // firing, not by normal forward traversal from Start).
    if let Some(start) = starts.first() {
        let pg = graph.petgraph();
        let mut reachable: HashSet<_> = HashSet::new();
        if let Some(start_idx) = pg.node_indices().find(|&i| pg[i] == start.id) {
            let mut dfs = Dfs::new(pg, start_idx);
            while let Some(idx) = dfs.next(pg) {
                reachable.insert(idx);
            }
        }
        for idx in pg.node_indices() {
            let id = &pg[idx];
            let is_boundary_entry = graph
                .element(id)
                .map(|e| matches!(e.kind, ElementKind::Boundary(_)))
                .unwrap_or(false);
            if is_boundary_entry && !reachable.contains(&idx) {
                let mut dfs = Dfs::new(pg, idx);
                while let Some(nx) = dfs.next(pg) {
                    reachable.insert(nx);
                }
            }
        }
        for idx in pg.node_indices() {
            if !reachable.contains(&idx) {
                let id = &pg[idx];
                errors.push(VerifyError {
                    message: format!("unreachable element: {id}"),
                    element_id: Some(id.clone()),
                });
            }
        }
    }

    // Parallel fork/join arity: every parallel gateway with fan-out > 1
    // feeding a join should find a join with matching fan-in somewhere
    // downstream. This engine does not require strict fork/join pairing
    // the way the teacher's VM does (BPMN allows asymmetric topologies),
    // so this check only flags the unambiguous error case: a parallel
    // gateway with a single outgoing flow, which is never a real fork.
    for element in graph.elements() {
        if let ElementKind::Gateway(GatewayKind::Parallel) = element.kind {
            let outgoing = graph.outgoing(&element.id);
            let incoming = graph.incoming(&element.id);
            if outgoing.len() <= 1 && incoming.len() <= 1 {
                errors.push(VerifyError {
                    message: "parallel gateway has neither fork (>1 outgoing) nor join (>1 incoming) shape"
                        .to_string(),
                    element_id: Some(element.id.clone()),
                });
            }
        }
    }

    // Compensation boundaries must target a task that is capable of
    // registering a handler; escalation/signal boundaries follow the same
    // attached_to shape as error boundaries (§4.3).
    for element in graph.elements() {
        if let ElementKind::Boundary(BoundaryKind::Compensation) = element.kind {
            if graph.outgoing(&element.id).is_empty() {
                errors.push(VerifyError {
                    message: "compensation boundary has no outgoing handler flow".to_string(),
                    element_id: Some(element.id.clone()),
                });
            }
        }
    }

    errors
}
