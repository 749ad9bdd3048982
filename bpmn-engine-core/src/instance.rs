//! Mutable per-execution state: [`Instance`] plus the registries the
//! scheduler, boundary supervisor, and cancellation subsystem thread through
//! a single run (§3 "Instance State").

use crate::context::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

pub type InstanceId = Uuid;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum InstanceOutcome {
    Success,
    Failed,
    Cancelled,
}

/// Ordered compensation registration: `(task_id, compensation_boundary_id)`.
/// Appended FIFO by the boundary supervisor, drained LIFO by the
/// compensation-throw runner (§4.4, invariant 5 in §8).
pub type CompensationEntry = (String, String);

/// Per-inclusive-join bookkeeping (§3 `inclusive_merge_state`).
#[derive(Clone, Debug, Default)]
pub struct InclusiveMergeState {
    pub arrived: HashSet<String>,
    pub first_arrival_ms: Option<i64>,
    pub committed: bool,
}

/// Per-join (parallel) bookkeeping: which incoming connection ids have
/// delivered a token.
#[derive(Clone, Debug, Default)]
pub struct ParallelJoinState {
    pub arrived: HashSet<String>,
    pub first_arrival_ms: Option<i64>,
}

/// One live execution of a [`crate::types::ProcessGraph`].
pub struct Instance {
    pub instance_id: InstanceId,
    pub process_key: String,
    pub context: Context,
    pub active_tasks: HashSet<String>,
    pub completed_elements: HashSet<String>,
    pub skipped_elements: HashSet<String>,
    pub errored_elements: HashSet<String>,
    pub compensation_registry: Vec<CompensationEntry>,
    pub inclusive_merge_state: BTreeMap<String, InclusiveMergeState>,
    pub parallel_join_state: BTreeMap<String, ParallelJoinState>,
    pub outcome: Option<InstanceOutcome>,
}

impl Instance {
    pub fn new(process_key: impl Into<String>, initial_context: serde_json::Value) -> Self {
        Self {
            instance_id: Uuid::now_v7(),
            process_key: process_key.into(),
            context: Context::new(initial_context),
            active_tasks: HashSet::new(),
            completed_elements: HashSet::new(),
            skipped_elements: HashSet::new(),
            errored_elements: HashSet::new(),
            compensation_registry: Vec::new(),
            inclusive_merge_state: BTreeMap::new(),
            parallel_join_state: BTreeMap::new(),
            outcome: None,
        }
    }

    pub fn mark_active(&mut self, element_id: &str) {
        debug_assert!(!self.completed_elements.contains(element_id));
        self.active_tasks.insert(element_id.to_string());
    }

    pub fn mark_completed(&mut self, element_id: &str) {
        self.active_tasks.remove(element_id);
        self.completed_elements.insert(element_id.to_string());
    }

    pub fn mark_errored(&mut self, element_id: &str) {
        self.active_tasks.remove(element_id);
        self.errored_elements.insert(element_id.to_string());
    }

    pub fn mark_skipped(&mut self, element_id: &str) {
        self.skipped_elements.insert(element_id.to_string());
    }

    /// Drain the compensation registry in LIFO order, clearing it. §3
    /// invariant: "on drain, each handler executes exactly once and the
    /// registry is cleared."
    pub fn drain_compensations(&mut self) -> Vec<CompensationEntry> {
        let mut entries = std::mem::take(&mut self.compensation_registry);
        entries.reverse();
        entries
    }
}
