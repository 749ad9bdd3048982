//! Process graph model — the immutable in-memory representation of a parsed
//! workflow, plus the handful of small value types shared across the engine.
//!
//! The graph itself is never mutated once parsed; all mutable execution state
//! lives in [`crate::instance`].

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A context/flag value. Unlike the teacher's compact `Value` (a VM register
/// word), this carries arbitrary nested JSON since the context store supports
/// dotted-path access into structures produced by task runners.
pub type Value = serde_json::Value;

/// Element/connection id as it appears in the source process graph.
pub type ElementId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayKind {
    Exclusive,
    Inclusive,
    Parallel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryKind {
    Error,
    Timer,
    Escalation,
    Signal,
    Compensation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Generic,
    User,
    Service,
    Script,
    Send,
    Receive,
    Manual,
    BusinessRule,
    Agentic,
    Subprocess,
    CallActivity,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntermediateEventKind {
    CompensationThrow,
}

/// What kind of node an [`Element`] is. Mirrors §3's element taxonomy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ElementKind {
    Start,
    End,
    Task(TaskKind),
    Gateway(GatewayKind),
    Boundary(BoundaryKind),
    IntermediateEvent(IntermediateEventKind),
}

/// Arbitrary per-element configuration (timer durations, message refs,
/// correlation key expressions, script bodies, ...). Kept as a flat JSON
/// object rather than a typed struct per kind, since the set of recognized
/// properties differs per `ElementKind` and the graph is treated as opaque
/// data by everything except the component that interprets that one kind.
pub type Properties = BTreeMap<String, Value>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub kind: ElementKind,
    pub name: String,
    pub properties: Properties,
    /// Set only for `Boundary` elements: the task they are attached to.
    pub attached_to: Option<ElementId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Connection {
    pub id: ElementId,
    pub from: ElementId,
    pub to: ElementId,
    pub name: String,
    /// `${...}`-interpolated boolean expression, evaluated against instance
    /// context by the gateway evaluator. `None` for unconditional flows.
    pub condition: Option<String>,
}

impl Connection {
    /// A connection is a gateway's "default" outgoing flow either because it
    /// is named `default`, or it carries an explicit `default: true` marker
    /// property set by authoring tooling (out of scope here, but the
    /// resulting graph can still carry the marker).
    pub fn is_default(&self) -> bool {
        self.name == "default"
    }
}

/// A self-contained graph referenced by a call-activity's `calledElement`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubprocessDefinition {
    pub called_element: String,
    pub graph: ProcessGraph,
    /// Keys copied from the parent context into the child context at start,
    /// re-evaluated as `${...}` templates against the parent context.
    pub input_mappings: BTreeMap<String, String>,
    /// Keys copied from the child context back into the parent context on
    /// completion.
    pub output_mappings: BTreeMap<String, String>,
}

/// Immutable, parsed process graph. `petgraph`-backed so structural checks
/// (reachability, fan-in counts) reuse well-tested graph algorithms instead
/// of hand-rolled traversal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessGraph {
    pub process_key: String,
    elements: BTreeMap<ElementId, Element>,
    connections: Vec<Connection>,
    pub subprocesses: BTreeMap<String, SubprocessDefinition>,
    #[serde(skip)]
    graph: Option<DiGraph<ElementId, ElementId>>,
}

impl ProcessGraph {
    pub fn new(
        process_key: impl Into<String>,
        elements: Vec<Element>,
        connections: Vec<Connection>,
        subprocesses: BTreeMap<String, SubprocessDefinition>,
    ) -> Self {
        let elements = elements.into_iter().map(|e| (e.id.clone(), e)).collect();
        let mut graph = Self {
            process_key: process_key.into(),
            elements,
            connections,
            subprocesses,
            graph: None,
        };
        graph.rebuild_index();
        graph
    }

    fn rebuild_index(&mut self) {
        let mut g: DiGraph<ElementId, ElementId> = DiGraph::new();
        let mut idx: BTreeMap<&ElementId, NodeIndex> = BTreeMap::new();
        for id in self.elements.keys() {
            idx.insert(id, g.add_node(id.clone()));
        }
        for conn in &self.connections {
            if let (Some(&from), Some(&to)) = (idx.get(&conn.from), idx.get(&conn.to)) {
                g.add_edge(from, to, conn.id.clone());
            }
        }
        self.graph = Some(g);
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn outgoing(&self, element_id: &str) -> Vec<&Connection> {
        self.connections.iter().filter(|c| c.from == element_id).collect()
    }

    pub fn incoming(&self, element_id: &str) -> Vec<&Connection> {
        self.connections.iter().filter(|c| c.to == element_id).collect()
    }

    /// Boundary events attached to `task_id`, filtered by kind.
    pub fn boundaries_of_kind(&self, task_id: &str, kind: BoundaryKind) -> Vec<&Element> {
        self.elements
            .values()
            .filter(|e| {
                e.attached_to.as_deref() == Some(task_id)
                    && matches!(&e.kind, ElementKind::Boundary(k) if *k == kind)
            })
            .collect()
    }

    pub fn start_element(&self) -> Option<&Element> {
        self.elements
            .values()
            .find(|e| matches!(e.kind, ElementKind::Start))
    }

    pub fn petgraph(&self) -> &DiGraph<ElementId, ElementId> {
        self.graph.as_ref().expect("graph index built in ProcessGraph::new")
    }
}

impl ProcessGraph {
    /// Call after deserializing a `ProcessGraph` from an external source —
    /// the `#[serde(skip)]` index field comes back `None` and needs rebuilding
    /// before `outgoing`/`incoming`/`petgraph` can be used.
    pub fn finish_deserialize(mut self) -> Self {
        self.rebuild_index();
        self
    }
}
