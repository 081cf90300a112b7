// ir.rs — Dataflow graph container for doff programs
//
// A program is a directed graph of states (control nodes) connected by
// control edges carrying conditions/assignments over scalar symbols. Each
// state owns a local graph of data nodes (access, code, scope entry/exit,
// library, nested program) connected by data edges that name an array, an
// index subset, and an optional write-conflict-resolution operator.
//
// Preconditions: callers construct graphs through the add_* builders.
// Postconditions: node/edge identifiers are stable for the graph's lifetime;
//                 removed data edges leave their slot dead, never reused.
// Failure modes: none (queries on dead edges return None).
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Unique identifier for a state within a program graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId(pub u32);

/// Unique identifier for a data node within a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Unique identifier for a data edge within a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub u32);

// ── Storage / schedule vocabulary ───────────────────────────────────────────

/// Memory residency of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    HostHeap,
    HostPinned,
    DeviceGlobal,
    DeviceShared,
    Register,
}

impl StorageKind {
    /// Whether device kernels can address this storage directly.
    /// Pinned host memory is mapped into the device address space.
    pub fn device_accessible(self) -> bool {
        matches!(
            self,
            StorageKind::DeviceGlobal | StorageKind::DeviceShared | StorageKind::HostPinned
        )
    }
}

/// Execution target of a scope, library node, or nested program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleKind {
    HostSequential,
    DeviceParallel,
    DeviceDefault,
}

/// Allocation lifetime of a transient array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocLifetime {
    /// Allocated and freed per scope invocation.
    PerScope,
    /// Allocated once for the whole graph (hoisted out of loops).
    WholeGraph,
}

// ── Array descriptors ───────────────────────────────────────────────────────

/// One dimension of an array shape: a compile-time constant or a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dim {
    Const(u64),
    Sym(String),
}

/// Descriptor for one logical array. Every array reference in the graph
/// must resolve to exactly one descriptor in `ProgramGraph::arrays`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayDesc {
    pub shape: Vec<Dim>,
    pub scalar: bool,
    pub storage: StorageKind,
    /// false = externally supplied input/output; true = internal temporary.
    pub transient: bool,
    pub lifetime: AllocLifetime,
}

impl ArrayDesc {
    /// A non-transient host array with the given shape.
    pub fn array(shape: Vec<Dim>) -> Self {
        ArrayDesc {
            shape,
            scalar: false,
            storage: StorageKind::HostHeap,
            transient: false,
            lifetime: AllocLifetime::PerScope,
        }
    }

    /// A non-transient host scalar.
    pub fn scalar() -> Self {
        ArrayDesc {
            shape: vec![Dim::Const(1)],
            scalar: true,
            storage: StorageKind::HostHeap,
            transient: false,
            lifetime: AllocLifetime::PerScope,
        }
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }

    /// Symbols appearing in the shape (dynamic extents).
    pub fn free_symbols(&self) -> Vec<&str> {
        self.shape
            .iter()
            .filter_map(|d| match d {
                Dim::Sym(s) => Some(s.as_str()),
                Dim::Const(_) => None,
            })
            .collect()
    }

    /// Shapes are compatible when equal; used for shadow collision checks.
    pub fn shape_compatible(&self, other: &ArrayDesc) -> bool {
        self.shape == other.shape && self.scalar == other.scalar
    }
}

// ── Subsets ─────────────────────────────────────────────────────────────────

/// Index range of one dimension: start offset plus extent.
/// `len == None` means the extent is symbolic (unknown at compile time).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsetDim {
    pub start: u64,
    pub len: Option<u64>,
}

/// Index-range subset carried by a data edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subset {
    pub dims: Vec<SubsetDim>,
}

impl Subset {
    /// The full extent of an array described by `desc`.
    pub fn full(desc: &ArrayDesc) -> Self {
        let dims = desc
            .shape
            .iter()
            .map(|d| SubsetDim {
                start: 0,
                len: match d {
                    Dim::Const(n) => Some(*n),
                    Dim::Sym(_) => None,
                },
            })
            .collect();
        Subset { dims }
    }

    /// A single-element subset.
    pub fn element() -> Self {
        Subset {
            dims: vec![SubsetDim { start: 0, len: Some(1) }],
        }
    }

    /// Total element count, or None if any extent is symbolic.
    pub fn num_elements(&self) -> Option<u64> {
        let mut n = 1u64;
        for d in &self.dims {
            n = n.checked_mul(d.len?)?;
        }
        Some(n)
    }
}

// ── Data nodes ──────────────────────────────────────────────────────────────

/// Scope flavor. Consume scopes model irregular work queues and are not
/// offloadable; their presence anywhere makes the transform inapplicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    Map,
    Consume,
}

/// The kind of a data node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataNodeKind {
    /// Denotes one array by name; many access nodes may denote the same array.
    Access { array: String },
    /// Opaque host/device logic with named input/output connectors.
    Code {
        name: String,
        inputs: Vec<String>,
        outputs: Vec<String>,
    },
    /// Opens a parallel region. Primary data connectors are `IN_*`; any other
    /// connector feeds a dynamic bound and must stay host-readable.
    ScopeEntry {
        kind: ScopeKind,
        schedule: ScheduleKind,
        params: Vec<String>,
    },
    /// Closes the region opened by `entry`. Schedule lives on the entry.
    ScopeExit { entry: NodeId },
    /// Opaque library call (external kernel).
    Library { name: String, schedule: ScheduleKind },
    /// Nested sub-program. Connector names are the inner array names.
    Nested {
        graph: Box<ProgramGraph>,
        schedule: ScheduleKind,
    },
}

/// A data node, tagged with its enclosing scope entry (None = top level).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNode {
    pub id: NodeId,
    pub kind: DataNodeKind,
    pub scope: Option<NodeId>,
}

impl DataNode {
    pub fn is_access(&self) -> bool {
        matches!(self.kind, DataNodeKind::Access { .. })
    }

    pub fn access_array(&self) -> Option<&str> {
        match &self.kind {
            DataNodeKind::Access { array } => Some(array),
            _ => None,
        }
    }
}

// ── Data edges ──────────────────────────────────────────────────────────────

/// Directed transfer of an array subset between two data nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEdge {
    pub id: EdgeId,
    pub src: NodeId,
    pub src_conn: Option<String>,
    pub dst: NodeId,
    pub dst_conn: Option<String>,
    /// Name of the transferred array.
    pub array: String,
    pub subset: Subset,
    /// Write-conflict-resolution operator. Marks the source array as an
    /// effective program input (read-modify-write).
    pub wcr: Option<String>,
}

// ── States ──────────────────────────────────────────────────────────────────

/// A basic-block-like control node owning a local data graph.
///
/// Data edges live in slots so that removal never invalidates the EdgeIds a
/// traversal snapshotted earlier; dead slots stay dead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: StateId,
    pub label: String,
    nodes: Vec<DataNode>,
    edges: Vec<Option<DataEdge>>,
}

impl State {
    fn new(id: StateId, label: impl Into<String>) -> Self {
        State {
            id,
            label: label.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    // ── Builders ────────────────────────────────────────────────────────

    fn push_node(&mut self, kind: DataNodeKind, scope: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(DataNode { id, kind, scope });
        id
    }

    pub fn add_access(&mut self, array: impl Into<String>) -> NodeId {
        self.push_node(DataNodeKind::Access { array: array.into() }, None)
    }

    pub fn add_access_in(&mut self, array: impl Into<String>, scope: Option<NodeId>) -> NodeId {
        self.push_node(DataNodeKind::Access { array: array.into() }, scope)
    }

    pub fn add_code(
        &mut self,
        name: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> NodeId {
        self.push_node(
            DataNodeKind::Code {
                name: name.into(),
                inputs,
                outputs,
            },
            None,
        )
    }

    pub fn add_code_in(
        &mut self,
        name: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<String>,
        scope: Option<NodeId>,
    ) -> NodeId {
        self.push_node(
            DataNodeKind::Code {
                name: name.into(),
                inputs,
                outputs,
            },
            scope,
        )
    }

    /// Add a scope entry/exit pair. Returns (entry, exit).
    pub fn add_scope(
        &mut self,
        kind: ScopeKind,
        schedule: ScheduleKind,
        params: Vec<String>,
        scope: Option<NodeId>,
    ) -> (NodeId, NodeId) {
        let entry = self.push_node(
            DataNodeKind::ScopeEntry {
                kind,
                schedule,
                params,
            },
            scope,
        );
        let exit = self.push_node(DataNodeKind::ScopeExit { entry }, scope);
        (entry, exit)
    }

    pub fn add_library(
        &mut self,
        name: impl Into<String>,
        schedule: ScheduleKind,
    ) -> NodeId {
        self.push_node(
            DataNodeKind::Library {
                name: name.into(),
                schedule,
            },
            None,
        )
    }

    pub fn add_nested(&mut self, graph: ProgramGraph, schedule: ScheduleKind) -> NodeId {
        self.push_node(
            DataNodeKind::Nested {
                graph: Box::new(graph),
                schedule,
            },
            None,
        )
    }

    pub fn add_edge(
        &mut self,
        src: NodeId,
        src_conn: Option<String>,
        dst: NodeId,
        dst_conn: Option<String>,
        array: impl Into<String>,
        subset: Subset,
    ) -> EdgeId {
        self.add_edge_wcr(src, src_conn, dst, dst_conn, array, subset, None)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_edge_wcr(
        &mut self,
        src: NodeId,
        src_conn: Option<String>,
        dst: NodeId,
        dst_conn: Option<String>,
        array: impl Into<String>,
        subset: Subset,
        wcr: Option<String>,
    ) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Some(DataEdge {
            id,
            src,
            src_conn,
            dst,
            dst_conn,
            array: array.into(),
            subset,
            wcr,
        }));
        id
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn node(&self, id: NodeId) -> &DataNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut DataNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn edge(&self, id: EdgeId) -> Option<&DataEdge> {
        self.edges.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> Option<&mut DataEdge> {
        self.edges.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    /// Snapshot of all node ids, in creation order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DataNode> {
        self.nodes.iter()
    }

    /// Snapshot of all live edge ids, in creation order.
    pub fn edge_ids(&self) -> Vec<EdgeId> {
        self.edges
            .iter()
            .filter_map(|s| s.as_ref().map(|e| e.id))
            .collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = &DataEdge> {
        self.edges.iter().filter_map(|s| s.as_ref())
    }

    pub fn out_edges(&self, node: NodeId) -> Vec<EdgeId> {
        self.edges()
            .filter(|e| e.src == node)
            .map(|e| e.id)
            .collect()
    }

    pub fn in_edges(&self, node: NodeId) -> Vec<EdgeId> {
        self.edges()
            .filter(|e| e.dst == node)
            .map(|e| e.id)
            .collect()
    }

    pub fn out_degree(&self, node: NodeId) -> usize {
        self.edges().filter(|e| e.src == node).count()
    }

    pub fn in_degree(&self, node: NodeId) -> usize {
        self.edges().filter(|e| e.dst == node).count()
    }

    /// The exit node paired with a scope entry, if any.
    pub fn exit_of(&self, entry: NodeId) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, DataNodeKind::ScopeExit { entry: e } if e == entry))
            .map(|n| n.id)
    }

    /// Whether the node is outside any scope.
    pub fn top_level(&self, node: NodeId) -> bool {
        self.node(node).scope.is_none()
    }

    // ── Memlet paths ────────────────────────────────────────────────────
    //
    // A data edge ending at a scope node with an `IN_x` connector continues
    // on the inside through the matching `OUT_x` connector (and vice versa
    // walking backwards). These resolve an edge to the terminating edge of
    // its path; with several continuations the first in edge order is taken.

    /// Follow the edge forward through scope nodes to the last edge of its path.
    pub fn memlet_path_last(&self, edge: EdgeId) -> EdgeId {
        let mut cur = edge;
        loop {
            let e = match self.edge(cur) {
                Some(e) => e,
                None => return cur,
            };
            let dst = self.node(e.dst);
            let through = matches!(
                dst.kind,
                DataNodeKind::ScopeEntry { .. } | DataNodeKind::ScopeExit { .. }
            );
            if !through {
                return cur;
            }
            let out_conn = match &e.dst_conn {
                Some(c) if c.starts_with("IN_") => format!("OUT_{}", &c[3..]),
                _ => return cur, // dynamic-bound connector terminates here
            };
            let next = self
                .edges()
                .find(|n| n.src == e.dst && n.src_conn.as_deref() == Some(out_conn.as_str()));
            match next {
                Some(n) => cur = n.id,
                None => return cur,
            }
        }
    }

    /// Follow the edge backward through scope nodes to the first edge of its path.
    pub fn memlet_path_first(&self, edge: EdgeId) -> EdgeId {
        let mut cur = edge;
        loop {
            let e = match self.edge(cur) {
                Some(e) => e,
                None => return cur,
            };
            let src = self.node(e.src);
            let through = matches!(
                src.kind,
                DataNodeKind::ScopeEntry { .. } | DataNodeKind::ScopeExit { .. }
            );
            if !through {
                return cur;
            }
            let in_conn = match &e.src_conn {
                Some(c) if c.starts_with("OUT_") => format!("IN_{}", &c[4..]),
                _ => return cur,
            };
            let prev = self
                .edges()
                .find(|p| p.dst == e.src && p.dst_conn.as_deref() == Some(in_conn.as_str()));
            match prev {
                Some(p) => cur = p.id,
                None => return cur,
            }
        }
    }
}

// ── Control edges ───────────────────────────────────────────────────────────

/// Inter-state edge with an optional condition and symbol assignments.
/// Expressions are strings over scalar program symbols (see `expr`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEdge {
    pub src: StateId,
    pub dst: StateId,
    pub condition: Option<String>,
    pub assignments: BTreeMap<String, String>,
}

impl ControlEdge {
    pub fn unconditional(src: StateId, dst: StateId) -> Self {
        ControlEdge {
            src,
            dst,
            condition: None,
            assignments: BTreeMap::new(),
        }
    }

    pub fn conditional(src: StateId, dst: StateId, condition: impl Into<String>) -> Self {
        ControlEdge {
            src,
            dst,
            condition: Some(condition.into()),
            assignments: BTreeMap::new(),
        }
    }

    pub fn with_assignment(mut self, sym: impl Into<String>, expr: impl Into<String>) -> Self {
        self.assignments.insert(sym.into(), expr.into());
        self
    }
}

// ── Program graph ───────────────────────────────────────────────────────────

/// The whole-program IR: states, control edges, and the array table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramGraph {
    pub label: String,
    pub arrays: BTreeMap<String, ArrayDesc>,
    states: Vec<State>,
    edges: Vec<ControlEdge>,
    pub start: StateId,
}

impl ProgramGraph {
    pub fn new(label: impl Into<String>) -> Self {
        ProgramGraph {
            label: label.into(),
            arrays: BTreeMap::new(),
            states: Vec::new(),
            edges: Vec::new(),
            start: StateId(0),
        }
    }

    // ── Arrays ──────────────────────────────────────────────────────────

    pub fn add_array(&mut self, name: impl Into<String>, desc: ArrayDesc) -> String {
        let name = name.into();
        self.arrays.insert(name.clone(), desc);
        name
    }

    /// Register a descriptor under `base`, probing `base_0`, `base_1`, … on
    /// collision. Returns the chosen name.
    pub fn add_array_unique(&mut self, base: &str, desc: ArrayDesc) -> String {
        let name = self.find_new_name(base);
        self.arrays.insert(name.clone(), desc);
        name
    }

    pub fn find_new_name(&self, base: &str) -> String {
        if !self.arrays.contains_key(base) {
            return base.to_string();
        }
        let mut i = 0u32;
        loop {
            let candidate = format!("{base}_{i}");
            if !self.arrays.contains_key(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    // ── States and control edges ────────────────────────────────────────

    pub fn add_state(&mut self, label: impl Into<String>) -> StateId {
        let id = StateId(self.states.len() as u32);
        self.states.push(State::new(id, label));
        id
    }

    pub fn add_control_edge(&mut self, edge: ControlEdge) {
        self.edges.push(edge);
    }

    pub fn state(&self, id: StateId) -> &State {
        &self.states[id.0 as usize]
    }

    pub fn state_mut(&mut self, id: StateId) -> &mut State {
        &mut self.states[id.0 as usize]
    }

    /// Snapshot of all state ids, in creation order.
    pub fn state_ids(&self) -> Vec<StateId> {
        self.states.iter().map(|s| s.id).collect()
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.iter()
    }

    pub fn control_edges(&self) -> impl Iterator<Item = &ControlEdge> {
        self.edges.iter()
    }

    /// Snapshot of indices of control edges leaving `state`.
    pub fn out_control_edges(&self, state: StateId) -> Vec<usize> {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.src == state)
            .map(|(i, _)| i)
            .collect()
    }

    /// Snapshot of indices of control edges entering `state`.
    pub fn in_control_edges(&self, state: StateId) -> Vec<usize> {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.dst == state)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn control_edge(&self, idx: usize) -> &ControlEdge {
        &self.edges[idx]
    }

    pub fn control_edge_mut(&mut self, idx: usize) -> &mut ControlEdge {
        &mut self.edges[idx]
    }

    /// Drop control edges not matching the predicate. Invalidates previously
    /// obtained edge indices.
    pub fn retain_control_edges(&mut self, f: impl FnMut(&ControlEdge) -> bool) {
        self.edges.retain(f);
    }

    /// States with no outgoing control edges.
    pub fn sink_states(&self) -> Vec<StateId> {
        self.states
            .iter()
            .map(|s| s.id)
            .filter(|id| !self.edges.iter().any(|e| e.src == *id))
            .collect()
    }
}

impl fmt::Display for ProgramGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "ProgramGraph '{}' ({} states, {} control edges, {} arrays)",
            self.label,
            self.states.len(),
            self.edges.len(),
            self.arrays.len()
        )?;
        for state in &self.states {
            writeln!(
                f,
                "  state '{}': {} nodes, {} edges",
                state.label,
                state.nodes.len(),
                state.edges().count()
            )?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
