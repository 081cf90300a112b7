// scalars.rs — Scalar fixed-point absorption
//
// Decides which top-level code nodes are device-targeted. A code node may
// stay on the host only while every dataflow path out of it (and into it)
// terminates in a host relay: a chain of scalars or single-element accesses
// that are neither device-resident nor already promoted. Marking one node
// device-targeted promotes every relay scalar it touches, which can strip
// the relay property a neighbor depends on, so the pass iterates to a
// fixed point.
//
// Preconditions: runs after residency discovery, so device twins are already
//                substituted into access nodes and edges.
// Postconditions: the returned promotion set is closed — re-running the pass
//                 on the same graph with it would change nothing.
// Failure modes: none; the pass is read-only on the graph.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{DataNodeKind, NodeId, ProgramGraph, State, StateId};
use crate::transform::OffloadConfig;

/// Outcome of the absorption pass.
#[derive(Debug, Default)]
pub struct Absorption {
    /// Relay scalars touched by device-targeted code nodes, now device-bound.
    /// The value slot holds the lazily allocated host shadow name once
    /// control-edge fix-up needs one.
    pub promoted: BTreeMap<String, Option<String>>,
    /// Code nodes marked device-targeted by the fixed point.
    pub device_code: BTreeSet<(StateId, NodeId)>,
    /// Top-level nested-program nodes, for recursive descent.
    pub nested: Vec<(StateId, NodeId)>,
}

pub fn absorb(graph: &ProgramGraph, config: &OffloadConfig) -> Absorption {
    let mut out = Absorption::default();

    let mut candidates: Vec<(StateId, NodeId)> = Vec::new();
    for state in graph.states() {
        for node in state.nodes() {
            if !state.top_level(node.id) {
                continue;
            }
            match &node.kind {
                DataNodeKind::Code { .. } => candidates.push((state.id, node.id)),
                DataNodeKind::Nested { .. } => out.nested.push((state.id, node.id)),
                _ => {}
            }
        }
    }

    // Each promotion can strip the relay property from scalars other nodes
    // depend on, so sweep until a whole pass changes nothing.
    let mut changed = true;
    while changed {
        changed = false;
        let mut remaining = Vec::with_capacity(candidates.len());
        for (sid, nid) in candidates {
            let state = graph.state(sid);
            let mut relays = BTreeSet::new();
            let mut visited = BTreeSet::new();
            let out_ok = relay_scan(graph, state, nid, &out.promoted, true, &mut visited, &mut relays);
            let mut visited = BTreeSet::new();
            let in_ok = relay_scan(graph, state, nid, &out.promoted, false, &mut visited, &mut relays);

            if config.device_default_parent || !(out_ok && in_ok) {
                out.device_code.insert((sid, nid));
                for name in relays {
                    out.promoted.entry(name).or_insert(None);
                }
                changed = true;
            } else {
                remaining.push((sid, nid));
            }
        }
        candidates = remaining;
    }
    out
}

/// Walk one direction of a node's dataflow, collecting relay scalars and
/// reporting whether every path stays within host relays. Non-access
/// endpoints (dynamic scope bounds) are skipped, not counted against it.
fn relay_scan(
    graph: &ProgramGraph,
    state: &State,
    node: NodeId,
    promoted: &BTreeMap<String, Option<String>>,
    outward: bool,
    visited: &mut BTreeSet<NodeId>,
    relays: &mut BTreeSet<String>,
) -> bool {
    let mut ok = true;
    let eids = if outward {
        state.out_edges(node)
    } else {
        state.in_edges(node)
    };
    for eid in eids {
        let resolved = if outward {
            state.memlet_path_last(eid)
        } else {
            state.memlet_path_first(eid)
        };
        let Some(edge) = state.edge(resolved) else { continue };
        let endpoint = if outward { edge.dst } else { edge.src };
        let Some(array) = state.node(endpoint).access_array() else {
            continue;
        };
        let Some(desc) = graph.arrays.get(array) else {
            continue;
        };

        if desc.scalar {
            if desc.storage.device_accessible() || promoted.contains_key(array) {
                ok = false;
            }
            relays.insert(array.to_string());
            if visited.insert(endpoint) {
                ok &= relay_scan(graph, state, endpoint, promoted, outward, visited, relays);
            }
        } else if !desc.storage.device_accessible() && edge.subset.num_elements() == Some(1) {
            if visited.insert(endpoint) {
                ok &= relay_scan(graph, state, endpoint, promoted, outward, visited, relays);
            }
        } else {
            ok = false;
        }
    }
    ok
}

// ── Tests ───────────────────────────────────────────────────────────────────
