// descend.rs — Recursive descent into nested programs
//
// Re-applies the offload transform to the body of every top-level
// nested-program node. Arrays passed in through connectors whose outer
// source (or destination) is already device-resident are forced to the
// outer storage inside the body and excluded from the child's explicit
// boundary copies; the child otherwise runs with a default configuration.
//
// Preconditions: `nested` lists nodes of kind Nested; discovery has already
//                retargeted their schedules.
// Postconditions: every nested body satisfies the transform's own
//                 postconditions.
// Failure modes: a nested body that fails its applicability check aborts the
//                whole transform as an invariant violation (the outer graph
//                is already mutated).
// Side effects: mutates nested graphs in place.

use std::collections::BTreeSet;

use crate::ir::{DataNodeKind, NodeId, ProgramGraph, ScheduleKind, StateId, StorageKind};
use crate::loops::LoopProvider;
use crate::simplify::Simplify;
use crate::transform::{OffloadConfig, OffloadError, Offloader};

pub fn run(
    graph: &mut ProgramGraph,
    nested: &[(StateId, NodeId)],
    provider: &dyn LoopProvider,
    simplifier: Option<&dyn Simplify>,
) -> Result<(), OffloadError> {
    for &(sid, nid) in nested {
        let plan = plan_for(graph, sid, nid)?;

        let state = graph.state_mut(sid);
        let DataNodeKind::Nested { graph: inner, .. } = &mut state.node_mut(nid).kind else {
            return Err(OffloadError::invariant(format!(
                "descent target {nid:?} in state {sid:?} is not a nested program"
            )));
        };

        for (name, storage) in &plan.forced_storage {
            if let Some(desc) = inner.arrays.get_mut(name) {
                desc.storage = *storage;
            }
        }

        let config = OffloadConfig {
            exclude_copy_in: plan.exclude_copy_in,
            exclude_copy_out: plan.exclude_copy_out,
            device_default_parent: plan.device_default,
            ..OffloadConfig::default()
        };
        let child = Offloader::new(config);
        match child.apply(inner, provider, simplifier) {
            Ok(()) => {}
            Err(OffloadError::NotApplicable) => {
                return Err(OffloadError::invariant(format!(
                    "nested program '{}' rejected the transform mid-flight",
                    inner.label
                )));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

struct DescentPlan {
    exclude_copy_in: BTreeSet<String>,
    exclude_copy_out: BTreeSet<String>,
    forced_storage: Vec<(String, StorageKind)>,
    device_default: bool,
}

/// Inspect the outer edges of one nested node: connectors backed by
/// device-resident outer arrays keep that storage inside and skip the
/// child's boundary copies.
fn plan_for(graph: &ProgramGraph, sid: StateId, nid: NodeId) -> Result<DescentPlan, OffloadError> {
    let state = graph.state(sid);
    let node = state.node(nid);
    let DataNodeKind::Nested { schedule, .. } = &node.kind else {
        return Err(OffloadError::invariant(format!(
            "descent target {nid:?} in state {sid:?} is not a nested program"
        )));
    };

    let mut plan = DescentPlan {
        exclude_copy_in: BTreeSet::new(),
        exclude_copy_out: BTreeSet::new(),
        forced_storage: Vec::new(),
        device_default: *schedule == ScheduleKind::DeviceDefault,
    };

    for eid in state.in_edges(nid) {
        let Some(edge) = state.edge(eid) else { continue };
        let Some(conn) = edge.dst_conn.clone() else { continue };
        let first = state.memlet_path_first(eid);
        let Some(array) = state
            .edge(first)
            .and_then(|e| state.node(e.src).access_array())
        else {
            continue;
        };
        if let Some(desc) = graph.arrays.get(array) {
            if desc.storage.device_accessible() {
                plan.forced_storage.push((conn.clone(), desc.storage));
                plan.exclude_copy_in.insert(conn);
            }
        }
    }
    for eid in state.out_edges(nid) {
        let Some(edge) = state.edge(eid) else { continue };
        let Some(conn) = edge.src_conn.clone() else { continue };
        let last = state.memlet_path_last(eid);
        let Some(array) = state
            .edge(last)
            .and_then(|e| state.node(e.dst).access_array())
        else {
            continue;
        };
        if let Some(desc) = graph.arrays.get(array) {
            if desc.storage.device_accessible() {
                plan.forced_storage.push((conn.clone(), desc.storage));
                plan.exclude_copy_out.insert(conn);
            }
        }
    }
    Ok(plan)
}

// ── Tests ───────────────────────────────────────────────────────────────────
