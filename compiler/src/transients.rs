// transients.rs — Transient storage assignment
//
// After discovery and absorption, host-storage transients that are still
// referenced from device contexts must move: top-level host transients flip
// to device-global storage (with an allocation hoist to whole-graph lifetime
// when their shape is symbol-free or constant-bound), while host transients
// nested inside any scope demote to register storage. Transients feeding
// dynamic scope bounds are read on the host and stay put.
//
// Preconditions: runs after absorption; `promoted` names the scalars that
//                moved to the device with their writers.
// Postconditions: no top-level access to a moved transient remains
//                 host-resident; descriptors are mutated in place (names do
//                 not change).
// Failure modes: none.
// Side effects: mutates the array table and registry.

use std::collections::BTreeMap;

use crate::expr::constant_symbols;
use crate::ir::{AllocLifetime, DataNodeKind, ProgramGraph, StorageKind};
use crate::shadow::ShadowRegistry;
use crate::transform::OffloadConfig;

/// Heuristic gate over which host transients are allowed to move to device
/// storage. The default approves every candidate.
pub trait TransientPolicy {
    fn should_promote(&self, name: &str, desc: &crate::ir::ArrayDesc) -> bool;
}

pub struct DefaultTransientPolicy;

impl TransientPolicy for DefaultTransientPolicy {
    fn should_promote(&self, _name: &str, _desc: &crate::ir::ArrayDesc) -> bool {
        true
    }
}

pub fn assign(
    graph: &mut ProgramGraph,
    registry: &mut ShadowRegistry,
    promoted: &BTreeMap<String, Option<String>>,
    config: &OffloadConfig,
    policy: &dyn TransientPolicy,
) {
    let constants = constant_symbols(graph);

    let mut to_device: Vec<String> = Vec::new();
    let mut to_register: Vec<String> = Vec::new();

    for state in graph.states() {
        for node in state.nodes() {
            let Some(array) = node.access_array() else {
                continue;
            };
            let Some(desc) = graph.arrays.get(array) else {
                continue;
            };
            if !desc.transient || desc.storage != StorageKind::HostHeap {
                continue;
            }
            if feeds_dynamic_bound(state, node.id) {
                continue;
            }
            if state.top_level(node.id) {
                // Scalars only follow their absorbed writers.
                if desc.scalar && !promoted.contains_key(array) {
                    continue;
                }
                if !policy.should_promote(array, desc) {
                    continue;
                }
                if !to_device.iter().any(|n| n == array) {
                    to_device.push(array.to_string());
                }
            } else if config.register_promote_transients && !to_register.iter().any(|n| n == array)
            {
                to_register.push(array.to_string());
            }
        }
    }

    for name in to_device {
        registry.move_to_device(graph, &name);
        if config.promote_top_level_transients {
            if let Some(desc) = graph.arrays.get_mut(&name) {
                if desc.free_symbols().iter().all(|s| constants.contains(*s)) {
                    desc.lifetime = AllocLifetime::WholeGraph;
                }
            }
        }
    }
    for name in to_register {
        if let Some(desc) = graph.arrays.get_mut(&name) {
            desc.storage = StorageKind::Register;
        }
    }
}

/// True when some read of this node ends at a top-level dynamic scope-bound
/// connector, which is evaluated on the host.
fn feeds_dynamic_bound(state: &crate::ir::State, node: crate::ir::NodeId) -> bool {
    state.out_edges(node).into_iter().any(|eid| {
        let last = state.memlet_path_last(eid);
        match state.edge(last) {
            Some(le) => {
                matches!(state.node(le.dst).kind, DataNodeKind::ScopeEntry { .. })
                    && le.dst_conn.as_deref().is_some_and(|c| !c.starts_with("IN_"))
                    && state.top_level(le.dst)
            }
            None => false,
        }
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────
