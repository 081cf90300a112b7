// control.rs — Control-edge residency fix-up
//
// Control-edge conditions and assignments execute on the host, but after
// discovery and absorption the values they reference may live only in device
// memory. For every state with an outgoing edge that reads a device-resident
// name, one interim copy-out state is spliced after it: the interim copies
// each referenced value into a host shadow exactly once, every outgoing edge
// of the state is redirected to leave the interim state, and the expressions
// are rewritten onto the shadow names. Redirecting all exits together keeps
// the branch point single: the state ends with one unconditional hop and the
// interim re-evaluates the original conditions.
//
// Preconditions: runs after transient assignment, so promoted scalars
//                already carry device storage under their original names.
// Postconditions: no control-edge expression references a device-resident
//                 array; edge conditions and assignment sets are otherwise
//                 untouched.
// Failure modes: host-shadow allocation can fail on an incompatible name
//                collision.
// Side effects: adds states, control edges, arrays; fills the host-shadow
//               slots of `promoted`.

use std::collections::BTreeMap;

use crate::expr::{free_symbols, rename};
use crate::ir::{ControlEdge, ProgramGraph, Subset};
use crate::shadow::ShadowRegistry;
use crate::transform::OffloadError;

pub fn fixup(
    graph: &mut ProgramGraph,
    registry: &mut ShadowRegistry,
    promoted: &mut BTreeMap<String, Option<String>>,
) -> Result<(), OffloadError> {
    // logical name → device twin name, for every array this transform put on
    // the device. Promoted scalars keep their logical name on the device.
    let mut tracked: BTreeMap<String, String> = BTreeMap::new();
    for name in registry.names() {
        if registry.on_device(&name) {
            if let Some(device) = registry.device_array(&name) {
                tracked.insert(name.clone(), device.to_string());
            }
        }
    }
    for name in promoted.keys() {
        tracked.entry(name.clone()).or_insert_with(|| name.clone());
    }

    // Interim states appended below have no outgoing expressions of their
    // own; the original state set is the sweep bound.
    for sid in graph.state_ids() {
        let outs = graph.out_control_edges(sid);

        // Union of tracked names read by any exit of this state.
        let mut referenced: BTreeMap<String, String> = BTreeMap::new();
        for &idx in &outs {
            for (logical, device) in referenced_names(graph.control_edge(idx), &tracked) {
                referenced.insert(logical, device);
            }
        }
        if referenced.is_empty() {
            continue;
        }

        let interim_label = format!("{}_icopyout", graph.state(sid).label);
        let interim = graph.add_state(interim_label);

        // One copy per name, shared by every exit that reads it.
        let mut renames: Vec<(String, String, String)> = Vec::new();
        for (logical, device) in &referenced {
            let host = host_shadow(graph, registry, promoted, logical)?;
            let subset = Subset::full(&graph.arrays[device.as_str()]);
            let state = graph.state_mut(interim);
            let from = state.add_access(device.clone());
            let to = state.add_access(host.clone());
            state.add_edge(from, None, to, None, device.clone(), subset);
            renames.push((logical.clone(), device.clone(), host));
        }

        // Every exit leaves the interim so the branch point stays single,
        // including exits that read nothing tracked.
        for &idx in &outs {
            let edge = graph.control_edge_mut(idx);
            for (logical, device, host) in &renames {
                if let Some(cond) = &edge.condition {
                    let cond = rename(&rename(cond, logical, host), device, host);
                    edge.condition = Some(cond);
                }
                for rhs in edge.assignments.values_mut() {
                    *rhs = rename(&rename(rhs, logical, host), device, host);
                }
            }
            edge.src = interim;
        }
        graph.add_control_edge(ControlEdge::unconditional(sid, interim));
    }
    Ok(())
}

/// Tracked names an edge's expressions actually read, as
/// (logical, device) pairs. Either twin name counts as a reference.
fn referenced_names(
    edge: &ControlEdge,
    tracked: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut syms = std::collections::BTreeSet::new();
    if let Some(cond) = &edge.condition {
        syms.extend(free_symbols(cond));
    }
    for rhs in edge.assignments.values() {
        syms.extend(free_symbols(rhs));
    }
    tracked
        .iter()
        .filter(|(logical, device)| syms.contains(*logical) || syms.contains(*device))
        .map(|(l, d)| (l.clone(), d.clone()))
        .collect()
}

/// Host shadow for one tracked name, allocated on first use and then reused.
/// Promoted scalars additionally record the shadow in their promotion slot.
fn host_shadow(
    graph: &mut ProgramGraph,
    registry: &mut ShadowRegistry,
    promoted: &mut BTreeMap<String, Option<String>>,
    logical: &str,
) -> Result<String, OffloadError> {
    if let Some(Some(host)) = promoted.get(logical) {
        return Ok(host.clone());
    }
    let host = registry.clone_to_host(graph, logical)?;
    if let Some(slot) = promoted.get_mut(logical) {
        *slot = Some(host.clone());
    }
    Ok(host)
}

// ── Tests ───────────────────────────────────────────────────────────────────
