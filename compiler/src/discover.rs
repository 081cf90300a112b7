// discover.rs — Residency & copy discovery (steps 0–4)
//
// Finds the true program inputs/outputs, clones them to the device, rewrites
// every reference to the device twins, synthesizes the prologue copy-in and
// epilogue copy-out states, and retargets top-level scopes, library nodes,
// and nested programs to device schedules (moving their direct outputs to
// device storage).
//
// Preconditions: registry is bootstrapped; applicability has been checked.
// Postconditions: the copy-in state strictly dominates the original start
//                 state; the copy-out state is dominated by every original
//                 sink state.
// Failure modes: a scope entry without a paired exit is an invariant
//                violation.
// Side effects: mutates graph and registry.

use crate::ir::{
    ControlEdge, DataNodeKind, NodeId, ProgramGraph, ScheduleKind, ScopeKind, StateId, Subset,
};
use crate::shadow::ShadowRegistry;
use crate::transform::{OffloadConfig, OffloadError};

/// True inputs and outputs found by step 0, in discovery order.
#[derive(Debug, Default)]
pub struct Discovery {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

pub fn run(
    graph: &mut ProgramGraph,
    registry: &mut ShadowRegistry,
    config: &OffloadConfig,
) -> Result<Discovery, OffloadError> {
    let discovery = find_true_inputs_outputs(graph);

    let start = graph.start;
    let sinks = graph.sink_states();

    clone_and_rewrite(graph, registry, &discovery);
    add_copy_in_state(graph, registry, config, &discovery.inputs, start);
    add_copy_out_state(graph, registry, config, &discovery.outputs, &sinks);
    retarget_top_level(graph, registry)?;

    Ok(discovery)
}

// ── Step 0: true inputs and outputs ─────────────────────────────────────────

/// An array is a true input if some access node reads it (has outgoing data
/// edges) and no read feeds a top-level dynamic scope bound; it is a true
/// output if some access node writes it. A non-transient source of a
/// write-conflict-resolution edge is read-modified and counts as an input.
fn find_true_inputs_outputs(graph: &ProgramGraph) -> Discovery {
    let mut inputs: Vec<String> = Vec::new();
    let mut outputs: Vec<String> = Vec::new();

    for state in graph.states() {
        for node in state.nodes() {
            let Some(array) = node.access_array() else {
                continue;
            };
            let Some(desc) = graph.arrays.get(array) else {
                continue;
            };
            if desc.transient {
                continue;
            }
            if state.out_degree(node.id) > 0 && !inputs.iter().any(|n| n == array) {
                let feeds_dynamic_bound = state.out_edges(node.id).into_iter().any(|eid| {
                    let last = state.memlet_path_last(eid);
                    match state.edge(last) {
                        Some(le) => {
                            matches!(state.node(le.dst).kind, DataNodeKind::ScopeEntry { .. })
                                && le
                                    .dst_conn
                                    .as_deref()
                                    .is_some_and(|c| !c.starts_with("IN_"))
                                && state.top_level(le.dst)
                        }
                        None => false,
                    }
                });
                if !feeds_dynamic_bound {
                    inputs.push(array.to_string());
                }
            }
            if state.in_degree(node.id) > 0 && !outputs.iter().any(|n| n == array) {
                outputs.push(array.to_string());
            }
        }

        for edge in state.edges() {
            if edge.wcr.is_none() {
                continue;
            }
            let transient = graph
                .arrays
                .get(&edge.array)
                .map(|d| d.transient)
                .unwrap_or(true);
            if !transient && !inputs.iter().any(|n| *n == edge.array) {
                inputs.push(edge.array.clone());
            }
        }
    }

    Discovery { inputs, outputs }
}

// ── Step 1: device clones and reference rewrite ─────────────────────────────

fn clone_and_rewrite(
    graph: &mut ProgramGraph,
    registry: &mut ShadowRegistry,
    discovery: &Discovery,
) {
    for name in &discovery.inputs {
        let (scalar, device) = {
            let desc = &graph.arrays[name];
            (desc.scalar, desc.storage.device_accessible())
        };
        if scalar || device {
            continue;
        }
        registry.clone_to_device(graph, name);
    }
    for name in &discovery.outputs {
        if registry.on_device(name) {
            continue;
        }
        let (scalar, device) = {
            let desc = &graph.arrays[name];
            (desc.scalar, desc.storage.device_accessible())
        };
        if scalar || device {
            continue;
        }
        registry.clone_to_device(graph, name);
    }

    // Rewrite every access node and data edge to the device twin.
    for sid in graph.state_ids() {
        let state = graph.state_mut(sid);
        for nid in state.node_ids() {
            if let DataNodeKind::Access { array } = &mut state.node_mut(nid).kind {
                if registry.on_device(array) {
                    if let Some(device) = registry.device_array(array) {
                        *array = device.to_string();
                    }
                }
            }
        }
        for eid in state.edge_ids() {
            if let Some(edge) = state.edge_mut(eid) {
                if registry.on_device(&edge.array) {
                    if let Some(device) = registry.device_array(&edge.array) {
                        edge.array = device.to_string();
                    }
                }
            }
        }
    }
}

// ── Steps 2/3: prologue and epilogue copy states ────────────────────────────

fn add_copy_in_state(
    graph: &mut ProgramGraph,
    registry: &ShadowRegistry,
    config: &OffloadConfig,
    inputs: &[String],
    start: StateId,
) {
    let label = format!("{}_copyin", graph.label);
    let copyin = graph.add_state(label);
    graph.add_control_edge(ControlEdge::unconditional(copyin, start));
    graph.start = copyin;

    for name in inputs {
        if config.exclude_copy_in.contains(name) || !registry.on_device(name) {
            continue;
        }
        let Some(device) = registry.device_array(name).map(str::to_string) else {
            continue;
        };
        let subset = Subset::full(&graph.arrays[name]);
        let state = graph.state_mut(copyin);
        let src = state.add_access(name.clone());
        let dst = state.add_access(device);
        state.add_edge(src, None, dst, None, name.clone(), subset);
    }
}

fn add_copy_out_state(
    graph: &mut ProgramGraph,
    registry: &ShadowRegistry,
    config: &OffloadConfig,
    outputs: &[String],
    sinks: &[StateId],
) {
    let label = format!("{}_copyout", graph.label);
    let copyout = graph.add_state(label);
    for sink in sinks {
        graph.add_control_edge(ControlEdge::unconditional(*sink, copyout));
    }

    for name in outputs {
        if config.exclude_copy_out.contains(name) || !registry.on_device(name) {
            continue;
        }
        let Some(device) = registry.device_array(name).map(str::to_string) else {
            continue;
        };
        let subset = Subset::full(&graph.arrays[name]);
        let state = graph.state_mut(copyout);
        let src = state.add_access(device);
        let dst = state.add_access(name.clone());
        state.add_edge(src, None, dst, None, name.clone(), subset);
    }
}

// ── Step 4: device schedules for top-level regions ──────────────────────────

fn retarget_top_level(
    graph: &mut ProgramGraph,
    registry: &mut ShadowRegistry,
) -> Result<(), OffloadError> {
    let mut device_nodes: Vec<(StateId, NodeId)> = Vec::new();

    for sid in graph.state_ids() {
        let state = graph.state_mut(sid);
        for nid in state.node_ids() {
            if !state.top_level(nid) {
                continue;
            }
            match &mut state.node_mut(nid).kind {
                DataNodeKind::Library { schedule, .. }
                | DataNodeKind::Nested { schedule, .. } => {
                    *schedule = ScheduleKind::DeviceDefault;
                    device_nodes.push((sid, nid));
                }
                DataNodeKind::ScopeEntry {
                    kind: ScopeKind::Map,
                    schedule,
                    ..
                } => {
                    *schedule = ScheduleKind::DeviceParallel;
                    device_nodes.push((sid, nid));
                }
                _ => {}
            }
        }
    }

    // The direct outputs of device-scheduled regions live in device memory.
    for (sid, nid) in device_nodes {
        let targets = {
            let state = graph.state(sid);
            let from = match state.node(nid).kind {
                DataNodeKind::ScopeEntry { .. } => state.exit_of(nid).ok_or_else(|| {
                    OffloadError::invariant(format!(
                        "scope entry {:?} in state '{}' has no paired exit",
                        nid, state.label
                    ))
                })?,
                _ => nid,
            };
            let mut targets = Vec::new();
            for eid in state.out_edges(from) {
                let last = state.memlet_path_last(eid);
                if let Some(le) = state.edge(last) {
                    if let Some(array) = state.node(le.dst).access_array() {
                        targets.push(array.to_string());
                    }
                }
            }
            targets
        };
        for array in targets {
            registry.move_to_device(graph, &array);
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ArrayDesc, Dim, StorageKind};

    /// host A → map scope → host B, all in one state.
    fn scope_graph() -> ProgramGraph {
        let mut g = ProgramGraph::new("prog");
        g.add_array("A", ArrayDesc::array(vec![Dim::Const(32)]));
        g.add_array("B", ArrayDesc::array(vec![Dim::Const(32)]));
        let s0 = g.add_state("s0");
        let st = g.state_mut(s0);
        let a = st.add_access("A");
        let (entry, exit) =
            st.add_scope(ScopeKind::Map, ScheduleKind::HostSequential, vec!["i".into()], None);
        let code = st.add_code_in("work", vec!["x".into()], vec!["y".into()], Some(entry));
        let b = st.add_access("B");
        let full = Subset::full(&ArrayDesc::array(vec![Dim::Const(32)]));
        st.add_edge(a, None, entry, Some("IN_A".into()), "A", full.clone());
        st.add_edge(entry, Some("OUT_A".into()), code, Some("x".into()), "A", Subset::element());
        st.add_edge(code, Some("y".into()), exit, Some("IN_B".into()), "B", Subset::element());
        st.add_edge(exit, Some("OUT_B".into()), b, None, "B", full);
        g.start = s0;
        g
    }

    #[test]
    fn finds_true_inputs_and_outputs() {
        let g = scope_graph();
        let d = find_true_inputs_outputs(&g);
        assert_eq!(d.inputs, vec!["A".to_string()]);
        assert_eq!(d.outputs, vec!["B".to_string()]);
    }

    #[test]
    fn wcr_source_counts_as_input() {
        let mut g = ProgramGraph::new("p");
        g.add_array("acc", ArrayDesc::array(vec![Dim::Const(4)]));
        let s = g.add_state("s0");
        let st = g.state_mut(s);
        let code = st.add_code("sum", vec![], vec!["o".into()]);
        let acc = st.add_access("acc");
        st.add_edge_wcr(
            code,
            Some("o".into()),
            acc,
            None,
            "acc",
            Subset::element(),
            Some("+".into()),
        );
        let d = find_true_inputs_outputs(&g);
        assert!(d.inputs.contains(&"acc".to_string()));
        assert!(d.outputs.contains(&"acc".to_string()));
    }

    #[test]
    fn dynamic_bound_feeder_is_not_an_input() {
        let mut g = ProgramGraph::new("p");
        g.add_array("n", ArrayDesc::array(vec![Dim::Const(1)]));
        let s = g.add_state("s0");
        let st = g.state_mut(s);
        let n = st.add_access("n");
        let (entry, _) =
            st.add_scope(ScopeKind::Map, ScheduleKind::HostSequential, vec!["i".into()], None);
        st.add_edge(n, None, entry, Some("n".into()), "n", Subset::element());
        let d = find_true_inputs_outputs(&g);
        assert!(d.inputs.is_empty());
    }

    #[test]
    fn copy_states_bracket_the_graph() {
        let mut g = scope_graph();
        let mut reg = ShadowRegistry::bootstrap(&g);
        run(&mut g, &mut reg, &OffloadConfig::default()).unwrap();

        let copyin = g
            .states()
            .find(|s| s.label == "prog_copyin")
            .expect("copy-in state");
        let copyout = g
            .states()
            .find(|s| s.label == "prog_copyout")
            .expect("copy-out state");
        assert_eq!(g.start, copyin.id);
        assert_eq!(g.out_control_edges(copyin.id).len(), 1);
        assert_eq!(
            g.control_edge(g.out_control_edges(copyin.id)[0]).dst,
            StateId(0)
        );
        assert_eq!(g.in_control_edges(copyout.id).len(), 1);
        // copy-in carries A → device_A
        let e = copyin.edges().next().expect("copy-in edge");
        assert_eq!(copyin.node(e.src).access_array(), Some("A"));
        assert_eq!(copyin.node(e.dst).access_array(), Some("device_A"));
        // copy-out carries device_B → B
        let e = copyout.edges().next().expect("copy-out edge");
        assert_eq!(copyout.node(e.src).access_array(), Some("device_B"));
        assert_eq!(copyout.node(e.dst).access_array(), Some("B"));
    }

    #[test]
    fn top_level_scope_gets_device_schedule_and_outputs_move() {
        let mut g = scope_graph();
        let mut reg = ShadowRegistry::bootstrap(&g);
        run(&mut g, &mut reg, &OffloadConfig::default()).unwrap();

        let st = g.state(StateId(0));
        let entry = st
            .nodes()
            .find(|n| matches!(n.kind, DataNodeKind::ScopeEntry { .. }))
            .unwrap();
        match &entry.kind {
            DataNodeKind::ScopeEntry { schedule, .. } => {
                assert_eq!(*schedule, ScheduleKind::DeviceParallel)
            }
            _ => unreachable!(),
        }
        // B was cloned; its device twin is the scope output and stays device.
        assert_eq!(g.arrays["device_B"].storage, StorageKind::DeviceGlobal);
        // Host originals keep their names and storage.
        assert_eq!(g.arrays["B"].storage, StorageKind::HostHeap);
    }

    #[test]
    fn input_and_output_array_gets_single_clone() {
        let mut g = ProgramGraph::new("p");
        g.add_array("x", ArrayDesc::array(vec![Dim::Const(8)]));
        let s = g.add_state("s0");
        let st = g.state_mut(s);
        let rd = st.add_access("x");
        let code = st.add_code("inc", vec!["a".into()], vec!["b".into()]);
        let wr = st.add_access("x");
        st.add_edge(rd, None, code, Some("a".into()), "x", Subset::element());
        st.add_edge(code, Some("b".into()), wr, None, "x", Subset::element());
        g.start = s;
        let mut reg = ShadowRegistry::bootstrap(&g);
        run(&mut g, &mut reg, &OffloadConfig::default()).unwrap();
        assert_eq!(reg.device_array("x"), Some("device_x"));
        assert!(!g.arrays.contains_key("device_x_0"), "no duplicate clone");
    }

    #[test]
    fn excluded_inputs_get_no_prologue_copy() {
        let mut g = scope_graph();
        let mut reg = ShadowRegistry::bootstrap(&g);
        let mut config = OffloadConfig::default();
        config.exclude_copy_in.insert("A".into());
        run(&mut g, &mut reg, &config).unwrap();
        let copyin = g.states().find(|s| s.label == "prog_copyin").unwrap();
        assert_eq!(copyin.edges().count(), 0);
    }
}
