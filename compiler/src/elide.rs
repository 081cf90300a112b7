// elide.rs — Host/device boundary copies for remaining host code
//
// Top-level code nodes execute on the host yet may touch device-resident
// arrays. Each such read is rerouted through a host shadow
// with a device-to-host copy in front of it; each such write goes to the
// shadow with a host-to-device write-back behind it. When the state sits
// inside a structural loop, the per-state copies are elided and batched
// once at the loop boundary instead: a copy-in state spliced onto every
// edge entering the loop from outside, and a copy-out state spliced onto
// the loop's single exit edge.
//
// Preconditions: runs last among the mutating stages, and only for graphs
//                whose code nodes execute on the host (not inside a
//                device-default nested program).
// Postconditions: no top-level code node is connected to a device-resident
//                 access node.
// Failure modes: a loop guard with zero or several exit edges cannot host a
//                copy-out scaffold and is an invariant violation.
// Side effects: adds states, arrays, nodes, edges; redirects control edges.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{ControlEdge, DataNodeKind, NodeId, ProgramGraph, StateId, Subset};
use crate::loops::LoopSet;
use crate::shadow::ShadowRegistry;
use crate::transform::OffloadError;

pub fn run(
    graph: &mut ProgramGraph,
    registry: &mut ShadowRegistry,
    loops: &LoopSet,
) -> Result<(), OffloadError> {
    // Deferred loop-boundary copies, deduplicated per loop: copy-ins by
    // device name, copy-outs by host name.
    let mut copy_ins: BTreeMap<usize, BTreeMap<String, String>> = BTreeMap::new();
    let mut copy_outs: BTreeMap<usize, BTreeMap<String, String>> = BTreeMap::new();

    for sid in graph.state_ids() {
        let enclosing = loops.enclosing(sid);

        let host_code: Vec<NodeId> = {
            let state = graph.state(sid);
            state
                .nodes()
                .filter(|n| matches!(n.kind, DataNodeKind::Code { .. }))
                .filter(|n| state.top_level(n.id))
                .map(|n| n.id)
                .collect()
        };
        if host_code.is_empty() {
            continue;
        }

        // One host access node per device array per state and direction;
        // reads and writes use distinct nodes to keep the state acyclic.
        let mut read_shadows: BTreeMap<String, NodeId> = BTreeMap::new();
        let mut write_shadows: BTreeMap<String, NodeId> = BTreeMap::new();
        let mut copied_in: BTreeSet<String> = BTreeSet::new();
        let mut copied_out: BTreeSet<String> = BTreeSet::new();

        for nid in host_code {
            reroute_reads(
                graph, registry, sid, nid, enclosing, &mut read_shadows, &mut copied_in,
                &mut copy_ins,
            )?;
            reroute_writes(
                graph, registry, sid, nid, enclosing, &mut write_shadows, &mut copied_out,
                &mut copy_outs,
            )?;
        }
    }

    materialize_loop_scaffolds(graph, loops, &copy_ins, &copy_outs)
}

#[allow(clippy::too_many_arguments)]
fn reroute_reads(
    graph: &mut ProgramGraph,
    registry: &mut ShadowRegistry,
    sid: StateId,
    nid: NodeId,
    enclosing: Option<usize>,
    shadow_nodes: &mut BTreeMap<String, NodeId>,
    copied_in: &mut BTreeSet<String>,
    copy_ins: &mut BTreeMap<usize, BTreeMap<String, String>>,
) -> Result<(), OffloadError> {
    for eid in graph.state(sid).in_edges(nid) {
        let resolved = {
            let state = graph.state(sid);
            let first = state.memlet_path_first(eid);
            state
                .edge(first)
                .and_then(|e| state.node(e.src).access_array().map(|a| (e.src, a)))
                .map(|(n, a)| (first, n, a.to_string()))
        };
        let Some((first, device_node, device)) = resolved else { continue };
        if !graph
            .arrays
            .get(&device)
            .is_some_and(|d| d.storage.device_accessible())
        {
            continue;
        }

        let host = host_shadow_for(graph, registry, &device)?;
        let shadow = *shadow_nodes
            .entry(device.clone())
            .or_insert_with(|| graph.state_mut(sid).add_access(host.clone()));
        {
            let state = graph.state_mut(sid);
            if let Some(edge) = state.edge_mut(first) {
                edge.src = shadow;
                edge.array = host.clone();
            }
        }

        match enclosing {
            Some(li) => {
                copy_ins.entry(li).or_default().insert(device, host);
            }
            None => {
                if copied_in.insert(device.clone()) {
                    // Copy off the edge's own device node so the copy stays
                    // ordered against same-state producers of that node.
                    let subset = Subset::full(&graph.arrays[&device]);
                    let state = graph.state_mut(sid);
                    state.add_edge(device_node, None, shadow, None, device, subset);
                }
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn reroute_writes(
    graph: &mut ProgramGraph,
    registry: &mut ShadowRegistry,
    sid: StateId,
    nid: NodeId,
    enclosing: Option<usize>,
    shadow_nodes: &mut BTreeMap<String, NodeId>,
    copied_out: &mut BTreeSet<String>,
    copy_outs: &mut BTreeMap<usize, BTreeMap<String, String>>,
) -> Result<(), OffloadError> {
    for eid in graph.state(sid).out_edges(nid) {
        let resolved = {
            let state = graph.state(sid);
            let last = state.memlet_path_last(eid);
            state
                .edge(last)
                .and_then(|e| state.node(e.dst).access_array().map(|a| (e.dst, a)))
                .map(|(n, a)| (last, n, a.to_string()))
        };
        let Some((last, device_node, device)) = resolved else { continue };
        if !graph
            .arrays
            .get(&device)
            .is_some_and(|d| d.storage.device_accessible())
        {
            continue;
        }

        let host = host_shadow_for(graph, registry, &device)?;
        let shadow = *shadow_nodes
            .entry(device.clone())
            .or_insert_with(|| graph.state_mut(sid).add_access(host.clone()));
        {
            let state = graph.state_mut(sid);
            if let Some(edge) = state.edge_mut(last) {
                edge.dst = shadow;
                edge.array = host.clone();
            }
        }

        match enclosing {
            Some(li) => {
                copy_outs.entry(li).or_default().insert(host, device);
            }
            None => {
                if copied_out.insert(host.clone()) {
                    // Write back into the edge's own device node so same-state
                    // consumers of that node observe the update.
                    let subset = Subset::full(&graph.arrays[&device]);
                    let state = graph.state_mut(sid);
                    state.add_edge(shadow, None, device_node, None, host, subset);
                }
            }
        }
    }
    Ok(())
}

/// Host shadow for a device-resident name: resolved through the registry so
/// a shadow created by control-edge fix-up is reused rather than duplicated.
/// Discovery's retargeting also registers entries keyed by the twin name
/// itself; the reverse lookup prefers the logical key over that alias, since
/// the alias would mint a second shadow (`host_device_x` next to `host_x`).
fn host_shadow_for(
    graph: &mut ProgramGraph,
    registry: &mut ShadowRegistry,
    device: &str,
) -> Result<String, OffloadError> {
    let logical = registry
        .names()
        .into_iter()
        .filter(|n| registry.device_array(n) == Some(device))
        .find(|n| n.as_str() != device)
        .unwrap_or_else(|| device.to_string());
    registry.clone_to_host(graph, &logical)
}

fn materialize_loop_scaffolds(
    graph: &mut ProgramGraph,
    loops: &LoopSet,
    copy_ins: &BTreeMap<usize, BTreeMap<String, String>>,
    copy_outs: &BTreeMap<usize, BTreeMap<String, String>>,
) -> Result<(), OffloadError> {
    let touched: BTreeSet<usize> = copy_ins.keys().chain(copy_outs.keys()).copied().collect();

    for li in touched {
        let desc = loops.get(li);
        let guard = desc.guard;
        let guard_label = graph.state(guard).label.clone();

        if let Some(obligations) = copy_ins.get(&li) {
            let copyin = graph.add_state(format!("{guard_label}_loopcopyin"));
            for (device, host) in obligations {
                let subset = Subset::full(&graph.arrays[device.as_str()]);
                let state = graph.state_mut(copyin);
                let from = state.add_access(device.clone());
                let to = state.add_access(host.clone());
                state.add_edge(from, None, to, None, host.clone(), subset);
            }
            for idx in graph.in_control_edges(guard) {
                let src = graph.control_edge(idx).src;
                if !desc.body.contains(&src) {
                    graph.control_edge_mut(idx).dst = copyin;
                }
            }
            graph.add_control_edge(ControlEdge::unconditional(copyin, guard));
        }

        if let Some(obligations) = copy_outs.get(&li) {
            let exits: Vec<usize> = graph
                .out_control_edges(guard)
                .into_iter()
                .filter(|&i| !desc.body.contains(&graph.control_edge(i).dst))
                .collect();
            let &[exit_idx] = exits.as_slice() else {
                return Err(OffloadError::invariant(format!(
                    "loop '{}' has {} exit edges, need exactly one for the write-back scaffold",
                    desc.label,
                    exits.len()
                )));
            };
            let old_dst = graph.control_edge(exit_idx).dst;
            let copyout = graph.add_state(format!("{guard_label}_loopcopyout"));
            for (host, device) in obligations {
                let subset = Subset::full(&graph.arrays[device.as_str()]);
                let state = graph.state_mut(copyout);
                let from = state.add_access(host.clone());
                let to = state.add_access(device.clone());
                state.add_edge(from, None, to, None, device.clone(), subset);
            }
            // The exit edge keeps its condition; the scaffold re-targets it.
            graph.control_edge_mut(exit_idx).dst = copyout;
            graph.add_control_edge(ControlEdge::unconditional(copyout, old_dst));
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ArrayDesc, Dim, StorageKind};
    use crate::loops::{LoopDescriptor, LoopSet};

    fn device_array(n: u64) -> ArrayDesc {
        ArrayDesc::array(vec![Dim::Const(n)])
            .with_storage(StorageKind::DeviceGlobal)
            .transient()
    }

    /// One state with a host tasklet reading device array `d`.
    fn reader_graph() -> (ProgramGraph, StateId) {
        let mut g = ProgramGraph::new("p");
        g.add_array("d", device_array(8));
        g.add_array("out", ArrayDesc::scalar().transient());
        let sid = g.add_state("s0");
        let st = g.state_mut(sid);
        let d = st.add_access("d");
        let t = st.add_code("t", vec!["x".into()], vec!["y".into()]);
        let o = st.add_access("out");
        st.add_edge(d, None, t, Some("x".into()), "d", Subset::element());
        st.add_edge(t, Some("y".into()), o, None, "out", Subset::element());
        (g, sid)
    }

    #[test]
    fn host_read_goes_through_shadow_with_copy() {
        let (mut g, sid) = reader_graph();
        let mut reg = ShadowRegistry::bootstrap(&g);
        run(&mut g, &mut reg, &LoopSet::default()).unwrap();

        assert!(g.arrays.contains_key("host_d"));
        assert_eq!(g.arrays["host_d"].storage, StorageKind::HostHeap);
        let st = g.state(sid);
        // d → host_d copy, then host_d → tasklet.
        let copy = st
            .edges()
            .find(|e| st.node(e.src).access_array() == Some("d"))
            .expect("device-to-host copy");
        assert_eq!(st.node(copy.dst).access_array(), Some("host_d"));
        assert_eq!(copy.array, "d");
        let feed = st
            .edges()
            .find(|e| e.dst_conn.as_deref() == Some("x"))
            .expect("tasklet input");
        assert_eq!(st.node(feed.src).access_array(), Some("host_d"));
        assert_eq!(feed.array, "host_d");
    }

    #[test]
    fn host_write_gets_write_back() {
        let mut g = ProgramGraph::new("p");
        g.add_array("d", device_array(8));
        let sid = g.add_state("s0");
        let st = g.state_mut(sid);
        let t = st.add_code("t", vec![], vec!["y".into()]);
        let d = st.add_access("d");
        st.add_edge(t, Some("y".into()), d, None, "d", Subset::element());
        let mut reg = ShadowRegistry::bootstrap(&g);
        run(&mut g, &mut reg, &LoopSet::default()).unwrap();

        let st = g.state(sid);
        let feed = st
            .edges()
            .find(|e| e.src_conn.as_deref() == Some("y"))
            .expect("tasklet output");
        assert_eq!(st.node(feed.dst).access_array(), Some("host_d"));
        let back = st
            .edges()
            .find(|e| st.node(e.dst).access_array() == Some("d"))
            .expect("host-to-device write-back");
        assert_eq!(st.node(back.src).access_array(), Some("host_d"));
        assert_eq!(back.array, "host_d");
    }

    #[test]
    fn copy_is_ordered_after_in_state_producer() {
        // A device map writes `d`; a host tasklet in the same state reads it.
        // The device-to-host copy must hang off the node the map writes, not
        // a detached duplicate, or the copy could run before the kernel.
        let mut g = ProgramGraph::new("p");
        g.add_array("d", device_array(8));
        g.add_array("out", ArrayDesc::scalar().transient());
        let sid = g.add_state("s0");
        let st = g.state_mut(sid);
        let (entry, exit) = st.add_scope(
            crate::ir::ScopeKind::Map,
            crate::ir::ScheduleKind::DeviceParallel,
            vec!["i".into()],
            None,
        );
        let k = st.add_code_in("k", vec![], vec!["v".into()], Some(entry));
        let d = st.add_access("d");
        st.add_edge(k, Some("v".into()), exit, Some("IN_d".into()), "d", Subset::element());
        st.add_edge(exit, Some("OUT_d".into()), d, None, "d", Subset::element());
        let t = st.add_code("t", vec!["x".into()], vec!["y".into()]);
        let o = st.add_access("out");
        st.add_edge(d, None, t, Some("x".into()), "d", Subset::element());
        st.add_edge(t, Some("y".into()), o, None, "out", Subset::element());

        let mut reg = ShadowRegistry::bootstrap(&g);
        run(&mut g, &mut reg, &LoopSet::default()).unwrap();

        let st = g.state(sid);
        let copy = st
            .edges()
            .find(|e| st.node(e.dst).access_array() == Some("host_d"))
            .expect("device-to-host copy");
        assert_eq!(copy.src, d, "copy reads the node the map writes");
        assert!(st
            .in_edges(copy.src)
            .into_iter()
            .any(|eid| st.edge(eid).is_some_and(|e| e.src == exit)));
    }

    #[test]
    fn write_back_reaches_in_state_consumer() {
        // Host tasklet writes `d`; a device map in the same state reads the
        // same access node. The write-back must land on that node.
        let mut g = ProgramGraph::new("p");
        g.add_array("d", device_array(8));
        let sid = g.add_state("s0");
        let st = g.state_mut(sid);
        let t = st.add_code("t", vec![], vec!["y".into()]);
        let d = st.add_access("d");
        st.add_edge(t, Some("y".into()), d, None, "d", Subset::element());
        let (entry, _) = st.add_scope(
            crate::ir::ScopeKind::Map,
            crate::ir::ScheduleKind::DeviceParallel,
            vec!["i".into()],
            None,
        );
        st.add_edge(d, None, entry, Some("IN_d".into()), "d", Subset::element());

        let mut reg = ShadowRegistry::bootstrap(&g);
        run(&mut g, &mut reg, &LoopSet::default()).unwrap();

        let st = g.state(sid);
        let back = st
            .edges()
            .find(|e| st.node(e.src).access_array() == Some("host_d")
                && st.node(e.dst).access_array() == Some("d"))
            .expect("host-to-device write-back");
        assert_eq!(back.dst, d, "write-back lands on the node the map reads");
    }

    #[test]
    fn scope_nested_code_is_left_alone() {
        let mut g = ProgramGraph::new("p");
        g.add_array("d", device_array(8));
        let sid = g.add_state("s0");
        let st = g.state_mut(sid);
        let d = st.add_access("d");
        let (entry, _) = st.add_scope(
            crate::ir::ScopeKind::Map,
            crate::ir::ScheduleKind::DeviceParallel,
            vec!["i".into()],
            None,
        );
        let t = st.add_code_in("t", vec!["x".into()], vec![], Some(entry));
        st.add_edge(d, None, entry, Some("IN_d".into()), "d", Subset::element());
        st.add_edge(entry, Some("OUT_d".into()), t, Some("x".into()), "d", Subset::element());
        let mut reg = ShadowRegistry::bootstrap(&g);
        run(&mut g, &mut reg, &LoopSet::default()).unwrap();
        assert!(!g.arrays.contains_key("host_d"));
    }

    /// pre → guard → body → guard, guard → after; host tasklet in the body
    /// reads and writes device array `d`.
    fn loop_graph() -> (ProgramGraph, LoopSet) {
        let mut g = ProgramGraph::new("p");
        g.add_array("d", device_array(8));
        let pre = g.add_state("pre");
        let guard = g.add_state("guard");
        let body = g.add_state("body");
        let after = g.add_state("after");
        g.add_control_edge(ControlEdge::unconditional(pre, guard));
        g.add_control_edge(ControlEdge::conditional(guard, body, "i < 4"));
        g.add_control_edge(ControlEdge::conditional(guard, after, "i >= 4"));
        g.add_control_edge(ControlEdge::unconditional(body, guard).with_assignment("i", "i + 1"));
        g.start = pre;

        let st = g.state_mut(body);
        let d_in = st.add_access("d");
        let t = st.add_code("t", vec!["x".into()], vec!["y".into()]);
        let d_out = st.add_access("d");
        st.add_edge(d_in, None, t, Some("x".into()), "d", Subset::element());
        st.add_edge(t, Some("y".into()), d_out, None, "d", Subset::element());

        let set = LoopSet::new(vec![LoopDescriptor {
            label: "l0".into(),
            guard,
            body: [body].into_iter().collect(),
        }]);
        (g, set)
    }

    #[test]
    fn loop_copies_batch_at_the_boundary() {
        let (mut g, loops) = loop_graph();
        let mut reg = ShadowRegistry::bootstrap(&g);
        run(&mut g, &mut reg, &loops).unwrap();

        let body = g.state(StateId(2));
        // No per-iteration copies inside the body.
        assert_eq!(body.edges().count(), 2);
        assert!(body
            .edges()
            .all(|e| e.array == "host_d"));

        let copyin = g
            .states()
            .find(|s| s.label == "guard_loopcopyin")
            .expect("loop copy-in state");
        let e = copyin.edges().next().expect("scaffold copy");
        assert_eq!(copyin.node(e.src).access_array(), Some("d"));
        assert_eq!(copyin.node(e.dst).access_array(), Some("host_d"));
        assert_eq!(copyin.edges().count(), 1, "deduped by device name");

        let copyout = g
            .states()
            .find(|s| s.label == "guard_loopcopyout")
            .expect("loop copy-out state");
        let e = copyout.edges().next().expect("scaffold write-back");
        assert_eq!(copyout.node(e.src).access_array(), Some("host_d"));
        assert_eq!(copyout.node(e.dst).access_array(), Some("d"));

        // pre enters through copy-in; the back edge still targets the guard.
        let pre_out = g.out_control_edges(StateId(0));
        assert_eq!(g.control_edge(pre_out[0]).dst, copyin.id);
        let back = g
            .control_edges()
            .find(|e| !e.assignments.is_empty())
            .unwrap();
        assert_eq!(back.dst, StateId(1));

        // The exit condition rides the redirected edge into copy-out, and an
        // unconditional edge continues to the old exit target.
        let exit = g
            .control_edges()
            .find(|e| e.condition.as_deref() == Some("i >= 4"))
            .unwrap();
        assert_eq!(exit.dst, copyout.id);
        assert!(g
            .control_edges()
            .any(|e| e.src == copyout.id && e.dst == StateId(3) && e.condition.is_none()));
    }

    #[test]
    fn multi_exit_loop_is_rejected() {
        let (mut g, mut loops) = loop_graph();
        // Second exit edge out of the guard.
        let extra = g.add_state("err");
        let guard = loops.loops[0].guard;
        g.add_control_edge(ControlEdge::conditional(guard, extra, "i < 0"));
        let mut reg = ShadowRegistry::bootstrap(&g);
        assert!(matches!(
            run(&mut g, &mut reg, &loops),
            Err(OffloadError::Invariant(_))
        ));
    }
}
