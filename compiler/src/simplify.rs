// simplify.rs — Structural cleanup hook
//
// The transform synthesizes copy states eagerly; when an input set turns out
// empty they carry no nodes and only add control-flow hops. Callers hand the
// transform a simplifier through this trait; the bundled one bypasses empty
// pass-through states. States are never deleted (ids are index-stable), only
// disconnected.
//
// Preconditions: none.
// Postconditions: reachable semantics are unchanged; bypassed states have no
//                 control edges left.
// Failure modes: none.
// Side effects: redirects and removes control edges; may retarget the start
//               state.

use crate::ir::ProgramGraph;

/// Post-transform structural simplification.
pub trait Simplify {
    fn simplify(&self, graph: &mut ProgramGraph);
}

/// Bypasses node-less states that forward unconditionally to a single
/// successor. Incoming edges keep their own conditions and assignments.
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneEmptyStates;

impl Simplify for PruneEmptyStates {
    fn simplify(&self, graph: &mut ProgramGraph) {
        // Chains of empty states collapse one link per sweep.
        loop {
            let mut bypassed = None;
            for sid in graph.state_ids() {
                if graph.state(sid).nodes().next().is_some() {
                    continue;
                }
                let outs = graph.out_control_edges(sid);
                let &[out_idx] = outs.as_slice() else { continue };
                let out = graph.control_edge(out_idx);
                if out.condition.is_some() || !out.assignments.is_empty() || out.dst == sid {
                    continue;
                }
                let dst = out.dst;
                for idx in graph.in_control_edges(sid) {
                    graph.control_edge_mut(idx).dst = dst;
                }
                if graph.start == sid {
                    graph.start = dst;
                }
                graph.retain_control_edges(|e| e.src != sid);
                bypassed = Some(sid);
                break;
            }
            if bypassed.is_none() {
                return;
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
