// loops.rs — Structural loop descriptors (consumed, not computed)
//
// The transform never detects loops itself; a caller-supplied provider names,
// for any state, the enclosing structural loop as a guard state plus body
// state set. Loop descriptors are only used as grouping keys for deferred
// copy obligations during boundary elision.
//
// Preconditions: descriptors describe actual loops of the graph they are
//                queried for; the guard is outside the body set.
// Postconditions: none (read-only data).
// Failure modes: none here; a guard with zero or multiple exit edges is
//                rejected later, during scaffold materialization.
// Side effects: none.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ir::{ProgramGraph, StateId};

/// A structural loop: guard state plus body state set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDescriptor {
    pub label: String,
    pub guard: StateId,
    pub body: BTreeSet<StateId>,
}

/// All loops of one graph, in provider order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopSet {
    pub loops: Vec<LoopDescriptor>,
}

impl LoopSet {
    pub fn new(loops: Vec<LoopDescriptor>) -> Self {
        LoopSet { loops }
    }

    /// Index of the loop whose body contains `state`, if any.
    /// The first (innermost-listed) match wins.
    pub fn enclosing(&self, state: StateId) -> Option<usize> {
        self.loops.iter().position(|l| l.body.contains(&state))
    }

    pub fn get(&self, idx: usize) -> &LoopDescriptor {
        &self.loops[idx]
    }
}

/// Supplies loop descriptors per graph. Nested programs are looked up by
/// label, so one provider can serve a whole recursion.
pub trait LoopProvider {
    fn loops_of(&self, graph: &ProgramGraph) -> LoopSet;
}

/// Provider for graphs known to contain no structural loops.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLoops;

impl LoopProvider for NoLoops {
    fn loops_of(&self, _graph: &ProgramGraph) -> LoopSet {
        LoopSet::default()
    }
}

/// Static provider: loop sets keyed by graph label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticLoops {
    pub by_graph: std::collections::BTreeMap<String, LoopSet>,
}

impl StaticLoops {
    pub fn single(graph_label: impl Into<String>, set: LoopSet) -> Self {
        let mut by_graph = std::collections::BTreeMap::new();
        by_graph.insert(graph_label.into(), set);
        StaticLoops { by_graph }
    }
}

impl LoopProvider for StaticLoops {
    fn loops_of(&self, graph: &ProgramGraph) -> LoopSet {
        self.by_graph.get(&graph.label).cloned().unwrap_or_default()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enclosing_finds_body_state() {
        let set = LoopSet::new(vec![LoopDescriptor {
            label: "l0".into(),
            guard: StateId(1),
            body: [StateId(2), StateId(3)].into_iter().collect(),
        }]);
        assert_eq!(set.enclosing(StateId(2)), Some(0));
        assert_eq!(set.enclosing(StateId(1)), None);
        assert_eq!(set.enclosing(StateId(5)), None);
    }

    #[test]
    fn static_provider_keys_by_label() {
        let g = ProgramGraph::new("inner");
        let provider = StaticLoops::single("outer", LoopSet::default());
        assert!(provider.loops_of(&g).loops.is_empty());
    }
}
