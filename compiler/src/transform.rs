// transform.rs — Whole-program device-offload transform
//
// Orchestrates the offload pipeline over a dataflow graph: shadow registry
// bootstrap, residency & copy discovery, scalar fixed-point absorption,
// recursive descent into nested programs, transient storage assignment,
// control-edge residency fix-up, and host/device boundary copy elision.
// Each stage mutates the graph and registry in place; no stage rolls back a
// later stage's decision, and the stage order must not change.
//
// Preconditions: `graph` is structurally valid; loop metadata comes from the
//               caller's provider; `can_be_applied` has not been invalidated
//               by concurrent mutation (callers serialize).
// Postconditions: on Ok, the graph is rewritten in place and ready for
//                 device code generation.
// Failure modes: `NotApplicable` before any mutation; `Invariant` mid-flight,
//                after which the graph must be treated as corrupted.
// Side effects: mutates the graph; registers shadow descriptors.

use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;

use crate::ir::{DataNodeKind, ProgramGraph, ScopeKind};
use crate::loops::LoopProvider;
use crate::shadow::ShadowRegistry;
use crate::simplify::Simplify;
use crate::transients::{DefaultTransientPolicy, TransientPolicy};
use crate::{control, descend, discover, elide, scalars, transients};

// ── Errors ──────────────────────────────────────────────────────────────────

/// The transform's two failure classes, both fatal to the invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffloadError {
    /// Precondition check failed before any mutation; the graph is untouched.
    NotApplicable,
    /// A structural assumption did not hold mid-transform. Mutation is in
    /// place and not transactional: the graph must be discarded.
    Invariant(String),
}

impl OffloadError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        OffloadError::Invariant(msg.into())
    }
}

impl fmt::Display for OffloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffloadError::NotApplicable => {
                write!(f, "transform not applicable to this graph")
            }
            OffloadError::Invariant(msg) => write!(f, "internal invariant violation: {msg}"),
        }
    }
}

impl Error for OffloadError {}

// ── Configuration ───────────────────────────────────────────────────────────

/// Recognized options of the offload transform.
#[derive(Debug, Clone)]
pub struct OffloadConfig {
    /// Hoist allocation of promoted transients to whole-graph lifetime when
    /// their free symbols are compile-time constants.
    pub promote_top_level_transients: bool,
    /// Demote host transients nested inside scopes to register storage.
    pub register_promote_transients: bool,
    /// Invoke the external structural simplifier as the final step.
    pub run_simplify_after: bool,
    /// Array names skipped by the explicit prologue copy.
    pub exclude_copy_in: BTreeSet<String>,
    /// Array names skipped by the explicit epilogue copy.
    pub exclude_copy_out: BTreeSet<String>,
    /// Set by recursive descent: the graph being transformed is the body of
    /// a nested-program node that executes with device-default schedule.
    pub device_default_parent: bool,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        OffloadConfig {
            promote_top_level_transients: true,
            register_promote_transients: true,
            run_simplify_after: true,
            exclude_copy_in: BTreeSet::new(),
            exclude_copy_out: BTreeSet::new(),
            device_default_parent: false,
        }
    }
}

// ── Offloader ───────────────────────────────────────────────────────────────

/// The whole-program offload transform. One instance can be applied to many
/// graphs; applications on a single graph must be serialized by the caller.
pub struct Offloader {
    pub config: OffloadConfig,
    policy: Box<dyn TransientPolicy>,
}

impl Offloader {
    pub fn new(config: OffloadConfig) -> Self {
        Offloader {
            config,
            policy: Box::new(DefaultTransientPolicy),
        }
    }

    /// Substitute the transient-promotion heuristic.
    pub fn with_policy(mut self, policy: Box<dyn TransientPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Pure applicability check; performs no mutation.
    ///
    /// Rejects graphs containing irregular work-queue (consume) scopes
    /// anywhere, and graphs where two top-level code nodes are connected by
    /// a direct code-to-code data edge (which would become an invalid
    /// mixed-residency fusion after the rewrite).
    pub fn can_be_applied(&self, graph: &ProgramGraph) -> bool {
        if contains_consume_scope(graph) {
            return false;
        }
        !has_toplevel_code_to_code(graph)
    }

    /// Apply the transform in place. The loop provider supplies structural
    /// loop descriptors for this graph and any nested one; the simplifier,
    /// when given and enabled, folds now-trivial scaffolding at the end.
    pub fn apply(
        &self,
        graph: &mut ProgramGraph,
        provider: &dyn LoopProvider,
        simplifier: Option<&dyn Simplify>,
    ) -> Result<(), OffloadError> {
        if !self.can_be_applied(graph) {
            return Err(OffloadError::NotApplicable);
        }

        let mut registry = ShadowRegistry::bootstrap(graph);

        discover::run(graph, &mut registry, &self.config)?;

        let absorption = scalars::absorb(graph, &self.config);

        descend::run(graph, &absorption.nested, provider, simplifier)?;

        transients::assign(
            graph,
            &mut registry,
            &absorption.promoted,
            &self.config,
            self.policy.as_ref(),
        );

        let mut promoted = absorption.promoted.clone();
        control::fixup(graph, &mut registry, &mut promoted)?;

        // Inside a device-default nested program every code node executes on
        // the device; there is no host boundary to copy across.
        if !self.config.device_default_parent {
            let loops = provider.loops_of(graph);
            elide::run(graph, &mut registry, &loops)?;
        }

        if self.config.run_simplify_after {
            if let Some(s) = simplifier {
                s.simplify(graph);
            }
        }
        Ok(())
    }
}

// ── Applicability helpers ───────────────────────────────────────────────────

fn contains_consume_scope(graph: &ProgramGraph) -> bool {
    for state in graph.states() {
        for node in state.nodes() {
            match &node.kind {
                DataNodeKind::ScopeEntry {
                    kind: ScopeKind::Consume,
                    ..
                } => return true,
                DataNodeKind::Nested { graph: nested, .. } => {
                    if contains_consume_scope(nested) {
                        return true;
                    }
                }
                _ => {}
            }
        }
    }
    false
}

fn is_code_kind(kind: &DataNodeKind) -> bool {
    matches!(
        kind,
        DataNodeKind::Code { .. } | DataNodeKind::Library { .. } | DataNodeKind::Nested { .. }
    )
}

fn has_toplevel_code_to_code(graph: &ProgramGraph) -> bool {
    for state in graph.states() {
        for node in state.nodes() {
            if !state.top_level(node.id) || !is_code_kind(&node.kind) {
                continue;
            }
            for eid in state.out_edges(node.id) {
                if let Some(edge) = state.edge(eid) {
                    if is_code_kind(&state.node(edge.dst).kind) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

// ── Tests ───────────────────────────────────────────────────────────────────
