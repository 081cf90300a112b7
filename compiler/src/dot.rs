// dot.rs — Graphviz DOT output for program graphs
//
// Renders a ProgramGraph into DOT format suitable for `dot`, `neato`, or
// other Graphviz layout engines: one cluster per state, data nodes shaped
// and colored by kind and storage, control edges dashed between clusters.
//
// Preconditions: `graph` is a fully constructed ProgramGraph.
// Postconditions: returns a valid DOT string representing the graph.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::ir::{DataNode, DataNodeKind, ProgramGraph, State, StateId, StorageKind};

/// Emit the program graph as a Graphviz DOT string.
pub fn emit_dot(graph: &ProgramGraph) -> String {
    let mut buf = String::new();
    writeln!(buf, "digraph offload {{").unwrap();
    writeln!(buf, "    compound=true;").unwrap();
    writeln!(buf, "    rankdir=TB;").unwrap();
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();

    for state in graph.states() {
        writeln!(buf).unwrap();
        writeln!(buf, "    subgraph cluster_s{} {{", state.id.0).unwrap();
        let start_mark = if state.id == graph.start { " (start)" } else { "" };
        writeln!(buf, "        label=\"{}{}\";", state.label, start_mark).unwrap();
        writeln!(buf, "        style=rounded;").unwrap();
        writeln!(buf, "        color=gray50;").unwrap();
        // Anchor for cluster-to-cluster control edges.
        writeln!(buf, "        s{}_x [shape=point, style=invis];", state.id.0).unwrap();
        write_state_contents(&mut buf, graph, state);
        writeln!(buf, "    }}").unwrap();
    }

    if graph.control_edges().next().is_some() {
        writeln!(buf).unwrap();
        writeln!(buf, "    // Control edges").unwrap();
        for edge in graph.control_edges() {
            let label = control_label(edge.condition.as_deref(), &edge.assignments);
            writeln!(
                buf,
                "    s{}_x -> s{}_x [ltail=cluster_s{}, lhead=cluster_s{}, style=dashed, color=red{label}];",
                edge.src.0, edge.dst.0, edge.src.0, edge.dst.0,
            )
            .unwrap();
        }
    }

    writeln!(buf, "}}").unwrap();
    buf
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn write_state_contents(buf: &mut String, graph: &ProgramGraph, state: &State) {
    for node in state.nodes() {
        let id = dot_node_id(state.id, node);
        let attrs = node_attrs(graph, node);
        writeln!(buf, "        {id} [{attrs}];").unwrap();
    }
    writeln!(buf).unwrap();
    for edge in state.edges() {
        let src = dot_node_id(state.id, state.node(edge.src));
        let dst = dot_node_id(state.id, state.node(edge.dst));
        let style = if edge.wcr.is_some() {
            ", style=bold, color=blue"
        } else {
            ""
        };
        writeln!(
            buf,
            "        {src} -> {dst} [label=\"{}\"{style}];",
            edge.array
        )
        .unwrap();
    }
}

fn dot_node_id(state: StateId, node: &DataNode) -> String {
    format!("s{}_n{}", state.0, node.id.0)
}

fn node_label(node: &DataNode) -> String {
    match &node.kind {
        DataNodeKind::Access { array } => array.clone(),
        DataNodeKind::Code { name, .. } => name.clone(),
        DataNodeKind::ScopeEntry { params, .. } => format!("[{}]", params.join(", ")),
        DataNodeKind::ScopeExit { .. } => "[/]".to_string(),
        DataNodeKind::Library { name, .. } => name.clone(),
        DataNodeKind::Nested { graph, .. } => graph.label.clone(),
    }
}

fn node_attrs(graph: &ProgramGraph, node: &DataNode) -> String {
    let (shape, color) = match &node.kind {
        DataNodeKind::Access { array } => {
            let storage = graph
                .arrays
                .get(array)
                .map(|d| d.storage)
                .unwrap_or(StorageKind::HostHeap);
            let color = match storage {
                StorageKind::DeviceGlobal | StorageKind::DeviceShared => "lightsalmon",
                StorageKind::HostPinned => "khaki",
                StorageKind::Register => "lightyellow",
                StorageKind::HostHeap => "lightblue",
            };
            ("ellipse", color)
        }
        DataNodeKind::Code { .. } => ("box", "lightgreen"),
        DataNodeKind::ScopeEntry { .. } => ("trapezium", "gray90"),
        DataNodeKind::ScopeExit { .. } => ("invtrapezium", "gray90"),
        DataNodeKind::Library { .. } => ("box3d", "plum"),
        DataNodeKind::Nested { .. } => ("folder", "wheat"),
    };
    let label = node_label(node);
    format!("shape={shape}, style=filled, fillcolor={color}, label=\"{label}\"")
}

fn control_label(
    condition: Option<&str>,
    assignments: &std::collections::BTreeMap<String, String>,
) -> String {
    let mut parts = Vec::new();
    if let Some(cond) = condition {
        parts.push(cond.to_string());
    }
    for (sym, rhs) in assignments {
        parts.push(format!("{sym} = {rhs}"));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(", label=\"{}\"", parts.join("; ").replace('"', "\\\""))
    }
}
