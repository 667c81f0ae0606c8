//! Human-readable text dump of a compute graph.

use std::fmt::Write;

use crate::graph::{ComputeGraph, EdgeId};

fn edge_label(graph: &ComputeGraph, id: EdgeId) -> String {
    match graph.edge(id) {
        Some(t) => format!("{}:{:?}/{}/{:?}", t.name, t.desc.shape, t.desc.format, t.desc.dtype),
        None => format!("<missing e{}>", id.0),
    }
}

/// Dump a graph in a line-per-node text format, in topological order when
/// the graph is acyclic and in storage order otherwise.
pub fn dump_graph(graph: &ComputeGraph) -> String {
    let mut out = String::new();
    let order = graph
        .topological_order()
        .unwrap_or_else(|_| graph.nodes.iter().map(|n| n.id).collect());

    let _ = writeln!(
        out,
        "Graph: {} node(s), {} edge(s)",
        graph.node_count(),
        graph.edge_count()
    );
    for id in order {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let inputs: Vec<String> = node.inputs.iter().map(|&e| edge_label(graph, e)).collect();
        let outputs: Vec<String> = node.outputs.iter().map(|&e| edge_label(graph, e)).collect();
        let _ = writeln!(
            out,
            "  n{} {} = {}<{}>({}) -> ({})",
            node.id.0,
            node.name,
            node.op_type,
            node.kind,
            inputs.join(", "),
            outputs.join(", ")
        );
        for (key, value) in &node.attrs {
            let _ = writeln!(out, "      {key} = {value}");
        }
    }
    out
}
