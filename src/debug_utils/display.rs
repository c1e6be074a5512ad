//! Human-readable formatting of the graph for logs.

use core::fmt;

use crate::backend::Backend;
use crate::graph::{CallsiteContextGraph, EdgeId, NodeId};

/// Wrapper around a [`CallsiteContextGraph`] which implements `Display` to
/// print all live nodes and their edges.
pub struct DisplayGraph<'a, 'b, B: Backend>(pub &'a CallsiteContextGraph<'b, B>);

impl<B: Backend> fmt::Display for DisplayGraph<'_, '_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Callsite Context Graph:")?;
        for node in self.0.nodes.keys() {
            if self.0.is_removed(node) {
                continue;
            }
            write_node(f, self.0, node)?;
        }
        Ok(())
    }
}

fn write_node<B: Backend>(
    f: &mut fmt::Formatter<'_>,
    graph: &CallsiteContextGraph<'_, B>,
    node: NodeId,
) -> fmt::Result {
    let data = &graph.nodes[node];
    write!(f, "{node}")?;
    if data.is_allocation {
        write!(f, " alloc")?;
    }
    if let Some(call) = data.call {
        write!(f, " {call}")?;
    } else {
        write!(f, " null call")?;
        if data.recursive {
            write!(f, " (recursive)")?;
        }
    }
    writeln!(f, " [orig id {}]", data.orig_stack_or_alloc_id)?;
    write!(f, "\tAllocTypes: {}", data.alloc_types)?;
    write!(f, " ContextIds:")?;
    for id in data.context_ids.sorted() {
        write!(f, " {id}")?;
    }
    writeln!(f)?;
    writeln!(f, "\tCalleeEdges:")?;
    for &edge in &data.callee_edges {
        write_edge(f, graph, edge)?;
    }
    writeln!(f, "\tCallerEdges:")?;
    for &edge in &data.caller_edges {
        write_edge(f, graph, edge)?;
    }
    if !data.clones.is_empty() {
        write!(f, "\tClones:")?;
        for &clone in &data.clones {
            write!(f, " {clone}")?;
        }
        writeln!(f)?;
    } else if let Some(orig) = data.clone_of.expand() {
        writeln!(f, "\tClone of {orig}")?;
    }
    Ok(())
}

fn write_edge<B: Backend>(
    f: &mut fmt::Formatter<'_>,
    graph: &CallsiteContextGraph<'_, B>,
    edge: EdgeId,
) -> fmt::Result {
    let data = &graph.edges[edge];
    write!(
        f,
        "\t\tcallee {} -> caller {} AllocTypes: {} ContextIds:",
        data.callee, data.caller, data.alloc_types
    )?;
    for id in data.context_ids.sorted() {
        write!(f, " {id}")?;
    }
    writeln!(f)
}
