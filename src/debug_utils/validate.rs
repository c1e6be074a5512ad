//! Graph invariant checking.

use anyhow::{ensure, Result};

use crate::backend::Backend;
use crate::context::ContextIdSet;
use crate::graph::{CallsiteContextGraph, EdgeId, NodeId};

/// Checks every live node and edge of `graph` against the structural
/// invariants that the transformation stages rely on.
///
/// Holds after every stage: after the initial build, after callsite
/// matching, after cloning, and after function assignment. A violation
/// indicates a bug in the analysis or a backend returning inconsistent
/// stack metadata.
pub fn validate_graph<B: Backend>(graph: &CallsiteContextGraph<'_, B>) -> Result<()> {
    for node in graph.nodes.keys() {
        validate_node(graph, node, false)?;
        for &edge in &graph.nodes[node].caller_edges {
            validate_edge(graph, edge)?;
        }
    }
    Ok(())
}

/// Checks the invariants of a single node, and of its edges when
/// `check_edges` is set.
pub fn validate_node<B: Backend>(
    graph: &CallsiteContextGraph<'_, B>,
    node: NodeId,
    check_edges: bool,
) -> Result<()> {
    let data = &graph.nodes[node];

    // A node drained of contexts is removed. Its edges are unlinked as part
    // of whichever transformation drained it; an edge may linger only while
    // it is itself context-free and about to be pruned.
    if data.context_ids.is_empty() {
        for &edge in data.callee_edges.iter().chain(&data.caller_edges) {
            ensure!(
                graph.edges[edge].context_ids.is_empty(),
                "removed {node} still has {edge} carrying contexts"
            );
        }
        return Ok(());
    }

    ensure!(
        data.alloc_types == graph.contexts.alloc_types_of(&data.context_ids),
        "{node} alloc types {} do not match its context ids",
        data.alloc_types
    );

    // The node's context ids are the union of its callee edges' ids, and a
    // superset of its caller edges' union: contexts may terminate at the
    // node while others continue to callers.
    if !data.caller_edges.is_empty() {
        let mut caller_ids = ContextIdSet::new();
        for &edge in &data.caller_edges {
            if check_edges {
                validate_edge(graph, edge)?;
            }
            caller_ids.extend_from(&graph.edges[edge].context_ids);
        }
        ensure!(
            caller_ids.is_subset_of(&data.context_ids),
            "{node} caller edges carry context ids the node does not"
        );
    }
    if !data.callee_edges.is_empty() {
        let mut callee_ids = ContextIdSet::new();
        for &edge in &data.callee_edges {
            if check_edges {
                validate_edge(graph, edge)?;
            }
            callee_ids.extend_from(&graph.edges[edge].context_ids);
        }
        ensure!(
            callee_ids == data.context_ids,
            "{node} context ids are not the union of its callee edges'"
        );
    }
    Ok(())
}

/// Checks the invariants of a single live edge.
pub fn validate_edge<B: Backend>(graph: &CallsiteContextGraph<'_, B>, edge: EdgeId) -> Result<()> {
    let data = &graph.edges[edge];
    ensure!(!data.removed, "{edge} is removed but still linked");
    ensure!(!data.context_ids.is_empty(), "{edge} has no context ids");
    ensure!(!data.alloc_types.is_none(), "{edge} has no alloc types");
    ensure!(
        data.alloc_types == graph.contexts.alloc_types_of(&data.context_ids),
        "{edge} alloc types {} do not match its context ids",
        data.alloc_types
    );
    ensure!(
        data.context_ids
            .is_subset_of(&graph.nodes[data.callee].context_ids),
        "{edge} carries context ids its callee {} does not",
        data.callee
    );
    ensure!(
        data.context_ids
            .is_subset_of(&graph.nodes[data.caller].context_ids),
        "{edge} carries context ids its caller {} does not",
        data.caller
    );
    Ok(())
}
