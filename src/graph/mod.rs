//! The callsite context graph.
//!
//! The graph represents the call contexts in all profiled allocation
//! behavior records, with nodes for the allocations themselves as well as
//! for the calls in each context. It is initially built from the allocation
//! MIBs, then updated to match callsites carrying stack metadata onto the
//! nodes, reflecting any inlining performed on those calls.
//!
//! Each MIB is assigned a unique context id during the build, and the edges
//! and nodes are decorated with the context ids they carry. This is what
//! allows cloning to preserve exactly which contexts reach which copy of an
//! allocation.
//!
//! Transformation proceeds in stages over the same graph:
//!
//! 1. [build](CallsiteContextGraph::build): allocation nodes and profiled
//!    stack chains, then callsite matching and neutralization of callsites
//!    whose static callee disagrees with the profile.
//! 2. [`process`](CallsiteContextGraph::process): cloning to uniquify
//!    behavior classes, then assignment of callsite clones to function
//!    clones, with decisions delivered through the backend.

use alloc::vec::Vec;

use crate::backend::{Backend, CallInfo};
use crate::context::{AllocType, AllocTypes, ContextId, ContextIdRegistry, ContextIdSet};
use crate::debug_utils::{validate_node, DisplayGraph};
use crate::entity::{PackedOption, PrimaryMap};
use crate::{FxHashMap, FxIndexMap, Options, Stats};

mod assign;
mod build;
mod cloning;
mod stack_matching;

#[cfg(test)]
mod tests;

entity_def! {
    /// An allocation or interior callsite node in the context graph.
    pub entity NodeId(u32, "node");

    /// An edge between a callee node and one of its callers.
    pub entity EdgeId(u32, "edge");
}

/// A node in the callsite context graph.
///
/// Nodes are never deallocated; a node whose context ids have all moved
/// elsewhere is *removed*, which also implies it has no remaining edges.
pub(crate) struct ContextNode<C> {
    /// Whether this node represents an allocation call rather than an
    /// interior callsite.
    pub is_allocation: bool,

    /// Set when this node's stack id repeated within a single context,
    /// which bars it from being bound to a call and from cloning.
    pub recursive: bool,

    /// The corresponding allocation or interior call, if any. Interior
    /// nodes start unbound and are bound during callsite matching; a bound
    /// node can be unbound again if its static callee disagrees with the
    /// profiled one.
    pub call: Option<CallInfo<C>>,

    /// For allocation nodes a unique label; for stack nodes the original
    /// stack id, used to index callsite matching. Not maintained for clones.
    pub orig_stack_or_alloc_id: u64,

    /// Union of the behavior classes of all contexts including this node.
    pub alloc_types: AllocTypes,

    /// Edges towards callees in the profiled call chains.
    pub callee_edges: Vec<EdgeId>,

    /// Edges towards callers in the profiled call chains.
    pub caller_edges: Vec<EdgeId>,

    /// The contexts including this node.
    pub context_ids: ContextIdSet,

    /// Clones of this node. Only populated on the original: a clone of a
    /// clone is recorded against the original as well.
    pub clones: Vec<NodeId>,

    /// If this is a clone, the original node.
    pub clone_of: PackedOption<NodeId>,
}

impl<C> ContextNode<C> {
    fn new(is_allocation: bool, call: Option<CallInfo<C>>) -> Self {
        Self {
            is_allocation,
            recursive: false,
            call,
            orig_stack_or_alloc_id: 0,
            alloc_types: AllocTypes::NONE,
            callee_edges: Vec::new(),
            caller_edges: Vec::new(),
            context_ids: ContextIdSet::new(),
            clones: Vec::new(),
            clone_of: PackedOption::default(),
        }
    }
}

/// An edge in the callsite context graph, shared by its two endpoints: it
/// appears in the callee node's caller list and the caller node's callee
/// list for as long as it is live.
pub(crate) struct ContextEdge {
    pub callee: NodeId,
    pub caller: NodeId,

    /// Union of the behavior classes of all contexts including this edge.
    pub alloc_types: AllocTypes,

    /// The contexts including this edge; always a subset of both endpoints'
    /// context ids.
    pub context_ids: ContextIdSet,

    /// Set once the edge has been unlinked from both endpoints. Edge slots
    /// are not reused, so traversals iterating over snapshots of edge lists
    /// use this to skip edges removed by a nested mutation.
    pub removed: bool,
}

/// The callsite context graph over a backend `B`.
///
/// Owns all nodes and edges as well as the context-id registry. Built with
/// [`CallsiteContextGraph::build`]; the cloning transformation is then
/// driven by [`CallsiteContextGraph::process`].
pub struct CallsiteContextGraph<'a, B: Backend> {
    pub(crate) backend: &'a mut B,
    pub(crate) stats: &'a mut Stats,
    pub(crate) options: Options,

    pub(crate) nodes: PrimaryMap<NodeId, ContextNode<B::Call>>,
    pub(crate) edges: PrimaryMap<EdgeId, ContextEdge>,
    pub(crate) contexts: ContextIdRegistry,

    /// The node created for each stack id when adding MIB contexts. Used to
    /// locate nodes when matching callsites onto them.
    pub(crate) stack_id_to_node: FxHashMap<u64, NodeId>,

    /// Calls to their corresponding nodes, insertion-ordered so that every
    /// traversal seeded from allocations is deterministic.
    pub(crate) alloc_call_to_node: FxIndexMap<CallInfo<B::Call>, NodeId>,
    pub(crate) non_alloc_call_to_node: FxIndexMap<CallInfo<B::Call>, NodeId>,

    /// The function enclosing each bound node.
    pub(crate) node_to_calling_func: FxHashMap<NodeId, B::Func>,

    /// Calls with profile metadata in each function, in profile order.
    pub(crate) func_to_calls_with_metadata: Vec<(B::Func, Vec<CallInfo<B::Call>>)>,
}

impl<'a, B: Backend> CallsiteContextGraph<'a, B> {
    /// Performs cloning on the graph as necessary to uniquely identify the
    /// behavior class of each allocation given its context, then assigns
    /// callsite clones to function clones and delivers all decisions to the
    /// backend.
    ///
    /// Returns `true` if any function cloning was planned.
    pub fn process(&mut self) -> bool {
        if trace_enabled!() {
            trace!("CCG before cloning:\n{}", DisplayGraph(self));
        }
        if self.options.verify_ccg {
            self.verify();
        }

        self.identify_clones();

        if self.options.verify_ccg {
            self.verify();
        }
        if trace_enabled!() {
            trace!("CCG after cloning:\n{}", DisplayGraph(self));
        }

        let changed = self.assign_functions();

        if trace_enabled!() {
            trace!("CCG after assigning function clones:\n{}", DisplayGraph(self));
        }
        changed
    }

    /// True if this node was effectively removed from the graph: all of its
    /// context ids have moved elsewhere, which implies it retains no edges.
    pub(crate) fn is_removed(&self, node: NodeId) -> bool {
        let node = &self.nodes[node];
        debug_assert_eq!(
            node.context_ids.is_empty(),
            node.callee_edges.is_empty() && node.caller_edges.is_empty()
        );
        node.context_ids.is_empty()
    }

    pub(crate) fn has_call(&self, node: NodeId) -> bool {
        self.nodes[node].call.is_some()
    }

    /// The original node of a clone, or the node itself if it is original.
    pub(crate) fn orig_node(&self, node: NodeId) -> NodeId {
        self.nodes[node].clone_of.expand().unwrap_or(node)
    }

    /// Registers `clone` in the clone list of `node`'s original.
    pub(crate) fn add_clone(&mut self, node: NodeId, clone: NodeId) {
        let orig = self.orig_node(node);
        debug_assert!(self.nodes[clone].clone_of.is_none());
        self.nodes[orig].clones.push(clone);
        self.nodes[clone].clone_of = orig.into();
    }

    pub(crate) fn node_for_alloc(&self, call: CallInfo<B::Call>) -> Option<NodeId> {
        self.alloc_call_to_node.get(&call).copied()
    }

    pub(crate) fn node_for_inst(&self, call: CallInfo<B::Call>) -> Option<NodeId> {
        self.node_for_alloc(call)
            .or_else(|| self.non_alloc_call_to_node.get(&call).copied())
    }

    pub(crate) fn node_for_stack_id(&self, stack_id: u64) -> Option<NodeId> {
        self.stack_id_to_node.get(&stack_id).copied()
    }

    /// Creates a node owned by the graph.
    pub(crate) fn add_node(
        &mut self,
        is_allocation: bool,
        call: Option<CallInfo<B::Call>>,
    ) -> NodeId {
        self.nodes.push(ContextNode::new(is_allocation, call))
    }

    /// Creates an edge and links it into both endpoints' edge lists.
    pub(crate) fn add_edge(
        &mut self,
        callee: NodeId,
        caller: NodeId,
        alloc_types: AllocTypes,
        context_ids: ContextIdSet,
    ) -> EdgeId {
        let edge = self.edges.push(ContextEdge {
            callee,
            caller,
            alloc_types,
            context_ids,
            removed: false,
        });
        self.nodes[callee].caller_edges.push(edge);
        self.nodes[caller].callee_edges.push(edge);
        edge
    }

    /// Adds `context_id` to the edge from `callee` to `caller`, creating the
    /// edge if this caller is not linked yet.
    pub(crate) fn add_or_update_caller_edge(
        &mut self,
        callee: NodeId,
        caller: NodeId,
        alloc_type: AllocType,
        context_id: ContextId,
    ) {
        if let Some(edge) = self.find_edge_from_caller(callee, caller) {
            self.edges[edge].alloc_types.insert(alloc_type);
            self.edges[edge].context_ids.insert(context_id);
            return;
        }
        let mut context_ids = ContextIdSet::new();
        context_ids.insert(context_id);
        self.add_edge(callee, caller, AllocTypes::of(alloc_type), context_ids);
    }

    /// The callee edge of `node` leading to `callee`, if any.
    pub(crate) fn find_edge_from_callee(&self, node: NodeId, callee: NodeId) -> Option<EdgeId> {
        self.nodes[node]
            .callee_edges
            .iter()
            .copied()
            .find(|&e| self.edges[e].callee == callee)
    }

    /// The caller edge of `node` leading to `caller`, if any.
    pub(crate) fn find_edge_from_caller(&self, node: NodeId, caller: NodeId) -> Option<EdgeId> {
        self.nodes[node]
            .caller_edges
            .iter()
            .copied()
            .find(|&e| self.edges[e].caller == caller)
    }

    /// Unlinks `edge` from `node`'s callee edge list.
    pub(crate) fn erase_callee_edge(&mut self, node: NodeId, edge: EdgeId) {
        let edges = &mut self.nodes[node].callee_edges;
        let pos = edges.iter().position(|&e| e == edge);
        debug_assert!(pos.is_some());
        if let Some(pos) = pos {
            edges.remove(pos);
        }
    }

    /// Unlinks `edge` from `node`'s caller edge list.
    pub(crate) fn erase_caller_edge(&mut self, node: NodeId, edge: EdgeId) {
        let edges = &mut self.nodes[node].caller_edges;
        let pos = edges.iter().position(|&e| e == edge);
        debug_assert!(pos.is_some());
        if let Some(pos) = pos {
            edges.remove(pos);
        }
    }

    /// Unlinks `edge` from both endpoints and marks it removed.
    pub(crate) fn remove_edge(&mut self, edge: EdgeId) {
        let (callee, caller) = (self.edges[edge].callee, self.edges[edge].caller);
        self.erase_caller_edge(callee, edge);
        self.erase_callee_edge(caller, edge);
        self.edges[edge].removed = true;
    }

    /// Drops any callee edges of `node` that no longer carry any contexts
    /// after a transformation.
    pub(crate) fn remove_none_type_callee_edges(&mut self, node: NodeId) {
        let mut i = 0;
        while i < self.nodes[node].callee_edges.len() {
            let edge = self.nodes[node].callee_edges[i];
            if self.edges[edge].alloc_types.is_none() {
                debug_assert!(self.edges[edge].context_ids.is_empty());
                self.nodes[node].callee_edges.remove(i);
                let callee = self.edges[edge].callee;
                self.erase_caller_edge(callee, edge);
                self.edges[edge].removed = true;
            } else {
                i += 1;
            }
        }
    }

    /// Removes the node information recorded for the given call.
    pub(crate) fn unset_node_for_inst(&mut self, call: CallInfo<B::Call>) {
        self.non_alloc_call_to_node.shift_remove(&call);
        debug_assert!(!self.alloc_call_to_node.contains_key(&call));
    }

    /// Panics if any graph invariant is violated.
    pub(crate) fn verify(&self) {
        if let Err(err) = crate::debug_utils::validate_graph(self) {
            panic!("callsite context graph is invalid: {err:#}");
        }
    }

    /// Panics if any invariant of `node` is violated.
    pub(crate) fn verify_node(&self, node: NodeId, check_edges: bool) {
        if let Err(err) = validate_node(self, node, check_edges) {
            panic!("context node {node} is invalid: {err:#}");
        }
    }
}
