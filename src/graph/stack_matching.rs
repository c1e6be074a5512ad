//! Matching real callsites onto the profiled stack chains.
//!
//! The graph built from MIBs has one node per profiled stack id, but an
//! actual post-inlining callsite covers a *sequence* of stack ids (the
//! frames inlined into it, innermost first). This stage binds each callsite
//! to its node when the sequence is a single id, and otherwise synthesizes a
//! fresh interior node covering the sequence, carving the matching context
//! ids out of the original chain.
//!
//! Two callsites can carry identical sequences (cloning or macro expansion
//! upstream); their contexts are indistinguishable in the profile, so the
//! matching contexts are duplicated, giving each callsite its own ids.
//!
//! Finally, callsites whose static callee does not match the function of the
//! profiled callee node are unbound so that later stages never reason about
//! a call the call graph disagrees with.

use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::backend::Backend;
use crate::context::{ContextId, ContextIdSet};
use crate::graph::{CallsiteContextGraph, EdgeId, NodeId};
use crate::{FxHashMap, FxHashSet, FxIndexMap};

/// One callsite recorded against the outermost stack id of its sequence.
struct MatchingCall<B: Backend> {
    call: crate::backend::CallInfo<B::Call>,
    func: B::Func,
    /// Resolved stack ids covered by the call, innermost first, truncated to
    /// the prefix that has context nodes.
    ids: SmallVec<[u64; 8]>,
    /// The context ids this call will take over, filled in by the
    /// disambiguation pass and consumed by the post-order pass.
    saved_context_ids: ContextIdSet,
}

impl<'a, B: Backend> CallsiteContextGraph<'a, B> {
    /// Matches all callsites carrying stack metadata onto the nodes created
    /// for the allocation MIBs, synthesizing new nodes to reflect any
    /// inlining performed on those calls.
    pub(crate) fn update_stack_nodes(&mut self) {
        // Index every callsite under the last (outermost caller) stack id of
        // its sequence that has a context node. Some ids have no node
        // because their contexts were pruned from every MIB.
        let mut calls_by_last_id: FxIndexMap<u64, Vec<MatchingCall<B>>> = FxIndexMap::default();
        for func_idx in 0..self.func_to_calls_with_metadata.len() {
            for call_idx in 0..self.func_to_calls_with_metadata[func_idx].1.len() {
                let (func, call) = {
                    let entry = &self.func_to_calls_with_metadata[func_idx];
                    (entry.0, entry.1[call_idx])
                };
                // Allocations are already bound to their nodes.
                if self.alloc_call_to_node.contains_key(&call) {
                    continue;
                }
                let ids = self.stack_ids_with_context_nodes(call.call());
                if ids.is_empty() {
                    continue;
                }
                let last = *ids.last().unwrap();
                calls_by_last_id.entry(last).or_default().push(MatchingCall {
                    call,
                    func,
                    ids,
                    saved_context_ids: ContextIdSet::new(),
                });
            }
        }

        // Compute the context ids belonging to each call, and duplicate ids
        // where multiple calls share one stack-id sequence.
        let mut old_to_new: FxHashMap<ContextId, ContextIdSet> = FxHashMap::default();
        for (&last_id, calls) in calls_by_last_id.iter_mut() {
            // A single call covering a single id binds directly to the
            // existing node in the post-order pass below.
            if calls.len() == 1 && calls[0].ids.len() == 1 {
                continue;
            }

            // Sort by descending sequence length so the longest (most
            // precisely known) inlined sequences claim their contexts
            // first, then lexicographically so identical sequences are
            // adjacent and handled by duplication.
            calls.sort_by(|a, b| {
                b.ids
                    .len()
                    .cmp(&a.ids.len())
                    .then_with(|| a.ids.cmp(&b.ids))
            });

            let last_node = self.stack_id_to_node[&last_id];
            if self.nodes[last_node].recursive {
                continue;
            }

            // Context ids not yet claimed by an earlier (longer) call.
            let mut remaining_ids = self.nodes[last_node].context_ids.clone();
            debug_assert!(!remaining_ids.is_empty());

            for i in 0..calls.len() {
                debug_assert!(calls[i].saved_context_ids.is_empty());
                debug_assert_eq!(last_id, *calls[i].ids.last().unwrap());

                // The contexts covered by this sequence are the intersection
                // of the edge contexts along it, walked from the outermost
                // node towards the innermost.
                let mut sequence_ids = remaining_ids.clone();
                let mut prev_node = last_node;
                let mut skip = false;
                for &id in calls[i].ids.iter().rev().skip(1) {
                    let cur_node = self.stack_id_to_node[&id];
                    if self.nodes[cur_node].recursive {
                        skip = true;
                        break;
                    }
                    // A missing edge means these ids were never profiled in
                    // sequence for any allocation, even though each has
                    // contexts of its own.
                    let Some(edge) = self.find_edge_from_caller(cur_node, prev_node) else {
                        skip = true;
                        break;
                    };
                    prev_node = cur_node;
                    sequence_ids.intersect_with(&self.edges[edge].context_ids);
                    if sequence_ids.is_empty() {
                        skip = true;
                        break;
                    }
                }
                if skip {
                    continue;
                }

                // If the call's sequence was truncated (its outer ids had no
                // nodes), contexts extending above the kept prefix belong to
                // longer, unrelated chains; keep only contexts terminating
                // at the last kept node.
                if *calls[i].ids.last().unwrap() != self.backend.last_stack_id(calls[i].call.call())
                {
                    for ei in 0..self.nodes[last_node].caller_edges.len() {
                        let edge = self.nodes[last_node].caller_edges[ei];
                        sequence_ids.subtract(&self.edges[edge].context_ids);
                        if sequence_ids.is_empty() {
                            break;
                        }
                    }
                    if sequence_ids.is_empty() {
                        continue;
                    }
                }

                // Calls with identical sequences cannot be told apart in the
                // profile; mint duplicates so each call gets its own ids.
                // The sort above guarantees duplicates are adjacent.
                let duplicate = i + 1 < calls.len() && calls[i].ids == calls[i + 1].ids;
                if duplicate {
                    calls[i].saved_context_ids =
                        self.contexts.duplicate(&sequence_ids, &mut old_to_new);
                    stat!(
                        self.stats,
                        duplicated_context_ids,
                        calls[i].saved_context_ids.len()
                    );
                } else {
                    remaining_ids.subtract(&sequence_ids);
                    calls[i].saved_context_ids = sequence_ids;
                    if remaining_ids.is_empty() {
                        break;
                    }
                }
            }
        }

        self.propagate_duplicate_context_ids(&old_to_new);

        if self.options.verify_ccg {
            self.verify();
        }

        // Post-order traversal from the allocation nodes towards callers,
        // updating the graph to contain new nodes for any inlined interior
        // callsites, moving the associated context ids over to them.
        let mut visited = FxHashSet::default();
        for i in 0..self.alloc_call_to_node.len() {
            let node = *self.alloc_call_to_node.get_index(i).unwrap().1;
            self.assign_stack_nodes_post_order(node, &mut visited, &mut calls_by_last_id);
        }
    }

    /// The resolved stack ids of `call`, truncated at the first id without a
    /// context node. An empty result means no part of the call's context
    /// survived profile pruning.
    fn stack_ids_with_context_nodes(&self, call: B::Call) -> SmallVec<[u64; 8]> {
        let mut ids = SmallVec::new();
        for raw in self.backend.callsite_stack_ids(call) {
            let stack_id = self.backend.stack_id(raw);
            if self.node_for_stack_id(stack_id).is_none() {
                break;
            }
            ids.push(stack_id);
        }
        ids
    }

    /// Adds every duplicated context id alongside its original throughout
    /// the graph, walking caller edges up from each allocation node.
    fn propagate_duplicate_context_ids(
        &mut self,
        old_to_new: &FxHashMap<ContextId, ContextIdSet>,
    ) {
        if old_to_new.is_empty() {
            return;
        }
        let mut visited = FxHashSet::default();
        for i in 0..self.alloc_call_to_node.len() {
            let node = *self.alloc_call_to_node.get_index(i).unwrap().1;
            // Update the allocation node itself first, which keeps the
            // caller-edge walk free of special cases.
            let new_ids = duplicated_ids(&self.nodes[node].context_ids, old_to_new);
            self.nodes[node].context_ids.extend_from(&new_ids);
            self.propagate_duplicates_to_callers(node, &mut visited, old_to_new);
        }
    }

    fn propagate_duplicates_to_callers(
        &mut self,
        node: NodeId,
        visited: &mut FxHashSet<EdgeId>,
        old_to_new: &FxHashMap<ContextId, ContextIdSet>,
    ) {
        let caller_edges = self.nodes[node].caller_edges.clone();
        for edge in caller_edges {
            if !visited.insert(edge) {
                continue;
            }
            let new_ids = duplicated_ids(&self.edges[edge].context_ids, old_to_new);
            // Only recurse via this edge if it carried any of the originals.
            if new_ids.is_empty() {
                continue;
            }
            let caller = self.edges[edge].caller;
            self.edges[edge].context_ids.extend_from(&new_ids);
            self.nodes[caller].context_ids.extend_from(&new_ids);
            self.propagate_duplicates_to_callers(caller, visited, old_to_new);
        }
    }

    /// Binds calls to nodes at or inlined into the location with the node's
    /// stack id, after post-order traversing and processing its callers.
    fn assign_stack_nodes_post_order(
        &mut self,
        node: NodeId,
        visited: &mut FxHashSet<NodeId>,
        calls_by_last_id: &mut FxIndexMap<u64, Vec<MatchingCall<B>>>,
    ) {
        if !visited.insert(node) {
            return;
        }
        // Iterate over a copy: the recursion may add callers (which were
        // already processed on creation) and remove edges.
        let caller_edges = self.nodes[node].caller_edges.clone();
        for edge in caller_edges {
            if self.edges[edge].removed {
                continue;
            }
            let caller = self.edges[edge].caller;
            self.assign_stack_nodes_post_order(caller, visited, calls_by_last_id);
        }

        if self.nodes[node].is_allocation {
            return;
        }
        let Some(calls) = calls_by_last_id.get_mut(&self.nodes[node].orig_stack_or_alloc_id)
        else {
            return;
        };

        // The simple case: a single call covering a single stack id binds
        // directly to this node, unless the node is recursive.
        if calls.len() == 1 && calls[0].ids.len() == 1 {
            debug_assert!(calls[0].saved_context_ids.is_empty());
            debug_assert_eq!(Some(node), self.node_for_stack_id(calls[0].ids[0]));
            if self.nodes[node].recursive {
                return;
            }
            let (call, func) = (calls[0].call, calls[0].func);
            self.nodes[node].call = Some(call);
            self.non_alloc_call_to_node.insert(call, node);
            self.node_to_calling_func.insert(node, func);
            stat!(self.stats, matched_callsites);
            return;
        }

        let last_node = node;
        for i in 0..calls.len() {
            // Calls that were assigned no ids get no node in the graph.
            if calls[i].saved_context_ids.is_empty() {
                continue;
            }
            let ids = calls[i].ids.clone();
            debug_assert_eq!(self.nodes[node].orig_stack_or_alloc_id, *ids.last().unwrap());

            let first_node = self.stack_id_to_node[&ids[0]];

            // Recompute the ids for this sequence: saved ids may overlap
            // between buckets and some may have already been claimed while
            // post-order processing other last nodes.
            let mut saved = core::mem::take(&mut calls[i].saved_context_ids);
            saved.intersect_with(&self.nodes[first_node].context_ids);
            let mut prev_node: Option<NodeId> = None;
            for &id in &ids {
                let cur_node = self.stack_id_to_node[&id];
                debug_assert!(!self.nodes[cur_node].recursive);
                if let Some(prev) = prev_node {
                    let Some(edge) = self.find_edge_from_callee(cur_node, prev) else {
                        saved = ContextIdSet::new();
                        break;
                    };
                    saved.intersect_with(&self.edges[edge].context_ids);
                    if saved.is_empty() {
                        break;
                    }
                }
                prev_node = Some(cur_node);
            }
            if saved.is_empty() {
                continue;
            }

            // Synthesize the interior node covering the inlined sequence.
            let (call, func) = (calls[i].call, calls[i].func);
            let alloc_types = self.contexts.alloc_types_of(&saved);
            let new_node = self.add_node(false, Some(call));
            self.node_to_calling_func.insert(new_node, func);
            self.non_alloc_call_to_node.insert(call, new_node);
            self.nodes[new_node].context_ids = saved;
            self.nodes[new_node].alloc_types = alloc_types;
            stat!(self.stats, synthesized_nodes);
            stat!(self.stats, matched_callsites);

            // Steal the matching context ids from the innermost node's
            // callee edges and the outermost node's caller edges.
            self.connect_new_node(new_node, first_node, true);
            self.connect_new_node(new_node, last_node, false);

            // The moved ids no longer flow through the interior of the
            // original chain.
            let moved = self.nodes[new_node].context_ids.clone();
            let mut prev_node: Option<NodeId> = None;
            for &id in &ids {
                let cur_node = self.stack_id_to_node[&id];
                self.nodes[cur_node].context_ids.subtract(&moved);
                self.nodes[cur_node].alloc_types =
                    self.contexts.alloc_types_of(&self.nodes[cur_node].context_ids);
                if let Some(prev) = prev_node {
                    if let Some(edge) = self.find_edge_from_callee(cur_node, prev) {
                        self.edges[edge].context_ids.subtract(&moved);
                        if self.edges[edge].context_ids.is_empty() {
                            self.remove_edge(edge);
                        } else {
                            self.edges[edge].alloc_types =
                                self.contexts.alloc_types_of(&self.edges[edge].context_ids);
                        }
                    }
                }
                prev_node = Some(cur_node);
            }
        }
    }

    /// Connects `new_node` to `orig_node`'s callees (`towards_callee`) or
    /// callers, moving over the context ids of `new_node` found on
    /// `orig_node`'s edges and pruning any edge drained by the move.
    fn connect_new_node(&mut self, new_node: NodeId, orig_node: NodeId, towards_callee: bool) {
        let mut remaining_ids = self.nodes[new_node].context_ids.clone();
        let mut i = 0;
        loop {
            let edges = if towards_callee {
                &self.nodes[orig_node].callee_edges
            } else {
                &self.nodes[orig_node].caller_edges
            };
            if i >= edges.len() {
                break;
            }
            let edge = edges[i];
            let (moved_ids, missing_ids) = self.edges[edge].context_ids.split_off(&remaining_ids);
            remaining_ids = missing_ids;
            if moved_ids.is_empty() {
                i += 1;
                continue;
            }
            let alloc_types = self.contexts.alloc_types_of(&moved_ids);
            if towards_callee {
                let callee = self.edges[edge].callee;
                self.add_edge(callee, new_node, alloc_types, moved_ids);
            } else {
                let caller = self.edges[edge].caller;
                self.add_edge(new_node, caller, alloc_types, moved_ids);
            }
            if self.edges[edge].context_ids.is_empty() {
                self.remove_edge(edge);
                continue;
            }
            self.edges[edge].alloc_types =
                self.contexts.alloc_types_of(&self.edges[edge].context_ids);
            i += 1;
        }
    }

    /// Unbinds callsites whose static callee disagrees with the function of
    /// any profiled callee node. This happens for indirect calls and in rare
    /// cases like macro expansion; such callsites are excluded from cloning
    /// rather than risking the call graph and profile diverging.
    pub(crate) fn handle_callsites_with_multiple_targets(&mut self) {
        let mut to_unbind = Vec::new();
        for (&call, &node) in &self.non_alloc_call_to_node {
            debug_assert!(self.nodes[node].clones.is_empty());
            for &edge in &self.nodes[node].callee_edges {
                let callee = self.edges[edge].callee;
                if !self.has_call(callee) {
                    continue;
                }
                let func = self.node_to_calling_func[&callee];
                if self.backend.callee_matches_func(call.call(), func) {
                    continue;
                }
                to_unbind.push((call, node));
                break;
            }
        }
        for (call, node) in to_unbind {
            self.unset_node_for_inst(call);
            self.nodes[node].call = None;
            stat!(self.stats, multi_target_callsites);
        }
    }
}

/// The fresh ids minted for any of `ids` during duplication.
fn duplicated_ids(
    ids: &ContextIdSet,
    old_to_new: &FxHashMap<ContextId, ContextIdSet>,
) -> ContextIdSet {
    let mut new_ids = ContextIdSet::new();
    for id in ids.iter() {
        if let Some(duplicates) = old_to_new.get(&id) {
            new_ids.extend_from(duplicates);
        }
    }
    new_ids
}
