//! Cloning of nodes to uniquify allocation behavior per context.
//!
//! Starting from each allocation node, nodes are visited towards callers in
//! post order. A node whose contexts mix behavior classes, and which has
//! more than one caller, is split: caller edges whose contexts would change
//! the picture move onto a clone of the node (together with the matching
//! portion of each callee edge), until the remaining edges all agree.
//!
//! Caller edges are processed cold-first so that the original node ends up
//! retaining the not-cold callers; any caller unknown to the profile (an
//! indirect call, say) then reaches the original and gets the default
//! behavior.

use alloc::vec::Vec;

use crate::backend::Backend;
use crate::context::AllocTypes;
use crate::graph::{CallsiteContextGraph, EdgeId, NodeId};
use crate::FxHashSet;

/// Relative order in which caller edges are peeled off onto clones. Cold
/// edges go first and not-cold edges last so the original node keeps them.
/// No live edge has an empty mask by the time this runs.
fn clone_priority(types: AllocTypes) -> u32 {
    debug_assert!(!types.is_none());
    if types == AllocTypes::COLD {
        0
    } else if types == AllocTypes::BOTH {
        1
    } else {
        2
    }
}

impl<'a, B: Backend> CallsiteContextGraph<'a, B> {
    /// Performs cloning on the graph so that each allocation's behavior
    /// class is unambiguous given its calling context, wherever the profile
    /// allows it.
    pub(crate) fn identify_clones(&mut self) {
        let mut visited = FxHashSet::default();
        for i in 0..self.alloc_call_to_node.len() {
            let node = *self.alloc_call_to_node.get_index(i).unwrap().1;
            self.identify_clones_for(node, &mut visited);
        }
    }

    fn identify_clones_for(&mut self, node: NodeId, visited: &mut FxHashSet<NodeId>) {
        if self.options.verify_nodes {
            self.verify_node(node, true);
        }
        debug_assert!(self.nodes[node].clone_of.is_none());

        // An unbound node either wasn't found in the program, or matching
        // ruled it out (recursion, multiple callee targets). There is
        // nothing to clone here, and nothing to gain from cloning its
        // callers either.
        if !self.has_call(node) {
            return;
        }

        let newly_visited = visited.insert(node);
        debug_assert!(newly_visited);

        // The recursive calls can remove edges from the caller list (and
        // add edges to clones, which must not be visited); iterate over a
        // snapshot and skip whatever has been unlinked since.
        let caller_edges = self.nodes[node].caller_edges.clone();
        for edge in caller_edges {
            if self.edges[edge].removed {
                continue;
            }
            let caller = self.edges[edge].caller;
            if !visited.contains(&caller) && self.nodes[caller].clone_of.is_none() {
                self.identify_clones_for(caller, visited);
            }
        }

        // Done if the behavior here is already unambiguous, or if there is
        // no second caller to disambiguate against.
        if self.nodes[node].alloc_types.has_single_type()
            || self.nodes[node].caller_edges.len() <= 1
        {
            return;
        }

        // Peel cold callers off first; the remaining (not-cold) tail stays
        // on the original node. Ties are broken by the smallest context id
        // on the edge to keep the outcome independent of edge order.
        let mut caller_edges = core::mem::take(&mut self.nodes[node].caller_edges);
        caller_edges.sort_by_key(|&edge| {
            let edge = &self.edges[edge];
            debug_assert!(!edge.alloc_types.is_none());
            let tie_break = edge
                .context_ids
                .min_id()
                .map_or(u32::MAX, |id| id.index() as u32);
            (clone_priority(edge.alloc_types), tie_break)
        });
        self.nodes[node].caller_edges = caller_edges;

        debug_assert!(!self.nodes[node].alloc_types.is_none());

        // Iterate until cloning can no longer disambiguate anything. Edges
        // are removed from the caller list as they move to clones, so the
        // index only advances past edges that stay.
        let mut ei = 0;
        while ei < self.nodes[node].caller_edges.len() {
            // Moving the previous edge may have left a single type or a
            // single caller behind.
            if self.nodes[node].alloc_types.has_single_type()
                || self.nodes[node].caller_edges.len() <= 1
            {
                break;
            }
            let caller_edge = self.nodes[node].caller_edges[ei];

            // The behavior each callee edge would have if this caller's
            // contexts moved away with it.
            let callee_types_for_caller: Vec<AllocTypes> = self.nodes[node]
                .callee_edges
                .iter()
                .map(|&callee_edge| {
                    self.contexts.intersect_alloc_types(
                        &self.edges[callee_edge].context_ids,
                        &self.edges[caller_edge].context_ids,
                    )
                })
                .collect();

            // Cloning is pointless if this caller already sees the node's
            // effective behavior and would not split any callee edge.
            debug_assert!(!self.edges[caller_edge].alloc_types.is_none());
            if self.edges[caller_edge].alloc_types.type_to_use()
                == self.nodes[node].alloc_types.type_to_use()
                && self.callee_types_match(&callee_types_for_caller, node)
            {
                ei += 1;
                continue;
            }

            // Reuse an existing clone whose behavior and callee-edge
            // behavior both match; otherwise mint a new one.
            let mut target = None;
            for clone_idx in 0..self.nodes[node].clones.len() {
                let clone = self.nodes[node].clones[clone_idx];
                if self.nodes[clone].alloc_types.type_to_use()
                    != self.edges[caller_edge].alloc_types.type_to_use()
                {
                    continue;
                }
                if !self.callee_types_match(&callee_types_for_caller, clone) {
                    continue;
                }
                target = Some(clone);
                break;
            }
            let clone = match target {
                Some(clone) => {
                    self.move_edge_to_existing_callee_clone(caller_edge, clone, Some(ei), false);
                    clone
                }
                None => self.move_edge_to_new_callee_clone(caller_edge, Some(ei)),
            };

            debug_assert!(!self.nodes[clone].alloc_types.is_none());
            debug_assert!(self.nodes[clone]
                .caller_edges
                .iter()
                .all(|&e| !self.edges[e].alloc_types.is_none()));
        }

        // Cloning can leave behind callee edges carrying no contexts, both
        // on the clones and on the original.
        for clone_idx in 0..self.nodes[node].clones.len() {
            let clone = self.nodes[node].clones[clone_idx];
            self.remove_none_type_callee_edges(clone);
            if self.options.verify_nodes {
                self.verify_node(clone, true);
            }
        }
        debug_assert!(!self.nodes[node].context_ids.is_empty());
        self.remove_none_type_callee_edges(node);

        debug_assert!(!self.nodes[node].alloc_types.is_none());
        debug_assert!(self.nodes[node]
            .callee_edges
            .iter()
            .all(|&e| !self.edges[e].alloc_types.is_none()));
        debug_assert!(self.nodes[node]
            .caller_edges
            .iter()
            .all(|&e| !self.edges[e].alloc_types.is_none()));

        if self.options.verify_nodes {
            self.verify_node(node, true);
        }
    }

    /// Whether the per-callee-edge behavior in `in_types` matches the callee
    /// edges of `node`, under the use-policy. An empty mask on either side
    /// matches anything: no contexts flow there for the caller in question,
    /// so that edge cannot be split further.
    fn callee_types_match(&self, in_types: &[AllocTypes], node: NodeId) -> bool {
        let edges = &self.nodes[node].callee_edges;
        debug_assert_eq!(in_types.len(), edges.len());
        in_types.iter().zip(edges).all(|(&in_type, &edge)| {
            let edge_types = self.edges[edge].alloc_types;
            if in_type.is_none() || edge_types.is_none() {
                return true;
            }
            in_type.type_to_use() == edge_types.type_to_use()
        })
    }

    /// Creates a clone of `edge`'s callee and moves `edge` onto it.
    ///
    /// `caller_edge_index` is the position of `edge` in the callee's caller
    /// list when the caller of this function is iterating over that list; the
    /// edge is removed from that position so iteration can resume there.
    pub(crate) fn move_edge_to_new_callee_clone(
        &mut self,
        edge: EdgeId,
        caller_edge_index: Option<usize>,
    ) -> NodeId {
        let node = self.edges[edge].callee;
        let clone = self.add_node(self.nodes[node].is_allocation, self.nodes[node].call);
        self.add_clone(node, clone);
        let func = self.node_to_calling_func[&node];
        self.node_to_calling_func.insert(clone, func);
        stat!(self.stats, callsite_clones);
        trace!("Cloning {node} into {clone}");
        self.move_edge_to_existing_callee_clone(edge, clone, caller_edge_index, true);
        clone
    }

    /// Moves `edge` onto `new_callee`, which must be a clone sibling of its
    /// current callee, migrating the edge's context ids and the matching
    /// portion of each of the old callee's callee edges.
    pub(crate) fn move_edge_to_existing_callee_clone(
        &mut self,
        edge: EdgeId,
        new_callee: NodeId,
        caller_edge_index: Option<usize>,
        new_clone: bool,
    ) {
        debug_assert_eq!(
            self.orig_node(new_callee),
            self.orig_node(self.edges[edge].callee)
        );
        let old_callee = self.edges[edge].callee;
        match caller_edge_index {
            Some(index) => {
                let removed = self.nodes[old_callee].caller_edges.remove(index);
                debug_assert_eq!(removed, edge);
            }
            None => self.erase_caller_edge(old_callee, edge),
        }
        self.edges[edge].callee = new_callee;
        self.nodes[new_callee].caller_edges.push(edge);

        // The edge's own context ids are unchanged; only its endpoints'
        // memberships move.
        let edge_ids = self.edges[edge].context_ids.clone();
        let edge_types = self.edges[edge].alloc_types;
        self.nodes[old_callee].context_ids.subtract(&edge_ids);
        self.nodes[new_callee].context_ids.extend_from(&edge_ids);
        self.nodes[new_callee].alloc_types |= edge_types;
        self.nodes[old_callee].alloc_types =
            self.contexts.alloc_types_of(&self.nodes[old_callee].context_ids);
        debug_assert_eq!(
            self.nodes[old_callee].alloc_types.is_none(),
            self.nodes[old_callee].context_ids.is_empty()
        );

        // Migrate the moved contexts across the old callee's callee edges,
        // onto the corresponding edges from the clone.
        for i in 0..self.nodes[old_callee].callee_edges.len() {
            let old_callee_edge = self.nodes[old_callee].callee_edges[i];
            let ids_to_move = self.edges[old_callee_edge]
                .context_ids
                .intersection(&edge_ids);
            self.edges[old_callee_edge].context_ids.subtract(&ids_to_move);
            self.edges[old_callee_edge].alloc_types = self
                .contexts
                .alloc_types_of(&self.edges[old_callee_edge].context_ids);
            let target = self.edges[old_callee_edge].callee;
            if !new_clone {
                // The clone may already reach this callee; merge into that
                // edge. It may also not: edges drained of contexts are
                // pruned eagerly, so fall through to making a new one.
                if let Some(existing) = self.find_edge_from_callee(new_callee, target) {
                    let moved_types = self.contexts.alloc_types_of(&ids_to_move);
                    self.edges[existing].context_ids.extend_from(&ids_to_move);
                    self.edges[existing].alloc_types |= moved_types;
                    continue;
                }
            }
            // A fresh clone gets a parallel edge for every callee edge of
            // the original, even context-free ones; they keep the callee
            // lists aligned until the caller prunes them.
            let moved_types = self.contexts.alloc_types_of(&ids_to_move);
            self.add_edge(target, new_callee, moved_types, ids_to_move);
        }

        if self.options.verify_ccg {
            self.verify_node(old_callee, false);
            self.verify_node(new_callee, false);
            for i in 0..self.nodes[old_callee].callee_edges.len() {
                let callee = self.edges[self.nodes[old_callee].callee_edges[i]].callee;
                self.verify_node(callee, false);
            }
            for i in 0..self.nodes[new_callee].callee_edges.len() {
                let callee = self.edges[self.nodes[new_callee].callee_edges[i]].callee;
                self.verify_node(callee, false);
            }
        }
    }
}
