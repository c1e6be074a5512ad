//! Assignment of callsite clones to function clones.
//!
//! Cloning a callsite is only materializable if some copy of its enclosing
//! function contains it. This stage walks each function's profiled calls and
//! greedily assigns every clone of every callsite node to a function clone,
//! creating new function clones through the backend when no existing copy
//! can host the required combination of callsite clones. The assignment is
//! constrained by callers: a caller already committed to calling a
//! particular function clone must find all of its callee callsite clones in
//! that copy, which can force further callsite cloning on the fly.
//!
//! Once every clone has a home, a final walk from the allocation nodes
//! delivers the decisions: the behavior class of every live allocation clone
//! and the callee function clone of every assigned callsite.

use alloc::collections::VecDeque;

use crate::backend::{Backend, CallInfo, CallMap, FuncInfo};
use crate::graph::{CallsiteContextGraph, NodeId};
use crate::{FxHashMap, FxHashSet, FxIndexMap};

impl<'a, B: Backend> CallsiteContextGraph<'a, B> {
    /// Assigns callsite clones to function clones, cloning functions as
    /// needed to accommodate the combinations of callsite clones reached by
    /// their callers, then updates all calls through the backend.
    ///
    /// Returns `true` if any function clone was created.
    pub(crate) fn assign_functions(&mut self) -> bool {
        let mut changed = false;

        // The function clone each callsite node has been assigned to call.
        let mut callee_func_clone: FxHashMap<NodeId, FuncInfo<B::Func>> = FxHashMap::default();

        for func_idx in 0..self.func_to_calls_with_metadata.len() {
            let orig_func = FuncInfo::new(self.func_to_calls_with_metadata[func_idx].0, 0);
            let calls_with_metadata = self.func_to_calls_with_metadata[func_idx].1.clone();

            // Map from each clone of this function to the remapping of every
            // tracked call into that clone. Insertion order is clone-number
            // order, which the first-free-clone search below relies on.
            let mut func_clones: FxIndexMap<FuncInfo<B::Func>, CallMap<B::Call>> =
                FxIndexMap::default();

            for &call in &calls_with_metadata {
                // Skip calls with no node (all uses of their stack ids were
                // inlined away or pruned) and callsites with no clones.
                let Some(node) = self.node_for_inst(call) else {
                    continue;
                };
                if self.nodes[node].clones.is_empty() {
                    continue;
                }
                debug_assert!(self.has_call(node));

                // Which clone of this callsite each function clone hosts.
                let mut func_clone_to_node_clone: FxHashMap<FuncInfo<B::Func>, NodeId> =
                    FxHashMap::default();

                // All clones of this callsite that need homes. Cloning during
                // the loop appends here. The original is skipped if all of
                // its contexts moved to clones.
                let mut worklist: VecDeque<NodeId> = VecDeque::new();
                if !self.nodes[node].context_ids.is_empty() {
                    worklist.push_back(node);
                }
                worklist.extend(self.nodes[node].clones.iter().copied());

                let mut node_clone_count = 0usize;
                while let Some(clone) = worklist.pop_front() {
                    node_clone_count += 1;
                    if self.options.verify_nodes {
                        self.verify_node(clone, true);
                    }

                    // More callsite clones than function clones: the earlier
                    // function clones are all taken, so grow the set.
                    if func_clones.len() < node_clone_count {
                        if node_clone_count == 1 {
                            // The first callsite copy lives in the original
                            // function, whose callers can't have committed
                            // to any clone yet.
                            debug_assert!(self.nodes[clone].caller_edges.iter().all(
                                |&e| !callee_func_clone.contains_key(&self.edges[e].caller)
                            ));
                            func_clones.insert(orig_func, CallMap::default());
                            self.assign_node_clone_to_func_clone(
                                orig_func,
                                call,
                                clone,
                                &mut func_clone_to_node_clone,
                                &func_clones,
                            );
                            self.record_callers_callee_func(clone, orig_func, &mut callee_func_clone);
                            continue;
                        }

                        // If a caller of this clone already committed to some
                        // function clone, the new copy must be cloned *from*
                        // that one: those callers move over, taking their
                        // other committed callees along.
                        let mut previously_assigned = None;
                        for &e in &self.nodes[clone].caller_edges {
                            if let Some(func_clone) =
                                callee_func_clone.get(&self.edges[e].caller)
                            {
                                previously_assigned = Some(*func_clone);
                                break;
                            }
                        }

                        let mut new_call_map = CallMap::default();
                        let clone_no = func_clones.len() as u32;
                        debug_assert!(clone_no > 0);
                        let new_func_clone = self.backend.clone_function_for_callsite(
                            orig_func,
                            call,
                            &mut new_call_map,
                            &calls_with_metadata,
                            clone_no,
                        );
                        func_clones.insert(new_func_clone, new_call_map);
                        stat!(self.stats, function_clones);
                        changed = true;
                        trace!("Created function clone {new_func_clone} for {clone}");

                        let Some(previously_assigned) = previously_assigned else {
                            // No caller is committed anywhere; simply put
                            // this callsite clone in the new function clone
                            // and point all callers at it.
                            self.assign_node_clone_to_func_clone(
                                new_func_clone,
                                call,
                                clone,
                                &mut func_clone_to_node_clone,
                                &func_clones,
                            );
                            self.record_callers_callee_func(
                                clone,
                                new_func_clone,
                                &mut callee_func_clone,
                            );
                            continue;
                        };

                        // Move the callers committed to the source copy over
                        // to the new clone, cloning each *other* callee
                        // callsite they reach in it so the new copy is
                        // consistent. The handling below then records the
                        // function for this callsite clone itself, which
                        // also covers callers committed to other clones.
                        let caller_edges = self.nodes[clone].caller_edges.clone();
                        for ce in caller_edges {
                            if self.edges[ce].removed {
                                continue;
                            }
                            let caller = self.edges[ce].caller;
                            if !self.has_call(caller) {
                                continue;
                            }
                            if callee_func_clone.get(&caller) != Some(&previously_assigned) {
                                continue;
                            }
                            callee_func_clone.insert(caller, new_func_clone);

                            let callee_edges = self.nodes[caller].callee_edges.clone();
                            for callee_edge in callee_edges {
                                if self.edges[callee_edge].removed {
                                    continue;
                                }
                                let callee = self.edges[callee_edge].callee;
                                if callee == clone || !self.has_call(callee) {
                                    continue;
                                }
                                let sibling_clone =
                                    self.move_edge_to_new_callee_clone(callee_edge, None);
                                self.remove_none_type_callee_edges(sibling_clone);
                                // Moving the edge may leave drained callee
                                // edges behind on the original as well.
                                self.remove_none_type_callee_edges(callee);
                                debug_assert!(!self.nodes[sibling_clone].alloc_types.is_none());
                                if let Some(&func_clone) = callee_func_clone.get(&callee) {
                                    callee_func_clone.insert(sibling_clone, func_clone);
                                }
                                // Rebind the new clone to the cloned call in
                                // the new function copy. The call map is
                                // indexed by the original call at clone 0;
                                // callers only reach callsites of their own
                                // function, so it must contain it.
                                let orig = self.orig_node(callee);
                                let Some(orig_call) = self.nodes[orig].call else {
                                    continue;
                                };
                                let orig_call = orig_call.with_clone_no(0);
                                let call_map = &func_clones[&new_func_clone];
                                debug_assert!(call_map.contains_key(&orig_call));
                                if let Some(&cloned_call) = call_map.get(&orig_call) {
                                    self.nodes[sibling_clone].call = Some(cloned_call);
                                }
                            }
                        }
                        // Fall through to record the function clone for this
                        // callsite clone.
                    }

                    // Try to place this callsite clone using its callers'
                    // commitments. Callers committed to function clones that
                    // already host a different clone of this callsite force
                    // yet another callsite clone, processed later.
                    let mut new_clone_for_func: FxHashMap<FuncInfo<B::Func>, NodeId> =
                        FxHashMap::default();
                    let mut assigned_func_clone: Option<FuncInfo<B::Func>> = None;

                    let mut ei = 0;
                    while ei < self.nodes[clone].caller_edges.len() {
                        let edge = self.nodes[clone].caller_edges[ei];
                        let caller = self.edges[edge].caller;
                        if !self.has_call(caller) {
                            ei += 1;
                            continue;
                        }

                        if let Some(&caller_func_clone) = callee_func_clone.get(&caller) {
                            // The caller's function clone is unusable if it
                            // already hosts a different clone of this
                            // callsite, or this clone is already placed in a
                            // different function clone.
                            let unusable = func_clone_to_node_clone
                                .get(&caller_func_clone)
                                .is_some_and(|&hosted| hosted != clone)
                                || assigned_func_clone
                                    .is_some_and(|assigned| assigned != caller_func_clone);
                            if unusable {
                                // Split this caller off onto another
                                // callsite clone; reuse the one already
                                // created for this function clone if the
                                // loop made one.
                                if let Some(&existing) =
                                    new_clone_for_func.get(&caller_func_clone)
                                {
                                    self.move_edge_to_existing_callee_clone(
                                        edge,
                                        existing,
                                        Some(ei),
                                        false,
                                    );
                                    self.remove_none_type_callee_edges(existing);
                                } else {
                                    let new_clone =
                                        self.move_edge_to_new_callee_clone(edge, Some(ei));
                                    self.remove_none_type_callee_edges(new_clone);
                                    new_clone_for_func.insert(caller_func_clone, new_clone);
                                    worklist.push_back(new_clone);
                                    debug_assert!(!self.nodes[new_clone].alloc_types.is_none());
                                }
                                // Moving the caller edge may have drained
                                // some of this clone's callee edges.
                                self.remove_none_type_callee_edges(clone);
                                // The edge at `ei` changed; reconsider it.
                                continue;
                            }

                            if assigned_func_clone.is_none() {
                                assigned_func_clone = Some(caller_func_clone);
                                self.assign_node_clone_to_func_clone(
                                    caller_func_clone,
                                    call,
                                    clone,
                                    &mut func_clone_to_node_clone,
                                    &func_clones,
                                );
                            }
                        } else {
                            // This caller is uncommitted. Place the clone
                            // first if needed: the earlier cloning
                            // guarantees a function clone without a hosted
                            // clone of this callsite exists.
                            if assigned_func_clone.is_none() {
                                let func_clone = func_clones
                                    .keys()
                                    .copied()
                                    .find(|fc| !func_clone_to_node_clone.contains_key(fc))
                                    .expect("no function clone available for callsite clone");
                                assigned_func_clone = Some(func_clone);
                                self.assign_node_clone_to_func_clone(
                                    func_clone,
                                    call,
                                    clone,
                                    &mut func_clone_to_node_clone,
                                    &func_clones,
                                );
                            } else {
                                debug_assert_eq!(
                                    func_clone_to_node_clone
                                        .get(&assigned_func_clone.unwrap()),
                                    Some(&clone)
                                );
                            }
                            callee_func_clone.insert(caller, assigned_func_clone.unwrap());
                        }

                        ei += 1;
                    }
                }

                if self.options.verify_ccg {
                    self.verify_node(node, true);
                    self.verify_neighbors(node);
                    for i in 0..self.nodes[node].clones.len() {
                        let clone = self.nodes[node].clones[i];
                        self.verify_node(clone, true);
                        self.verify_neighbors(clone);
                    }
                }
            }
        }

        // Deliver the decisions recorded above, walking from each allocation
        // towards callers so every live clone is visited once.
        let mut visited = FxHashSet::default();
        for i in 0..self.alloc_call_to_node.len() {
            let node = *self.alloc_call_to_node.get_index(i).unwrap().1;
            self.update_calls(node, &mut visited, &callee_func_clone);
        }

        changed
    }

    /// Records that `node_clone` lives in `func_clone` and rebinds its call
    /// to that function clone's copy of it.
    fn assign_node_clone_to_func_clone(
        &mut self,
        func_clone: FuncInfo<B::Func>,
        call: CallInfo<B::Call>,
        node_clone: NodeId,
        func_clone_to_node_clone: &mut FxHashMap<FuncInfo<B::Func>, NodeId>,
        func_clones: &FxIndexMap<FuncInfo<B::Func>, CallMap<B::Call>>,
    ) {
        func_clone_to_node_clone.insert(func_clone, node_clone);
        let call_map = &func_clones[&func_clone];
        // The original function's call map is empty: the call is already the
        // right one.
        let call_clone = call_map.get(&call).copied().unwrap_or(call);
        self.nodes[node_clone].call = Some(call_clone);
        trace!("Assigning {node_clone} to function clone {func_clone}");
    }

    /// Points every bound caller of `clone` at `func_clone`.
    fn record_callers_callee_func(
        &mut self,
        clone: NodeId,
        func_clone: FuncInfo<B::Func>,
        callee_func_clone: &mut FxHashMap<NodeId, FuncInfo<B::Func>>,
    ) {
        for i in 0..self.nodes[clone].caller_edges.len() {
            let caller = self.edges[self.nodes[clone].caller_edges[i]].caller;
            if !self.has_call(caller) {
                continue;
            }
            callee_func_clone.insert(caller, func_clone);
        }
    }

    fn verify_neighbors(&self, node: NodeId) {
        for &edge in &self.nodes[node].callee_edges {
            self.verify_node(self.edges[edge].callee, true);
        }
        for &edge in &self.nodes[node].caller_edges {
            self.verify_node(self.edges[edge].caller, true);
        }
    }

    /// Delivers the final decisions for `node`, its clones, and its callers.
    fn update_calls(
        &mut self,
        node: NodeId,
        visited: &mut FxHashSet<NodeId>,
        callee_func_clone: &FxHashMap<NodeId, FuncInfo<B::Func>>,
    ) {
        if !visited.insert(node) {
            return;
        }

        let clones = self.nodes[node].clones.clone();
        for clone in clones {
            self.update_calls(clone, visited, callee_func_clone);
        }
        let caller_edges = self.nodes[node].caller_edges.clone();
        for edge in caller_edges {
            if self.edges[edge].removed {
                continue;
            }
            let caller = self.edges[edge].caller;
            self.update_calls(caller, visited, callee_func_clone);
        }

        // Nothing to update without a call, or if all contexts moved onto
        // other clones.
        if self.nodes[node].context_ids.is_empty() {
            return;
        }
        let Some(call) = self.nodes[node].call else {
            return;
        };

        if self.nodes[node].is_allocation {
            let alloc_type = self.nodes[node].alloc_types.type_to_use();
            match alloc_type {
                crate::context::AllocType::Cold => stat!(self.stats, allocs_cold),
                crate::context::AllocType::NotCold => stat!(self.stats, allocs_not_cold),
            }
            trace!("Allocation {node} gets type {alloc_type}");
            self.backend.update_allocation_call(call, alloc_type);
            return;
        }

        let Some(&callee_func) = callee_func_clone.get(&node) else {
            return;
        };
        trace!("Callsite {node} calls function clone {callee_func}");
        self.backend.update_call(call, callee_func);
        stat!(self.stats, calls_updated);
    }
}
