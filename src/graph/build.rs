//! Initial graph construction from profiled allocation records.
//!
//! Each MIB of each allocation becomes a fresh context id and a chain of
//! stack nodes anchored at the allocation node. Stack nodes are shared
//! between contexts by stack id; a stack id repeating within a single
//! context marks the node recursive, which bars it from matching and
//! cloning later.

use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::backend::{Backend, CallInfo, FunctionProfile, Mib};
use crate::context::ContextIdRegistry;
use crate::entity::PrimaryMap;
use crate::graph::{CallsiteContextGraph, NodeId};
use crate::{FxHashMap, FxIndexMap, Options, Stats};

impl<'a, B: Backend> CallsiteContextGraph<'a, B> {
    /// Builds the graph for the given per-function profile records.
    ///
    /// This adds an allocation node and MIB stack chains for every profiled
    /// allocation, matches the callsites carrying stack metadata onto the
    /// graph (reflecting any inlining performed on them), and neutralizes
    /// callsites whose static callee disagrees with the profiled one. The
    /// result is ready for [`Self::process`].
    pub fn build(
        backend: &'a mut B,
        profile: &[FunctionProfile<B::Func, B::Call>],
        options: &Options,
        stats: &'a mut Stats,
    ) -> Self {
        let mut graph = Self {
            backend,
            stats,
            options: *options,
            nodes: PrimaryMap::new(),
            edges: PrimaryMap::new(),
            contexts: ContextIdRegistry::new(),
            stack_id_to_node: FxHashMap::default(),
            alloc_call_to_node: FxIndexMap::default(),
            non_alloc_call_to_node: FxIndexMap::default(),
            node_to_calling_func: FxHashMap::default(),
            func_to_calls_with_metadata: Vec::new(),
        };

        for function in profile {
            graph.add_function_profile(function);
        }

        if trace_enabled!() {
            trace!(
                "CCG before updating call stack chains:\n{}",
                crate::debug_utils::DisplayGraph(&graph)
            );
        }

        graph.update_stack_nodes();
        graph.handle_callsites_with_multiple_targets();
        graph
    }

    fn add_function_profile(&mut self, function: &FunctionProfile<B::Func, B::Call>) {
        let mut calls_with_metadata = Vec::new();
        for alloc in &function.allocs {
            // Allocations can lose all their MIBs to recursion elimination
            // performed while the profile was attached; they need no node.
            if alloc.mibs.is_empty() {
                continue;
            }
            let call = CallInfo::new(alloc.call, 0);
            calls_with_metadata.push(call);
            let alloc_node = self.add_alloc_node(call, function.func);
            for mib in &alloc.mibs {
                self.add_stack_nodes_for_mib(alloc_node, mib, &alloc.inlined_call_stack);
            }
            debug_assert!(!self.nodes[alloc_node].alloc_types.is_none());
            stat!(self.stats, allocs);
        }
        for &call in &function.callsites {
            calls_with_metadata.push(CallInfo::new(call, 0));
        }
        if !calls_with_metadata.is_empty() {
            self.func_to_calls_with_metadata
                .push((function.func, calls_with_metadata));
            stat!(self.stats, functions);
        }
    }

    /// Adds the node for an allocation call.
    fn add_alloc_node(&mut self, call: CallInfo<B::Call>, func: B::Func) -> NodeId {
        debug_assert!(self.node_for_alloc(call).is_none());
        let alloc_node = self.add_node(true, Some(call));
        self.alloc_call_to_node.insert(call, alloc_node);
        self.node_to_calling_func.insert(alloc_node, func);
        // The number of context ids minted so far is a convenient unique
        // label for allocation nodes.
        self.nodes[alloc_node].orig_stack_or_alloc_id = self.contexts.len() as u64;
        alloc_node
    }

    /// Mints a context id for one MIB and threads it through the chain of
    /// stack nodes for the MIB's call stack.
    fn add_stack_nodes_for_mib(
        &mut self,
        alloc_node: NodeId,
        mib: &Mib,
        inlined_call_stack: &[u64],
    ) {
        let context_id = self.contexts.mint(mib.alloc_type);
        stat!(self.stats, context_ids);
        stat!(self.stats, mibs);

        self.nodes[alloc_node].alloc_types.insert(mib.alloc_type);
        self.nodes[alloc_node].context_ids.insert(context_id);

        // Frames inlined into the allocation call itself appear as a shared
        // prefix of the MIB stack; they belong to the allocation node.
        let skip = prefix_len(inlined_call_stack, &mib.call_stack);

        // Track repeats to detect mutual recursion within this context.
        // Direct recursion is collapsed before the profile reaches us.
        let mut seen: SmallVec<[u64; 8]> = SmallVec::new();
        let mut prev_node = alloc_node;
        for &id_or_index in &mib.call_stack[skip..] {
            let stack_id = self.backend.stack_id(id_or_index);
            let stack_node = match self.node_for_stack_id(stack_id) {
                Some(node) => node,
                None => {
                    let node = self.add_node(false, None);
                    self.nodes[node].orig_stack_or_alloc_id = stack_id;
                    self.stack_id_to_node.insert(stack_id, node);
                    stat!(self.stats, stack_nodes);
                    node
                }
            };
            if seen.contains(&stack_id) {
                self.nodes[stack_node].recursive = true;
            } else {
                seen.push(stack_id);
            }
            self.nodes[stack_node].context_ids.insert(context_id);
            self.nodes[stack_node].alloc_types.insert(mib.alloc_type);
            self.add_or_update_caller_edge(prev_node, stack_node, mib.alloc_type, context_id);
            prev_node = stack_node;
        }
    }
}

/// Length of the longest common prefix of two stacks.
fn prefix_len(a: &[u64], b: &[u64]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
