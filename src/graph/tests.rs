use alloc::vec;
use alloc::vec::Vec;

use crate::backend::{AllocationRecord, Backend, CallInfo, FunctionProfile, Mib};
use crate::context::{AllocType, AllocTypes, ContextId};
use crate::debug_utils::{validate_graph, GenericBackend, GenericCall, GenericFunc};
use crate::graph::{CallsiteContextGraph, NodeId};
use crate::{ContextDisambiguation, Options, Stats};

fn options() -> Options {
    Options {
        verify_ccg: true,
        verify_nodes: true,
    }
}

fn mib(call_stack: &[u64], alloc_type: AllocType) -> Mib {
    Mib {
        call_stack: call_stack.into(),
        alloc_type,
    }
}

fn alloc_record(call: GenericCall, mibs: Vec<Mib>) -> AllocationRecord<GenericCall> {
    AllocationRecord {
        call,
        inlined_call_stack: vec![],
        mibs,
    }
}

fn func_profile(
    func: GenericFunc,
    allocs: Vec<AllocationRecord<GenericCall>>,
    callsites: Vec<GenericCall>,
) -> FunctionProfile<GenericFunc, GenericCall> {
    FunctionProfile {
        func,
        allocs,
        callsites,
    }
}

fn ids(raw: &[usize]) -> Vec<ContextId> {
    raw.iter().map(|&id| ContextId::new(id)).collect()
}

fn clone_names(backend: &GenericBackend) -> Vec<&str> {
    backend.clone_names().iter().map(|s| s.as_str()).collect()
}

/// Structural summary of every node, for idempotence comparisons.
fn snapshot<B: Backend>(
    graph: &CallsiteContextGraph<'_, B>,
) -> Vec<(bool, Vec<ContextId>, AllocTypes, usize, usize)> {
    graph
        .nodes
        .keys()
        .map(|node| {
            let data = &graph.nodes[node];
            (
                data.is_allocation,
                data.context_ids.sorted(),
                data.alloc_types,
                data.callee_edges.len(),
                data.caller_edges.len(),
            )
        })
        .collect()
}

fn context_ids_of<B: Backend>(graph: &CallsiteContextGraph<'_, B>, node: NodeId) -> Vec<ContextId> {
    graph.nodes[node].context_ids.sorted()
}

#[test]
fn empty_profile_builds_empty_graph() {
    let mut backend = GenericBackend::new();
    let mut stats = Stats::default();
    let opts = options();
    let mut graph = CallsiteContextGraph::build(&mut backend, &[], &opts, &mut stats);
    assert_eq!(graph.nodes.len(), 0);
    assert_eq!(graph.edges.len(), 0);
    validate_graph(&graph).unwrap();
    assert!(!graph.process());
}

#[test]
fn trivial_cold_alloc() {
    let mut backend = GenericBackend::new();
    let f = backend.add_func("f");
    let a = backend.add_allocation(f, &[]);
    let profile = vec![func_profile(
        f,
        vec![alloc_record(a, vec![mib(&[100], AllocType::Cold)])],
        vec![],
    )];

    let mut stats = Stats::default();
    let opts = options();
    {
        let graph = CallsiteContextGraph::build(&mut backend, &profile, &opts, &mut stats);
        // One allocation node and one stack node, one edge, one context.
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        let alloc_node = graph.node_for_alloc(CallInfo::new(a, 0)).unwrap();
        assert_eq!(context_ids_of(&graph, alloc_node), ids(&[1]));
        assert_eq!(graph.nodes[alloc_node].alloc_types, AllocTypes::COLD);
        let stack_node = graph.node_for_stack_id(100).unwrap();
        assert_eq!(context_ids_of(&graph, stack_node), ids(&[1]));
        validate_graph(&graph).unwrap();
    }

    let mut analysis = ContextDisambiguation::new();
    let changed = analysis.process_profile(&mut backend, &profile, &opts);
    assert!(!changed);
    assert_eq!(backend.alloc_versions(a), &[Some(AllocType::Cold)]);
    assert!(backend.clone_names().is_empty());
    assert_eq!(analysis.stats().function_clones, 0);
    assert_eq!(analysis.stats().allocs_cold, 1);
}

/// An allocation whose two contexts have equal stacks but different classes
/// collapses to one chain that no amount of cloning can split.
#[test]
fn ambiguous_contexts_collapse_to_not_cold() {
    let mut backend = GenericBackend::new();
    let f = backend.add_func("f");
    let a = backend.add_allocation(f, &[]);
    let profile = vec![func_profile(
        f,
        vec![alloc_record(
            a,
            vec![
                mib(&[70, 71], AllocType::Cold),
                mib(&[70, 71], AllocType::NotCold),
            ],
        )],
        vec![],
    )];

    let mut analysis = ContextDisambiguation::new();
    let changed = analysis.process_profile(&mut backend, &profile, &options());
    assert!(!changed);
    assert_eq!(backend.alloc_versions(a), &[Some(AllocType::NotCold)]);
    assert!(backend.clone_names().is_empty());
    assert_eq!(analysis.stats().callsite_clones, 0);
}

fn cold_hot_split_input() -> (
    GenericBackend,
    GenericCall,
    GenericCall,
    Vec<FunctionProfile<GenericFunc, GenericCall>>,
) {
    let mut backend = GenericBackend::new();
    let f = backend.add_func("F");
    let g = backend.add_func("G");
    let a = backend.add_allocation(f, &[]);
    // The callsite in G covers stack id 10, the frame that calls F.
    let c = backend.add_callsite(g, &[10], f);
    let profile = vec![
        func_profile(
            f,
            vec![alloc_record(
                a,
                vec![
                    mib(&[10, 20], AllocType::Cold),
                    mib(&[10, 30], AllocType::NotCold),
                ],
            )],
            vec![],
        ),
        func_profile(g, vec![], vec![c]),
    ];
    (backend, a, c, profile)
}

/// A callsite whose stack-id sequence exactly matches an existing node
/// binds to it without synthesizing a new node.
#[test]
fn exact_sequence_binds_to_existing_node() {
    let (mut backend, _a, c, profile) = cold_hot_split_input();
    let mut stats = Stats::default();
    let opts = options();
    let graph = CallsiteContextGraph::build(&mut backend, &profile, &opts, &mut stats);
    let bound = graph.node_for_inst(CallInfo::new(c, 0)).unwrap();
    assert_eq!(Some(bound), graph.node_for_stack_id(10));
    assert_eq!(context_ids_of(&graph, bound), ids(&[1, 2]));
    assert_eq!(graph.nodes[bound].alloc_types, AllocTypes::BOTH);
    validate_graph(&graph).unwrap();
    drop(graph);
    assert_eq!(stats.synthesized_nodes, 0);
    assert_eq!(stats.matched_callsites, 1);
}

/// Cold and not-cold contexts splitting through a single caller: both the
/// callsite node and the allocation are cloned, and each enclosing function
/// gets one clone hosting the cold versions.
#[test]
fn cold_hot_split_through_one_caller() {
    let (mut backend, a, c, profile) = cold_hot_split_input();
    let mut analysis = ContextDisambiguation::new();
    let changed = analysis.process_profile(&mut backend, &profile, &options());
    assert!(changed);

    assert_eq!(clone_names(&backend), ["F.memprof.1", "G.memprof.1"]);
    // Clone 0 keeps the default behavior, clone 1 is the cold path.
    assert_eq!(
        backend.alloc_versions(a),
        &[Some(AllocType::NotCold), Some(AllocType::Cold)]
    );
    // The original callsite invokes the original F; its clone in
    // G.memprof.1 invokes F.memprof.1.
    assert_eq!(backend.callsite_clones(c), &[0, 1]);

    assert_eq!(analysis.stats().function_clones, 2);
    assert_eq!(analysis.stats().callsite_clones, 2);
    assert_eq!(analysis.stats().allocs_cold, 1);
    assert_eq!(analysis.stats().allocs_not_cold, 1);
}

/// The same split expressed with summary-style stack metadata: raw values
/// are indices into a stack-id table.
#[test]
fn cold_hot_split_with_stack_id_index() {
    let mut backend = GenericBackend::with_stack_id_index(vec![0, 10, 20, 30]);
    let f = backend.add_func("F");
    let g = backend.add_func("G");
    let a = backend.add_allocation(f, &[]);
    let c = backend.add_callsite(g, &[1], f);
    let profile = vec![
        func_profile(
            f,
            vec![alloc_record(
                a,
                vec![
                    mib(&[1, 2], AllocType::Cold),
                    mib(&[1, 3], AllocType::NotCold),
                ],
            )],
            vec![],
        ),
        func_profile(g, vec![], vec![c]),
    ];

    let mut analysis = ContextDisambiguation::new();
    assert!(analysis.process_profile(&mut backend, &profile, &options()));
    assert_eq!(clone_names(&backend), ["F.memprof.1", "G.memprof.1"]);
    assert_eq!(
        backend.alloc_versions(a),
        &[Some(AllocType::NotCold), Some(AllocType::Cold)]
    );
    assert_eq!(backend.callsite_clones(c), &[0, 1]);
}

/// A callsite spanning an inlined sequence gets a synthesized interior
/// node carrying exactly the contexts profiled through that sequence.
#[test]
fn inlined_callsite_synthesizes_node() {
    let mut backend = GenericBackend::new();
    let f = backend.add_func("F");
    let h = backend.add_func("H");
    let a1 = backend.add_allocation(f, &[]);
    let a2 = backend.add_allocation(f, &[]);
    // The frame with id 7 was inlined into this call, so it covers [8, 9].
    let c1 = backend.add_callsite(f, &[8, 9], h);
    let profile = vec![func_profile(
        f,
        vec![
            alloc_record(a1, vec![mib(&[7, 8, 9], AllocType::NotCold)]),
            alloc_record(a2, vec![mib(&[7, 8, 10], AllocType::Cold)]),
        ],
        vec![c1],
    )];

    let mut stats = Stats::default();
    let opts = options();
    let graph = CallsiteContextGraph::build(&mut backend, &profile, &opts, &mut stats);
    validate_graph(&graph).unwrap();

    let synth = graph.node_for_inst(CallInfo::new(c1, 0)).unwrap();
    assert!(graph.node_for_stack_id(8) != Some(synth));
    assert!(graph.node_for_stack_id(9) != Some(synth));
    // The synthesized node took over context 1; nodes 8 and 9 keep only
    // what is left of theirs.
    assert_eq!(context_ids_of(&graph, synth), ids(&[1]));
    let n8 = graph.node_for_stack_id(8).unwrap();
    assert_eq!(context_ids_of(&graph, n8), ids(&[2]));
    let n9 = graph.node_for_stack_id(9).unwrap();
    assert!(graph.is_removed(n9));
    let n7 = graph.node_for_stack_id(7).unwrap();
    assert_eq!(context_ids_of(&graph, n7), ids(&[1, 2]));
    // The synthesized node's callees took the moved context from node 8's
    // callee side.
    let callee_edge = graph.find_edge_from_callee(synth, n7).unwrap();
    assert_eq!(graph.edges[callee_edge].context_ids.sorted(), ids(&[1]));
    drop(graph);
    assert_eq!(stats.synthesized_nodes, 1);
}

/// Two callsites with identical stack sequences: the second one's contexts
/// are freshly minted duplicates propagated through the whole graph.
#[test]
fn identical_sequences_duplicate_context_ids() {
    let mut backend = GenericBackend::new();
    let f = backend.add_func("F");
    let g = backend.add_func("G");
    let a = backend.add_allocation(f, &[]);
    let c1 = backend.add_callsite(g, &[5, 6, 7], f);
    let c2 = backend.add_callsite(g, &[5, 6, 7], f);
    let profile = vec![
        func_profile(
            f,
            vec![alloc_record(a, vec![mib(&[5, 6, 7], AllocType::Cold)])],
            vec![],
        ),
        func_profile(g, vec![], vec![c1, c2]),
    ];

    let mut stats = Stats::default();
    let opts = options();
    let graph = CallsiteContextGraph::build(&mut backend, &profile, &opts, &mut stats);
    validate_graph(&graph).unwrap();

    let node1 = graph.node_for_inst(CallInfo::new(c1, 0)).unwrap();
    let node2 = graph.node_for_inst(CallInfo::new(c2, 0)).unwrap();
    assert_ne!(node1, node2);
    // The first call in sequence order gets the duplicated ids, the second
    // the originals; they are disjoint.
    assert_eq!(context_ids_of(&graph, node1), ids(&[2]));
    assert_eq!(context_ids_of(&graph, node2), ids(&[1]));
    // The allocation now carries both the original and the duplicate.
    let alloc_node = graph.node_for_alloc(CallInfo::new(a, 0)).unwrap();
    assert_eq!(context_ids_of(&graph, alloc_node), ids(&[1, 2]));
    // The interior chain is fully absorbed by the synthesized nodes.
    for stack_id in [5, 6, 7] {
        let node = graph.node_for_stack_id(stack_id).unwrap();
        assert!(graph.is_removed(node));
    }
    drop(graph);
    assert_eq!(stats.duplicated_context_ids, 1);
    assert_eq!(stats.synthesized_nodes, 2);
}

/// A callsite whose static callee disagrees with the profiled target is
/// neutralized and never updated.
#[test]
fn mismatched_callee_is_neutralized() {
    let mut backend = GenericBackend::new();
    let f = backend.add_func("F");
    let g = backend.add_func("G");
    let h = backend.add_func("H");
    let a = backend.add_allocation(f, &[]);
    // The profile says stack id 40 reaches the allocation in F, but this
    // call's static target is H.
    let c = backend.add_callsite(g, &[40], h);
    let profile = vec![
        func_profile(
            f,
            vec![alloc_record(a, vec![mib(&[40], AllocType::Cold)])],
            vec![],
        ),
        func_profile(g, vec![], vec![c]),
    ];

    let mut stats = Stats::default();
    let opts = options();
    {
        let graph = CallsiteContextGraph::build(&mut backend, &profile, &opts, &mut stats);
        validate_graph(&graph).unwrap();
        assert!(graph.node_for_inst(CallInfo::new(c, 0)).is_none());
        let n40 = graph.node_for_stack_id(40).unwrap();
        assert!(!graph.has_call(n40));
    }
    assert_eq!(stats.multi_target_callsites, 1);

    let mut analysis = ContextDisambiguation::new();
    let changed = analysis.process_profile(&mut backend, &profile, &options());
    assert!(!changed);
    assert_eq!(backend.alloc_versions(a), &[Some(AllocType::Cold)]);
    assert!(backend.callsite_clones(c).is_empty());
    assert!(backend.clone_names().is_empty());
}

/// A stack id repeating within one context marks its node recursive, which
/// bars both call binding and cloning.
#[test]
fn recursive_stack_id_is_never_bound() {
    let mut backend = GenericBackend::new();
    let f = backend.add_func("F");
    let g = backend.add_func("G");
    let a = backend.add_allocation(f, &[]);
    let c = backend.add_callsite(g, &[50], f);
    let profile = vec![
        func_profile(
            f,
            vec![alloc_record(a, vec![mib(&[50, 60, 50], AllocType::Cold)])],
            vec![],
        ),
        func_profile(g, vec![], vec![c]),
    ];

    let mut stats = Stats::default();
    let opts = options();
    {
        let graph = CallsiteContextGraph::build(&mut backend, &profile, &opts, &mut stats);
        validate_graph(&graph).unwrap();
        let n50 = graph.node_for_stack_id(50).unwrap();
        assert!(graph.nodes[n50].recursive);
        assert!(!graph.has_call(n50));
        assert!(graph.node_for_inst(CallInfo::new(c, 0)).is_none());
    }

    let mut analysis = ContextDisambiguation::new();
    assert!(!analysis.process_profile(&mut backend, &profile, &options()));
    assert_eq!(backend.alloc_versions(a), &[Some(AllocType::Cold)]);
    assert!(backend.clone_names().is_empty());
}

/// Running the cloner a second time finds nothing left to do.
#[test]
fn cloning_is_idempotent() {
    let (mut backend, _a, _c, profile) = cold_hot_split_input();
    let mut stats = Stats::default();
    let opts = options();
    let mut graph = CallsiteContextGraph::build(&mut backend, &profile, &opts, &mut stats);
    graph.identify_clones();
    validate_graph(&graph).unwrap();
    let before = snapshot(&graph);
    graph.identify_clones();
    validate_graph(&graph).unwrap();
    assert_eq!(before, snapshot(&graph));
}

/// Two identical runs produce identical decisions.
#[test]
fn pipeline_is_deterministic() {
    let run = || {
        let (mut backend, a, c, profile) = cold_hot_split_input();
        let mut analysis = ContextDisambiguation::new();
        analysis.process_profile(&mut backend, &profile, &options());
        (
            backend.clone_names().to_vec(),
            backend.alloc_versions(a).to_vec(),
            backend.callsite_clones(c).to_vec(),
        )
    };
    assert_eq!(run(), run());
}

/// Allocations stripped of their MIBs by upstream recursion elimination are
/// ignored entirely.
#[test]
fn allocation_without_mibs_is_skipped() {
    let mut backend = GenericBackend::new();
    let f = backend.add_func("f");
    let a = backend.add_allocation(f, &[]);
    let profile = vec![func_profile(f, vec![alloc_record(a, vec![])], vec![])];

    let mut stats = Stats::default();
    let opts = options();
    let graph = CallsiteContextGraph::build(&mut backend, &profile, &opts, &mut stats);
    assert_eq!(graph.nodes.len(), 0);
    assert!(graph.func_to_calls_with_metadata.is_empty());
}

/// Frames inlined into the allocation call itself are stripped from the MIB
/// stacks as a shared prefix.
#[test]
fn alloc_inlined_prefix_is_stripped() {
    let mut backend = GenericBackend::new();
    let f = backend.add_func("f");
    // The allocation call has frame 5 inlined into it.
    let a = backend.add_allocation(f, &[5]);
    let profile = vec![func_profile(
        f,
        vec![alloc_record(a, vec![mib(&[5, 6], AllocType::Cold)])],
        vec![],
    )];

    let mut stats = Stats::default();
    let opts = options();
    let graph = CallsiteContextGraph::build(&mut backend, &profile, &opts, &mut stats);
    validate_graph(&graph).unwrap();
    // No node for frame 5; the chain starts at frame 6.
    assert!(graph.node_for_stack_id(5).is_none());
    assert!(graph.node_for_stack_id(6).is_some());
    drop(graph);
    assert_eq!(stats.stack_nodes, 1);
}
