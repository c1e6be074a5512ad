//! Generic in-memory implementation of [`Backend`] for testing the analysis.
//!
//! Calls and functions are plain entities; the backend records everything
//! the analysis decides in summary-style arrays: one behavior class per
//! allocation clone (`Versions`) and one callee clone number per callsite
//! clone (`Clones`), plus the symbol names of the function clones it was
//! asked to materialize.
//!
//! Stack metadata is stored directly on each call. By default the recorded
//! values are stack ids themselves; with
//! [`GenericBackend::with_stack_id_index`] they are indices into a table
//! instead, exercising the resolution step that summary-style profile
//! formats require.

use alloc::string::String;
use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::backend::{memprof_clone_name, Backend, CallInfo, CallMap, FuncInfo};
use crate::context::AllocType;
use crate::entity::{PackedOption, PrimaryMap};
use crate::FxHashMap;

#[cfg(feature = "arbitrary")]
mod arbitrary_impl;
#[cfg(feature = "arbitrary")]
pub use arbitrary_impl::ArbitraryProfile;

entity_def! {
    /// A function tracked by a [`GenericBackend`].
    pub entity GenericFunc(u32, "func");

    /// A call tracked by a [`GenericBackend`].
    pub entity GenericCall(u32, "call");
}

struct FuncData {
    name: String,
}

struct CallData {
    /// The function containing this call.
    func: GenericFunc,
    /// Static callee, for callsites with a direct target.
    callee: PackedOption<GenericFunc>,
    /// Recorded stack context, innermost frame first.
    stack_ids: Vec<u64>,
    is_allocation: bool,
}

/// A generic implementation of [`Backend`] backed by in-memory records.
///
/// This is primarily useful for development and testing of the analysis: a
/// profile can be described programmatically and every decision the analysis
/// delivers is captured for inspection.
#[derive(Default)]
pub struct GenericBackend {
    funcs: PrimaryMap<GenericFunc, FuncData>,
    calls: PrimaryMap<GenericCall, CallData>,

    /// When set, raw stack values on calls and in MIB stacks are indices
    /// into this table rather than stack ids.
    stack_id_index: Option<Vec<u64>>,

    /// Behavior class per clone of each profiled allocation. Index 0 is the
    /// original; `None` marks a clone not (yet) assigned a class.
    alloc_versions: FxHashMap<GenericCall, Vec<Option<AllocType>>>,

    /// Callee function clone number invoked by each clone of a callsite.
    /// Index 0 is the original.
    callsite_clones: FxHashMap<GenericCall, Vec<u32>>,

    /// Names of the function clones materialized, in creation order.
    clone_names: Vec<String>,
}

impl GenericBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose raw stack values are indices into `table`.
    #[must_use]
    pub fn with_stack_id_index(table: Vec<u64>) -> Self {
        Self {
            stack_id_index: Some(table),
            ..Self::default()
        }
    }

    pub fn add_func(&mut self, name: &str) -> GenericFunc {
        self.funcs.push(FuncData {
            name: String::from(name),
        })
    }

    /// Adds an allocation call to `func`. `inlined_stack_ids` is the stack
    /// context of the allocation call itself (raw values, innermost first),
    /// empty unless calls were inlined into it.
    pub fn add_allocation(&mut self, func: GenericFunc, inlined_stack_ids: &[u64]) -> GenericCall {
        self.calls.push(CallData {
            func,
            callee: PackedOption::default(),
            stack_ids: inlined_stack_ids.into(),
            is_allocation: true,
        })
    }

    /// Adds a callsite in `func` with the given stack context (raw values,
    /// innermost first) and static callee.
    pub fn add_callsite(
        &mut self,
        func: GenericFunc,
        stack_ids: &[u64],
        callee: GenericFunc,
    ) -> GenericCall {
        self.calls.push(CallData {
            func,
            callee: callee.into(),
            stack_ids: stack_ids.into(),
            is_allocation: false,
        })
    }

    /// The function containing `call`.
    #[must_use]
    pub fn func_of(&self, call: GenericCall) -> GenericFunc {
        self.calls[call].func
    }

    /// The behavior classes assigned to the clones of an allocation, index 0
    /// being the original. Empty if the analysis never touched it.
    #[must_use]
    pub fn alloc_versions(&self, call: GenericCall) -> &[Option<AllocType>] {
        self.alloc_versions.get(&call).map_or(&[], Vec::as_slice)
    }

    /// The callee function clone numbers assigned to the clones of a
    /// callsite, index 0 being the original. Empty if the analysis never
    /// touched it.
    #[must_use]
    pub fn callsite_clones(&self, call: GenericCall) -> &[u32] {
        self.callsite_clones.get(&call).map_or(&[], Vec::as_slice)
    }

    /// Names of the function clones materialized, in creation order.
    #[must_use]
    pub fn clone_names(&self) -> &[String] {
        &self.clone_names
    }
}

impl Backend for GenericBackend {
    type Call = GenericCall;
    type Func = GenericFunc;

    fn stack_id(&self, id_or_index: u64) -> u64 {
        match &self.stack_id_index {
            Some(table) => table[id_or_index as usize],
            None => id_or_index,
        }
    }

    fn callsite_stack_ids(&self, call: GenericCall) -> SmallVec<[u64; 8]> {
        self.calls[call].stack_ids.iter().copied().collect()
    }

    fn callee_matches_func(&self, call: GenericCall, func: GenericFunc) -> bool {
        self.calls[call].callee.expand() == Some(func)
    }

    fn update_allocation_call(&mut self, call: CallInfo<GenericCall>, alloc_type: AllocType) {
        debug_assert!(self.calls[call.call()].is_allocation);
        let versions = self
            .alloc_versions
            .entry(call.call())
            .or_insert_with(|| alloc::vec![None]);
        let slot = call.clone_no() as usize;
        debug_assert!(slot < versions.len());
        versions[slot] = Some(alloc_type);
    }

    fn update_call(&mut self, caller_call: CallInfo<GenericCall>, callee_func: FuncInfo<GenericFunc>) {
        debug_assert!(!self.calls[caller_call.call()].is_allocation);
        let clones = self
            .callsite_clones
            .entry(caller_call.call())
            .or_insert_with(|| alloc::vec![0]);
        let slot = caller_call.clone_no() as usize;
        debug_assert!(slot < clones.len());
        clones[slot] = callee_func.clone_no();
    }

    fn clone_function_for_callsite(
        &mut self,
        func: FuncInfo<GenericFunc>,
        _call: CallInfo<GenericCall>,
        call_map: &mut CallMap<GenericCall>,
        calls_with_metadata: &[CallInfo<GenericCall>],
        clone_no: u32,
    ) -> FuncInfo<GenericFunc> {
        // Mint a new version slot for every tracked call in the function;
        // the analysis fills them in through the update methods.
        for &inst in calls_with_metadata {
            debug_assert_eq!(inst.clone_no(), 0);
            if self.calls[inst.call()].is_allocation {
                let versions = self
                    .alloc_versions
                    .entry(inst.call())
                    .or_insert_with(|| alloc::vec![None]);
                debug_assert_eq!(versions.len(), clone_no as usize);
                versions.push(None);
            } else {
                let clones = self
                    .callsite_clones
                    .entry(inst.call())
                    .or_insert_with(|| alloc::vec![0]);
                debug_assert_eq!(clones.len(), clone_no as usize);
                clones.push(0);
            }
            call_map.insert(inst, CallInfo::new(inst.call(), clone_no));
        }
        self.clone_names
            .push(memprof_clone_name(&self.funcs[func.func()].name, clone_no));
        FuncInfo::new(func.func(), clone_no)
    }
}
