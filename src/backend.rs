//! The [`Backend`] trait which connects the analysis to a program
//! representation.
//!
//! The context graph itself is representation-agnostic: the same analysis
//! runs over whole-module IR and over distributed link-time summaries. The
//! two differ only in how calls and functions are named, how callsite stack
//! metadata is fetched, and how decisions are persisted, and those operations
//! are exactly the surface of [`Backend`].
//!
//! # Handles
//!
//! Calls and functions appear to the analysis as the opaque
//! [`Backend::Call`] and [`Backend::Func`] handles. The analysis pairs them
//! with clone numbers in [`CallInfo`] and [`FuncInfo`]; clone number 0 always
//! names the original.
//!
//! # Stack metadata
//!
//! A callsite's recorded stack context is a sequence of ids, innermost frame
//! first, with the outermost profiled caller last. A callsite that inlined
//! other calls covers a sequence of several ids. The raw values delivered by
//! [`Backend::callsite_stack_ids`] pass through [`Backend::stack_id`] before
//! use: an in-IR backend stores ids directly and resolves them with the
//! identity function, while a summary backend stores indices into a module
//! stack-id table.
//!
//! # Persisting decisions
//!
//! For every live allocation clone the analysis calls
//! [`Backend::update_allocation_call`] with the behavior class to attach; for
//! every callsite clone it calls [`Backend::update_call`] with the function
//! clone to invoke. When a single function body cannot host the required
//! combination of callsite clones, the analysis requests a fresh copy through
//! [`Backend::clone_function_for_callsite`]. A summary-style backend persists
//! these as a `Versions` array per allocation (one class per clone) and a
//! `Clones` array per callsite (the callee clone number each function clone
//! should invoke); an IR-style backend applies them directly.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::hash::Hash;

use alloc::format;
use smallvec::SmallVec;

use crate::context::AllocType;
use crate::FxHashMap;

/// Suffix used to name function clones.
pub const MEMPROF_CLONE_SUFFIX: &str = ".memprof.";

/// The symbol name for clone `clone_no` of a function named `base`.
///
/// Clone 0 is the original and keeps its name; clone N is named
/// `<base>.memprof.<N>`. This naming is relied on by the consumers that
/// later materialize the clones.
#[must_use]
pub fn memprof_clone_name(base: &str, clone_no: u32) -> String {
    if clone_no == 0 {
        String::from(base)
    } else {
        format!("{base}{MEMPROF_CLONE_SUFFIX}{clone_no}")
    }
}

/// A call together with a clone number.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CallInfo<C> {
    call: C,
    clone_no: u32,
}

impl<C: Copy> CallInfo<C> {
    #[inline]
    pub fn new(call: C, clone_no: u32) -> Self {
        Self { call, clone_no }
    }

    #[inline]
    pub fn call(self) -> C {
        self.call
    }

    #[inline]
    pub fn clone_no(self) -> u32 {
        self.clone_no
    }

    /// The same call with a different clone number.
    #[inline]
    #[must_use]
    pub fn with_clone_no(self, clone_no: u32) -> Self {
        Self { clone_no, ..self }
    }
}

impl<C: fmt::Debug> fmt::Display for CallInfo<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (clone {})", self.call, self.clone_no)
    }
}

/// A function together with a clone number.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FuncInfo<F> {
    func: F,
    clone_no: u32,
}

impl<F: Copy> FuncInfo<F> {
    #[inline]
    pub fn new(func: F, clone_no: u32) -> Self {
        Self { func, clone_no }
    }

    #[inline]
    pub fn func(self) -> F {
        self.func
    }

    #[inline]
    pub fn clone_no(self) -> u32 {
        self.clone_no
    }
}

impl<F: fmt::Debug> fmt::Display for FuncInfo<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (clone {})", self.func, self.clone_no)
    }
}

/// Mapping from each original call of a function to the corresponding call in
/// one of its clones.
///
/// Populated by [`Backend::clone_function_for_callsite`] and queried by the
/// planner to rebind callsite clones onto the cloned calls. Keys always carry
/// clone number 0.
pub type CallMap<C> = FxHashMap<CallInfo<C>, CallInfo<C>>;

/// One profiled behavior record (MIB) for an allocation: the call stack it
/// was observed under and the behavior class observed.
///
/// `call_stack` holds raw id-or-index values, innermost frame (the one
/// closest to the allocation) first.
#[derive(Clone, Debug)]
pub struct Mib {
    pub call_stack: Vec<u64>,
    pub alloc_type: AllocType,
}

/// A profiled allocation call and its MIBs.
#[derive(Clone, Debug)]
pub struct AllocationRecord<C> {
    pub call: C,

    /// Stack ids of callsites inlined into the allocation call itself. The
    /// shared prefix these form with each MIB call stack is skipped when
    /// building the graph. Empty when the profile format already collapses
    /// inlined frames out of the MIB stacks.
    pub inlined_call_stack: Vec<u64>,

    /// Profiled contexts. An allocation with no MIBs is ignored.
    pub mibs: Vec<Mib>,
}

/// Profile data for one function: its profiled allocations and the callsites
/// within it that carry stack metadata.
#[derive(Clone, Debug)]
pub struct FunctionProfile<F, C> {
    pub func: F,
    pub allocs: Vec<AllocationRecord<C>>,
    pub callsites: Vec<C>,
}

/// Connects the analysis to a concrete program representation.
///
/// Backends must hand out stable, copyable handles for calls and functions;
/// the analysis uses them as map keys and never interprets them.
pub trait Backend {
    /// Handle naming a call instruction or its summary entry.
    type Call: Copy + Eq + Hash + fmt::Debug;

    /// Handle naming a function or its summary entry.
    type Func: Copy + Eq + Hash + fmt::Debug;

    /// Resolves a raw stack value from profile metadata to a stack id.
    ///
    /// Identity when the metadata stores ids directly; a table lookup when it
    /// stores indices.
    fn stack_id(&self, id_or_index: u64) -> u64;

    /// The resolved outermost (closest to the root caller) stack id recorded
    /// for a callsite.
    fn last_stack_id(&self, call: Self::Call) -> u64 {
        let ids = self.callsite_stack_ids(call);
        let &raw = ids.last().expect("callsite with empty stack context");
        self.stack_id(raw)
    }

    /// Raw stack-id sequence recorded for a callsite, innermost frame first.
    fn callsite_stack_ids(&self, call: Self::Call) -> SmallVec<[u64; 8]>;

    /// Whether the static callee of `call` is `func`, resolving aliases.
    fn callee_matches_func(&self, call: Self::Call, func: Self::Func) -> bool;

    /// Records the behavior class decided for an allocation clone.
    fn update_allocation_call(&mut self, call: CallInfo<Self::Call>, alloc_type: AllocType);

    /// Redirects a callsite clone to the given function clone.
    fn update_call(&mut self, caller_call: CallInfo<Self::Call>, callee_func: FuncInfo<Self::Func>);

    /// Materializes clone `clone_no` of `func`, which must be the next
    /// unused clone number for it.
    ///
    /// For every call in `calls_with_metadata` (all carrying clone number 0)
    /// the backend records in `call_map` the corresponding call in the new
    /// clone. `call` is the callsite whose cloning forced the new function
    /// clone, for backends that want to report it.
    fn clone_function_for_callsite(
        &mut self,
        func: FuncInfo<Self::Func>,
        call: CallInfo<Self::Call>,
        call_map: &mut CallMap<Self::Call>,
        calls_with_metadata: &[CallInfo<Self::Call>],
        clone_no: u32,
    ) -> FuncInfo<Self::Func>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_names() {
        assert_eq!(memprof_clone_name("foo", 0), "foo");
        assert_eq!(memprof_clone_name("foo", 1), "foo.memprof.1");
        assert_eq!(memprof_clone_name("foo", 12), "foo.memprof.12");
    }
}
