//! Disambiguation of allocation call contexts using memory allocation
//! profiles.
//!
//! Memory profiles ("memprof") record, for each profiled heap allocation, one
//! behavior class per distinct call context reaching it: today either *cold*
//! or *not cold*. A single allocation call frequently serves contexts of both
//! classes, in which case no single placement decision is correct for all of
//! them. This crate implements the analysis that makes those contexts
//! unambiguous: it builds a [Callsite Context Graph] from the profile,
//! reconciles it with the post-inlining shape of the program, clones callsite
//! chains until every allocation clone is reached by contexts of a single
//! class, and finally plans which function clones must exist so that each
//! callsite clone has a concrete home.
//!
//! This crate is compatible with `#![no_std]` and only requires `alloc`.
//!
//! # Usage
//!
//! The analysis is independent of how programs and profiles are actually
//! represented. To use it you need an implementation of the [`Backend`]
//! trait, which gives the analysis access to callsite stack metadata and
//! receives the decisions it makes: behavior classes for allocation clones,
//! retargeted calls, and requests to materialize function clones. See the
//! [`backend`] module documentation for more details.
//!
//! The input profile is a list of [`FunctionProfile`] records, one per
//! function that contains either profiled allocations or callsites with stack
//! metadata.
//!
//! The analysis is invoked by creating an instance of
//! [`ContextDisambiguation`] and calling
//! [`ContextDisambiguation::process_profile`]. The return value indicates
//! whether any cloning was planned; all concrete decisions are delivered
//! through the backend.
//!
//! # Cloning contract
//!
//! Clone 0 always refers to the original function or call. Additional
//! function clones are named by appending `.memprof.<N>` to the base symbol
//! name (see [`memprof_clone_name`]); downstream consumers rely on this
//! naming to correlate cloning decisions with symbols.
//!
//! # Validation
//!
//! [`debug_utils`] contains an invariant checker for the graph as well as a
//! generic in-memory backend that is useful for testing clients and the
//! analysis itself. Verification of the graph between and during the
//! transformation stages can be requested through [`Options`]; an invariant
//! violation is a bug in the analysis (or in a backend feeding it
//! inconsistent metadata) and aborts the process.
//!
//! [Callsite Context Graph]: CallsiteContextGraph
//! [`Backend`]: backend::Backend
//! [`FunctionProfile`]: backend::FunctionProfile

#![no_std]
#![warn(rust_2018_idioms)]
#![allow(
    clippy::too_many_arguments,
    clippy::collapsible_if,
    clippy::collapsible_else_if,
    clippy::too_many_lines,
    clippy::module_name_repetitions
)]

extern crate alloc;

#[cfg(test)]
extern crate std;

use core::fmt;

// Even when trace logging is disabled, the trace macro has a significant
// performance cost so we disable it in release builds.
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}
macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

// Macro for collecting statistics.
macro_rules! stat {
    ($stats:expr, $field:ident) => {
        $stats.$field += 1
    };
    ($stats:expr, $field:ident, $count:expr) => {
        $stats.$field += $count
    };
}

#[macro_use]
pub mod entity;

pub mod backend;
pub mod context;
pub mod debug_utils;
pub mod graph;

pub use backend::{
    memprof_clone_name, AllocationRecord, Backend, CallInfo, CallMap, FuncInfo, FunctionProfile,
    Mib,
};
pub use context::{AllocType, AllocTypes, ContextId};
pub use graph::CallsiteContextGraph;

/// Hash collections keyed by a deterministic hasher.
///
/// Iteration order of these must still never influence analysis output; the
/// deterministic hasher only guarantees that any ordering bug reproduces.
pub(crate) type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub(crate) type FxHashSet<T> = hashbrown::HashSet<T, rustc_hash::FxBuildHasher>;
pub(crate) type FxIndexMap<K, V> = indexmap::IndexMap<K, V, rustc_hash::FxBuildHasher>;

/// Entry point for running context disambiguation over a module's profile.
///
/// Holds the statistics collected by the last run; the analysis itself keeps
/// no state between runs.
pub struct ContextDisambiguation {
    stats: Stats,
}

impl Default for ContextDisambiguation {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl ContextDisambiguation {
    /// Creates a new `ContextDisambiguation` instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stats: Stats::default(),
        }
    }

    /// Runs the analysis over the given per-function profile records.
    ///
    /// Decisions are delivered through `backend`:
    /// [`Backend::update_allocation_call`] for every live allocation clone,
    /// [`Backend::update_call`] for every callsite clone assigned to a
    /// function clone, and [`Backend::clone_function_for_callsite`] whenever
    /// an additional function clone is required.
    ///
    /// Returns `true` if any function cloning was planned.
    pub fn process_profile<B: Backend>(
        &mut self,
        backend: &mut B,
        profile: &[FunctionProfile<B::Func, B::Call>],
        options: &Options,
    ) -> bool {
        self.stats = Stats::default();
        let mut graph = CallsiteContextGraph::build(backend, profile, options, &mut self.stats);
        let changed = graph.process();
        drop(graph);
        trace!("{}", self.stats);
        changed
    }

    /// Statistics collected by the most recent [`Self::process_profile`] run.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

/// Configuration options for the analysis.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Check all graph invariants between transformation stages. An
    /// invariant violation panics.
    pub verify_ccg: bool,

    /// Additionally re-check every node touched by cloning as it is
    /// produced. Much slower; intended for debugging and fuzzing.
    pub verify_nodes: bool,
}

/// Statistics collected while processing a profile.
///
/// This is an opaque type since the set of statistics may vary between
/// versions of the analysis, even across minor versions.
///
/// The only supported operations on this type are:
/// * Default initialization
/// * Printing with `Debug` or `Display`
#[derive(Debug, Default, Clone)]
pub struct Stats {
    // Stats from graph construction.
    functions: usize,
    allocs: usize,
    mibs: usize,
    context_ids: usize,
    stack_nodes: usize,

    // Stats from matching callsites onto the graph.
    matched_callsites: usize,
    synthesized_nodes: usize,
    duplicated_context_ids: usize,
    multi_target_callsites: usize,

    // Stats from cloning and function assignment.
    callsite_clones: usize,
    function_clones: usize,
    allocs_not_cold: usize,
    allocs_cold: usize,
    calls_updated: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:#?}")
    }
}
