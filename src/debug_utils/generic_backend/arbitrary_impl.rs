//! Random profile generation for fuzzing.

use alloc::format;
use alloc::vec::Vec;

use arbitrary::{Arbitrary, Result, Unstructured};

use super::{GenericBackend, GenericCall, GenericFunc};
use crate::backend::{AllocationRecord, FunctionProfile, Mib};
use crate::context::AllocType;

const MAX_FUNCS: usize = 3;
const MAX_ALLOCS_PER_FUNC: usize = 2;
const MAX_MIBS_PER_ALLOC: usize = 3;
const MAX_CALLSITES_PER_FUNC: usize = 3;
const MAX_STACK_DEPTH: usize = 4;
const MAX_STACK_ID: u64 = 10;

/// A random but well-formed profile over a [`GenericBackend`].
///
/// The stack-id universe is kept deliberately small so that contexts
/// frequently share chains, collide on identical sequences, and recurse,
/// which is where the interesting graph transformations happen.
pub struct ArbitraryProfile {
    pub backend: GenericBackend,
    pub profile: Vec<FunctionProfile<GenericFunc, GenericCall>>,
}

impl core::fmt::Debug for ArbitraryProfile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.profile.iter()).finish()
    }
}

fn arbitrary_stack(u: &mut Unstructured<'_>) -> Result<Vec<u64>> {
    let depth = u.int_in_range(1..=MAX_STACK_DEPTH)?;
    (0..depth).map(|_| u.int_in_range(1..=MAX_STACK_ID)).collect()
}

impl<'a> Arbitrary<'a> for ArbitraryProfile {
    fn arbitrary(u: &mut Unstructured<'a>) -> Result<Self> {
        let mut backend = GenericBackend::new();
        let funcs: Vec<GenericFunc> = (0..u.int_in_range(1..=MAX_FUNCS)?)
            .map(|i| backend.add_func(&format!("f{i}")))
            .collect();

        let mut profile = Vec::new();
        for &func in &funcs {
            let mut allocs = Vec::new();
            for _ in 0..u.int_in_range(0..=MAX_ALLOCS_PER_FUNC)? {
                let call = backend.add_allocation(func, &[]);
                let mut mibs = Vec::new();
                for _ in 0..u.int_in_range(1..=MAX_MIBS_PER_ALLOC)? {
                    mibs.push(Mib {
                        call_stack: arbitrary_stack(u)?,
                        alloc_type: if u.arbitrary()? {
                            AllocType::Cold
                        } else {
                            AllocType::NotCold
                        },
                    });
                }
                allocs.push(AllocationRecord {
                    call,
                    inlined_call_stack: Vec::new(),
                    mibs,
                });
            }

            let mut callsites = Vec::new();
            for _ in 0..u.int_in_range(0..=MAX_CALLSITES_PER_FUNC)? {
                let stack = arbitrary_stack(u)?;
                let callee = *u.choose(&funcs)?;
                callsites.push(backend.add_callsite(func, &stack, callee));
            }

            profile.push(FunctionProfile {
                func,
                allocs,
                callsites,
            });
        }

        Ok(Self { backend, profile })
    }
}
