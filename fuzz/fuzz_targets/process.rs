//! Runs the full analysis pipeline over random profiles with every
//! verification check enabled. Any invariant violation panics.

#![no_main]

use libfuzzer_sys::fuzz_target;
use memprof_ccg::debug_utils::ArbitraryProfile;
use memprof_ccg::{ContextDisambiguation, Options};

fuzz_target!(|input: ArbitraryProfile| {
    let ArbitraryProfile {
        mut backend,
        profile,
    } = input;
    let options = Options {
        verify_ccg: true,
        verify_nodes: true,
    };
    ContextDisambiguation::new().process_profile(&mut backend, &profile, &options);
});
