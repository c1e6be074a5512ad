//! Utility functions and types for debugging the analysis.
//!
//! These are not needed for normal compilation, but are useful during
//! development of both the analysis itself and of backends feeding it.

mod display;
mod generic_backend;
mod validate;

pub use display::*;
pub use generic_backend::*;
pub use validate::*;
