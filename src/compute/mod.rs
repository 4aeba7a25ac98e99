//! Compute module - expression evaluation and fitness.

mod eval;
mod fitness;

pub use eval::*;
pub use fitness::*;
