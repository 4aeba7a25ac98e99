//! Schema types for engine configuration.

mod config;

pub use config::*;
