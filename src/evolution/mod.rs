//! Evolution engine: breeding coordination and the worker scheduler.

mod breeding;
mod scheduler;

pub use breeding::*;
pub use scheduler::*;

use crate::compute::FitnessError;
use crate::grammar::GrammarError;
use crate::schema::ConfigError;

/// Errors surfaced by the evolution engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Grammar error: {0}")]
    Grammar(#[from] GrammarError),
    #[error("Fitness error: {0}")]
    Fitness(#[from] FitnessError),
    #[error("Scheduler already started (state: {0})")]
    AlreadyStarted(SchedulerState),
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}
