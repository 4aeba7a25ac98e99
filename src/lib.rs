//! Grid GP - grammar-guided genetic programming on a spatial population grid.
//!
//! Candidate solutions are vectors of expression trees, one per output
//! dimension, generated and mutated from user-supplied grammars. They live on
//! a 2-D grid where a pool of worker threads breeds them concurrently: each
//! worker locks the neighbourhood of a parent, spreads mutated children into
//! it and lets them compete with the incumbents for their cells.
//!
//! # Architecture
//!
//! - `schema`: Engine configuration and validation
//! - `grammar`: Grammar parsing, size analysis, tree generation and mutation
//! - `compute`: Expression evaluation and fitness
//! - `grid`: Individuals, the population grid, area locks and observers
//! - `evolution`: Breeding coordination and the worker scheduler
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use gridgp::{
//!     compute::{RegressionFitness, Sample},
//!     evolution::EvolutionScheduler,
//!     grid::BestFitObserver,
//!     schema::EngineConfig,
//! };
//!
//! let samples = (0..20)
//!     .map(|i| {
//!         let x = i as f64 / 4.0;
//!         Sample { inputs: vec![x], outputs: vec![x * x] }
//!     })
//!     .collect();
//! let fitness = Arc::new(RegressionFitness::new(samples).unwrap());
//! let observer = Arc::new(BestFitObserver::new());
//!
//! let scheduler = EvolutionScheduler::new(EngineConfig::default(), fitness, observer)
//!     .unwrap()
//!     .with_callback(|s| println!("finished after {} reproductions", s.reproductions()));
//! scheduler.start().unwrap();
//! scheduler.wait_until_stopped(Duration::from_secs(60));
//!
//! for best in scheduler.best_fit_individuals() {
//!     println!("{best}: {}", best.exprs()[0]);
//! }
//! ```

pub mod compute;
pub mod evolution;
pub mod grammar;
pub mod grid;
pub mod schema;

// Re-export commonly used types
pub use compute::{Fitness, FitnessEvaluator, RegressionFitness, Sample};
pub use evolution::{EngineError, EvolutionScheduler};
pub use grammar::{Expr, Grammar, GrammarSet};
pub use grid::{BestFitObserver, GridObserver, Individual};
pub use schema::EngineConfig;
