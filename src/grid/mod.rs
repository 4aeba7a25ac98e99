//! Spatial population: individuals, the grid, area locks and observers.

mod area_lock;
mod individual;
mod observer;
mod population;

pub use area_lock::*;
pub use individual::*;
pub use observer::*;
pub use population::*;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
///
/// Workers catch panics per iteration, so a poisoned lock still guards
/// consistent state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::compute::{Fitness, FitnessError};
    use crate::grammar::{Expr, GrammarSet};
    use crate::schema::{GrammarConfig, GridConfig};

    #[test]
    fn test_best_fit_observer_prefers_smallest() {
        let grammars = GrammarSet::new(&GrammarConfig::default(), 1).unwrap();
        let evaluator = |_: u32, exprs: &[Expr]| -> Result<Fitness, FitnessError> {
            Ok(Fitness::new(if exprs[0].size() > 4 { 0.5 } else { 0.9 }))
        };
        let factory = IndividualFactory::new(0, grammars, Arc::new(evaluator), 1, 1);
        let observer = Arc::new(BestFitObserver::new());
        let grid = PopulationGrid::new(&GridConfig::default(), observer.clone());

        assert!(observer.best_fit_individuals().is_empty());
        observer.start_observing();
        assert!(observer.is_observing());

        let mut rng = StdRng::seed_from_u64(11);
        for x in 0..20 {
            let individual = Arc::new(factory.random(&mut rng).unwrap());
            grid.set(Position::new(x, 0), individual);
        }

        let best = observer.best_fit_individuals();
        let top = best.iter().map(|i| i.fitness()).max();
        let overall = grid.individuals().iter().map(|i| i.fitness()).max();
        assert_eq!(top, overall);
        assert!(best.windows(2).all(|w| w[0].size() <= w[1].size()));
        assert!(best.iter().all(|i| grid.contains(i)));

        observer.stop_observing();
        assert!(!observer.is_observing());
    }

    #[test]
    fn test_null_observer_reports_nothing() {
        assert!(NullObserver.best_fit_individuals().is_empty());
    }
}
