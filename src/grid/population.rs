//! The population grid.

use std::sync::{Arc, Mutex};

use super::individual::{Individual, Position};
use super::lock;
use super::observer::GridObserver;
use crate::schema::GridConfig;

/// Outcome of offering a candidate to a cell.
#[derive(Debug)]
pub enum Placement {
    /// The incumbent kept the cell.
    Rejected,
    /// The candidate took the cell, evicting the previous occupant if any.
    Settled { evicted: Option<Arc<Individual>> },
}

impl Placement {
    pub fn is_settled(&self) -> bool {
        matches!(self, Placement::Settled { .. })
    }
}

/// Fixed-size grid of optional individuals.
///
/// Every mutation runs under one lock and notifies the observer before the
/// lock is released.
pub struct PopulationGrid {
    size_x: usize,
    size_y: usize,
    cells: Mutex<Vec<Option<Arc<Individual>>>>,
    observer: Arc<dyn GridObserver>,
}

impl PopulationGrid {
    pub fn new(config: &GridConfig, observer: Arc<dyn GridObserver>) -> Self {
        Self {
            size_x: config.size_x,
            size_y: config.size_y,
            cells: Mutex::new(vec![None; config.cells()]),
            observer,
        }
    }

    pub fn size_x(&self) -> usize {
        self.size_x
    }

    pub fn size_y(&self) -> usize {
        self.size_y
    }

    #[inline]
    fn index(&self, pos: Position) -> usize {
        debug_assert!(pos.x < self.size_x && pos.y < self.size_y);
        pos.y * self.size_x + pos.x
    }

    pub fn get(&self, pos: Position) -> Option<Arc<Individual>> {
        lock(&self.cells)[self.index(pos)].clone()
    }

    /// `true` if the individual occupies the cell it records as its position.
    pub fn contains(&self, individual: &Individual) -> bool {
        let Some(pos) = individual.position() else {
            return false;
        };
        lock(&self.cells)[self.index(pos)]
            .as_ref()
            .is_some_and(|occupant| occupant.id() == individual.id())
    }

    /// Put `candidate` at `pos` unconditionally, returning the evicted occupant.
    pub fn set(&self, pos: Position, candidate: Arc<Individual>) -> Option<Arc<Individual>> {
        match self.offer(pos, candidate, |_, _| true) {
            Placement::Settled { evicted } => evicted,
            Placement::Rejected => None,
        }
    }

    /// Offer `candidate` to the cell at `pos`.
    ///
    /// An empty cell is always taken. Otherwise `wins(incumbent, candidate)`
    /// decides, atomically with the write.
    pub fn offer<F>(&self, pos: Position, candidate: Arc<Individual>, wins: F) -> Placement
    where
        F: FnOnce(&Individual, &Individual) -> bool,
    {
        let idx = self.index(pos);
        let mut cells = lock(&self.cells);
        if let Some(incumbent) = &cells[idx]
            && !wins(incumbent, &candidate)
        {
            return Placement::Rejected;
        }

        candidate.set_position(pos);
        self.observer.on_settle(&candidate);
        let evicted = cells[idx].replace(candidate);
        if let Some(old) = &evicted {
            self.observer.on_evict(old);
        }
        Placement::Settled { evicted }
    }

    /// Remove the individual if it still occupies its cell.
    pub fn remove(&self, individual: &Individual) -> bool {
        let Some(pos) = individual.position() else {
            return false;
        };
        let idx = self.index(pos);
        let mut cells = lock(&self.cells);
        match &cells[idx] {
            Some(occupant) if occupant.id() == individual.id() => {
                if let Some(old) = cells[idx].take() {
                    self.observer.on_evict(&old);
                }
                true
            }
            _ => false,
        }
    }

    /// Number of occupied cells.
    pub fn population(&self) -> usize {
        lock(&self.cells).iter().flatten().count()
    }

    /// All live individuals, row by row.
    pub fn individuals(&self) -> Vec<Arc<Individual>> {
        lock(&self.cells).iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::compute::{Fitness, FitnessError};
    use crate::grammar::{Expr, GrammarSet};
    use crate::grid::{BestFitObserver, IndividualFactory};
    use crate::schema::GrammarConfig;

    fn individual(seed: u64) -> Arc<Individual> {
        let grammars = GrammarSet::new(&GrammarConfig::default(), 1).unwrap();
        let evaluator = move |_: u32, _: &[Expr]| -> Result<Fitness, FitnessError> {
            Ok(Fitness::new(seed as f64 / 10.0))
        };
        let factory = IndividualFactory::new(0, grammars, Arc::new(evaluator), 1, 2);
        Arc::new(factory.random(&mut StdRng::seed_from_u64(seed)).unwrap())
    }

    fn grid(observer: Arc<dyn GridObserver>) -> PopulationGrid {
        let config = GridConfig {
            size_x: 4,
            size_y: 3,
            ..GridConfig::default()
        };
        PopulationGrid::new(&config, observer)
    }

    #[test]
    fn test_set_updates_position_and_evicts() {
        let observer = Arc::new(BestFitObserver::new());
        let grid = grid(observer.clone());
        let a = individual(1);
        let b = individual(2);
        let pos = Position::new(3, 2);

        assert!(grid.set(pos, a.clone()).is_none());
        assert_eq!(a.position(), Some(pos));
        assert!(grid.contains(&a));

        let evicted = grid.set(pos, b.clone()).unwrap();
        assert_eq!(evicted.id(), a.id());
        assert!(!grid.contains(&a));
        assert!(grid.contains(&b));
        assert_eq!(grid.population(), 1);
        assert_eq!(observer.population(), 1);
    }

    #[test]
    fn test_offer_respects_decision() {
        let grid = grid(Arc::new(crate::grid::NullObserver));
        let strong = individual(5);
        let weak = individual(3);
        let pos = Position::new(0, 1);
        let by_fitness = |inc: &Individual, cand: &Individual| cand.fitness() > inc.fitness();

        assert!(grid.offer(pos, strong.clone(), by_fitness).is_settled());
        assert!(!grid.offer(pos, weak.clone(), by_fitness).is_settled());
        assert_eq!(weak.position(), None);
        assert_eq!(grid.get(pos).unwrap().id(), strong.id());
    }

    #[test]
    fn test_remove_only_current_occupant() {
        let observer = Arc::new(BestFitObserver::new());
        let grid = grid(observer.clone());
        let a = individual(1);
        let b = individual(2);
        grid.set(Position::new(1, 1), a.clone());
        grid.set(Position::new(1, 1), b.clone());

        assert!(!grid.remove(&a));
        assert!(grid.remove(&b));
        assert!(!grid.remove(&b));
        assert_eq!(grid.population(), 0);
        assert_eq!(observer.population(), 0);
        assert!(grid.individuals().is_empty());
    }
}
