//! Grid observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use super::individual::Individual;
use super::lock;

/// Receives population changes.
///
/// `on_settle` and `on_evict` run inside the grid's critical section and must
/// not call back into the grid.
pub trait GridObserver: Send + Sync {
    fn on_settle(&self, _individual: &Arc<Individual>) {}

    fn on_evict(&self, _individual: &Arc<Individual>) {}

    fn start_observing(&self) {}

    fn stop_observing(&self) {}

    /// Individuals sharing the best fitness seen in the live population.
    fn best_fit_individuals(&self) -> Vec<Arc<Individual>> {
        Vec::new()
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl GridObserver for NullObserver {}

/// Mirrors the live population to answer best-fit queries.
#[derive(Debug, Default)]
pub struct BestFitObserver {
    live: Mutex<HashMap<u64, Arc<Individual>>>,
    observing: AtomicBool,
}

impl BestFitObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_observing(&self) -> bool {
        self.observing.load(Ordering::Acquire)
    }

    /// Number of individuals currently mirrored.
    pub fn population(&self) -> usize {
        lock(&self.live).len()
    }
}

impl GridObserver for BestFitObserver {
    fn on_settle(&self, individual: &Arc<Individual>) {
        lock(&self.live).insert(individual.id(), Arc::clone(individual));
    }

    fn on_evict(&self, individual: &Arc<Individual>) {
        lock(&self.live).remove(&individual.id());
    }

    fn start_observing(&self) {
        debug!("Best-fit observer started");
        self.observing.store(true, Ordering::Release);
    }

    fn stop_observing(&self) {
        debug!("Best-fit observer stopped");
        self.observing.store(false, Ordering::Release);
    }

    /// Smallest first.
    fn best_fit_individuals(&self) -> Vec<Arc<Individual>> {
        let live = lock(&self.live);
        let Some(best) = live.values().map(|i| i.fitness()).max() else {
            return Vec::new();
        };
        let mut winners: Vec<_> = live
            .values()
            .filter(|i| i.fitness() == best)
            .cloned()
            .collect();
        winners.sort_by_key(|i| (i.size(), i.id()));
        winners
    }
}
