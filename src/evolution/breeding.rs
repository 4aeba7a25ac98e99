//! Breeding coordination: selection, settling, reproduction and filtering.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use rand::Rng;
use rayon::prelude::*;

use crate::compute::FitnessEvaluator;
use crate::grammar::{GrammarError, GrammarSet};
use crate::grid::{
    AreaLock, GridObserver, Individual, IndividualFactory, Placement, PopulationGrid, Position,
    lock,
};
use crate::schema::{BreedingConfig, EngineConfig, SelectionPolicy};

/// How long a filter waits for in-flight reproductions to drain.
pub const FILTER_DRAIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Decide whether `candidate` displaces `incumbent`.
pub fn candidate_wins<R: Rng + ?Sized>(
    policy: SelectionPolicy,
    incumbent: &Individual,
    candidate: &Individual,
    rng: &mut R,
) -> bool {
    match policy {
        SelectionPolicy::Value => {
            let (old, new) = (incumbent.fitness(), candidate.fitness());
            new > old || (new == old && candidate.size() < incumbent.size())
        }
        SelectionPolicy::Prob => {
            let old = incumbent.fitness().value().max(0.0);
            let new = candidate.fitness().value().max(0.0);
            let total = old + new;
            if total > 0.0 && total.is_finite() {
                rng.gen_range(0.0..total) >= old
            } else {
                rng.gen_bool(0.5)
            }
        }
    }
}

/// Owns the grid, the area locks and the pool of individuals awaiting breeding.
///
/// Lock order is pool, then grid, then observer.
pub struct BreedingCoordinator {
    selection: SelectionPolicy,
    breeding: BreedingConfig,
    grid: PopulationGrid,
    area_lock: AreaLock,
    pool: Mutex<VecDeque<Arc<Individual>>>,
    factory: IndividualFactory,
    cancelled: AtomicBool,
}

impl BreedingCoordinator {
    pub fn new(
        config: &EngineConfig,
        grammars: GrammarSet,
        evaluator: Arc<dyn FitnessEvaluator>,
        observer: Arc<dyn GridObserver>,
    ) -> Self {
        let factory = IndividualFactory::new(
            config.manager_id,
            grammars,
            evaluator,
            config.breeding.min_children,
            config.breeding.max_children,
        );
        Self {
            selection: config.selection,
            breeding: config.breeding,
            grid: PopulationGrid::new(&config.grid, observer),
            area_lock: AreaLock::new(config.grid),
            pool: Mutex::new(VecDeque::new()),
            factory,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn grid(&self) -> &PopulationGrid {
        &self.grid
    }

    pub fn area_lock(&self) -> &AreaLock {
        &self.area_lock
    }

    pub fn factory(&self) -> &IndividualFactory {
        &self.factory
    }

    /// Number of individuals waiting in the pool.
    pub fn pool_len(&self) -> usize {
        lock(&self.pool).len()
    }

    /// Abort pending initial generation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Take the next pooled individual and lock its area.
    ///
    /// Returns `None` when the pool is empty, the area is busy or the
    /// individual died in the meantime.
    pub fn acquire_individual(&self) -> Option<LockedIndividual<'_>> {
        let individual = lock(&self.pool).pop_front()?;
        if self.area_lock.try_lock(&individual) && self.grid.contains(&individual) {
            trace!("Locked individual {individual}");
            Some(LockedIndividual {
                coordinator: self,
                individual,
            })
        } else {
            self.release_individual(&individual);
            None
        }
    }

    /// Return a live individual to the pool and drop its area lock.
    pub fn release_individual(&self, individual: &Arc<Individual>) {
        {
            let mut pool = lock(&self.pool);
            if self.grid.contains(individual) {
                pool.push_back(Arc::clone(individual));
            }
        }
        self.area_lock.unlock(individual);
    }

    /// Offer `candidate` to the cell at `pos` under the selection policy.
    ///
    /// The incumbent is read and replaced atomically; a winner joins the
    /// pool and the evicted loser leaves it.
    pub fn settle<R: Rng + ?Sized>(
        &self,
        pos: Position,
        candidate: Arc<Individual>,
        rng: &mut R,
    ) -> bool {
        let mut pool = lock(&self.pool);
        let placement = self.grid.offer(pos, Arc::clone(&candidate), |incumbent, new| {
            candidate_wins(self.selection, incumbent, new, rng)
        });
        match placement {
            Placement::Rejected => false,
            Placement::Settled { evicted } => {
                if let Some(old) = evicted {
                    pool.retain(|i| i.id() != old.id());
                }
                trace!("Settled individual {candidate}");
                pool.push_back(candidate);
                true
            }
        }
    }

    fn kill(&self, individual: &Individual) {
        let mut pool = lock(&self.pool);
        pool.retain(|i| i.id() != individual.id());
        self.grid.remove(individual);
    }

    /// Breed a locked parent: it either dies of old age or spreads children
    /// around its cell. Returns the number of children settled.
    pub fn reproduce_individual<R: Rng + ?Sized>(
        &self,
        parent: &Individual,
        rng: &mut R,
    ) -> Result<usize, GrammarError> {
        let Some(origin) = parent.position() else {
            return Ok(0);
        };
        if self.breeding.allow_dying && parent.has_to_die() {
            trace!("Individual {parent} dies");
            self.kill(parent);
            return Ok(0);
        }

        let area = self.area_lock.area(origin);
        let children = self.factory.reproduce(parent, area.size(), rng)?;
        let mut settled = 0;
        for child in children {
            let child = Arc::new(child);
            let equal = self.breeding.avoid_equal_fitness && child.fitness() == parent.fitness();
            let placed = (equal && self.settle(origin, Arc::clone(&child), rng))
                || (0..area.size()).any(|_| {
                    let pos = area.random_position(rng);
                    self.settle(pos, Arc::clone(&child), rng)
                });
            settled += usize::from(placed);
        }
        Ok(settled)
    }

    /// Remove every individual matching `predicate` from a quiescent grid.
    ///
    /// Pauses the area locks and waits up to [`FILTER_DRAIN_TIMEOUT`] for
    /// in-flight reproductions. Returns `false` if filtering was skipped.
    pub fn filter_individuals<F>(&self, predicate: F) -> bool
    where
        F: Fn(&Individual) -> bool + Sync,
    {
        self.area_lock.pause();
        let drained = self.area_lock.wait_until_paused(FILTER_DRAIN_TIMEOUT);
        if drained {
            let mut pool = lock(&self.pool);
            let doomed: Vec<Arc<Individual>> = self
                .grid
                .individuals()
                .into_par_iter()
                .filter(|i| predicate(i))
                .collect();
            for individual in &doomed {
                self.grid.remove(individual);
            }
            pool.retain(|i| !doomed.iter().any(|d| d.id() == i.id()));
            debug!("Filtered out {} individuals", doomed.len());
        } else {
            warn!("Area locks could not be drained, filtering is skipped");
        }
        self.area_lock.resume();
        drained
    }

    /// Seed `count` random individuals at random cells and return how many
    /// were settled.
    ///
    /// Each seed retries random positions until its area can be locked, and
    /// stops early once cancelled. A seed that loses its cell to a fitter
    /// occupant is discarded.
    pub fn generate_initial<R: Rng + ?Sized>(
        &self,
        count: usize,
        rng: &mut R,
    ) -> Result<usize, GrammarError> {
        let (size_x, size_y) = (self.grid.size_x(), self.grid.size_y());
        let mut created = 0;
        for _ in 0..count {
            let individual = Arc::new(self.factory.random(rng)?);
            let pos = loop {
                if self.is_cancelled() {
                    return Ok(created);
                }
                let pos = Position::new(rng.gen_range(0..size_x), rng.gen_range(0..size_y));
                individual.set_position(pos);
                if self.area_lock.try_lock(&individual) {
                    break pos;
                }
                thread::yield_now();
            };
            if self.settle(pos, Arc::clone(&individual), rng) {
                created += 1;
            }
            self.area_lock.unlock(&individual);
        }
        debug!("Settled {created} of {count} initial individuals");
        Ok(created)
    }
}

/// An individual whose area is locked; released back to the pool on drop.
pub struct LockedIndividual<'a> {
    coordinator: &'a BreedingCoordinator,
    individual: Arc<Individual>,
}

impl Deref for LockedIndividual<'_> {
    type Target = Arc<Individual>;

    fn deref(&self) -> &Self::Target {
        &self.individual
    }
}

impl Drop for LockedIndividual<'_> {
    fn drop(&mut self) {
        self.coordinator.release_individual(&self.individual);
    }
}
