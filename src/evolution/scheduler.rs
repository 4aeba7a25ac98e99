//! Worker pool driving the evolution.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::EngineError;
use super::breeding::BreedingCoordinator;
use crate::compute::FitnessEvaluator;
use crate::grammar::GrammarSet;
use crate::grid::{GridObserver, Individual, lock};
use crate::schema::EngineConfig;

/// Invoked exactly once after the scheduler has stopped.
pub type CompletionCallback = Box<dyn FnOnce(&EvolutionScheduler) + Send>;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of a scheduler. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Stopping => "stopping",
            SchedulerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct Inner {
    config: EngineConfig,
    coordinator: BreedingCoordinator,
    observer: Arc<dyn GridObserver>,
    state: Mutex<SchedulerState>,
    state_changed: Condvar,
    reproductions: AtomicU64,
    active_workers: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    callback: Mutex<Option<CompletionCallback>>,
}

/// Runs a fixed pool of worker threads that breed the population until the
/// global reproduction budget is spent or [`stop`](Self::stop) is called.
///
/// Cloning yields another handle to the same run.
#[derive(Clone)]
pub struct EvolutionScheduler {
    inner: Arc<Inner>,
}

impl EvolutionScheduler {
    /// Validate the configuration and compile the grammars.
    pub fn new(
        config: EngineConfig,
        evaluator: Arc<dyn FitnessEvaluator>,
        observer: Arc<dyn GridObserver>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let grammars = GrammarSet::new(&config.grammar, config.num_dofs)?;
        let coordinator =
            BreedingCoordinator::new(&config, grammars, evaluator, Arc::clone(&observer));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                coordinator,
                observer,
                state: Mutex::new(SchedulerState::Idle),
                state_changed: Condvar::new(),
                reproductions: AtomicU64::new(0),
                active_workers: AtomicUsize::new(0),
                handles: Mutex::new(Vec::new()),
                callback: Mutex::new(None),
            }),
        })
    }

    /// Register the completion callback, replacing any previous one.
    pub fn with_callback<F>(self, callback: F) -> Self
    where
        F: FnOnce(&EvolutionScheduler) + Send + 'static,
    {
        *lock(&self.inner.callback) = Some(Box::new(callback));
        self
    }

    pub fn manager_id(&self) -> u32 {
        self.inner.config.manager_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn coordinator(&self) -> &BreedingCoordinator {
        &self.inner.coordinator
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.inner.state)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            SchedulerState::Running | SchedulerState::Stopping
        )
    }

    /// Reproductions claimed so far.
    pub fn reproductions(&self) -> u64 {
        self.inner.reproductions.load(Ordering::Acquire)
    }

    /// Spawn the workers.
    pub fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = lock(&self.inner.state);
            if *state != SchedulerState::Idle {
                return Err(EngineError::AlreadyStarted(*state));
            }
            *state = SchedulerState::Running;
        }

        let workers = self.inner.config.process.num_workers;
        info!(
            "Manager {} starting {workers} workers, {} reproductions",
            self.manager_id(),
            self.inner.config.process.max_reproductions
        );
        self.inner.observer.start_observing();

        let mut handles = lock(&self.inner.handles);
        self.inner.active_workers.store(workers, Ordering::Release);
        for idx in 0..workers {
            let scheduler = self.clone();
            let spawned = thread::Builder::new()
                .name(format!("gp-worker-{}-{idx}", self.manager_id()))
                .spawn(move || scheduler.run_worker(idx));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.inner
                        .active_workers
                        .fetch_sub(workers - idx, Ordering::AcqRel);
                    drop(handles);
                    error!("Failed to spawn worker {idx}: {e}");
                    self.stop();
                    return Err(EngineError::Spawn(e));
                }
            }
        }
        Ok(())
    }

    /// Claim one unit of the global budget, if any is left.
    fn claim_reproduction(&self) -> bool {
        let max = self.inner.config.process.max_reproductions;
        self.inner
            .reproductions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    fn can_reproduce(&self) -> bool {
        self.reproductions() < self.inner.config.process.max_reproductions
    }

    fn run_worker(self, idx: usize) {
        let _active = ActiveWorker(self.clone());
        let name = thread::current().name().unwrap_or("gp-worker").to_owned();
        debug!("{name} started");

        let mut rng = StdRng::from_entropy();
        let coordinator = &self.inner.coordinator;
        let seeds = self.inner.config.initial_per_worker();
        if let Err(e) = coordinator.generate_initial(seeds, &mut rng) {
            error!("{name} failed generating initial population: {e}");
            return;
        }

        while self.can_reproduce() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.iterate(&mut rng)));
            match outcome {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    if coordinator.grid().population() == 0 {
                        warn!("{name}: population is extinct, finishing");
                        break;
                    }
                    thread::yield_now();
                }
                Ok(Err(e)) => error!("{name}: reproduction failed: {e}"),
                Err(payload) => error!("{name}: iteration panicked: {}", panic_message(&*payload)),
            }
        }
        debug!("{name} finished (worker {idx})");
    }

    /// One acquire/reproduce/release round. `Ok(false)` if nothing was acquired.
    fn iterate(&self, rng: &mut StdRng) -> Result<bool, EngineError> {
        let Some(parent) = self.inner.coordinator.acquire_individual() else {
            return Ok(false);
        };
        if self.claim_reproduction() {
            self.inner.coordinator.reproduce_individual(&parent, rng)?;
        }
        Ok(true)
    }

    /// Request shutdown. Idempotent; the first call wins.
    ///
    /// Returns immediately. Workers are joined on a helper thread, after which
    /// the observer is stopped and the completion callback runs.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                SchedulerState::Stopping | SchedulerState::Stopped => return,
                SchedulerState::Idle => {
                    *state = SchedulerState::Stopped;
                    drop(state);
                    self.inner.state_changed.notify_all();
                    self.finish();
                    return;
                }
                SchedulerState::Running => *state = SchedulerState::Stopping,
            }
        }

        info!("Manager {} stopping", self.manager_id());
        let max = self.inner.config.process.max_reproductions;
        self.inner.reproductions.fetch_max(max, Ordering::AcqRel);
        self.inner.coordinator.cancel();

        let scheduler = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("gp-stopper-{}", self.manager_id()))
            .spawn(move || scheduler.shutdown());
        if let Err(e) = spawned {
            error!("Failed to spawn shutdown thread, stopping inline: {e}");
            self.shutdown();
        }
    }

    fn shutdown(&self) {
        let timeout = Duration::from_millis(self.inner.config.process.shutdown_timeout_ms);
        let deadline = Instant::now() + timeout;
        let handles = std::mem::take(&mut *lock(&self.inner.handles));
        let current = thread::current().id();

        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL_INTERVAL);
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Worker terminated by panic");
                }
            } else {
                warn!(
                    "Worker {} did not finish within {timeout:?}, detaching",
                    handle.thread().name().unwrap_or("?")
                );
            }
        }

        *lock(&self.inner.state) = SchedulerState::Stopped;
        self.inner.state_changed.notify_all();
        info!(
            "Manager {} stopped after {} reproductions",
            self.manager_id(),
            self.reproductions()
        );
        self.finish();
    }

    fn finish(&self) {
        self.inner.observer.stop_observing();
        let callback = lock(&self.inner.callback).take();
        if let Some(callback) = callback
            && let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(self)))
        {
            error!("Completion callback panicked: {}", panic_message(&*payload));
        }
    }

    /// Block until stopped or `timeout` elapses. Returns `true` if stopped.
    pub fn wait_until_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.inner.state);
        while *state != SchedulerState::Stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.inner.state_changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Best individuals reported by the observer.
    pub fn best_fit_individuals(&self) -> Vec<Arc<Individual>> {
        self.inner.observer.best_fit_individuals()
    }

    /// Remove matching individuals; see [`BreedingCoordinator::filter_individuals`].
    pub fn filter_individuals<F>(&self, predicate: F) -> bool
    where
        F: Fn(&Individual) -> bool + Sync,
    {
        self.inner.coordinator.filter_individuals(predicate)
    }
}

impl fmt::Debug for EvolutionScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvolutionScheduler")
            .field("manager_id", &self.manager_id())
            .field("state", &self.state())
            .field("reproductions", &self.reproductions())
            .finish()
    }
}

/// Counts a live worker; the last one out requests the stop.
struct ActiveWorker(EvolutionScheduler);

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        if self.0.inner.active_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.stop();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{Fitness, FitnessError, RegressionFitness, Sample};
    use crate::grammar::Expr;
    use crate::grid::{BestFitObserver, NullObserver};
    use crate::schema::GridConfig;

    fn config(max_reproductions: u64, num_workers: usize) -> EngineConfig {
        let mut config = EngineConfig {
            grid: GridConfig {
                size_x: 12,
                size_y: 12,
                spread_x: 1,
                spread_y: 1,
            },
            ..EngineConfig::default()
        };
        config.process.max_reproductions = max_reproductions;
        config.process.num_workers = num_workers;
        config.process.shutdown_timeout_ms = 2000;
        config
    }

    fn constant(_: u32, _: &[Expr]) -> Result<Fitness, FitnessError> {
        Ok(Fitness::new(0.5))
    }

    #[test]
    fn test_runs_to_budget_and_calls_back_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut config = config(300, 4);
        config.breeding.allow_dying = false;
        let scheduler = EvolutionScheduler::new(
            config,
            Arc::new(constant),
            Arc::new(BestFitObserver::new()),
        )
        .unwrap()
        .with_callback(move |s| {
            assert_eq!(s.state(), SchedulerState::Stopped);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.start().unwrap();
        assert!(scheduler.wait_until_stopped(Duration::from_secs(60)));
        assert_eq!(scheduler.reproductions(), 300);
        assert!(!scheduler.is_active());

        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.best_fit_individuals().is_empty());
    }

    #[test]
    fn test_claims_never_exceed_budget() {
        let scheduler =
            EvolutionScheduler::new(config(50, 1), Arc::new(constant), Arc::new(NullObserver))
                .unwrap();
        let granted = Arc::new(AtomicUsize::new(0));
        let claimers: Vec<_> = (0..16)
            .map(|_| {
                let scheduler = scheduler.clone();
                let granted = Arc::clone(&granted);
                thread::spawn(move || {
                    for _ in 0..100 {
                        if scheduler.claim_reproduction() {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for claimer in claimers {
            claimer.join().unwrap();
        }
        assert_eq!(granted.load(Ordering::SeqCst), 50);
        assert_eq!(scheduler.reproductions(), 50);
    }

    #[test]
    fn test_workers_breed_at_most_budget() {
        let evaluations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evaluations);
        let evaluator = move |_: u32, _: &[Expr]| -> Result<Fitness, FitnessError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Fitness::new(0.5))
        };
        let mut config = config(20, 8);
        config.breeding.allow_dying = false;
        config.breeding.min_children = 1;
        config.breeding.max_children = 1;
        let seeds = config.initial_per_worker() * config.process.num_workers;

        let scheduler =
            EvolutionScheduler::new(config, Arc::new(evaluator), Arc::new(NullObserver)).unwrap();
        scheduler.start().unwrap();
        assert!(scheduler.wait_until_stopped(Duration::from_secs(60)));

        // One child per granted reproduction, on top of the seeds.
        let children = evaluations.load(Ordering::SeqCst).saturating_sub(seeds);
        assert!(children <= 20, "{children} children bred from a budget of 20");
    }

    #[test]
    fn test_concurrent_stop_calls_back_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let scheduler = EvolutionScheduler::new(
            config(u64::MAX, 2),
            Arc::new(constant),
            Arc::new(NullObserver),
        )
        .unwrap()
        .with_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.start().unwrap();

        let stoppers: Vec<_> = (0..8)
            .map(|_| {
                let scheduler = scheduler.clone();
                thread::spawn(move || scheduler.stop())
            })
            .collect();
        for stopper in stoppers {
            stopper.join().unwrap();
        }
        assert!(scheduler.wait_until_stopped(Duration::from_secs(30)));
        scheduler.stop();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.reproductions(), u64::MAX);
    }

    #[test]
    fn test_start_twice_fails() {
        let scheduler =
            EvolutionScheduler::new(config(10, 1), Arc::new(constant), Arc::new(NullObserver))
                .unwrap();
        scheduler.start().unwrap();
        assert!(matches!(
            scheduler.start(),
            Err(EngineError::AlreadyStarted(_))
        ));
        assert!(scheduler.wait_until_stopped(Duration::from_secs(30)));
    }

    #[test]
    fn test_stop_before_start() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let scheduler =
            EvolutionScheduler::new(config(10, 1), Arc::new(constant), Arc::new(NullObserver))
                .unwrap()
                .with_callback(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(scheduler.wait_until_stopped(Duration::ZERO));
        assert!(scheduler.start().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_evaluator_does_not_kill_workers() {
        let failing = |_: u32, _: &[Expr]| -> Result<Fitness, FitnessError> {
            Err(FitnessError::Custom("unavailable".into()))
        };
        let mut config = config(200, 2);
        config.breeding.allow_dying = false;
        let scheduler =
            EvolutionScheduler::new(config, Arc::new(failing), Arc::new(NullObserver)).unwrap();
        scheduler.start().unwrap();
        assert!(scheduler.wait_until_stopped(Duration::from_secs(60)));
        assert_eq!(scheduler.reproductions(), 200);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config(10, 1);
        config.process.num_workers = 0;
        let result = EvolutionScheduler::new(config, Arc::new(constant), Arc::new(NullObserver));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_regression_improves_on_seed() {
        let samples = (0..10)
            .map(|i| {
                let x = i as f64 / 2.0;
                Sample {
                    inputs: vec![x],
                    outputs: vec![x * x + 1.0],
                }
            })
            .collect();
        let evaluator = Arc::new(RegressionFitness::new(samples).unwrap());
        let observer = Arc::new(BestFitObserver::new());
        let mut config = config(3000, 4);
        config.grid.size_x = 16;
        config.grid.size_y = 16;
        config.breeding.allow_dying = false;
        let scheduler = EvolutionScheduler::new(config, evaluator.clone(), observer).unwrap();

        scheduler.start().unwrap();
        assert!(scheduler.wait_until_stopped(Duration::from_secs(120)));
        let best = scheduler.best_fit_individuals();
        assert!(!best.is_empty());
        let score = best[0].fitness();
        assert_eq!(
            evaluator.compute_fitness(0, best[0].exprs()).unwrap(),
            score
        );
        assert!(score.value() > 0.0);
    }
}
