//! Neighbourhood locking.
//!
//! A worker owns the area around the individual it is breeding. Two areas
//! conflict when their centres lie within twice the spread on both axes, so
//! every cell a child can land in belongs to one worker at a time.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use super::individual::{Individual, Position};
use super::lock;
use crate::schema::GridConfig;

/// Inclusive rectangle of cells clipped to the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Area {
    pub min_x: usize,
    pub max_x: usize,
    pub min_y: usize,
    pub max_y: usize,
}

impl Area {
    /// Number of cells in the area.
    pub fn size(&self) -> usize {
        (self.max_x - self.min_x + 1) * (self.max_y - self.min_y + 1)
    }

    pub fn contains(&self, pos: Position) -> bool {
        (self.min_x..=self.max_x).contains(&pos.x) && (self.min_y..=self.max_y).contains(&pos.y)
    }

    /// Uniformly random cell of the area.
    pub fn random_position<R: Rng + ?Sized>(&self, rng: &mut R) -> Position {
        Position::new(
            rng.gen_range(self.min_x..=self.max_x),
            rng.gen_range(self.min_y..=self.max_y),
        )
    }
}

#[derive(Debug, Default)]
struct LockState {
    held: HashMap<u64, Position>,
    paused: bool,
}

/// Registry of locked areas keyed by individual id.
#[derive(Debug)]
pub struct AreaLock {
    grid: GridConfig,
    state: Mutex<LockState>,
    released: Condvar,
}

impl AreaLock {
    pub fn new(grid: GridConfig) -> Self {
        Self {
            grid,
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    /// Area around `pos`, clipped to the grid.
    pub fn area(&self, pos: Position) -> Area {
        let GridConfig {
            size_x,
            size_y,
            spread_x,
            spread_y,
        } = self.grid;
        Area {
            min_x: pos.x.saturating_sub(spread_x),
            max_x: (pos.x + spread_x).min(size_x - 1),
            min_y: pos.y.saturating_sub(spread_y),
            max_y: (pos.y + spread_y).min(size_y - 1),
        }
    }

    fn conflicts(&self, a: Position, b: Position) -> bool {
        a.x.abs_diff(b.x) <= 2 * self.grid.spread_x && a.y.abs_diff(b.y) <= 2 * self.grid.spread_y
    }

    /// Lock the area around the individual's position.
    ///
    /// Fails when paused, when the individual is unplaced or already holds a
    /// lock, or when the area overlaps a held one.
    pub fn try_lock(&self, individual: &Individual) -> bool {
        let Some(pos) = individual.position() else {
            return false;
        };
        let mut state = lock(&self.state);
        if state.paused || state.held.contains_key(&individual.id()) {
            return false;
        }
        if state.held.values().any(|&other| self.conflicts(pos, other)) {
            return false;
        }
        state.held.insert(individual.id(), pos);
        true
    }

    /// Release the individual's lock. Releasing an unheld lock is a no-op.
    pub fn unlock(&self, individual: &Individual) {
        let mut state = lock(&self.state);
        if state.held.remove(&individual.id()).is_some() && state.held.is_empty() {
            self.released.notify_all();
        }
    }

    /// Refuse new locks until [`resume`](Self::resume).
    pub fn pause(&self) {
        lock(&self.state).paused = true;
    }

    pub fn resume(&self) {
        lock(&self.state).paused = false;
        self.released.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    /// Number of areas currently held.
    pub fn held(&self) -> usize {
        lock(&self.state).held.len()
    }

    /// Wait for every held lock to drain while paused.
    ///
    /// Returns `true` once no lock is held, `false` if resumed or timed out.
    pub fn wait_until_paused(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if !state.paused {
                return false;
            }
            if state.held.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.released.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
