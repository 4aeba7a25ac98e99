//! Individuals: expression vectors with cached fitness and a reproduction budget.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::error;
use rand::Rng;
use serde::Serialize;

use crate::compute::{Fitness, FitnessEvaluator};
use crate::grammar::{Expr, GrammarError, GrammarSet};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

const UNPLACED: usize = usize::MAX;

/// Grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Position {
    pub x: usize,
    pub y: usize,
}

impl Position {
    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

/// A candidate solution living on the grid.
pub struct Individual {
    id: u64,
    manager_id: u32,
    exprs: Vec<Expr>,
    fitness: Fitness,
    size: usize,
    pos_x: AtomicUsize,
    pos_y: AtomicUsize,
    children_left: AtomicUsize,
}

impl Individual {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn manager_id(&self) -> u32 {
        self.manager_id
    }

    /// One expression per output dimension.
    pub fn exprs(&self) -> &[Expr] {
        &self.exprs
    }

    pub fn fitness(&self) -> Fitness {
        self.fitness
    }

    /// Total size of all expressions.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current cell, `None` before the individual is first placed.
    pub fn position(&self) -> Option<Position> {
        let x = self.pos_x.load(Ordering::Acquire);
        let y = self.pos_y.load(Ordering::Acquire);
        (x != UNPLACED && y != UNPLACED).then_some(Position { x, y })
    }

    pub(crate) fn set_position(&self, position: Position) {
        self.pos_x.store(position.x, Ordering::Release);
        self.pos_y.store(position.y, Ordering::Release);
    }

    /// Children this individual may still produce.
    pub fn children_left(&self) -> usize {
        self.children_left.load(Ordering::Acquire)
    }

    /// `true` once the reproduction budget is spent.
    pub fn has_to_die(&self) -> bool {
        self.children_left() == 0
    }

    /// Spend one unit of the reproduction budget.
    fn take_child(&self) -> bool {
        self.children_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Serializable summary for reports.
    pub fn to_snapshot(&self) -> IndividualSnapshot {
        IndividualSnapshot {
            id: self.id,
            position: self.position(),
            fitness: self.fitness.value(),
            size: self.size,
            expressions: self.exprs.iter().map(ToString::to_string).collect(),
        }
    }
}

impl fmt::Debug for Individual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Individual")
            .field("id", &self.id)
            .field("fitness", &self.fitness)
            .field("size", &self.size)
            .field("position", &self.position())
            .finish()
    }
}

impl fmt::Display for Individual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, ", self.fitness)?;
        match self.position() {
            Some(pos) => write!(f, "({}, {})]", pos.x, pos.y),
            None => f.write_str("(unplaced)]"),
        }
    }
}

/// Report view of an individual.
#[derive(Debug, Clone, Serialize)]
pub struct IndividualSnapshot {
    pub id: u64,
    pub position: Option<Position>,
    pub fitness: f64,
    pub size: usize,
    pub expressions: Vec<String>,
}

/// Creates individuals: random seeds and mutated children.
///
/// Holds everything an individual needs at birth, so grammars and the
/// evaluator are passed around explicitly rather than looked up globally.
pub struct IndividualFactory {
    manager_id: u32,
    grammars: GrammarSet,
    evaluator: Arc<dyn FitnessEvaluator>,
    min_children: usize,
    max_children: usize,
}

impl IndividualFactory {
    pub fn new(
        manager_id: u32,
        grammars: GrammarSet,
        evaluator: Arc<dyn FitnessEvaluator>,
        min_children: usize,
        max_children: usize,
    ) -> Self {
        Self {
            manager_id,
            grammars,
            evaluator,
            min_children,
            max_children: max_children.max(min_children),
        }
    }

    pub fn grammars(&self) -> &GrammarSet {
        &self.grammars
    }

    /// Wrap expressions into an individual, evaluating its fitness.
    ///
    /// Evaluator failures are logged and yield [`Fitness::ZERO`].
    pub fn create(&self, exprs: Vec<Expr>) -> Individual {
        let fitness = match self.evaluator.compute_fitness(self.manager_id, &exprs) {
            Ok(fitness) => fitness,
            Err(e) => {
                error!("Failed computing fitness: {e}");
                Fitness::ZERO
            }
        };
        let budget = (fitness.value() * self.max_children as f64) as usize;
        let children = budget.clamp(self.min_children, self.max_children);

        Individual {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            manager_id: self.manager_id,
            size: exprs.iter().map(Expr::size).sum(),
            exprs,
            fitness,
            pos_x: AtomicUsize::new(UNPLACED),
            pos_y: AtomicUsize::new(UNPLACED),
            children_left: AtomicUsize::new(children),
        }
    }

    /// Fresh random individual.
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Individual, GrammarError> {
        Ok(self.create(self.grammars.generate(rng)?))
    }

    /// Up to `area_size` mutated children, spending the parent's budget.
    pub fn reproduce<R: Rng + ?Sized>(
        &self,
        parent: &Individual,
        area_size: usize,
        rng: &mut R,
    ) -> Result<Vec<Individual>, GrammarError> {
        let mut children = Vec::new();
        while children.len() < area_size && parent.take_child() {
            let exprs = self.grammars.mutate(parent.exprs(), rng)?;
            children.push(self.create(exprs));
        }
        Ok(children)
    }
}
