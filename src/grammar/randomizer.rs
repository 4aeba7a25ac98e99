//! Weighted selection over productions.

use std::sync::Arc;

use rand::Rng;

use super::production::Production;

/// A set of productions sampled proportionally to their weights.
#[derive(Debug, Clone, Default)]
pub struct Randomizer {
    items: Vec<Arc<Production>>,
    /// Running weight sum; `bounds[i]` is the upper end of item `i`'s interval.
    bounds: Vec<f64>,
}

impl Randomizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, production: Arc<Production>) {
        let total = self.total() + production.weight;
        self.items.push(production);
        self.bounds.push(total);
    }

    pub fn total(&self) -> f64 {
        self.bounds.last().copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn contains(&self, production: &Production) -> bool {
        self.items.iter().any(|p| p.id == production.id)
    }

    pub fn items(&self) -> &[Arc<Production>] {
        &self.items
    }

    /// Draw a production; `None` only when empty.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Arc<Production>> {
        match self.items.len() {
            0 => None,
            1 => self.items.first(),
            _ => {
                let draw = rng.gen_range(0.0..self.total());
                let idx = self
                    .bounds
                    .iter()
                    .position(|&bound| draw < bound)
                    .unwrap_or(self.items.len() - 1);
                self.items.get(idx)
            }
        }
    }
}
