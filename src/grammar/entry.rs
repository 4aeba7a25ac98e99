//! Grammar entries and their size-indexed selectors.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::Rng;

use super::production::{EntryId, Production, SizeBound};
use super::randomizer::Randomizer;

/// Built-in terminal entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalKind {
    /// `V`: input variable index.
    Variable,
    /// `D`: numeric constant in [0, 1).
    Constant,
    /// `L`: boolean constant.
    Boolean,
}

impl TerminalKind {
    pub const ALL: [TerminalKind; 3] = [Self::Variable, Self::Constant, Self::Boolean];

    /// Reserved entry name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Variable => "V",
            Self::Constant => "D",
            Self::Boolean => "L",
        }
    }

    /// Entry id of the built-in entry; built-ins come first in every grammar.
    pub fn entry_id(self) -> EntryId {
        match self {
            Self::Variable => 0,
            Self::Constant => 1,
            Self::Boolean => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Terminal(TerminalKind),
    Functional,
}

/// A named grammar entry.
#[derive(Debug, Clone)]
pub struct GrammarEntry {
    pub(crate) name: String,
    pub(crate) kind: EntryKind,
    pub(crate) productions: Vec<Arc<Production>>,
    pub(crate) min_size: usize,
    pub(crate) max_size: SizeBound,
    /// Productions that can realize each subtree size.
    buckets: BTreeMap<usize, Randomizer>,
    /// Productions keyed by argument signature.
    signatures: HashMap<Vec<EntryId>, Randomizer>,
}

impl GrammarEntry {
    pub(crate) fn terminal(kind: TerminalKind) -> Self {
        Self {
            name: kind.name().to_string(),
            kind: EntryKind::Terminal(kind),
            productions: Vec::new(),
            min_size: 1,
            max_size: SizeBound::Finite(1),
            buckets: BTreeMap::new(),
            signatures: HashMap::new(),
        }
    }

    pub(crate) fn functional(name: String, productions: Vec<Arc<Production>>) -> Self {
        let min_size = productions.iter().map(|p| p.min_size).min().unwrap_or(1);
        let max_size = productions
            .iter()
            .map(|p| p.max_size)
            .max()
            .unwrap_or(SizeBound::Finite(1));
        let mut entry = Self {
            name,
            kind: EntryKind::Functional,
            productions,
            min_size,
            max_size,
            buckets: BTreeMap::new(),
            signatures: HashMap::new(),
        };
        entry.prepare();
        entry
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn terminal_kind(&self) -> Option<TerminalKind> {
        match self.kind {
            EntryKind::Terminal(kind) => Some(kind),
            EntryKind::Functional => None,
        }
    }

    pub fn productions(&self) -> &[Arc<Production>] {
        &self.productions
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> SizeBound {
        self.max_size
    }

    /// Smallest and largest bucket keys.
    pub fn bucket_range(&self) -> Option<(usize, usize)> {
        let (&lo, _) = self.buckets.first_key_value()?;
        let (&hi, _) = self.buckets.last_key_value()?;
        Some((lo, hi))
    }

    /// Build the size buckets and the signature index.
    fn prepare(&mut self) {
        self.buckets.clear();
        self.signatures.clear();

        let Some(min_key) = self.productions.iter().map(|p| p.min_size).min() else {
            return;
        };
        let mut max_key = self
            .productions
            .iter()
            .flat_map(|p| [Some(p.min_size), p.max_size.finite()])
            .flatten()
            .max()
            .unwrap_or(min_key);
        let unbounded: Vec<_> = self
            .productions
            .iter()
            .filter(|p| p.max_size.is_unbounded())
            .cloned()
            .collect();

        for production in &self.productions {
            self.buckets
                .entry(production.min_size)
                .or_default()
                .push(Arc::clone(production));
            self.signatures
                .entry(production.args.clone())
                .or_default()
                .push(Arc::clone(production));
        }

        // Recursive productions live in one extra bucket past every finite size.
        let last_finite = max_key;
        if !unbounded.is_empty() {
            max_key += 1;
            let top = self.buckets.entry(max_key).or_default();
            for production in unbounded {
                top.push(production);
            }
        }

        // Carry each production forward through every size it can still reach.
        for curr in min_key..last_finite {
            let next = curr + 1;
            let Some(bucket) = self.buckets.get(&curr) else {
                continue;
            };
            let existing = self.buckets.get(&next);
            let carried: Vec<_> = bucket
                .items()
                .iter()
                .filter(|p| p.max_size.admits(next))
                .filter(|p| existing.is_none_or(|b| !b.contains(p)))
                .cloned()
                .collect();
            if !carried.is_empty() {
                let target = self.buckets.entry(next).or_default();
                for production in carried {
                    target.push(production);
                }
            }
        }
    }

    /// Pick a production for a subtree of roughly `target` size.
    ///
    /// The target is clamped into the bucket range and lowered to the nearest
    /// populated bucket, so the result never needs more than `target` nodes
    /// unless `target` is below the entry minimum.
    pub fn choose<R: Rng + ?Sized>(&self, target: usize, rng: &mut R) -> Option<&Arc<Production>> {
        let (lo, hi) = self.bucket_range()?;
        let target = target.clamp(lo, hi);
        self.buckets
            .range(..=target)
            .next_back()
            .and_then(|(_, bucket)| bucket.sample(rng))
    }

    /// Pick a production with the given argument signature.
    pub fn choose_same_signature<R: Rng + ?Sized>(
        &self,
        args: &[EntryId],
        rng: &mut R,
    ) -> Option<&Arc<Production>> {
        self.signatures.get(args).and_then(|r| r.sample(rng))
    }

    #[cfg(test)]
    pub(crate) fn bucket(&self, size: usize) -> Option<&Randomizer> {
        self.buckets.get(&size)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::grammar::template::Template;

    fn production(id: usize, min: usize, max: SizeBound, weight: f64) -> Arc<Production> {
        Arc::new(Production {
            id,
            entry: 3,
            template: Template::parse(&format!("x1 + {id}")).unwrap(),
            args: vec![0],
            occurrences: vec![1],
            weight,
            min_size: min,
            max_size: max,
        })
    }

    fn ids(entry: &GrammarEntry, size: usize) -> Vec<usize> {
        let mut ids: Vec<_> = entry
            .bucket(size)
            .map(|b| b.items().iter().map(|p| p.id).collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_buckets_carry_forward() {
        let entry = GrammarEntry::functional(
            "R".into(),
            vec![
                production(0, 2, SizeBound::Finite(2), 1.0),
                production(1, 5, SizeBound::Finite(7), 1.0),
                production(2, 3, SizeBound::Unbounded, 1.0),
            ],
        );

        assert_eq!(entry.min_size(), 2);
        assert_eq!(entry.max_size(), SizeBound::Unbounded);
        assert_eq!(entry.bucket_range(), Some((2, 8)));
        assert_eq!(ids(&entry, 2), vec![0]);
        assert_eq!(ids(&entry, 3), vec![2]);
        assert_eq!(ids(&entry, 5), vec![1, 2]);
        assert_eq!(ids(&entry, 7), vec![1, 2]);
        // Top bucket holds each recursive production exactly once.
        assert_eq!(ids(&entry, 8), vec![2]);
    }

    #[test]
    fn test_choose_clamps_and_walks_down() {
        let entry = GrammarEntry::functional(
            "R".into(),
            vec![
                production(0, 2, SizeBound::Finite(2), 1.0),
                production(1, 5, SizeBound::Finite(7), 1.0),
            ],
        );
        let mut rng = StdRng::seed_from_u64(3);

        assert_eq!(entry.bucket_range(), Some((2, 7)));
        assert!(entry.bucket(3).is_none());
        for target in [0, 1, 2, 3, 4] {
            assert_eq!(entry.choose(target, &mut rng).unwrap().id, 0);
        }
        for target in [5, 6, 7, 100] {
            assert_eq!(entry.choose(target, &mut rng).unwrap().id, 1);
        }
    }

    #[test]
    fn test_terminal_entry_has_no_productions() {
        let entry = GrammarEntry::terminal(TerminalKind::Boolean);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(entry.name(), "L");
        assert_eq!(entry.min_size(), 1);
        assert!(entry.choose(5, &mut rng).is_none());
        assert_eq!(entry.terminal_kind(), Some(TerminalKind::Boolean));
    }

    #[test]
    fn test_same_signature() {
        let entry = GrammarEntry::functional(
            "R".into(),
            vec![
                production(0, 2, SizeBound::Finite(2), 1.0),
                production(1, 2, SizeBound::Finite(2), 1.0),
            ],
        );
        let mut rng = StdRng::seed_from_u64(9);
        assert!(entry.choose_same_signature(&[0], &mut rng).is_some());
        assert!(entry.choose_same_signature(&[1], &mut rng).is_none());
    }
}
