//! Grammar productions and their size bounds.

use std::fmt;

use super::template::Template;

/// Index of an entry inside its grammar.
pub type EntryId = usize;

/// Upper bound on the size of a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeBound {
    Finite(usize),
    /// Reachable through recursion.
    Unbounded,
}

impl SizeBound {
    #[inline]
    pub fn is_unbounded(self) -> bool {
        matches!(self, Self::Unbounded)
    }

    #[inline]
    pub fn finite(self) -> Option<usize> {
        match self {
            Self::Finite(size) => Some(size),
            Self::Unbounded => None,
        }
    }

    /// `true` when a subtree of `size` fits under this bound.
    #[inline]
    pub fn admits(self, size: usize) -> bool {
        match self {
            Self::Finite(max) => size <= max,
            Self::Unbounded => true,
        }
    }

    /// `self + count * other`, saturating to `Unbounded`.
    pub fn add_scaled(self, other: SizeBound, count: usize) -> SizeBound {
        match (self, other) {
            (Self::Finite(a), Self::Finite(b)) => b
                .checked_mul(count)
                .and_then(|scaled| a.checked_add(scaled))
                .map_or(Self::Unbounded, Self::Finite),
            _ => Self::Unbounded,
        }
    }
}

impl fmt::Display for SizeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finite(size) => write!(f, "{size}"),
            Self::Unbounded => f.write_str("unbounded"),
        }
    }
}

/// One weighted alternative of a functional grammar entry.
///
/// The size of a node built from a production is its expanded size: one for
/// the node plus each child's size times the number of times the child's
/// placeholder occurs in the template.
#[derive(Debug, Clone)]
pub struct Production {
    pub(crate) id: usize,
    pub(crate) entry: EntryId,
    pub(crate) template: Template,
    pub(crate) args: Vec<EntryId>,
    pub(crate) occurrences: Vec<usize>,
    pub(crate) weight: f64,
    pub(crate) min_size: usize,
    pub(crate) max_size: SizeBound,
}

impl Production {
    /// Grammar-wide unique identifier.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Entry this production belongs to.
    pub fn entry(&self) -> EntryId {
        self.entry
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Argument entries, in placeholder order.
    pub fn args(&self) -> &[EntryId] {
        &self.args
    }

    /// Placeholder occurrence count per argument.
    pub fn occurrences(&self) -> &[usize] {
        &self.occurrences
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> SizeBound {
        self.max_size
    }

    /// `[x1](E)`: forwards to a single argument.
    pub fn is_placement(&self) -> bool {
        self.args.len() == 1 && self.template.is_placement()
    }

    /// Size of a node built from this production over children of the given sizes.
    pub fn node_size(&self, child_sizes: impl IntoIterator<Item = usize>) -> usize {
        1 + self
            .occurrences
            .iter()
            .zip(child_sizes)
            .map(|(occ, size)| occ * size)
            .sum::<usize>()
    }
}
