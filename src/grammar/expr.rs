//! Expression trees built from grammar productions.

use std::fmt;
use std::sync::Arc;

use super::entry::TerminalKind;
use super::production::{EntryId, Production};
use super::template::{PREC_ATOM, format_number};

/// Leaf value of an expression tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Terminal {
    /// Zero-based input variable index.
    Var(usize),
    Num(f64),
    Bool(bool),
}

impl Terminal {
    pub fn kind(self) -> TerminalKind {
        match self {
            Self::Var(_) => TerminalKind::Variable,
            Self::Num(_) => TerminalKind::Constant,
            Self::Bool(_) => TerminalKind::Boolean,
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(idx) => write!(f, "x[{idx}]"),
            Self::Num(value) => f.write_str(&format_number(*value)),
            Self::Bool(value) => write!(f, "{value}"),
        }
    }
}

/// An expression tree node. Trees are immutable once built; mutation
/// produces a new tree.
#[derive(Debug, Clone)]
pub enum Expr {
    Term(Terminal),
    Funct {
        prod: Arc<Production>,
        children: Vec<Expr>,
        size: usize,
    },
}

/// Location of a node inside a tree, as produced by [`Expr::nodes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    /// Child indices from the root.
    pub path: Vec<usize>,
    /// Factor by which this node's size counts toward the root size.
    pub multiplier: usize,
    pub size: usize,
    pub terminal: bool,
}

impl Expr {
    /// Build a functional node, caching its size.
    pub fn funct(prod: Arc<Production>, children: Vec<Expr>) -> Self {
        let size = prod.node_size(children.iter().map(Expr::size));
        Self::Funct {
            prod,
            children,
            size,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        match self {
            Self::Term(_) => 1,
            Self::Funct { size, .. } => *size,
        }
    }

    /// Entry this node belongs to.
    pub fn entry(&self) -> EntryId {
        match self {
            Self::Term(terminal) => terminal.kind().entry_id(),
            Self::Funct { prod, .. } => prod.entry,
        }
    }

    pub fn production(&self) -> Option<&Arc<Production>> {
        match self {
            Self::Term(_) => None,
            Self::Funct { prod, .. } => Some(prod),
        }
    }

    pub fn children(&self) -> &[Expr] {
        match self {
            Self::Term(_) => &[],
            Self::Funct { children, .. } => children,
        }
    }

    /// Leaves, argument-free productions and placements of a leaf.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Term(_) => true,
            Self::Funct { prod, children, .. } => {
                prod.args.is_empty()
                    || (prod.is_placement() && children.first().is_some_and(Expr::is_terminal))
            }
        }
    }

    /// Every node in pre-order.
    pub fn nodes(&self) -> Vec<NodeRef> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.collect_nodes(&mut path, 1, &mut out);
        out
    }

    fn collect_nodes(&self, path: &mut Vec<usize>, multiplier: usize, out: &mut Vec<NodeRef>) {
        out.push(NodeRef {
            path: path.clone(),
            multiplier,
            size: self.size(),
            terminal: self.is_terminal(),
        });
        if let Self::Funct { prod, children, .. } = self {
            for (idx, child) in children.iter().enumerate() {
                let occ = prod.occurrences.get(idx).copied().unwrap_or(1);
                path.push(idx);
                child.collect_nodes(path, multiplier * occ, out);
                path.pop();
            }
        }
    }

    pub fn node_at(&self, path: &[usize]) -> Option<&Expr> {
        match path.split_first() {
            None => Some(self),
            Some((&idx, rest)) => self.children().get(idx)?.node_at(rest),
        }
    }

    /// Swap the node at `path` for `node`, refreshing cached sizes on the way up.
    /// Returns `false` if the path does not exist.
    pub fn replace_at(&mut self, path: &[usize], node: Expr) -> bool {
        let Some((&idx, rest)) = path.split_first() else {
            *self = node;
            return true;
        };
        match self {
            Self::Term(_) => false,
            Self::Funct {
                prod,
                children,
                size,
            } => {
                let Some(child) = children.get_mut(idx) else {
                    return false;
                };
                if !child.replace_at(rest, node) {
                    return false;
                }
                *size = prod.node_size(children.iter().map(Expr::size));
                true
            }
        }
    }

    /// Text of the expression and the precedence of its outermost operator.
    pub fn render(&self) -> (String, u8) {
        match self {
            Self::Term(terminal) => (terminal.to_string(), PREC_ATOM),
            Self::Funct { prod, children, .. } => {
                let args: Vec<_> = children.iter().map(Expr::render).collect();
                prod.template.render(&args)
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render().0)
    }
}
