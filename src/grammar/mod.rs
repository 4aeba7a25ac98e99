//! Grammar-driven expression engine.
//!
//! A grammar is a set of named entries, each a weighted list of productions
//! `[template](ARG, ...)`. The engine computes the smallest and largest
//! subtree every entry can produce, indexes productions by size, and uses
//! those indices to generate and mutate trees that stay inside a size budget.
//!
//! # Grammar text
//!
//! ```text
//! // comment
//! R := [x1 + x2](R, R) ; [$sin(x1)](R) @ 0.5 ; [x1](V) @ 2.0 ; [x1](D)
//! B := [x1 < x2](R, R) ; [x1](L)
//! ```
//!
//! `V`, `D` and `L` are built-in terminal entries (input variable, numeric
//! constant in [0, 1), boolean constant). `R` is the mandatory root entry.

mod entry;
mod expr;
mod production;
mod randomizer;
pub mod template;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use rand::Rng;

use crate::schema::{ConfigError, GrammarConfig};

pub use entry::{EntryKind, GrammarEntry, TerminalKind};
pub use expr::{Expr, NodeRef, Terminal};
pub use production::{EntryId, Production, SizeBound};
pub use randomizer::Randomizer;
pub use template::{Template, TemplateError};

/// Name of the mandatory root entry.
pub const ROOT_ENTRY: &str = "R";

/// Grammar construction and expression errors.
#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    #[error("Line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("Line {line}: invalid template: {source}")]
    Template { line: usize, source: TemplateError },
    #[error("Entry '{0}' is defined more than once")]
    DuplicateEntry(String),
    #[error("Entry '{0}' has no productions")]
    EmptyEntry(String),
    #[error("Entry '{0}' is a built-in terminal and cannot be redefined")]
    ReservedEntry(String),
    #[error("Missing mandatory root entry 'R'")]
    MissingRoot,
    #[error("Entry '{entry}' references undefined entry '{referenced}'")]
    UndefinedEntry { entry: String, referenced: String },
    #[error("Entry '{entry}' has invalid production weight {weight}")]
    InvalidWeight { entry: String, weight: f64 },
    #[error("Production [{template}] of '{entry}' uses x{index} but declares {arity} argument(s)")]
    PlaceholderOutOfRange {
        entry: String,
        template: String,
        index: usize,
        arity: usize,
    },
    #[error("Production [{template}] of '{entry}' never uses argument x{index}")]
    UnusedArgument {
        entry: String,
        template: String,
        index: usize,
    },
    #[error("Recursion does not terminate for entries: {}", .0.join(", "))]
    NonTerminating(Vec<String>),
    #[error("Maximum tree size {max_tree_size} is below the grammar minimum {min_tree_size}")]
    TreeSizeTooSmall {
        max_tree_size: usize,
        min_tree_size: usize,
    },
    #[error("Expected {expected} expressions, got {found}")]
    DofMismatch { expected: usize, found: usize },
    #[error("Malformed expression: {0}")]
    MalformedExpression(String),
    #[error("Invalid grammar settings: {0}")]
    Config(#[from] ConfigError),
}

/// Production as written, with names resolved but sizes not yet known.
#[derive(Debug, Clone)]
struct Draft {
    template: Template,
    args: Vec<EntryId>,
    occurrences: Vec<usize>,
    weight: f64,
}

impl Draft {
    fn is_placement(&self) -> bool {
        self.args.len() == 1 && self.template.is_placement()
    }

    fn same_shape(&self, other: &Draft) -> bool {
        self.template == other.template && self.args == other.args
    }
}

struct RawProduction {
    template: Template,
    args: Vec<String>,
    weight: f64,
}

struct RawEntry {
    name: String,
    productions: Vec<RawProduction>,
}

/// A compiled grammar for one output dimension.
#[derive(Debug)]
pub struct Grammar {
    entries: Vec<GrammarEntry>,
    names: HashMap<String, EntryId>,
    root: EntryId,
    settings: GrammarConfig,
    min_tree_size: usize,
}

impl Grammar {
    /// Compile grammar text with the given settings.
    pub fn new(text: &str, settings: &GrammarConfig) -> Result<Self, GrammarError> {
        settings.validate()?;

        let raw = parse_text(text)?;

        let mut names: HashMap<String, EntryId> = TerminalKind::ALL
            .iter()
            .map(|kind| (kind.name().to_string(), kind.entry_id()))
            .collect();
        let mut entry_names: Vec<String> = TerminalKind::ALL
            .iter()
            .map(|kind| kind.name().to_string())
            .collect();
        for entry in &raw {
            names.insert(entry.name.clone(), entry_names.len());
            entry_names.push(entry.name.clone());
        }
        let root = *names.get(ROOT_ENTRY).ok_or(GrammarError::MissingRoot)?;

        let mut drafts: Vec<Vec<Draft>> = vec![Vec::new(); entry_names.len()];
        for (offset, entry) in raw.into_iter().enumerate() {
            let id = TerminalKind::ALL.len() + offset;
            drafts[id] = resolve_entry(entry, &names)?;
        }

        if settings.propagate_placements {
            propagate_placements(&mut drafts, settings.max_grammar_depth);
        }

        let mins = compute_min_sizes(&drafts, &entry_names, settings.max_grammar_depth)?;
        let maxs = compute_max_sizes(&drafts);

        let mut next_id = 0;
        let mut entries: Vec<GrammarEntry> = TerminalKind::ALL
            .iter()
            .map(|kind| GrammarEntry::terminal(*kind))
            .collect();
        for (id, entry_drafts) in drafts.into_iter().enumerate().skip(TerminalKind::ALL.len()) {
            let productions = entry_drafts
                .into_iter()
                .map(|draft| {
                    let min_size = production_min(&draft, &mins).unwrap_or(usize::MAX);
                    let max_size = production_max(&draft, &maxs);
                    let production = Production {
                        id: next_id,
                        entry: id,
                        template: draft.template,
                        args: draft.args,
                        occurrences: draft.occurrences,
                        weight: draft.weight,
                        min_size,
                        max_size,
                    };
                    next_id += 1;
                    Arc::new(production)
                })
                .collect();
            let entry = GrammarEntry::functional(entry_names[id].clone(), productions);
            debug!(
                "Entry {}: {} production(s), size {}..{}",
                entry.name(),
                entry.productions().len(),
                entry.min_size(),
                entry.max_size()
            );
            entries.push(entry);
        }

        let min_tree_size = entries[root].min_size();
        if min_tree_size > settings.max_tree_size {
            return Err(GrammarError::TreeSizeTooSmall {
                max_tree_size: settings.max_tree_size,
                min_tree_size,
            });
        }

        info!(
            "Grammar compiled: {} entries, {} productions, tree size {}..{}",
            entries.len(),
            next_id,
            min_tree_size,
            settings.max_tree_size
        );

        Ok(Self {
            entries,
            names,
            root,
            settings: settings.clone(),
            min_tree_size,
        })
    }

    pub fn entries(&self) -> &[GrammarEntry] {
        &self.entries
    }

    pub fn entry(&self, id: EntryId) -> Option<&GrammarEntry> {
        self.entries.get(id)
    }

    pub fn entry_id(&self, name: &str) -> Option<EntryId> {
        self.names.get(name).copied()
    }

    pub fn root(&self) -> EntryId {
        self.root
    }

    pub fn settings(&self) -> &GrammarConfig {
        &self.settings
    }

    /// Smallest tree the root entry can produce.
    pub fn min_tree_size(&self) -> usize {
        self.min_tree_size
    }

    pub fn max_tree_size(&self) -> usize {
        self.settings.max_tree_size
    }

    fn entry_ref(&self, id: EntryId) -> Result<&GrammarEntry, GrammarError> {
        self.entries
            .get(id)
            .ok_or_else(|| GrammarError::MalformedExpression(format!("unknown entry id {id}")))
    }

    /// Pick a production of `entry` for a subtree of about `target` size.
    pub fn choose<R: Rng + ?Sized>(
        &self,
        entry: EntryId,
        target: usize,
        rng: &mut R,
    ) -> Option<&Arc<Production>> {
        self.entries.get(entry)?.choose(target, rng)
    }

    /// Fresh random value for a terminal entry.
    pub fn random_terminal<R: Rng + ?Sized>(&self, kind: TerminalKind, rng: &mut R) -> Terminal {
        match kind {
            TerminalKind::Variable => Terminal::Var(rng.gen_range(0..self.settings.num_vars)),
            TerminalKind::Constant => Terminal::Num(rng.r#gen::<f64>()),
            TerminalKind::Boolean => Terminal::Bool(rng.r#gen::<bool>()),
        }
    }

    /// Build a subtree of `entry` of at most `budget` size (or the entry minimum).
    pub fn grow<R: Rng + ?Sized>(
        &self,
        entry: EntryId,
        budget: usize,
        rng: &mut R,
    ) -> Result<Expr, GrammarError> {
        let grammar_entry = self.entry_ref(entry)?;
        if let Some(kind) = grammar_entry.terminal_kind() {
            return Ok(Expr::Term(self.random_terminal(kind, rng)));
        }
        let production = grammar_entry
            .choose(budget, rng)
            .ok_or_else(|| GrammarError::EmptyEntry(grammar_entry.name().to_string()))?;
        self.materialize(production, budget, rng)
    }

    /// Expand `production` into a node whose size is at most
    /// `max(budget, production.min_size())`.
    ///
    /// Every argument starts at its entry minimum; the leftover budget is
    /// handed out one unit at a time, round-robin, each unit costing the
    /// argument's occurrence count and never exceeding the entry maximum.
    pub fn materialize<R: Rng + ?Sized>(
        &self,
        production: &Arc<Production>,
        budget: usize,
        rng: &mut R,
    ) -> Result<Expr, GrammarError> {
        let budget = budget.max(production.min_size);
        let mut remaining = budget - 1;

        let mut sizes = Vec::with_capacity(production.args.len());
        for (&arg, &occ) in production.args.iter().zip(&production.occurrences) {
            let min = self.entry_ref(arg)?.min_size();
            remaining = remaining.saturating_sub(min * occ);
            sizes.push(min);
        }

        loop {
            let mut progress = false;
            for (idx, (&arg, &occ)) in production
                .args
                .iter()
                .zip(&production.occurrences)
                .enumerate()
            {
                let cost = occ.max(1);
                if remaining >= cost && self.entries[arg].max_size().admits(sizes[idx] + 1) {
                    sizes[idx] += 1;
                    remaining -= cost;
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }

        let children = production
            .args
            .iter()
            .zip(sizes)
            .map(|(&arg, size)| self.grow(arg, size, rng))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Expr::funct(Arc::clone(production), children))
    }

    /// Random tree with size uniform in `[min_tree_size, max_tree_size]`.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Expr, GrammarError> {
        let min = self.min_tree_size;
        let max = self.settings.max_tree_size.max(min);
        let size = rng.gen_range(min..=max);
        let expr = self.grow(self.root, size, rng)?;
        trace!("Generated (target {size}, size {}): {expr}", expr.size());
        Ok(expr)
    }

    /// Mutated copy of `expr`. The input tree is left untouched.
    pub fn mutate<R: Rng + ?Sized>(&self, expr: &Expr, rng: &mut R) -> Result<Expr, GrammarError> {
        let mut tree = expr.clone();
        let nodes = tree.nodes();
        let (terminals, nonterminals): (Vec<&NodeRef>, Vec<&NodeRef>) =
            nodes.iter().partition(|node| node.terminal);

        let prefer_terminal = rng.gen_bool(self.settings.terminal_vs_nonterminal);
        let pool = if (prefer_terminal && !terminals.is_empty()) || nonterminals.is_empty() {
            &terminals
        } else {
            &nonterminals
        };
        let node = pool[rng.gen_range(0..pool.len())];
        let target = tree.node_at(&node.path).ok_or_else(|| {
            GrammarError::MalformedExpression(format!("no node at {:?}", node.path))
        })?;

        let replacement = if rng.gen_bool(self.settings.change_vs_replace) {
            self.change(tree.size(), node, target, rng)?
        } else {
            self.replace(tree.size(), node, target, rng)?
        };
        trace!("Mutating node {:?}: {target} -> {replacement}", node.path);

        tree.replace_at(&node.path, replacement);
        Ok(tree)
    }

    /// Same-shape change: swap the production keeping the children, or redraw a leaf.
    fn change<R: Rng + ?Sized>(
        &self,
        tree_size: usize,
        node: &NodeRef,
        target: &Expr,
        rng: &mut R,
    ) -> Result<Expr, GrammarError> {
        let (production, children) = match target {
            Expr::Term(terminal) => {
                return Ok(Expr::Term(self.random_terminal(terminal.kind(), rng)));
            }
            Expr::Funct { prod, children, .. } => (prod, children),
        };

        let entry = self.entry_ref(production.entry)?;
        let Some(candidate) = entry.choose_same_signature(&production.args, rng) else {
            return self.replace(tree_size, node, target, rng);
        };
        if candidate.template == production.template {
            return self.replace(tree_size, node, target, rng);
        }

        let changed = Expr::funct(Arc::clone(candidate), children.clone());
        let new_size = tree_size - node.multiplier * node.size + node.multiplier * changed.size();
        if new_size > self.settings.max_tree_size {
            return self.replace(tree_size, node, target, rng);
        }
        Ok(changed)
    }

    /// Regrow the subtree at `node` within the growth window and the tree budget.
    fn replace<R: Rng + ?Sized>(
        &self,
        tree_size: usize,
        node: &NodeRef,
        target: &Expr,
        rng: &mut R,
    ) -> Result<Expr, GrammarError> {
        if matches!(target, Expr::Term(_)) {
            return self.change(tree_size, node, target, rng);
        }

        let old = node.size as f64;
        let min = ((old * self.settings.min_node_grow).floor() as usize).max(1);
        let max = ((old * self.settings.max_node_grow).ceil() as usize).max(min);
        let others = tree_size.saturating_sub(node.multiplier * node.size);
        let room = self.settings.max_tree_size.saturating_sub(others) / node.multiplier.max(1);
        let size = rng.gen_range(min..=max).min(room);

        self.grow(target.entry(), size, rng)
    }

    /// Verify that `expr` is a well-formed root tree of this grammar.
    pub fn check(&self, expr: &Expr) -> Result<(), GrammarError> {
        if expr.entry() != self.root {
            return Err(GrammarError::MalformedExpression(format!(
                "root belongs to entry {} instead of {ROOT_ENTRY}",
                self.entry_name(expr.entry())
            )));
        }
        let size = expr.size();
        if size < self.min_tree_size || size > self.settings.max_tree_size {
            return Err(GrammarError::MalformedExpression(format!(
                "size {size} outside {}..={}",
                self.min_tree_size, self.settings.max_tree_size
            )));
        }
        self.check_node(expr)
    }

    fn entry_name(&self, id: EntryId) -> &str {
        self.entries.get(id).map_or("?", GrammarEntry::name)
    }

    fn check_node(&self, expr: &Expr) -> Result<(), GrammarError> {
        let (production, children, size) = match expr {
            Expr::Term(Terminal::Var(idx)) if *idx >= self.settings.num_vars => {
                return Err(GrammarError::MalformedExpression(format!(
                    "variable x[{idx}] out of range"
                )));
            }
            Expr::Term(_) => return Ok(()),
            Expr::Funct {
                prod,
                children,
                size,
            } => (prod, children, *size),
        };

        let entry = self.entry_ref(production.entry)?;
        let known = entry
            .productions()
            .iter()
            .any(|p| p.id == production.id && Arc::ptr_eq(p, production));
        if !known {
            return Err(GrammarError::MalformedExpression(format!(
                "production [{}] is not part of entry {}",
                production.template,
                entry.name()
            )));
        }
        if children.len() != production.args.len() {
            return Err(GrammarError::MalformedExpression(format!(
                "[{}] expects {} children, has {}",
                production.template,
                production.args.len(),
                children.len()
            )));
        }
        for (child, &arg) in children.iter().zip(&production.args) {
            if child.entry() != arg {
                return Err(GrammarError::MalformedExpression(format!(
                    "[{}] expects a {} child, got {}",
                    production.template,
                    self.entry_name(arg),
                    self.entry_name(child.entry())
                )));
            }
            self.check_node(child)?;
        }
        if production.node_size(children.iter().map(Expr::size)) != size {
            return Err(GrammarError::MalformedExpression(format!(
                "stale cached size {size} at [{}]",
                production.template
            )));
        }
        Ok(())
    }
}

fn parse_text(text: &str) -> Result<Vec<RawEntry>, GrammarError> {
    let mut entries: Vec<RawEntry> = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.find("//").map_or(line, |pos| &line[..pos]).trim();
        if line.is_empty() {
            continue;
        }

        let Some((name, body)) = line.split_once(":=") else {
            return Err(GrammarError::Syntax {
                line: line_no,
                message: "expected `NAME := productions`".into(),
            });
        };
        let name = name.trim();
        if !is_identifier(name) {
            return Err(GrammarError::Syntax {
                line: line_no,
                message: format!("invalid entry name '{name}'"),
            });
        }
        if TerminalKind::ALL.iter().any(|kind| kind.name() == name) {
            return Err(GrammarError::ReservedEntry(name.to_string()));
        }
        if entries.iter().any(|entry| entry.name == name) {
            return Err(GrammarError::DuplicateEntry(name.to_string()));
        }

        let productions = body
            .split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| parse_production(part, line_no))
            .collect::<Result<Vec<_>, _>>()?;
        if productions.is_empty() {
            return Err(GrammarError::EmptyEntry(name.to_string()));
        }

        entries.push(RawEntry {
            name: name.to_string(),
            productions,
        });
    }

    Ok(entries)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_production(text: &str, line: usize) -> Result<RawProduction, GrammarError> {
    let syntax = |message: &str| GrammarError::Syntax {
        line,
        message: format!("{message} in '{text}'"),
    };

    let rest = text
        .strip_prefix('[')
        .ok_or_else(|| syntax("production must look like [template](ARGS)"))?;
    let (template_text, rest) = rest
        .split_once(']')
        .ok_or_else(|| syntax("missing ']'"))?;
    let rest = rest
        .trim_start()
        .strip_prefix('(')
        .ok_or_else(|| syntax("missing argument list"))?;
    let (args_text, rest) = rest
        .split_once(')')
        .ok_or_else(|| syntax("missing ')'"))?;

    let args: Vec<String> = if args_text.trim().is_empty() {
        Vec::new()
    } else {
        args_text.split(',').map(|a| a.trim().to_string()).collect()
    };
    if args.iter().any(|a| !is_identifier(a)) {
        return Err(syntax("invalid argument list"));
    }

    let rest = rest.trim();
    let weight = if rest.is_empty() {
        1.0
    } else {
        rest.strip_prefix('@')
            .ok_or_else(|| syntax("expected '@ weight'"))?
            .trim()
            .parse::<f64>()
            .map_err(|_| syntax("invalid weight"))?
    };

    let template =
        Template::parse(template_text).map_err(|source| GrammarError::Template { line, source })?;

    Ok(RawProduction {
        template,
        args,
        weight,
    })
}

fn resolve_entry(
    entry: RawEntry,
    names: &HashMap<String, EntryId>,
) -> Result<Vec<Draft>, GrammarError> {
    let mut drafts = Vec::with_capacity(entry.productions.len());

    for production in entry.productions {
        if !(production.weight.is_finite() && production.weight > 0.0) {
            return Err(GrammarError::InvalidWeight {
                entry: entry.name.clone(),
                weight: production.weight,
            });
        }

        let args = production
            .args
            .iter()
            .map(|arg| {
                names
                    .get(arg)
                    .copied()
                    .ok_or_else(|| GrammarError::UndefinedEntry {
                        entry: entry.name.clone(),
                        referenced: arg.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(max_arg) = production.template.max_arg()
            && max_arg >= args.len()
        {
            return Err(GrammarError::PlaceholderOutOfRange {
                entry: entry.name.clone(),
                template: production.template.source().to_string(),
                index: max_arg + 1,
                arity: args.len(),
            });
        }

        let occurrences = production.template.occurrences(args.len());
        if let Some(unused) = occurrences.iter().position(|&occ| occ == 0) {
            return Err(GrammarError::UnusedArgument {
                entry: entry.name.clone(),
                template: production.template.source().to_string(),
                index: unused + 1,
            });
        }

        drafts.push(Draft {
            template: production.template,
            args,
            occurrences,
            weight: production.weight,
        });
    }

    Ok(drafts)
}

fn is_functional(id: EntryId) -> bool {
    id >= TerminalKind::ALL.len()
}

/// Inline `[x1](E)` productions: the placement is replaced by `E`'s own
/// productions, weighted by the placement weight. Placements of built-in
/// terminals and of the entry itself are kept.
fn propagate_placements(drafts: &mut [Vec<Draft>], max_rounds: usize) {
    for round in 0..max_rounds {
        let mut changed = false;

        for id in (0..drafts.len()).filter(|&id| is_functional(id)) {
            if !drafts[id]
                .iter()
                .any(|d| d.is_placement() && is_functional(d.args[0]) && d.args[0] != id)
            {
                continue;
            }

            let current = std::mem::take(&mut drafts[id]);
            let mut out: Vec<Draft> = Vec::with_capacity(current.len());
            for draft in current {
                let target = draft.args[0];
                if !(draft.is_placement() && is_functional(target) && target != id) {
                    out.push(draft);
                    continue;
                }
                for inlined in &drafts[target] {
                    // A placement back into the inlined entry would only re-add itself.
                    if inlined.is_placement() && inlined.args[0] == target {
                        continue;
                    }
                    let weight = draft.weight * inlined.weight;
                    match out.iter_mut().find(|d| d.same_shape(inlined)) {
                        Some(existing) => existing.weight += weight,
                        None => out.push(Draft {
                            weight,
                            ..inlined.clone()
                        }),
                    }
                }
            }
            drafts[id] = out;
            changed = true;
        }

        if !changed {
            debug!("Placement propagation converged after {round} round(s)");
            return;
        }
    }
    warn!("Placement propagation did not converge within {max_rounds} rounds");
}

fn production_min(draft: &Draft, mins: &[Option<usize>]) -> Option<usize> {
    draft
        .args
        .iter()
        .zip(&draft.occurrences)
        .try_fold(1usize, |acc, (&arg, &occ)| {
            mins[arg].map(|min| acc.saturating_add(min.saturating_mul(occ)))
        })
}

/// Least fixed point of `min(entry) = min over productions of 1 + sum(occ * min(arg))`.
fn compute_min_sizes(
    drafts: &[Vec<Draft>],
    names: &[String],
    max_rounds: usize,
) -> Result<Vec<Option<usize>>, GrammarError> {
    let mut mins: Vec<Option<usize>> = (0..drafts.len())
        .map(|id| if is_functional(id) { None } else { Some(1) })
        .collect();

    let mut converged = false;
    for _ in 0..max_rounds {
        let mut changed = false;
        for id in (0..drafts.len()).filter(|&id| is_functional(id)) {
            let best = drafts[id]
                .iter()
                .filter_map(|draft| production_min(draft, &mins))
                .min();
            if best.is_some() && best != mins[id] {
                mins[id] = best;
                changed = true;
            }
        }
        if !changed {
            converged = true;
            break;
        }
    }

    let stuck: Vec<String> = mins
        .iter()
        .enumerate()
        .filter(|(_, min)| min.is_none() || !converged)
        .filter(|(id, _)| is_functional(*id))
        .map(|(id, _)| names[id].clone())
        .collect();
    if !stuck.is_empty() {
        return Err(GrammarError::NonTerminating(stuck));
    }

    Ok(mins)
}

fn production_max(draft: &Draft, maxs: &[SizeBound]) -> SizeBound {
    draft
        .args
        .iter()
        .zip(&draft.occurrences)
        .fold(SizeBound::Finite(1), |acc, (&arg, &occ)| {
            acc.add_scaled(maxs[arg], occ)
        })
}

#[derive(Clone, Copy)]
enum Visit {
    Pending,
    Active,
    Done(SizeBound),
}

/// Largest subtree per entry; anything on a recursive cycle is unbounded.
fn compute_max_sizes(drafts: &[Vec<Draft>]) -> Vec<SizeBound> {
    fn visit(id: EntryId, drafts: &[Vec<Draft>], state: &mut [Visit]) -> SizeBound {
        if !is_functional(id) {
            return SizeBound::Finite(1);
        }
        match state[id] {
            Visit::Done(bound) => return bound,
            Visit::Active => return SizeBound::Unbounded,
            Visit::Pending => {}
        }
        state[id] = Visit::Active;
        let mut best = SizeBound::Finite(1);
        for draft in &drafts[id] {
            let mut bound = SizeBound::Finite(1);
            for (&arg, &occ) in draft.args.iter().zip(&draft.occurrences) {
                bound = bound.add_scaled(visit(arg, drafts, state), occ);
            }
            best = best.max(bound);
        }
        state[id] = Visit::Done(best);
        best
    }

    let mut state = vec![Visit::Pending; drafts.len()];
    (0..drafts.len())
        .map(|id| visit(id, drafts, &mut state))
        .collect()
}

/// One compiled grammar per output dimension.
#[derive(Debug, Clone)]
pub struct GrammarSet {
    grammars: Vec<Arc<Grammar>>,
}

impl GrammarSet {
    /// Compile the grammar of every output dimension.
    pub fn new(config: &GrammarConfig, num_dofs: usize) -> Result<Self, GrammarError> {
        let grammars = (0..num_dofs)
            .map(|dof| Grammar::new(config.text_for(dof), config).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { grammars })
    }

    pub fn from_grammars(grammars: Vec<Arc<Grammar>>) -> Self {
        Self { grammars }
    }

    pub fn len(&self) -> usize {
        self.grammars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grammars.is_empty()
    }

    pub fn get(&self, dof: usize) -> Option<&Arc<Grammar>> {
        self.grammars.get(dof)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Grammar>> {
        self.grammars.iter()
    }

    /// One random tree per dimension.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<Expr>, GrammarError> {
        self.grammars.iter().map(|g| g.generate(rng)).collect()
    }

    /// Mutate every dimension's tree with its own grammar.
    pub fn mutate<R: Rng + ?Sized>(
        &self,
        exprs: &[Expr],
        rng: &mut R,
    ) -> Result<Vec<Expr>, GrammarError> {
        if exprs.len() != self.grammars.len() {
            return Err(GrammarError::DofMismatch {
                expected: self.grammars.len(),
                found: exprs.len(),
            });
        }
        self.grammars
            .iter()
            .zip(exprs)
            .map(|(grammar, expr)| grammar.mutate(expr, rng))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::schema::DEFAULT_GRAMMAR;

    fn settings(max_tree_size: usize) -> GrammarConfig {
        GrammarConfig {
            max_tree_size,
            num_vars: 2,
            ..GrammarConfig::default()
        }
    }

    fn compile(text: &str) -> Result<Grammar, GrammarError> {
        Grammar::new(text, &settings(30))
    }

    fn entry<'a>(grammar: &'a Grammar, name: &str) -> &'a GrammarEntry {
        grammar.entry(grammar.entry_id(name).unwrap()).unwrap()
    }

    #[test]
    fn test_default_grammar_sizes() {
        let grammar = compile(DEFAULT_GRAMMAR).unwrap();
        assert_eq!(grammar.min_tree_size(), 2);
        assert_eq!(entry(&grammar, "R").min_size(), 2);
        assert_eq!(entry(&grammar, "B").min_size(), 2);
        assert_eq!(entry(&grammar, "R").max_size(), SizeBound::Unbounded);
        assert_eq!(entry(&grammar, "V").max_size(), SizeBound::Finite(1));
    }

    #[test]
    fn test_finite_sizes_with_occurrences() {
        let grammar = compile("R := [x1 * x1 + x2](A, V)\nA := [-x1](V) ; [x1](D)").unwrap();
        let a = entry(&grammar, "A");
        assert_eq!(a.min_size(), 2);
        assert_eq!(a.max_size(), SizeBound::Finite(2));
        let r = entry(&grammar, "R");
        assert_eq!(r.min_size(), 1 + 2 * 2 + 1);
        assert_eq!(r.max_size(), SizeBound::Finite(6));
    }

    #[test]
    fn test_comments_and_weights() {
        let grammar = compile(
            "// header\nR := [x1 + x2](V, V) @ 3 ; [x1](D) // trailing\n\n   // indented\n",
        )
        .unwrap();
        let weights: Vec<f64> = entry(&grammar, "R")
            .productions()
            .iter()
            .map(|p| p.weight())
            .collect();
        assert_eq!(weights, vec![3.0, 1.0]);
    }

    #[test]
    fn test_choose_follows_production_weights() {
        let grammar = compile("R := [x1](V) @ 1 ; [-x1](V) @ 3").unwrap();
        let heavy = entry(&grammar, "R").productions()[1].id();
        let mut rng = StdRng::seed_from_u64(19);

        let draws = 40_000;
        let hits = (0..draws)
            .filter(|_| grammar.choose(grammar.root(), 10, &mut rng).unwrap().id() == heavy)
            .count();
        let ratio = hits as f64 / draws as f64;
        assert!((ratio - 0.75).abs() < 0.02, "ratio = {ratio}");
    }

    #[test]
    fn test_construction_errors() {
        assert!(matches!(compile("A := [x1](V)"), Err(GrammarError::MissingRoot)));
        assert!(matches!(
            compile("R := [x1](V)\nR := [x1](D)"),
            Err(GrammarError::DuplicateEntry(name)) if name == "R"
        ));
        assert!(matches!(
            compile("R := ; ;"),
            Err(GrammarError::EmptyEntry(name)) if name == "R"
        ));
        assert!(matches!(
            compile("R := [x1](V)\nV := [x1](D)"),
            Err(GrammarError::ReservedEntry(_))
        ));
        assert!(matches!(
            compile("R := [x1](Q)"),
            Err(GrammarError::UndefinedEntry { referenced, .. }) if referenced == "Q"
        ));
        assert!(matches!(
            compile("R := x1 + 1"),
            Err(GrammarError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            compile("R := [x1](V)\nnot a rule"),
            Err(GrammarError::Syntax { line: 2, .. })
        ));
        assert!(matches!(
            compile("R := [x1](V) @ -2"),
            Err(GrammarError::InvalidWeight { .. })
        ));
        assert!(matches!(
            compile("R := [x1 + x3](V, V)"),
            Err(GrammarError::PlaceholderOutOfRange { index: 3, arity: 2, .. })
        ));
        assert!(matches!(
            compile("R := [x1 + 1](V, V)"),
            Err(GrammarError::UnusedArgument { index: 2, .. })
        ));
        assert!(matches!(
            compile("R := [x1 +](V)"),
            Err(GrammarError::Template { line: 1, .. })
        ));
    }

    #[test]
    fn test_non_terminating_recursion() {
        match compile("R := [x1 + 1](R) ; [-x1](A)\nA := [x1 * 2](R)") {
            Err(GrammarError::NonTerminating(names)) => {
                assert_eq!(names, vec!["R".to_string(), "A".to_string()]);
            }
            other => panic!("expected non-termination, got {other:?}"),
        }
    }

    #[test]
    fn test_slow_convergence_hits_depth_bound() {
        let text = "R := [x1](A)\nA := [x1](B)\nB := [x1](C)\nC := [x1](V)";
        let mut shallow = settings(30);
        shallow.max_grammar_depth = 2;
        assert!(matches!(
            Grammar::new(text, &shallow),
            Err(GrammarError::NonTerminating(_))
        ));
        assert_eq!(compile(text).unwrap().min_tree_size(), 5);
    }

    #[test]
    fn test_tree_size_too_small() {
        let result = Grammar::new("R := [x1 + x2](V, V)", &settings(2));
        assert!(matches!(
            result,
            Err(GrammarError::TreeSizeTooSmall {
                max_tree_size: 2,
                min_tree_size: 3
            })
        ));
    }

    #[test]
    fn test_invalid_settings() {
        let mut config = settings(10);
        config.max_node_grow = 0.1;
        assert!(matches!(
            Grammar::new(DEFAULT_GRAMMAR, &config),
            Err(GrammarError::Config(ConfigError::InvalidGrowth { .. }))
        ));
    }

    #[test]
    fn test_placement_propagation() {
        let text = "R := [x1](A) @ 2 ; [x1](V)\nA := [x1 + x2](V, V) @ 0.5 ; [-x1](V)";

        let plain = compile(text).unwrap();
        assert_eq!(entry(&plain, "R").productions().len(), 2);

        let mut config = settings(30);
        config.propagate_placements = true;
        let grammar = Grammar::new(text, &config).unwrap();
        let mut found: Vec<(String, f64)> = entry(&grammar, "R")
            .productions()
            .iter()
            .map(|p| (p.template().source().to_string(), p.weight()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            found,
            vec![
                ("-x1".to_string(), 2.0),
                ("x1".to_string(), 1.0),
                ("x1 + x2".to_string(), 1.0),
            ]
        );
        // The inlined entry itself is unchanged.
        assert_eq!(entry(&grammar, "A").productions().len(), 2);
    }

    #[test]
    fn test_cyclic_placements_converge() {
        let mut config = settings(30);
        config.propagate_placements = true;
        let grammar = Grammar::new("R := [x1](A) ; [x1 + 1](V)\nA := [x1](R) ; [-x1](V)", &config)
            .unwrap();
        assert!(
            entry(&grammar, "R")
                .productions()
                .iter()
                .all(|p| !(p.is_placement() && p.args()[0] == grammar.entry_id("A").unwrap()))
        );
    }

    #[test]
    fn test_generate_within_bounds() {
        let grammar = compile(DEFAULT_GRAMMAR).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let expr = grammar.generate(&mut rng).unwrap();
            grammar.check(&expr).unwrap();
        }
    }

    #[test]
    fn test_materialize_fills_budget_when_possible() {
        let grammar = compile("R := [x1 + x2](A, A) ; [x1](V)\nA := [x1 + x2](A, A) ; [x1](V)")
            .unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let root = grammar.entry_id("R").unwrap();
        let production = Arc::clone(&entry(&grammar, "R").productions()[0]);
        for budget in [5, 9, 13, 21] {
            let expr = grammar.materialize(&production, budget, &mut rng).unwrap();
            assert!(expr.size() <= budget);
            assert_eq!(expr.entry(), root);
        }
        // Budgets below the production minimum still yield the smallest node.
        let small = grammar.materialize(&production, 1, &mut rng).unwrap();
        assert_eq!(small.size(), 5);
    }

    #[test]
    fn test_mutate_leaves_original_untouched() {
        let grammar = compile(DEFAULT_GRAMMAR).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let original = grammar.generate(&mut rng).unwrap();
        let text = original.to_string();
        let size = original.size();

        let mut current = original.clone();
        for _ in 0..200 {
            current = grammar.mutate(&current, &mut rng).unwrap();
            grammar.check(&current).unwrap();
        }
        assert_eq!(original.to_string(), text);
        assert_eq!(original.size(), size);
    }

    #[test]
    fn test_change_only_mutation() {
        let mut config = settings(3);
        config.change_vs_replace = 1.0;
        config.terminal_vs_nonterminal = 0.0;
        let grammar = Grammar::new("R := [x1 + x2](V, V) ; [x1 - x2](V, V)", &config).unwrap();
        let mut rng = StdRng::seed_from_u64(13);
        let mut expr = grammar.generate(&mut rng).unwrap();
        let mut templates = std::collections::HashSet::new();
        for _ in 0..50 {
            expr = grammar.mutate(&expr, &mut rng).unwrap();
            grammar.check(&expr).unwrap();
            assert_eq!(expr.size(), 3);
            templates.insert(expr.production().unwrap().template().source().to_string());
        }
        assert_eq!(templates.len(), 2);
    }

    #[test]
    fn test_terminal_mutation_redraws_leaf() {
        let mut config = settings(2);
        config.num_vars = 50;
        config.terminal_vs_nonterminal = 1.0;
        let grammar = Grammar::new("R := [x1](V)", &config).unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        let expr = grammar.generate(&mut rng).unwrap();
        let seen: std::collections::HashSet<String> = (0..20)
            .map(|_| grammar.mutate(&expr, &mut rng).unwrap().to_string())
            .collect();
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_check_rejects_foreign_trees() {
        let grammar = compile(DEFAULT_GRAMMAR).unwrap();
        let other = compile(DEFAULT_GRAMMAR).unwrap();
        let mut rng = StdRng::seed_from_u64(23);
        let expr = other.generate(&mut rng).unwrap();
        assert!(matches!(
            grammar.check(&expr),
            Err(GrammarError::MalformedExpression(_))
        ));
        assert!(grammar.check(&Expr::Term(Terminal::Num(0.5))).is_err());
    }

    #[test]
    fn test_grammar_set() {
        let mut config = settings(20);
        config.per_dof = vec!["R := [x1](V)".into(), DEFAULT_GRAMMAR.into()];
        let set = GrammarSet::new(&config, 2).unwrap();
        assert_eq!(set.len(), 2);

        let mut rng = StdRng::seed_from_u64(29);
        let exprs = set.generate(&mut rng).unwrap();
        assert_eq!(exprs[0].size(), 2);
        let children = set.mutate(&exprs, &mut rng).unwrap();
        assert_eq!(children.len(), 2);
        for (grammar, expr) in set.iter().zip(&children) {
            grammar.check(expr).unwrap();
        }
        assert!(matches!(
            set.mutate(&exprs[..1], &mut rng),
            Err(GrammarError::DofMismatch { expected: 2, found: 1 })
        ));
    }

    proptest! {
        #[test]
        fn prop_generated_and_mutated_trees_stay_well_formed(
            seed in any::<u64>(),
            max_tree_size in 7usize..60,
            change_vs_replace in 0.0f64..=1.0,
        ) {
            let config = GrammarConfig {
                max_tree_size,
                change_vs_replace,
                num_vars: 3,
                ..GrammarConfig::default()
            };
            let grammar = Grammar::new(DEFAULT_GRAMMAR, &config).unwrap();
            let mut rng = StdRng::seed_from_u64(seed);

            let mut expr = grammar.generate(&mut rng).unwrap();
            prop_assert!(grammar.check(&expr).is_ok());
            for _ in 0..20 {
                expr = grammar.mutate(&expr, &mut rng).unwrap();
                prop_assert!(grammar.check(&expr).is_ok(), "{}", expr);
                prop_assert!(expr.size() <= max_tree_size);
                prop_assert!(expr.size() >= grammar.min_tree_size());
            }
        }
    }
}
