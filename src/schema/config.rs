//! Configuration types for the evolution engine.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Grammar used when a configuration does not provide one.
///
/// Numeric expressions over the input variables with a boolean branch entry.
pub const DEFAULT_GRAMMAR: &str = "\
// Numeric root entry
R := [x1 + x2](R, R) ; [x1 - x2](R, R) ; [x1 * x2](R, R) ; [x1 / x2](R, R) @ 0.5 ; \
[$sin(x1)](R) @ 0.5 ; [$cos(x1)](R) @ 0.5 ; [x1 ? x2 : x3](B, R, R) @ 0.2 ; \
[x1](V) @ 2.0 ; [x1](D)
// Boolean conditions
B := [x1 < x2](R, R) ; [x1 > x2](R, R) ; [x1](L) @ 0.2
";

fn default_num_dofs() -> usize {
    1
}

fn default_grid_size() -> usize {
    32
}

fn default_spread() -> usize {
    1
}

fn default_min_children() -> usize {
    1
}

fn default_max_children() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_init_pop_mult() -> f64 {
    0.5
}

fn default_num_workers() -> usize {
    4
}

fn default_max_reproductions() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_grammar_text() -> String {
    DEFAULT_GRAMMAR.to_string()
}

fn default_max_tree_size() -> usize {
    40
}

fn default_change_vs_replace() -> f64 {
    0.3
}

fn default_num_vars() -> usize {
    1
}

fn default_min_node_grow() -> f64 {
    0.5
}

fn default_max_node_grow() -> f64 {
    1.5
}

fn default_max_grammar_depth() -> usize {
    100
}

fn default_terminal_vs_nonterminal() -> f64 {
    0.2
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Identifier handed to the fitness evaluator and the completion callback.
    #[serde(default)]
    pub manager_id: u32,
    /// Number of expressions per individual (output dimensions).
    #[serde(default = "default_num_dofs")]
    pub num_dofs: usize,
    /// Grid dimensions and neighbourhood spread.
    #[serde(default)]
    pub grid: GridConfig,
    /// How a candidate competes with the incumbent of a cell.
    #[serde(default)]
    pub selection: SelectionPolicy,
    /// Reproduction budget and placement rules.
    #[serde(default)]
    pub breeding: BreedingConfig,
    /// Worker pool and run length.
    #[serde(default)]
    pub process: ProcessConfig,
    /// Expression grammar and mutation settings.
    #[serde(default)]
    pub grammar: GrammarConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            manager_id: 0,
            num_dofs: default_num_dofs(),
            grid: GridConfig::default(),
            selection: SelectionPolicy::default(),
            breeding: BreedingConfig::default(),
            process: ProcessConfig::default(),
            grammar: GrammarConfig::default(),
        }
    }
}

/// Population grid configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GridConfig {
    /// Number of columns.
    #[serde(default = "default_grid_size")]
    pub size_x: usize,
    /// Number of rows.
    #[serde(default = "default_grid_size")]
    pub size_y: usize,
    /// Horizontal neighbourhood half-width.
    #[serde(default = "default_spread")]
    pub spread_x: usize,
    /// Vertical neighbourhood half-height.
    #[serde(default = "default_spread")]
    pub spread_y: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            size_x: default_grid_size(),
            size_y: default_grid_size(),
            spread_x: default_spread(),
            spread_y: default_spread(),
        }
    }
}

impl GridConfig {
    /// Total number of cells.
    #[inline]
    pub fn cells(&self) -> usize {
        self.size_x * self.size_y
    }
}

/// Selection policy used when settling a candidate over an incumbent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Strictly fitter wins; ties go to the strictly smaller candidate.
    #[default]
    Value,
    /// Fitness-proportional coin flip between candidate and incumbent.
    Prob,
}

/// Reproduction settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreedingConfig {
    /// Individuals that exhausted their budget are removed when selected again.
    #[serde(default = "default_true")]
    pub allow_dying: bool,
    /// Lower bound of the per-individual reproduction budget.
    #[serde(default = "default_min_children")]
    pub min_children: usize,
    /// Upper bound of the per-individual reproduction budget.
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    /// Children as fit as their parent try the parent's cell first.
    #[serde(default = "default_true")]
    pub avoid_equal_fitness: bool,
}

impl Default for BreedingConfig {
    fn default() -> Self {
        Self {
            allow_dying: true,
            min_children: default_min_children(),
            max_children: default_max_children(),
            avoid_equal_fitness: true,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Fraction of grid cells seeded at start, shared across workers.
    #[serde(default = "default_init_pop_mult")]
    pub init_pop_mult: f64,
    /// Number of worker threads.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Global reproduction budget.
    #[serde(default = "default_max_reproductions")]
    pub max_reproductions: u64,
    /// Grace period for workers to finish once a stop is requested.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            init_pop_mult: default_init_pop_mult(),
            num_workers: default_num_workers(),
            max_reproductions: default_max_reproductions(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Grammar and mutation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrammarConfig {
    /// Grammar text shared by every output dimension.
    #[serde(default = "default_grammar_text")]
    pub text: String,
    /// Per-dimension grammar overrides. Empty means `text` is used everywhere.
    #[serde(default)]
    pub per_dof: Vec<String>,
    /// Maximum expression size of a generated or mutated tree.
    #[serde(default = "default_max_tree_size")]
    pub max_tree_size: usize,
    /// Probability of a same-shape change rather than a subtree replacement.
    #[serde(default = "default_change_vs_replace")]
    pub change_vs_replace: f64,
    /// Number of input variables available to `V` terminals.
    #[serde(default = "default_num_vars")]
    pub num_vars: usize,
    /// Lower growth factor for replaced subtrees.
    #[serde(default = "default_min_node_grow")]
    pub min_node_grow: f64,
    /// Upper growth factor for replaced subtrees.
    #[serde(default = "default_max_node_grow")]
    pub max_node_grow: f64,
    /// Inline placement productions into the entries that use them.
    #[serde(default)]
    pub propagate_placements: bool,
    /// Iteration bound for the size fixed point and placement inlining.
    #[serde(default = "default_max_grammar_depth")]
    pub max_grammar_depth: usize,
    /// Probability of mutating a terminal node rather than a nonterminal one.
    #[serde(default = "default_terminal_vs_nonterminal")]
    pub terminal_vs_nonterminal: f64,
}

impl Default for GrammarConfig {
    fn default() -> Self {
        Self {
            text: default_grammar_text(),
            per_dof: Vec::new(),
            max_tree_size: default_max_tree_size(),
            change_vs_replace: default_change_vs_replace(),
            num_vars: default_num_vars(),
            min_node_grow: default_min_node_grow(),
            max_node_grow: default_max_node_grow(),
            propagate_placements: false,
            max_grammar_depth: default_max_grammar_depth(),
            terminal_vs_nonterminal: default_terminal_vs_nonterminal(),
        }
    }
}

impl GrammarConfig {
    /// Grammar text for the given output dimension.
    pub fn text_for(&self, dof: usize) -> &str {
        self.per_dof.get(dof).map_or(self.text.as_str(), String::as_str)
    }

    /// Validate grammar settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tree_size == 0 {
            return Err(ConfigError::InvalidTreeSize);
        }
        if self.num_vars == 0 {
            return Err(ConfigError::InvalidVariableCount);
        }
        if self.max_grammar_depth == 0 {
            return Err(ConfigError::InvalidGrammarDepth);
        }
        check_probability("change_vs_replace", self.change_vs_replace)?;
        check_probability("terminal_vs_nonterminal", self.terminal_vs_nonterminal)?;
        if !(self.min_node_grow.is_finite() && self.min_node_grow > 0.0)
            || !self.max_node_grow.is_finite()
            || self.max_node_grow < self.min_node_grow
        {
            return Err(ConfigError::InvalidGrowth {
                min: self.min_node_grow,
                max: self.max_node_grow,
            });
        }
        Ok(())
    }
}

fn check_probability(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidProbability { name, value })
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of individuals each worker seeds at start.
    pub fn initial_per_worker(&self) -> usize {
        let workers = self.process.num_workers.max(1) as f64;
        let count = self.grid.cells() as f64 * self.process.init_pop_mult / workers;
        (count as usize).max(1)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid.size_x == 0 || self.grid.size_y == 0 {
            return Err(ConfigError::InvalidDimensions);
        }
        if self.num_dofs == 0 {
            return Err(ConfigError::InvalidDofCount);
        }
        if self.breeding.min_children > self.breeding.max_children {
            return Err(ConfigError::InvalidChildrenRange {
                min: self.breeding.min_children,
                max: self.breeding.max_children,
            });
        }
        if self.process.num_workers == 0 {
            return Err(ConfigError::InvalidWorkerCount);
        }
        if !(self.process.init_pop_mult.is_finite() && self.process.init_pop_mult > 0.0) {
            return Err(ConfigError::InvalidPopulationMultiplier(
                self.process.init_pop_mult,
            ));
        }
        if !self.grammar.per_dof.is_empty() && self.grammar.per_dof.len() != self.num_dofs {
            return Err(ConfigError::GrammarCountMismatch {
                dofs: self.num_dofs,
                grammars: self.grammar.per_dof.len(),
            });
        }
        self.grammar.validate()
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Grid dimensions (size_x, size_y) must be non-zero")]
    InvalidDimensions,
    #[error("Number of output dimensions must be non-zero")]
    InvalidDofCount,
    #[error("Children range is empty: min {min} > max {max}")]
    InvalidChildrenRange { min: usize, max: usize },
    #[error("Worker count must be non-zero")]
    InvalidWorkerCount,
    #[error("Initial population multiplier must be positive, got {0}")]
    InvalidPopulationMultiplier(f64),
    #[error("Expected {dofs} per-dimension grammars, got {grammars}")]
    GrammarCountMismatch { dofs: usize, grammars: usize },
    #[error("Maximum tree size must be non-zero")]
    InvalidTreeSize,
    #[error("Variable count must be non-zero")]
    InvalidVariableCount,
    #[error("Maximum grammar depth must be non-zero")]
    InvalidGrammarDepth,
    #[error("Probability {name} must lie in [0, 1], got {value}")]
    InvalidProbability { name: &'static str, value: f64 },
    #[error("Node growth bounds are inconsistent: min {min}, max {max}")]
    InvalidGrowth { min: f64, max: f64 },
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grid.cells(), 32 * 32);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"grid": {"size_x": 8}, "selection": "prob"}"#).unwrap();
        assert_eq!(config.grid.size_x, 8);
        assert_eq!(config.grid.size_y, 32);
        assert_eq!(config.selection, SelectionPolicy::Prob);
        assert_eq!(config.grammar.max_tree_size, 40);
    }

    #[test]
    fn test_children_range_rejected() {
        let mut config = EngineConfig::default();
        config.breeding.min_children = 5;
        config.breeding.max_children = 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidChildrenRange { min: 5, max: 2 })
        ));
    }

    #[test]
    fn test_growth_bounds_rejected() {
        let mut config = GrammarConfig::default();
        config.min_node_grow = 2.0;
        config.max_node_grow = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGrowth { .. })
        ));
    }

    #[test]
    fn test_probability_rejected() {
        let mut config = GrammarConfig::default();
        config.change_vs_replace = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProbability {
                name: "change_vs_replace",
                ..
            })
        ));
    }

    #[test]
    fn test_initial_per_worker() {
        let mut config = EngineConfig::default();
        config.grid.size_x = 10;
        config.grid.size_y = 10;
        config.process.init_pop_mult = 0.4;
        config.process.num_workers = 4;
        assert_eq!(config.initial_per_worker(), 10);

        config.process.init_pop_mult = 0.001;
        assert_eq!(config.initial_per_worker(), 1);
    }

    #[test]
    fn test_text_for_per_dof() {
        let mut config = GrammarConfig::default();
        assert_eq!(config.text_for(3), DEFAULT_GRAMMAR);
        config.per_dof = vec!["R := [x1](V)".into(), "R := [x1](D)".into()];
        assert_eq!(config.text_for(1), "R := [x1](D)");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"num_dofs": 2, "process": {{"num_workers": 2}}}}"#).unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.num_dofs, 2);
        assert_eq!(config.process.num_workers, 2);
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"process": {{"num_workers": 0}}}}"#).unwrap();
        assert!(matches!(
            EngineConfig::load(file.path()),
            Err(ConfigError::InvalidWorkerCount)
        ));

        let missing = EngineConfig::load("/nonexistent/gridgp.json");
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
