//! Fitness values and evaluators.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::eval::EvalError;
use crate::grammar::Expr;

/// Scalar fitness; larger is better, `ONE` is a perfect fit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fitness(f64);

impl Fitness {
    pub const ZERO: Fitness = Fitness(0.0);
    pub const ONE: Fitness = Fitness(1.0);

    /// Wrap a raw score. NaN is treated as zero.
    pub fn new(value: f64) -> Self {
        if value.is_nan() { Self::ZERO } else { Self(value) }
    }

    #[inline]
    pub fn value(self) -> f64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }

    pub fn is_one(self) -> bool {
        self.0 == 1.0
    }
}

impl Default for Fitness {
    fn default() -> Self {
        Self::ZERO
    }
}

impl PartialEq for Fitness {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Fitness {}

impl PartialOrd for Fitness {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fitness {
    fn cmp(&self, other: &Self) -> Ordering {
        // -0.0 and 0.0 compare equal.
        if self.0 == other.0 {
            Ordering::Equal
        } else {
            self.0.total_cmp(&other.0)
        }
    }
}

impl fmt::Display for Fitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

/// Fitness evaluation errors.
#[derive(Debug, thiserror::Error)]
pub enum FitnessError {
    #[error("Evaluation failed: {0}")]
    Eval(#[from] EvalError),
    #[error("Expression {dof} produced a non-finite value on sample {sample}")]
    NonFinite { dof: usize, sample: usize },
    #[error("Expected {expected} expressions, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("{0}")]
    Custom(String),
}

/// Computes the fitness of an individual's expressions.
///
/// Called concurrently from every worker thread.
pub trait FitnessEvaluator: Send + Sync {
    fn compute_fitness(&self, manager_id: u32, exprs: &[Expr]) -> Result<Fitness, FitnessError>;
}

impl<F> FitnessEvaluator for F
where
    F: Fn(u32, &[Expr]) -> Result<Fitness, FitnessError> + Send + Sync,
{
    fn compute_fitness(&self, manager_id: u32, exprs: &[Expr]) -> Result<Fitness, FitnessError> {
        self(manager_id, exprs)
    }
}

/// One input/output observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub inputs: Vec<f64>,
    pub outputs: Vec<f64>,
}

/// Symbolic regression fitness over a fixed sample set.
///
/// Each output dimension scores `1 / (1 + RMSE)`; the fitness is the mean
/// over dimensions, so an exact fit scores [`Fitness::ONE`].
#[derive(Debug, Clone)]
pub struct RegressionFitness {
    samples: Vec<Sample>,
    num_dofs: usize,
}

impl RegressionFitness {
    pub fn new(samples: Vec<Sample>) -> Result<Self, FitnessError> {
        let num_dofs = samples.first().map_or(0, |s| s.outputs.len());
        if samples.is_empty() || num_dofs == 0 {
            return Err(FitnessError::Custom(
                "regression needs at least one sample with outputs".into(),
            ));
        }
        if let Some(bad) = samples.iter().find(|s| s.outputs.len() != num_dofs) {
            return Err(FitnessError::DimensionMismatch {
                expected: num_dofs,
                found: bad.outputs.len(),
            });
        }
        Ok(Self { samples, num_dofs })
    }

    pub fn num_dofs(&self) -> usize {
        self.num_dofs
    }

    /// Number of inputs of the narrowest sample.
    pub fn num_vars(&self) -> usize {
        self.samples
            .iter()
            .map(|s| s.inputs.len())
            .min()
            .unwrap_or(0)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Root-mean-square error of one expression against one output dimension.
    pub fn rmse(&self, dof: usize, expr: &Expr) -> Result<f64, FitnessError> {
        let mut sum = 0.0;
        for (idx, sample) in self.samples.iter().enumerate() {
            let value = expr.evaluate_num(&sample.inputs)?;
            if !value.is_finite() {
                return Err(FitnessError::NonFinite { dof, sample: idx });
            }
            let err = value - sample.outputs[dof];
            sum += err * err;
        }
        Ok((sum / self.samples.len() as f64).sqrt())
    }
}

impl FitnessEvaluator for RegressionFitness {
    fn compute_fitness(&self, _manager_id: u32, exprs: &[Expr]) -> Result<Fitness, FitnessError> {
        if exprs.len() != self.num_dofs {
            return Err(FitnessError::DimensionMismatch {
                expected: self.num_dofs,
                found: exprs.len(),
            });
        }
        let mut total = 0.0;
        for (dof, expr) in exprs.iter().enumerate() {
            total += 1.0 / (1.0 + self.rmse(dof, expr)?);
        }
        Ok(Fitness::new(total / self.num_dofs as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{Grammar, Terminal};
    use crate::schema::GrammarConfig;

    fn samples() -> Vec<Sample> {
        (0..5)
            .map(|i| {
                let x = i as f64;
                Sample {
                    inputs: vec![x],
                    outputs: vec![x],
                }
            })
            .collect()
    }

    #[test]
    fn test_fitness_ordering() {
        assert!(Fitness::new(3.0) < Fitness::new(5.0));
        assert_eq!(Fitness::new(0.0), Fitness::new(-0.0));
        assert_eq!(Fitness::new(f64::NAN), Fitness::ZERO);
        assert!(Fitness::ZERO.is_zero());
        assert!(Fitness::ONE.is_one());
        assert_eq!(Fitness::new(2.0).max(Fitness::ONE).value(), 2.0);
    }

    #[test]
    fn test_exact_fit_scores_one() {
        let fitness = RegressionFitness::new(samples()).unwrap();
        let expr = Expr::Term(Terminal::Var(0));
        assert_eq!(fitness.compute_fitness(0, &[expr]).unwrap(), Fitness::ONE);
    }

    #[test]
    fn test_constant_fit_scores_below_one() {
        let fitness = RegressionFitness::new(samples()).unwrap();
        let config = GrammarConfig {
            max_tree_size: 4,
            ..GrammarConfig::default()
        };
        let grammar = Grammar::new("R := [x1 + 2](V)", &config).unwrap();
        let production = grammar.entry(grammar.root()).unwrap().productions()[0].clone();
        let expr = Expr::funct(production, vec![Expr::Term(Terminal::Var(0))]);

        let score = fitness.compute_fitness(0, &[expr]).unwrap();
        assert!((score.value() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_errors() {
        let fitness = RegressionFitness::new(samples()).unwrap();
        assert!(matches!(
            fitness.compute_fitness(0, &[]),
            Err(FitnessError::DimensionMismatch { expected: 1, found: 0 })
        ));
        assert!(matches!(
            fitness.compute_fitness(0, &[Expr::Term(Terminal::Var(4))]),
            Err(FitnessError::Eval(EvalError::MissingVariable { .. }))
        ));
        assert!(matches!(
            fitness.compute_fitness(0, &[Expr::Term(Terminal::Num(f64::INFINITY))]),
            Err(FitnessError::NonFinite { dof: 0, sample: 0 })
        ));
        assert!(RegressionFitness::new(Vec::new()).is_err());
    }

    #[test]
    fn test_closure_evaluator() {
        let evaluator = |manager: u32, exprs: &[Expr]| -> Result<Fitness, FitnessError> {
            Ok(Fitness::new(manager as f64 + exprs.len() as f64))
        };
        let score = evaluator.compute_fitness(2, &[Expr::Term(Terminal::Bool(true))]);
        assert_eq!(score.unwrap().value(), 3.0);
    }
}
