//! Native interpretation of expression trees.

use std::fmt;

use crate::grammar::template::{BinaryOp, Function, Node, UnaryOp};
use crate::grammar::{Expr, Terminal};

/// Runtime value of an expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Num(f64),
    Bool(bool),
}

impl Value {
    fn type_name(self) -> &'static str {
        match self {
            Self::Num(_) => "number",
            Self::Bool(_) => "boolean",
        }
    }

    pub fn as_num(self) -> Result<f64, EvalError> {
        match self {
            Self::Num(value) => Ok(value),
            Self::Bool(_) => Err(EvalError::TypeMismatch {
                expected: "number",
                found: self.type_name(),
            }),
        }
    }

    pub fn as_bool(self) -> Result<bool, EvalError> {
        match self {
            Self::Bool(value) => Ok(value),
            Self::Num(_) => Err(EvalError::TypeMismatch {
                expected: "boolean",
                found: self.type_name(),
            }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
        }
    }
}

/// Expression evaluation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("Variable x[{index}] is out of range, {available} input(s) given")]
    MissingVariable { index: usize, available: usize },
    #[error("Template placeholder x{0} has no matching child")]
    MissingArgument(usize),
    #[error("Expected a {expected}, found a {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

impl Expr {
    /// Evaluate the tree for one input vector.
    pub fn evaluate(&self, vars: &[f64]) -> Result<Value, EvalError> {
        match self {
            Expr::Term(Terminal::Var(index)) => vars
                .get(*index)
                .map(|&value| Value::Num(value))
                .ok_or(EvalError::MissingVariable {
                    index: *index,
                    available: vars.len(),
                }),
            Expr::Term(Terminal::Num(value)) => Ok(Value::Num(*value)),
            Expr::Term(Terminal::Bool(value)) => Ok(Value::Bool(*value)),
            Expr::Funct { prod, children, .. } => {
                eval_node(prod.template().root(), children, vars)
            }
        }
    }

    /// Evaluate a numeric tree.
    pub fn evaluate_num(&self, vars: &[f64]) -> Result<f64, EvalError> {
        self.evaluate(vars)?.as_num()
    }
}

fn eval_node(node: &Node, children: &[Expr], vars: &[f64]) -> Result<Value, EvalError> {
    let num = |node: &Node| eval_node(node, children, vars)?.as_num();
    let boolean = |node: &Node| eval_node(node, children, vars)?.as_bool();

    Ok(match node {
        Node::Arg(idx) => {
            return children
                .get(*idx)
                .ok_or(EvalError::MissingArgument(idx + 1))?
                .evaluate(vars);
        }
        Node::Num(value) => Value::Num(*value),
        Node::Bool(value) => Value::Bool(*value),
        Node::Unary(UnaryOp::Neg, inner) => Value::Num(-num(inner)?),
        Node::Unary(UnaryOp::Not, inner) => Value::Bool(!boolean(inner)?),
        Node::Binary(BinaryOp::And, lhs, rhs) => Value::Bool(boolean(lhs)? && boolean(rhs)?),
        Node::Binary(BinaryOp::Or, lhs, rhs) => Value::Bool(boolean(lhs)? || boolean(rhs)?),
        Node::Binary(op @ (BinaryOp::Eq | BinaryOp::Ne), lhs, rhs) => {
            let left = eval_node(lhs, children, vars)?;
            let right = eval_node(rhs, children, vars)?;
            let equal = match (left, right) {
                (Value::Num(a), Value::Num(b)) => a == b,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (a, b) => {
                    return Err(EvalError::TypeMismatch {
                        expected: a.type_name(),
                        found: b.type_name(),
                    });
                }
            };
            Value::Bool(equal == (*op == BinaryOp::Eq))
        }
        Node::Binary(op, lhs, rhs) => {
            let (a, b) = (num(lhs)?, num(rhs)?);
            match op {
                BinaryOp::Lt => Value::Bool(a < b),
                BinaryOp::Le => Value::Bool(a <= b),
                BinaryOp::Gt => Value::Bool(a > b),
                BinaryOp::Ge => Value::Bool(a >= b),
                BinaryOp::Add => Value::Num(a + b),
                BinaryOp::Sub => Value::Num(a - b),
                BinaryOp::Mul => Value::Num(a * b),
                BinaryOp::Div => Value::Num(a / b),
                BinaryOp::Rem => Value::Num(a % b),
                // Logical and equality operators are matched by the arms above.
                BinaryOp::And | BinaryOp::Or | BinaryOp::Eq | BinaryOp::Ne => {
                    return Err(EvalError::TypeMismatch {
                        expected: "boolean",
                        found: "number",
                    });
                }
            }
        }
        Node::Ternary(cond, then, other) => {
            return if boolean(cond)? {
                eval_node(then, children, vars)
            } else {
                eval_node(other, children, vars)
            };
        }
        Node::Call(func, args) => {
            let values = args.iter().map(num).collect::<Result<Vec<_>, _>>()?;
            Value::Num(apply(*func, &values))
        }
    })
}

fn apply(func: Function, args: &[f64]) -> f64 {
    let x = args.first().copied().unwrap_or(f64::NAN);
    let y = args.get(1).copied().unwrap_or(f64::NAN);
    match func {
        Function::Sin => x.sin(),
        Function::Cos => x.cos(),
        Function::Tan => x.tan(),
        Function::Asin => x.asin(),
        Function::Acos => x.acos(),
        Function::Atan => x.atan(),
        Function::Atan2 => x.atan2(y),
        Function::Sinh => x.sinh(),
        Function::Cosh => x.cosh(),
        Function::Tanh => x.tanh(),
        Function::Exp => x.exp(),
        Function::Log => x.ln(),
        Function::Log10 => x.log10(),
        Function::Sqrt => x.sqrt(),
        Function::Cbrt => x.cbrt(),
        Function::Abs => x.abs(),
        Function::Pow => x.powf(y),
        Function::Min => x.min(y),
        Function::Max => x.max(y),
        Function::Floor => x.floor(),
        Function::Ceil => x.ceil(),
        Function::Round => x.round(),
        Function::Signum => x.signum(),
        Function::Hypot => x.hypot(y),
    }
}
