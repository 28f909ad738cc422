use crate::error::{Result, SimError};
use serde::{Deserialize, Serialize};
use std::f64::consts::{E, PI};
use std::fmt;

/// Operator tags understood by the compiler and the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Constant,
    Add,
    Subtract,
    Multiply,
    Divide,
    Log,
    Pow,
    Lt,
    Le,
    Eq,
    Min,
    Max,
    And,
    Or,
    Not,
    Time,
    Copy,
    Integrate,
    Differentiate,
    Data,
    Sqrt,
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Abs,
    Floor,
    Frac,
    Percent,
    Euler,
    Pi,
    Zero,
    One,
    Inf,
    UserFunction,
}

impl OperationType {
    /// Number of input ports.
    pub fn arity(self) -> usize {
        use OperationType::*;
        match self {
            Constant | Time | Euler | Pi | Zero | One | Inf => 0,
            Add | Subtract | Multiply | Divide | Log | Pow | Lt | Le | Eq | Min | Max | And
            | Or | UserFunction => 2,
            // integrate's second port is the initial value, which never feeds the DAG
            _ => 1,
        }
    }

    pub fn name(self) -> &'static str {
        use OperationType::*;
        match self {
            Constant => "constant",
            Add => "add",
            Subtract => "subtract",
            Multiply => "multiply",
            Divide => "divide",
            Log => "log",
            Pow => "pow",
            Lt => "lt",
            Le => "le",
            Eq => "eq",
            Min => "min",
            Max => "max",
            And => "and",
            Or => "or",
            Not => "not",
            Time => "time",
            Copy => "copy",
            Integrate => "integrate",
            Differentiate => "differentiate",
            Data => "data",
            Sqrt => "sqrt",
            Exp => "exp",
            Ln => "ln",
            Sin => "sin",
            Cos => "cos",
            Tan => "tan",
            Asin => "asin",
            Acos => "acos",
            Atan => "atan",
            Sinh => "sinh",
            Cosh => "cosh",
            Tanh => "tanh",
            Abs => "abs",
            Floor => "floor",
            Frac => "frac",
            Percent => "percent",
            Euler => "euler",
            Pi => "pi",
            Zero => "zero",
            One => "one",
            Inf => "inf",
            UserFunction => "user_function",
        }
    }

    /// Binding strength used when rendering: 0 binds tightest.
    pub fn precedence(self) -> u8 {
        use OperationType::*;
        match self {
            Multiply | Divide | And => 1,
            Add | Subtract | Or => 2,
            _ => 0,
        }
    }

    /// True for operators whose ports accept any number of wires.
    pub fn is_cumulative(self) -> bool {
        matches!(
            self,
            OperationType::Add
                | OperationType::Subtract
                | OperationType::Multiply
                | OperationType::Divide
                | OperationType::Min
                | OperationType::Max
                | OperationType::And
                | OperationType::Or
        )
    }

    /// Evaluates a stateless operator. `t` feeds the time operator.
    ///
    /// Data and user-function operations carry state and are evaluated by
    /// [`crate::eval_op::EvalOp`]; they yield 0 here.
    pub fn evaluate(self, x1: f64, x2: f64, t: f64) -> f64 {
        use OperationType::*;
        match self {
            Constant | Zero | Data | UserFunction => 0.0,
            Integrate | Differentiate => 0.0,
            Time => t,
            Euler => E,
            Pi => PI,
            One => 1.0,
            Inf => f64::MAX,
            Percent => 100.0 * x1,
            Copy => x1,
            Sqrt => x1.abs().sqrt(),
            Exp => x1.exp(),
            Ln => x1.ln(),
            Log => x1.ln() / x2.ln(),
            Pow => x1.powf(x2),
            Lt => indicator(x1 < x2),
            Le => indicator(x1 <= x2),
            Eq => indicator(x1 == x2),
            Min => x1.min(x2),
            Max => x1.max(x2),
            And => indicator(x1 > 0.5 && x2 > 0.5),
            Or => indicator(x1 > 0.5 || x2 > 0.5),
            Not => indicator(x1 <= 0.5),
            Sin => x1.sin(),
            Cos => x1.cos(),
            Tan => x1.tan(),
            Asin => x1.asin(),
            Acos => x1.acos(),
            Atan => x1.atan(),
            Sinh => x1.sinh(),
            Cosh => x1.cosh(),
            Tanh => x1.tanh(),
            Abs => x1.abs(),
            Floor => x1.floor(),
            Frac => x1 - x1.floor(),
            Add => x1 + x2,
            Subtract => x1 - x2,
            Multiply => x1 * x2,
            Divide => x1 / x2,
        }
    }

    /// Partial derivative with respect to the first argument.
    pub fn d1(self, x1: f64, x2: f64) -> Result<f64> {
        use OperationType::*;
        Ok(match self {
            Constant | Time | Euler | Pi | Zero | One | Inf => 0.0,
            Percent => 100.0,
            Copy | Integrate | Differentiate => 1.0,
            Sqrt => 0.5 / x1.abs().sqrt(),
            Exp => x1.exp(),
            Ln => 1.0 / x1,
            Log => 1.0 / (x1 * x2.ln()),
            Pow => x2 * x1.powf(x2 - 1.0),
            Min => indicator(x1 <= x2),
            Max => indicator(x1 > x2),
            Sin => x1.cos(),
            Cos => -x1.sin(),
            Tan => 1.0 / x1.cos().powi(2),
            Asin => 1.0 / (1.0 - x1 * x1).sqrt(),
            Acos => -1.0 / (1.0 - x1 * x1).sqrt(),
            Atan => 1.0 / (1.0 + x1 * x1),
            Sinh => x1.cosh(),
            Cosh => x1.sinh(),
            Tanh => 1.0 / x1.cosh().powi(2),
            Abs => {
                if x1 < 0.0 {
                    -1.0
                } else {
                    1.0
                }
            }
            Add | Subtract => 1.0,
            Multiply => x2,
            Divide => 1.0 / x2,
            Lt | Le | Eq | And | Or | Not | Floor | Frac | UserFunction => {
                return Err(not_implicit(self))
            }
            // the slope of a lookup table depends on its state
            Data => 0.0,
        })
    }

    /// Partial derivative with respect to the second argument.
    pub fn d2(self, x1: f64, x2: f64) -> Result<f64> {
        use OperationType::*;
        Ok(match self {
            Log => -x1.ln() / (x2 * x2.ln().powi(2)),
            Pow => x1.powf(x2) * x1.ln(),
            Min => indicator(x1 > x2),
            Max => indicator(x1 <= x2),
            Add => 1.0,
            Subtract => -1.0,
            Multiply => x1,
            Divide => -x1 / (x2 * x2),
            UserFunction => return Err(not_implicit(self)),
            _ => 0.0,
        })
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn indicator(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

fn not_implicit(op: OperationType) -> SimError {
    let name = match op {
        OperationType::UserFunction => "user functions",
        other => other.name(),
    };
    SimError::differentiation(format!("{name} cannot be used with an implicit method"))
}
