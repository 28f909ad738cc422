//! Text export of a system of equations as an Octave/MATLAB function or a
//! LaTeX `eqnarray*`.

use crate::dag::{Node, NodeId, OperationNode, SubexpressionCache};
use crate::equations::SystemOfEquations;
use crate::error::{Result, SimError};
use crate::operation::OperationType;
use crate::value::VariableValues;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Matlab,
    Latex,
}

/// Strips characters MATLAB does not accept in identifiers.
pub fn matlab_identifier(name: &str) -> String {
    let mut id: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if id.is_empty() || id.starts_with(|c: char| c.is_ascii_digit()) {
        id.insert(0, '_');
    }
    id
}

/// Typesets a variable name, treating `_` and `^` as sub/superscripts.
pub fn mathrm(name: &str) -> String {
    if let Some(pos) = name.find(['_', '^']) {
        let (head, tail) = name.split_at(pos);
        let marker = &tail[..1];
        return format!("{}{}{{{}}}", mathrm(head), marker, mathrm(&tail[1..]));
    }
    if name.chars().count() == 1 || name.contains('\\') {
        name.to_string()
    } else {
        format!("\\mathrm{{{name}}}")
    }
}

fn latex_number(x: f64) -> String {
    if x != 0.0 && (x.abs() >= 1e5 || x.abs() < 1e-4) {
        let mut exponent = x.abs().log10() as i32;
        if exponent < 0 {
            exponent -= 1;
        }
        format!("{}\\times10^{{{}}}", x / 10f64.powi(exponent), exponent)
    } else {
        x.to_string()
    }
}

struct Renderer<'a> {
    cache: &'a SubexpressionCache,
    values: &'a VariableValues,
    format: Format,
}

impl Renderer<'_> {
    fn number(&self, x: f64) -> String {
        match self.format {
            Format::Matlab => x.to_string(),
            Format::Latex => latex_number(x),
        }
    }

    fn name(&self, name: &str) -> String {
        match self.format {
            Format::Matlab => matlab_identifier(name),
            Format::Latex => mathrm(name),
        }
    }

    fn init(&self, value_id: &str) -> Result<String> {
        let init = self.values.init_value(value_id)?;
        Ok(match (init.as_slice(), self.format) {
            ([x], _) => self.number(*x),
            (xs, Format::Matlab) => {
                let items: Vec<String> = xs.iter().map(|x| x.to_string()).collect();
                format!("[{}]", items.join(","))
            }
            (xs, Format::Latex) => {
                let items: Vec<String> = xs.iter().take(5).map(|x| latex_number(*x)).collect();
                let more = if xs.len() > 5 { "\\ldots" } else { "" };
                format!("({}{})", items.join(" "), more)
            }
        })
    }

    fn paren(&self, inner: String, wrap: bool) -> String {
        match (wrap, self.format) {
            (false, _) => inner,
            (true, Format::Matlab) => format!("({inner})"),
            (true, Format::Latex) => format!("\\left({inner}\\right)"),
        }
    }

    fn node(&self, id: NodeId) -> Result<String> {
        match self.cache.node(id) {
            Node::Constant(x) => Ok(self.number(*x)),
            Node::Variable(v) => Ok(self.name(&v.name)),
            Node::IntegralInput(v) => match v.rhs {
                Some(rhs) => self.node(rhs),
                None => Ok("0".to_string()),
            },
            Node::Lock { rhs: Some(rhs), .. } => self.node(*rhs),
            Node::Lock { rhs: None, .. } => Ok("0".to_string()),
            Node::Operation(op) => self.operation(op),
            Node::GodleyColumn { column, .. } => self.operation(column),
        }
    }

    fn port(&self, op: &OperationNode, port: usize) -> Result<Vec<String>> {
        op.arguments
            .get(port)
            .map(|args| args.iter().map(|&a| self.node(a)).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn arg(&self, op: &OperationNode, port: usize) -> Result<Option<String>> {
        op.arg(port).map(|a| self.node(a)).transpose()
    }

    fn required(&self, op: &OperationNode, port: usize) -> Result<String> {
        self.arg(op, port)?.ok_or_else(|| {
            SimError::structural(format!("{} is missing an argument", op.op))
                .with_optional_item(op.item)
        })
    }

    fn precedence(&self, op: &OperationNode, port: usize) -> Vec<u8> {
        op.arguments
            .get(port)
            .map(|args| args.iter().map(|&a| self.cache.node(a).precedence()).collect())
            .unwrap_or_default()
    }

    fn operation(&self, op: &OperationNode) -> Result<String> {
        match self.format {
            Format::Matlab => self.matlab_operation(op),
            Format::Latex => self.latex_operation(op),
        }
    }

    fn matlab_operation(&self, op: &OperationNode) -> Result<String> {
        use OperationType::*;
        let first = self.port(op, 0)?;
        let second = self.port(op, 1)?;
        let bracketed = |args: &[String]| -> Vec<String> {
            args.iter().map(|a| format!("({a})")).collect()
        };
        let or_zero = |a: Option<String>| a.unwrap_or_else(|| "0".to_string());

        Ok(match op.op {
            Add => {
                let all: Vec<String> = first.into_iter().chain(second).collect();
                if all.is_empty() {
                    "0".to_string()
                } else {
                    all.join("+")
                }
            }
            Subtract => match (first.is_empty(), second.is_empty()) {
                (true, true) => "0".to_string(),
                (_, true) => first.join("+"),
                _ => format!("{}-({})", first.join("+"), second.join("+")),
            },
            Multiply => {
                let all: Vec<String> = first.into_iter().chain(second).collect();
                if all.is_empty() {
                    "1".to_string()
                } else {
                    bracketed(&all).join("*")
                }
            }
            Divide => {
                let numerator = if first.is_empty() {
                    "1".to_string()
                } else {
                    bracketed(&first).join("*")
                };
                if second.is_empty() {
                    numerator
                } else {
                    format!("{}/({})", numerator, bracketed(&second).join("*"))
                }
            }
            Log => match self.arg(op, 1)? {
                Some(base) => format!("log({})/log({})", self.required(op, 0)?, base),
                None => format!("log({})", self.required(op, 0)?),
            },
            Pow => format!("({})^({})", self.required(op, 0)?, self.required(op, 1)?),
            Lt | Le | Eq => {
                let symbol = match op.op {
                    Lt => "<",
                    Le => "<=",
                    _ => "==",
                };
                let x = self.arg(op, 0)?.map_or("0".to_string(), |x| format!("({x})"));
                let y = self.arg(op, 1)?.map_or("0".to_string(), |y| format!("({y})"));
                format!("({x}{symbol}{y})")
            }
            Min | Max => match (self.arg(op, 0)?, self.arg(op, 1)?) {
                (None, None) => "0".to_string(),
                (x, y) => format!("{}({},{})", op.op, or_zero(x), or_zero(y)),
            },
            And => match (self.arg(op, 0)?, self.arg(op, 1)?) {
                (Some(x), Some(y)) => format!("(({x})>=0.5 && ({y})>=0.5)"),
                _ => "0".to_string(),
            },
            Or => match (self.arg(op, 0)?, self.arg(op, 1)?) {
                (Some(x), Some(y)) => format!("(({x})>=0.5 || ({y})>=0.5)"),
                (Some(x), None) | (None, Some(x)) => format!("(({x})>=0.5)"),
                (None, None) => "0".to_string(),
            },
            Not => match self.arg(op, 0)? {
                Some(x) => format!("(({x})<0.5)"),
                None => "1".to_string(),
            },
            Time => "t".to_string(),
            Euler => "e".to_string(),
            Pi => "pi".to_string(),
            Zero => "0".to_string(),
            One => "1".to_string(),
            Inf => "inf".to_string(),
            Percent => format!("100*({})", self.required(op, 0)?),
            Copy => self.required(op, 0)?,
            Ln => format!("log({})", self.required(op, 0)?),
            Sqrt | Exp | Sin | Cos | Tan | Asin | Acos | Atan | Sinh | Cosh | Tanh | Abs
            | Floor | Frac | Data => format!("{}({})", op.op, self.required(op, 0)?),
            UserFunction => {
                let args: Vec<String> = [self.arg(op, 0)?, self.arg(op, 1)?]
                    .into_iter()
                    .flatten()
                    .collect();
                format!("user_function({})", args.join(","))
            }
            Constant | Integrate | Differentiate => {
                return Err(SimError::structural(format!(
                    "{} operation cannot be exported",
                    op.op
                ))
                .with_optional_item(op.item));
            }
        })
    }

    fn latex_operation(&self, op: &OperationNode) -> Result<String> {
        use OperationType::*;
        let level = op.op.precedence();
        let function = |name: &str, x: String| format!("\\{name}\\left({x}\\right)");

        Ok(match op.op {
            Add => {
                let all: Vec<String> = self.port(op, 0)?.into_iter().chain(self.port(op, 1)?).collect();
                if all.is_empty() {
                    "0".to_string()
                } else {
                    all.join("+")
                }
            }
            Subtract => {
                let first = self.port(op, 0)?.join("+");
                let second = self.port(op, 1)?;
                if second.is_empty() {
                    first
                } else {
                    let wrap = second.len() > 1 || self.precedence(op, 1).first() == Some(&level);
                    format!("{}-{}", first, self.paren(second.join("+"), wrap))
                }
            }
            Multiply => {
                let mut factors = Vec::new();
                for port in 0..2 {
                    let precedence = self.precedence(op, port);
                    for (arg, p) in self.port(op, port)?.into_iter().zip(precedence) {
                        factors.push(self.paren(arg, p > level));
                    }
                }
                if factors.is_empty() {
                    "1".to_string()
                } else {
                    factors.join("\\times ")
                }
            }
            Divide => {
                let part = |port: usize| -> Result<String> {
                    let args = self.port(op, port)?;
                    Ok(if args.is_empty() {
                        "1".to_string()
                    } else {
                        args.join("\\times ")
                    })
                };
                format!("\\frac{{{}}}{{{}}}", part(0)?, part(1)?)
            }
            Log => match self.arg(op, 1)? {
                Some(base) => format!("\\log_{{{}}}\\left({}\\right)", base, self.required(op, 0)?),
                None => function("ln", self.required(op, 0)?),
            },
            Pow => {
                let wrap = self.precedence(op, 0).first().is_some_and(|&p| p > level);
                format!(
                    "{}^{{{}}}",
                    self.paren(self.required(op, 0)?, wrap),
                    self.required(op, 1)?
                )
            }
            Lt => self.latex_step(op)?,
            Eq => self.latex_delta(op)?,
            Le => format!("{}+{}", self.latex_step(op)?, self.latex_delta(op)?),
            Min | Max => match (self.arg(op, 0)?, self.arg(op, 1)?) {
                (None, None) => "0".to_string(),
                (x, y) => format!(
                    "\\{}\\left({},{}\\right)",
                    op.op,
                    x.unwrap_or_else(|| "0".to_string()),
                    y.unwrap_or_else(|| "0".to_string())
                ),
            },
            And => match (self.arg(op, 0)?, self.arg(op, 1)?) {
                (Some(x), Some(y)) => {
                    format!("\\theta\\left({x}-0.5\\right)\\theta\\left({y}-0.5\\right)")
                }
                _ => "0".to_string(),
            },
            Or => match (self.arg(op, 0)?, self.arg(op, 1)?) {
                (Some(x), Some(y)) => format!(
                    "\\max\\left(\\theta\\left({x}-0.5\\right),\\theta\\left({y}-0.5\\right)\\right)"
                ),
                (Some(x), None) | (None, Some(x)) => format!("\\theta\\left({x}-0.5\\right)"),
                (None, None) => "0".to_string(),
            },
            Not => match self.arg(op, 0)? {
                Some(x) => format!("\\left(1-\\theta\\left(0.5-{x}\\right)\\right)"),
                None => "1".to_string(),
            },
            Time => " t ".to_string(),
            Euler => " e ".to_string(),
            Pi => "\\pi ".to_string(),
            Zero => " 0 ".to_string(),
            One => " 1 ".to_string(),
            Inf => "\\infty ".to_string(),
            Copy => self.required(op, 0)?,
            Sqrt => format!("\\sqrt{{{}}}", self.required(op, 0)?),
            Exp | Ln | Sin | Cos | Tan | Sinh | Cosh | Tanh => {
                function(op.op.name(), self.required(op, 0)?)
            }
            Asin => function("arcsin", self.required(op, 0)?),
            Acos => function("arccos", self.required(op, 0)?),
            Atan => function("arctan", self.required(op, 0)?),
            Abs => format!("\\left|{}\\right|", self.required(op, 0)?),
            Floor => format!("\\left\\lfloor {}\\right\\rfloor ", self.required(op, 0)?),
            Frac => format!("\\mathrm{{frac}}\\left({}\\right)", self.required(op, 0)?),
            Percent => format!("100\\left({}\\right)", self.required(op, 0)?),
            Data => format!("\\mathrm{{data}}\\left({}\\right)", self.required(op, 0)?),
            UserFunction => {
                let args: Vec<String> = [self.arg(op, 0)?, self.arg(op, 1)?]
                    .into_iter()
                    .flatten()
                    .collect();
                format!("\\mathrm{{f}}\\left({}\\right)", args.join(","))
            }
            Constant | Integrate | Differentiate => {
                return Err(SimError::structural(format!(
                    "{} operation cannot be exported",
                    op.op
                ))
                .with_optional_item(op.item));
            }
        })
    }

    /// Heaviside step of `y - x`, i.e. `x < y`.
    fn latex_step(&self, op: &OperationNode) -> Result<String> {
        Ok(match (self.arg(op, 0)?, self.arg(op, 1)?) {
            (Some(x), y) => {
                let wrap = self.precedence(op, 0).first().is_some_and(|&p| p > 1);
                format!(
                    "\\theta\\left({}-{}\\right)",
                    y.unwrap_or_default(),
                    self.paren(x, wrap)
                )
            }
            (None, Some(y)) => format!("\\theta\\left({y}\\right)"),
            (None, None) => "0".to_string(),
        })
    }

    fn latex_delta(&self, op: &OperationNode) -> Result<String> {
        Ok(match (self.arg(op, 0)?, self.arg(op, 1)?) {
            (Some(x), Some(y)) => {
                let wrap = self
                    .precedence(op, 1)
                    .first()
                    .is_some_and(|&p| p > op.op.precedence());
                format!("\\delta\\left({}-{}\\right)", x, self.paren(y, wrap))
            }
            (Some(x), None) | (None, Some(x)) => format!("\\delta\\left({x}\\right)"),
            (None, None) => "1".to_string(),
        })
    }
}

impl SystemOfEquations<'_> {
    fn renderer(&self, format: Format) -> Renderer<'_> {
        Renderer {
            cache: &self.cache,
            values: &self.values,
            format,
        }
    }

    /// Integration variables with the integrand of each, if defined.
    fn integrals(&self) -> Vec<(&str, &str, Option<NodeId>)> {
        self.integration_variables
            .iter()
            .filter_map(|&id| match self.cache.node(id) {
                Node::Variable(v) => {
                    let input = self
                        .cache
                        .integral_input(&v.value_id)
                        .and_then(|ii| match self.cache.node(ii) {
                            Node::IntegralInput(input) => input.rhs,
                            _ => None,
                        });
                    Some((v.name.as_str(), v.value_id.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    /// The system as an Octave/MATLAB function `f(x,t)` returning the
    /// derivative of the stock vector, followed by initial conditions `x0`.
    pub fn matlab(&self) -> Result<String> {
        let r = self.renderer(Format::Matlab);
        let integrals = self.integrals();
        let mut out = String::from("function f=f(x,t)\n");
        for (j, (name, _, _)) in integrals.iter().enumerate() {
            let _ = writeln!(out, "{}=x({});", matlab_identifier(name), j + 1);
        }
        for &id in &self.variables {
            let Node::Variable(v) = self.cache.node(id) else {
                continue;
            };
            let rhs = match v.rhs {
                Some(rhs) => r.node(rhs)?,
                None => r.init(&v.value_id)?,
            };
            let _ = writeln!(out, "{}={};", matlab_identifier(&v.name), rhs);
        }
        for (j, (_, _, input)) in integrals.iter().enumerate() {
            let rhs = match input {
                Some(input) => r.node(*input)?,
                None => "0".to_string(),
            };
            let _ = writeln!(out, "f({})={};", j + 1, rhs);
        }
        out.push_str("endfunction;\n\n");
        for (j, (_, vid, _)) in integrals.iter().enumerate() {
            let _ = writeln!(out, "x0({})={};", j + 1, r.init(vid)?);
        }
        Ok(out)
    }

    /// The system as a LaTeX `eqnarray*`.
    pub fn latex(&self) -> Result<String> {
        let r = self.renderer(Format::Latex);
        let mut out = String::from("\\begin{eqnarray*}\n");
        for &id in &self.variables {
            let Node::Variable(v) = self.cache.node(id) else {
                continue;
            };
            let rhs = match v.rhs {
                Some(rhs) => r.node(rhs)?,
                None => r.init(&v.value_id)?,
            };
            let _ = writeln!(out, "{}&=&{}\\\\", mathrm(&v.name), rhs);
        }
        for (name, vid, input) in self.integrals() {
            let _ = writeln!(out, "{}(0)&=&{}\\\\", mathrm(name), r.init(vid)?);
            let rhs = match input {
                Some(input) => r.node(input)?,
                None => String::new(),
            };
            let _ = writeln!(out, "\\frac{{ d {}}}{{dt}} &=&{}\\\\", mathrm(name), rhs);
        }
        out.push_str("\\end{eqnarray*}\n");
        Ok(out)
    }
}
