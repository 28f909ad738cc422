//! Symbolic time derivatives of expression nodes.

use crate::dag::{CacheKey, Node, NodeId, OperationNode, VariableNode};
use crate::equations::SystemOfEquations;
use crate::error::{Result, SimError};
use crate::operation::OperationType;
use crate::value::{value_id, VariableType, VariableValue};
use tracing::trace;

/// Name of the time derivative of a variable called `x`: `dx/dt`, then
/// `d^{2}x/dt^{2}` and so on.
pub fn differentiate_name(x: &str) -> String {
    let (order, base) = derivative_order(x);
    match order + 1 {
        1 => format!("d{base}/dt"),
        n => format!("d^{{{n}}}{base}/dt^{{{n}}}"),
    }
}

fn derivative_order(x: &str) -> (usize, &str) {
    if let Some(base) = x.strip_prefix('d').and_then(|rest| rest.strip_suffix("/dt")) {
        return (1, base);
    }
    let higher = x.strip_prefix("d^{").and_then(|rest| {
        let (order, rest) = rest.split_once('}')?;
        let base = rest.strip_suffix(&format!("/dt^{{{order}}}"))?;
        Some((order.parse().ok()?, base))
    });
    higher.unwrap_or((0, x))
}

impl SystemOfEquations<'_> {
    /// The node computing `d/dt` of `id`. Results are memoized, and
    /// differentiating a node while it is already being differentiated is
    /// an error.
    pub fn derivative(&mut self, id: NodeId) -> Result<NodeId> {
        if let Some(&d) = self.derivatives.get(&id) {
            return Ok(d);
        }
        if !self.differentiating.insert(id) {
            return Err(SimError::structural("definition loop detected while differentiating")
                .with_optional_item(self.cache.node(id).item()));
        }
        let result = self.derivative_uncached(id);
        self.differentiating.remove(&id);
        let d = result?;
        self.derivatives.insert(id, d);
        Ok(d)
    }

    fn derivative_uncached(&mut self, id: NodeId) -> Result<NodeId> {
        match self.cache.node(id).clone() {
            Node::Constant(_) => Ok(self.cache.zero()),
            Node::Variable(var) => self.variable_derivative(&var),
            Node::IntegralInput(var) => match var.rhs {
                Some(rhs) => self.derivative(rhs),
                None => Ok(self.cache.zero()),
            },
            Node::Lock { item, .. } => Err(SimError::differentiation(
                "cannot differentiate through a locked value",
            )
            .with_optional_item(item)),
            Node::GodleyColumn { column, .. } => self.sum_derivative(OperationType::Subtract, &column),
            Node::Operation(op) => self
                .operation_derivative(&op)
                .map_err(|e| e.with_optional_item(op.item)),
        }
    }

    fn variable_derivative(&mut self, var: &VariableNode) -> Result<NodeId> {
        let name = differentiate_name(&var.name);
        let scope = var
            .value_id
            .rsplit_once(':')
            .map(|(scope, _)| scope)
            .filter(|scope| !scope.is_empty());
        let vid = value_id(Some(scope.unwrap_or("")), &name);
        trace!(value_id = %vid, "differentiating variable");
        if !self.values.contains(&vid) {
            self.values
                .insert(VariableValue::new(&vid, scope, VariableType::Flow, "0"));
        }

        let key = CacheKey::Var(vid.clone());
        let r = match self.cache.get(&key) {
            Some(existing) => match self.cache.node(existing) {
                Node::Variable(v) if v.rhs.is_none() => existing,
                _ => return Ok(existing),
            },
            None => self.cache.insert(
                key,
                Node::Variable(VariableNode::new(&vid, &name, VariableType::Flow, "")),
            ),
        };

        let rhs = match var.rhs {
            Some(rhs) => self.derivative(rhs)?,
            None if matches!(var.kind, VariableType::Stock | VariableType::Integral) => {
                match self.cache.integral_input(&var.value_id) {
                    Some(ii) => match self.cache.node(ii) {
                        Node::IntegralInput(input) => input.rhs.unwrap_or(ii),
                        _ => ii,
                    },
                    None if var.kind == VariableType::Integral => {
                        return Err(SimError::differentiation(format!(
                            "integral input {} not defined",
                            var.value_id
                        ))
                        .with_optional_item(var.item));
                    }
                    // a stock nothing flows into is constant
                    None => self.cache.zero(),
                }
            }
            None => self.cache.zero(),
        };
        self.cache.set_rhs(r, Some(rhs));
        Ok(r)
    }

    /// Chain rule: `d f(x) = f'(x) dx`.
    fn chain(&mut self, x: NodeId, outer: NodeId) -> Result<NodeId> {
        let dx = self.derivative(x)?;
        Ok(self.cache.mul(dx, outer))
    }

    fn product(&mut self, factors: &[NodeId]) -> NodeId {
        match factors {
            [] => self.cache.one(),
            [single] => *single,
            _ => self
                .cache
                .op(OperationType::Multiply, vec![factors.to_vec(), Vec::new()]),
        }
    }

    /// Derivative of an add or subtract: the same operation over the
    /// derivatives of the arguments.
    fn sum_derivative(&mut self, op: OperationType, node: &OperationNode) -> Result<NodeId> {
        let zero = self.cache.zero();
        let mut ports = Vec::with_capacity(node.arguments.len());
        for port in &node.arguments {
            let mut terms = Vec::with_capacity(port.len());
            for &arg in port {
                let d = self.derivative(arg)?;
                if d != zero {
                    terms.push(d);
                }
            }
            ports.push(terms);
        }
        let positive = ports.first().map_or(0, Vec::len);
        let negative = ports.get(1).map_or(0, Vec::len);
        Ok(match (positive, negative) {
            (0, 0) => zero,
            (1, 0) => ports[0][0],
            _ => self.cache.op(op, ports),
        })
    }

    fn operation_derivative(&mut self, node: &OperationNode) -> Result<NodeId> {
        use OperationType::*;
        let zero = self.cache.zero();
        let one = self.cache.one();
        let x = node.arg(0);

        match node.op {
            Constant | Euler | Pi | Zero | One | Inf => Ok(zero),
            Lt | Le | Eq | And | Or | Not => Ok(zero),
            Time => Ok(one),
            Add | Subtract => self.sum_derivative(node.op, node),
            Multiply => {
                let factors: Vec<NodeId> = node.arguments.iter().flatten().copied().collect();
                let mut terms = Vec::with_capacity(factors.len());
                for (i, &factor) in factors.iter().enumerate() {
                    let d = self.derivative(factor)?;
                    if d == zero {
                        continue;
                    }
                    let mut others: Vec<NodeId> = factors
                        .iter()
                        .enumerate()
                        .filter(|&(j, _)| j != i)
                        .map(|(_, &f)| f)
                        .collect();
                    others.push(d);
                    let others: Vec<NodeId> = others.into_iter().filter(|&f| f != one).collect();
                    terms.push(self.product(&others));
                }
                Ok(match terms.as_slice() {
                    [] => zero,
                    [single] => *single,
                    _ => self.cache.op(Add, vec![terms, Vec::new()]),
                })
            }
            Divide => {
                let numerator = node.arguments.first().cloned().unwrap_or_default();
                let denominator = node.arguments.get(1).cloned().unwrap_or_default();
                let u = self.product(&numerator);
                if denominator.is_empty() {
                    return self.derivative(u);
                }
                let v = self.product(&denominator);
                let du = self.derivative(u)?;
                let dv = self.derivative(v)?;
                let vdu = self.cache.mul(v, du);
                let udv = self.cache.mul(u, dv);
                let numerator = self.cache.sub(vdu, udv);
                if numerator == zero {
                    return Ok(zero);
                }
                let v2 = self.cache.mul(v, v);
                Ok(self.cache.div(numerator, v2))
            }
            Log => {
                let Some(x) = x else { return Ok(zero) };
                match node.arg(1) {
                    None => {
                        let outer = self.cache.div(one, x);
                        self.chain(x, outer)
                    }
                    Some(base) => {
                        let ln_x = self.cache.unary(Ln, x);
                        let ln_b = self.cache.unary(Ln, base);
                        let q = self.cache.div(ln_x, ln_b);
                        self.derivative(q)
                    }
                }
            }
            Pow => {
                let (Some(x), Some(y)) = (x, node.arg(1)) else {
                    return Ok(zero);
                };
                let ln_x = self.cache.unary(Ln, x);
                let exponent = self.cache.mul(y, ln_x);
                let e = self.cache.unary(Exp, exponent);
                self.derivative(e)
            }
            Min | Max => {
                let args: Vec<NodeId> = node.arguments.iter().flatten().copied().collect();
                match args.as_slice() {
                    [] => Ok(zero),
                    [single] => self.derivative(*single),
                    [a, b] => {
                        let (a, b) = (*a, *b);
                        let da = self.derivative(a)?;
                        let db = self.derivative(b)?;
                        let le = self.cache.binary(Le, a, b);
                        let not_le = self.cache.sub(one, le);
                        let (first, second) = if node.op == Min { (da, db) } else { (db, da) };
                        let lhs = self.cache.mul(le, first);
                        let rhs = self.cache.mul(not_le, second);
                        Ok(self.cache.add(lhs, rhs))
                    }
                    [head, rest @ ..] => {
                        let folded = rest
                            .iter()
                            .fold(*head, |acc, &arg| self.cache.binary(node.op, acc, arg));
                        self.derivative(folded)
                    }
                }
            }
            Copy => match x {
                Some(x) => self.derivative(x),
                None => Ok(zero),
            },
            Integrate => Ok(x.unwrap_or(zero)),
            Differentiate => match x {
                Some(x) => {
                    let first = self.derivative(x)?;
                    self.derivative(first)
                }
                None => Ok(zero),
            },
            Data => Err(SimError::differentiation(
                "cannot differentiate an empirical curve",
            )),
            Floor | Frac | UserFunction => Err(SimError::differentiation(format!(
                "{} cannot be differentiated symbolically",
                node.op
            ))),
            Sqrt | Exp | Ln | Sin | Cos | Tan | Asin | Acos | Atan | Sinh | Cosh | Tanh | Abs
            | Percent => {
                let Some(x) = x else { return Ok(zero) };
                let outer = self.outer_derivative(node.op, x);
                self.chain(x, outer)
            }
        }
    }

    /// `f'(x)` for the elementary functions.
    fn outer_derivative(&mut self, op: OperationType, x: NodeId) -> NodeId {
        use OperationType::*;
        let one = self.cache.one();
        let c = &mut self.cache;
        match op {
            Sqrt => {
                let half = c.constant(0.5);
                let root = c.unary(Sqrt, x);
                c.div(half, root)
            }
            Exp => c.unary(Exp, x),
            Ln => c.div(one, x),
            Sin => c.unary(Cos, x),
            Cos => {
                let minus = c.constant(-1.0);
                let sin = c.unary(Sin, x);
                c.mul(minus, sin)
            }
            Tan => {
                let cos = c.unary(Cos, x);
                let sec = c.div(one, cos);
                c.mul(sec, sec)
            }
            Asin | Acos => {
                let x2 = c.mul(x, x);
                let diff = c.sub(one, x2);
                let root = c.unary(Sqrt, diff);
                let numerator = if op == Asin { one } else { c.constant(-1.0) };
                c.div(numerator, root)
            }
            Atan => {
                let x2 = c.mul(x, x);
                let sum = c.add(one, x2);
                c.div(one, sum)
            }
            Sinh => c.unary(Cosh, x),
            Cosh => c.unary(Sinh, x),
            Tanh => {
                let cosh = c.unary(Cosh, x);
                let sech = c.div(one, cosh);
                c.mul(sech, sech)
            }
            Abs => {
                let zero = c.zero();
                let negative = c.binary(Le, x, zero);
                let positive = c.sub(one, negative);
                c.sub(positive, negative)
            }
            Percent => c.constant(100.0),
            _ => c.zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::godley::GodleySettings;
    use crate::model::{DataTable, ItemId, Model};
    use crate::value::{ValueStore, VariableValues};

    #[test]
    fn derivative_names_count_orders() {
        assert_eq!(differentiate_name("x"), "dx/dt");
        assert_eq!(differentiate_name("dx/dt"), "d^{2}x/dt^{2}");
        assert_eq!(differentiate_name("d^{2}x/dt^{2}"), "d^{3}x/dt^{3}");
        assert_eq!(differentiate_name("d^{2}x/dt^{3}"), "dd^{2}x/dt^{3}/dt");
    }

    /// Model `y = op(x)` with `x` a stock fed by a constant rate of 1, so
    /// `dy/dt = op'(x)`.
    fn unary_model(op: OperationType) -> (Model, ItemId) {
        let mut model = Model::new();
        let rate = model.add_variable("rate", VariableType::Parameter, "1");
        let int = model.add_integral("x", "0.5");
        let f = model.add_operation(op);
        let y = model.add_variable("y", VariableType::Flow, "");
        model.connect(rate, int, 1);
        model.connect(int, f, 1);
        model.connect(f, y, 1);
        (model, f)
    }

    fn evaluate_derivative(model: &Model, item: ItemId, x: f64) -> f64 {
        let values = VariableValues::from_model(model).expect("values");
        let mut system =
            SystemOfEquations::new(model, values, GodleySettings::default()).expect("system");
        let node = system.resolve(item).expect("resolve").expect("node");
        let d = system.derivative(node).expect("derivative");
        let mut target = VariableNode::new(":d", "d", VariableType::Flow, "");
        target.rhs = Some(d);
        system.values.insert(VariableValue::new(":d", None, VariableType::Flow, "0"));
        let d_var = system
            .cache
            .insert(CacheKey::Var(":d".into()), Node::Variable(target));
        system.variables.push(d_var);
        let mut store = ValueStore::default();
        let (program, _) = system.populate_eval_ops(&mut store).expect("compile");
        system.values.reset(&mut store).expect("reset");
        let x_slot = system.values.get(":x").and_then(|v| v.slot()).expect("x");
        store.write(&x_slot, &[x]);
        let sv = store.stock_vars.clone();
        program.eval(&mut store.flow_vars, &sv, 0.0).expect("eval");
        let slot = system.values.get(":d").and_then(|v| v.slot()).expect("d");
        store.read(&slot)[0]
    }

    #[test]
    fn sin_differentiates_to_cos() {
        let (model, f) = unary_model(OperationType::Sin);
        let d = evaluate_derivative(&model, f, 0.3);
        assert!((d - 0.3f64.cos()).abs() < 1e-12);
    }

    #[test]
    fn abs_differentiates_to_sign() {
        let (model, f) = unary_model(OperationType::Abs);
        assert_eq!(evaluate_derivative(&model, f, -2.0), -1.0);
        assert_eq!(evaluate_derivative(&model, f, 2.0), 1.0);
    }

    #[test]
    fn derivative_of_a_stock_is_its_integrand() {
        let (model, _) = unary_model(OperationType::Sin);
        let values = VariableValues::from_model(&model).expect("values");
        let mut system =
            SystemOfEquations::new(&model, values, GodleySettings::default()).expect("system");
        let x = system
            .cache
            .get(&CacheKey::Var(":x".into()))
            .expect("stock");
        let dx = system.derivative(x).expect("derivative");
        match system.cache.node(dx) {
            Node::Variable(v) => {
                assert_eq!(v.name, "dx/dt");
                let rhs = v.rhs.expect("rhs");
                assert!(matches!(system.cache.node(rhs), Node::Variable(r) if r.name == "rate"));
            }
            other => panic!("unexpected node {other:?}"),
        }
        assert!(system.values.contains(":dx/dt"));
        // memoized
        assert_eq!(system.derivative(x).expect("derivative"), dx);
    }

    #[test]
    fn empirical_curves_cannot_be_differentiated() {
        let mut model = Model::new();
        let p = model.add_variable("p", VariableType::Parameter, "1");
        let data = model.add_data_operation(DataTable::new(vec![(0.0, 0.0), (1.0, 1.0)]));
        model.connect(p, data, 1);
        let values = VariableValues::from_model(&model).expect("values");
        let mut system =
            SystemOfEquations::new(&model, values, GodleySettings::default()).expect("system");
        let node = system.resolve(data).expect("resolve").expect("node");
        let err = system.derivative(node).expect_err("data");
        assert!(matches!(err, SimError::Differentiation { .. }));
        assert_eq!(err.item(), Some(data));
    }

    #[test]
    fn constants_and_comparisons_have_zero_derivative() {
        let mut model = Model::new();
        let p = model.add_variable("p", VariableType::Parameter, "1");
        let q = model.add_variable("q", VariableType::Parameter, "2");
        let lt = model.add_operation(OperationType::Lt);
        model.connect(p, lt, 1);
        model.connect(q, lt, 2);
        let values = VariableValues::from_model(&model).expect("values");
        let mut system =
            SystemOfEquations::new(&model, values, GodleySettings::default()).expect("system");
        let node = system.resolve(lt).expect("resolve").expect("node");
        let zero = system.cache.zero();
        assert_eq!(system.derivative(node).expect("derivative"), zero);
        assert_eq!(system.derivative(zero).expect("derivative"), zero);
    }
}
