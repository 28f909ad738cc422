//! Compiled instructions and the interpreter that runs them.

use crate::dag::OpState;
use crate::error::{Result, SimError};
use crate::model::ItemId;
use crate::operation::OperationType;
use crate::value::Slot;

/// A read-only reference into the flow or stock vector. Width-1 operands
/// broadcast across every element of a wider instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Operand {
    pub idx: usize,
    pub flow: bool,
    pub width: usize,
}

impl From<Slot> for Operand {
    fn from(slot: Slot) -> Self {
        Self {
            idx: slot.idx,
            flow: slot.flow,
            width: slot.width,
        }
    }
}

impl Operand {
    fn read(&self, flow: &[f64], stock: &[f64], i: usize) -> f64 {
        let vars = if self.flow { flow } else { stock };
        let offset = if self.width == 1 { 0 } else { i };
        vars.get(self.idx + offset).copied().unwrap_or(0.0)
    }
}

/// One instruction: `fv[out..out+width] = op(in1, in2)`.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOp {
    pub op: OperationType,
    pub out: usize,
    pub width: usize,
    pub in1: Option<Operand>,
    pub in2: Option<Operand>,
    /// Value written by a `constant` instruction.
    pub value: f64,
    pub state: OpState,
    pub item: Option<ItemId>,
}

impl EvalOp {
    pub fn new(op: OperationType, out: Slot, in1: Option<Slot>, in2: Option<Slot>) -> Self {
        Self {
            op,
            out: out.idx,
            width: out.width.max(1),
            in1: in1.map(Operand::from),
            in2: in2.map(Operand::from),
            value: 0.0,
            state: OpState::None,
            item: None,
        }
    }

    pub fn constant(out: Slot, value: f64) -> Self {
        Self {
            value,
            ..Self::new(OperationType::Constant, out, None, None)
        }
    }

    pub fn copy(out: Slot, from: Slot) -> Self {
        Self::new(OperationType::Copy, out, Some(from), None)
    }

    pub fn with_state(mut self, state: OpState) -> Self {
        self.state = state;
        self
    }

    pub fn with_item(mut self, item: Option<ItemId>) -> Self {
        self.item = item;
        self
    }

    fn evaluate(&self, x1: f64, x2: f64, t: f64) -> f64 {
        match (self.op, &self.state) {
            (OperationType::Constant, _) => self.value,
            (OperationType::Data, OpState::Data(table)) => table.interpolate(x1),
            (OperationType::UserFunction, OpState::UserFunction(f)) => f.evaluate(x1, x2),
            (op, _) => op.evaluate(x1, x2, t),
        }
    }

    fn d1(&self, x1: f64, x2: f64) -> Result<f64> {
        match (self.op, &self.state) {
            (OperationType::Constant, _) => Ok(0.0),
            (OperationType::Data, OpState::Data(table)) => Ok(table.slope(x1)),
            (op, _) => op.d1(x1, x2),
        }
    }

    fn error(&self, message: String) -> SimError {
        SimError::numeric(message).with_optional_item(self.item)
    }

    fn describe(&self, x1: f64, x2: f64) -> String {
        match (self.in1, self.in2) {
            (Some(_), Some(_)) => format!("{}({}, {})", self.op, x1, x2),
            (Some(_), None) => format!("{}({})", self.op, x1),
            _ => format!("{}()", self.op),
        }
    }

    /// Computes the instruction's output in place.
    pub fn eval(&self, fv: &mut [f64], sv: &[f64], t: f64) -> Result<()> {
        for i in 0..self.width {
            let x1 = self.in1.map_or(0.0, |o| o.read(fv, sv, i));
            let x2 = self.in2.map_or(0.0, |o| o.read(fv, sv, i));
            let y = self.evaluate(x1, x2, t);
            if !y.is_finite() {
                return Err(self.error(format!("invalid: {}", self.describe(x1, x2))));
            }
            if let Some(out) = fv.get_mut(self.out + i) {
                *out = y;
            }
        }
        Ok(())
    }

    /// Propagates the partials `df`/`ds` of the inputs to the output.
    pub fn deriv(&self, df: &mut [f64], ds: &[f64], sv: &[f64], fv: &[f64]) -> Result<()> {
        for i in 0..self.width {
            let (x1, dx1) = self
                .in1
                .map_or((0.0, 0.0), |o| (o.read(fv, sv, i), o.read(df, ds, i)));
            let (x2, dx2) = self
                .in2
                .map_or((0.0, 0.0), |o| (o.read(fv, sv, i), o.read(df, ds, i)));
            let mut d = 0.0;
            if dx1 != 0.0 {
                d += dx1 * self.d1(x1, x2).map_err(|e| e.with_optional_item(self.item))?;
            }
            if dx2 != 0.0 {
                d += dx2 * self.op.d2(x1, x2).map_err(|e| e.with_optional_item(self.item))?;
            }
            if !d.is_finite() {
                return Err(self.error(format!(
                    "invalid operation detected on a {} operation",
                    self.op
                )));
            }
            if let Some(out) = df.get_mut(self.out + i) {
                *out = d;
            }
        }
        Ok(())
    }
}

/// The ordered instruction list for one compiled model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalProgram {
    pub ops: Vec<EvalOp>,
}

impl EvalProgram {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn push(&mut self, op: EvalOp) {
        self.ops.push(op);
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvalOp> {
        self.ops.iter()
    }

    /// Runs every instruction in order, stopping at the first failure.
    pub fn eval(&self, fv: &mut [f64], sv: &[f64], t: f64) -> Result<()> {
        for op in &self.ops {
            op.eval(fv, sv, t)?;
        }
        Ok(())
    }

    pub fn deriv(&self, df: &mut [f64], ds: &[f64], sv: &[f64], fv: &[f64]) -> Result<()> {
        for op in &self.ops {
            op.deriv(df, ds, sv, fv)?;
        }
        Ok(())
    }
}

/// Links a stock to the flow slot holding its rate of change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Integral {
    pub stock: Slot,
    pub input: Slot,
    pub item: Option<ItemId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataTable;
    use std::sync::Arc;

    #[test]
    fn scalar_operands_broadcast() {
        let mut fv = vec![2.0, 1.0, 2.0, 3.0, 0.0, 0.0, 0.0];
        let op = EvalOp::new(
            OperationType::Multiply,
            Slot::flow(4, 3),
            Some(Slot::flow(1, 3)),
            Some(Slot::flow(0, 1)),
        );
        op.eval(&mut fv, &[], 0.0).expect("eval");
        assert_eq!(&fv[4..], &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn non_finite_results_name_the_operator() {
        let mut fv = vec![-1.0, 0.0];
        let op = EvalOp::new(OperationType::Ln, Slot::flow(1, 1), Some(Slot::flow(0, 1)), None)
            .with_item(Some(ItemId(7)));
        let err = op.eval(&mut fv, &[], 0.0).expect_err("ln(-1)");
        assert!(err.to_string().contains("ln"));
        assert_eq!(err.item(), Some(ItemId(7)));
    }

    #[test]
    fn stock_inputs_read_the_stock_vector() {
        let mut fv = vec![0.0];
        let op = EvalOp::copy(Slot::flow(0, 1), Slot::stock(1, 1));
        op.eval(&mut fv, &[5.0, 9.0], 0.0).expect("eval");
        assert_eq!(fv[0], 9.0);
    }

    #[test]
    fn deriv_applies_chain_rule() {
        // f = x * y with x a stock, y a flow
        let fv = vec![3.0, 0.0];
        let sv = vec![2.0];
        let op = EvalOp::new(
            OperationType::Multiply,
            Slot::flow(1, 1),
            Some(Slot::stock(0, 1)),
            Some(Slot::flow(0, 1)),
        );
        let mut df = vec![0.0, 0.0];
        op.deriv(&mut df, &[1.0], &sv, &fv).expect("deriv");
        assert_eq!(df[1], 3.0);
    }

    #[test]
    fn data_ops_interpolate_and_differentiate() {
        let table = Arc::new(DataTable::new(vec![(0.0, 0.0), (2.0, 4.0)]));
        let op = EvalOp::new(OperationType::Data, Slot::flow(1, 1), Some(Slot::stock(0, 1)), None)
            .with_state(OpState::Data(table));
        let mut fv = vec![0.0, 0.0];
        op.eval(&mut fv, &[1.0], 0.0).expect("eval");
        assert_eq!(fv[1], 2.0);
        let mut df = vec![0.0, 0.0];
        op.deriv(&mut df, &[1.0], &[1.0], &fv).expect("deriv");
        assert_eq!(df[1], 2.0);
    }

    #[test]
    fn comparisons_have_no_jacobian() {
        let op = EvalOp::new(
            OperationType::Lt,
            Slot::flow(0, 1),
            Some(Slot::stock(0, 1)),
            Some(Slot::stock(1, 1)),
        );
        let mut df = vec![0.0];
        assert!(op.deriv(&mut df, &[1.0, 0.0], &[0.0, 1.0], &[0.0]).is_err());
    }
}
