//! Double-entry accounting tables and their evaluation as a sparse
//! stock-by-flow matrix.

use crate::error::{Result, SimError};
use crate::flow_coef::FlowCoef;
use crate::model::{ItemKind, Model};
use crate::value::{value_id, ValueStore, VariableValues};
use nalgebra_sparse::CooMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

const INITIAL_CONDITIONS: &str = "initial conditions";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    #[default]
    NoAssetClass,
    Asset,
    Liability,
    Equity,
}

/// A Godley table. Row 0 holds the column (stock) names, column 0 the row
/// labels; every other cell is a signed flow entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GodleyTable {
    pub cells: Vec<Vec<String>>,
    /// Asset class of each column; index 0 is the label column.
    #[serde(default)]
    pub asset_classes: Vec<AssetClass>,
}

impl GodleyTable {
    pub fn new(cells: Vec<Vec<String>>) -> Self {
        Self {
            cells,
            asset_classes: Vec::new(),
        }
    }

    pub fn with_asset_classes(mut self, classes: Vec<AssetClass>) -> Self {
        self.asset_classes = classes;
        self
    }

    pub fn rows(&self) -> usize {
        self.cells.len()
    }

    pub fn cols(&self) -> usize {
        self.cells.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.cells
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn asset_class(&self, col: usize) -> AssetClass {
        self.asset_classes.get(col).copied().unwrap_or_default()
    }

    /// Trimmed stock name heading `col`, if any.
    pub fn column_name(&self, col: usize) -> Option<&str> {
        if col == 0 {
            return None;
        }
        let name = self.cell(0, col).trim();
        (!name.is_empty()).then_some(name)
    }

    pub fn initial_condition_row(&self, row: usize) -> bool {
        row > 0
            && row < self.rows()
            && self
                .cell(row, 0)
                .trim()
                .eq_ignore_ascii_case(INITIAL_CONDITIONS)
    }

    /// Initial value for the stock in `col`, from the last non-empty
    /// initial-condition cell.
    pub fn initial_condition(&self, col: usize) -> Option<String> {
        (1..self.rows())
            .filter(|&row| self.initial_condition_row(row))
            .map(|row| FlowCoef::parse(self.cell(row, col)))
            .filter(|fc| fc.coef != 0.0 || !fc.name.is_empty())
            .last()
            .map(|fc| fc.to_string())
    }

    pub fn sign_convention_reversed(&self, col: usize, double_entry_compliant: bool) -> bool {
        double_entry_compliant
            && matches!(
                self.asset_class(col),
                AssetClass::Liability | AssetClass::Equity
            )
    }

    /// Flow names referenced by the non-initial-condition rows, in table order.
    pub fn flow_names(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut names = Vec::new();
        for row in 1..self.rows() {
            if self.initial_condition_row(row) {
                continue;
            }
            for col in 1..self.cols() {
                let fc = FlowCoef::parse(self.cell(row, col));
                if !fc.name.is_empty() && seen.insert(fc.name.clone()) {
                    names.push(fc.name);
                }
            }
        }
        names
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GodleySettings {
    /// Skip the shared-column rules and simply sum shared columns.
    pub compatibility: bool,
    /// Reverse the sign of liability and equity columns.
    pub double_entry_compliant: bool,
}

/// Tracks column names across tables so that shared columns obey the
/// asset/liability pairing rules.
#[derive(Debug, Default)]
struct SharedColumnCheck {
    col_asset_type: BTreeMap<String, AssetClass>,
    shared_col: BTreeSet<String>,
    col_def: BTreeMap<String, BTreeMap<String, f64>>,
}

impl SharedColumnCheck {
    fn check_shared(&mut self, name: &str, class: AssetClass) -> Result<()> {
        let Some(&previous) = self.col_asset_type.get(name) else {
            self.col_asset_type.insert(name.to_string(), class);
            return Ok(());
        };
        let invalid_pair =
            || SimError::accounting(format!("shared column {name} is not an asset/liability pair"));
        match class {
            AssetClass::Liability if previous != AssetClass::Asset => return Err(invalid_pair()),
            AssetClass::Asset if previous != AssetClass::Liability => return Err(invalid_pair()),
            AssetClass::Liability | AssetClass::Asset | AssetClass::Equity => {}
            AssetClass::NoAssetClass => {
                return Err(SimError::accounting(format!(
                    "duplicated column {name} detected"
                )))
            }
        }
        if !self.shared_col.insert(name.to_string()) {
            return Err(SimError::accounting(format!(
                "more than two columns {name} detected"
            )));
        }
        Ok(())
    }

    /// Records a flow entry, returning true when `col` was already seen in
    /// another table.
    fn update_col_defs(&mut self, col: &str, fc: &FlowCoef) -> bool {
        let already_seen = self.shared_col.contains(col);
        let entry = self
            .col_def
            .entry(col.to_string())
            .or_default()
            .entry(fc.name.clone())
            .or_default();
        if already_seen {
            *entry -= fc.coef;
        } else {
            *entry += fc.coef;
        }
        already_seen
    }

    fn check_shared_col_defs(&self) -> Result<()> {
        for col in &self.shared_col {
            if let Some(defs) = self.col_def.get(col) {
                for (flow, net) in defs {
                    if net.abs() > 1e-30 {
                        return Err(SimError::accounting(format!(
                            "column {col} has mismatched flow {flow}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Sparse ledger: `stock[row] += flow[col] * coefficient`.
#[derive(Debug, Clone)]
pub struct EvalGodley {
    ledger: CooMatrix<f64>,
    init_idx: Vec<usize>,
}

impl Default for EvalGodley {
    fn default() -> Self {
        Self {
            ledger: CooMatrix::new(0, 0),
            init_idx: Vec::new(),
        }
    }
}

impl EvalGodley {
    /// Builds the ledger from every table in `model`. All referenced
    /// values must already be allocated in `store`.
    pub fn initialise(
        model: &Model,
        values: &VariableValues,
        store: &ValueStore,
        settings: &GodleySettings,
    ) -> Result<Self> {
        let mut check = SharedColumnCheck::default();
        let mut ledger = CooMatrix::new(store.stock_vars.len(), store.flow_vars.len());
        let mut touched = BTreeSet::new();
        if settings.compatibility {
            warn!("accounting compatibility mode: shared column checks disabled");
        }

        for item in &model.items {
            let ItemKind::Godley(table) = &item.kind else {
                continue;
            };
            if table.rows() == 0 {
                continue;
            }
            let scope = item.scope.as_deref();
            if !settings.compatibility {
                for col in 1..table.cols() {
                    if let Some(name) = table.column_name(col) {
                        check
                            .check_shared(&value_id(scope, name), table.asset_class(col))
                            .map_err(|e| e.with_item(item.id))?;
                    }
                }
            }

            for row in 1..table.rows() {
                if table.initial_condition_row(row) {
                    continue;
                }
                for col in 1..table.cols() {
                    let Some(stock_name) = table.column_name(col) else {
                        continue;
                    };
                    let mut fc = FlowCoef::parse(table.cell(row, col));
                    if fc.name.is_empty() {
                        continue;
                    }
                    fc.name = value_id(scope, &fc.name);
                    if table.sign_convention_reversed(col, settings.double_entry_compliant) {
                        fc.coef = -fc.coef;
                    }
                    let stock_id = value_id(scope, stock_name);
                    let stock = values.get(&stock_id).and_then(|v| v.idx());
                    let flow = values.get(&fc.name).and_then(|v| v.idx());
                    let (Some(stock), Some(flow)) = (stock, flow) else {
                        continue;
                    };
                    if !settings.compatibility && check.update_col_defs(&stock_id, &fc) {
                        continue;
                    }
                    touched.insert(stock);
                    ledger.push(stock, flow, fc.coef);
                }
            }
        }

        if !settings.compatibility {
            check.check_shared_col_defs()?;
        }
        debug!(
            triples = ledger.nnz(),
            stocks = touched.len(),
            "accounting ledger initialised"
        );
        Ok(Self {
            ledger,
            init_idx: touched.into_iter().collect(),
        })
    }

    /// Zeroes the touched stock slots of `sv`, then accumulates the ledger
    /// product of `fv` into them.
    pub fn eval(&self, sv: &mut [f64], fv: &[f64]) {
        for &i in &self.init_idx {
            sv[i] = 0.0;
        }
        for (s, f, coef) in self.ledger.triplet_iter() {
            sv[s] += fv[f] * coef;
        }
    }

    /// Number of (stock, flow, coefficient) triples.
    pub fn len(&self) -> usize {
        self.ledger.nnz()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.nnz() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::VariableType;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn table(cells: &[&[&str]]) -> GodleyTable {
        GodleyTable::new(
            cells
                .iter()
                .map(|row| row.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    fn build(model: &Model, settings: &GodleySettings) -> Result<(EvalGodley, VariableValues, ValueStore)> {
        let mut values = VariableValues::from_model(model)?;
        let mut store = ValueStore::default();
        values.allocate_all(&mut store);
        let godley = EvalGodley::initialise(model, &values, &store, settings)?;
        Ok((godley, values, store))
    }

    #[test]
    fn ledger_accumulates_signed_flows() {
        let mut model = Model::new();
        model.add_godley(table(&[
            &["", "Cash", "Loan"],
            &["Initial Conditions", "10", "5"],
            &["interest", "interest", "-interest"],
            &["lending", "2 lending", "lending"],
        ]));
        let (godley, values, store) = build(&model, &GodleySettings::default()).expect("ledger");
        assert_eq!(godley.len(), 4);

        let flow_idx = |name: &str| values.get(name).and_then(|v| v.idx()).expect("flow");
        let stock_idx = |name: &str| values.get(name).and_then(|v| v.idx()).expect("stock");
        let mut fv = store.flow_vars.clone();
        fv[flow_idx(":interest")] = 3.0;
        fv[flow_idx(":lending")] = 1.0;
        let mut sv = vec![99.0; store.stock_vars.len()];
        godley.eval(&mut sv, &fv);
        assert_eq!(sv[stock_idx(":Cash")], 5.0);
        assert_eq!(sv[stock_idx(":Loan")], -2.0);
    }

    #[test]
    fn double_entry_mode_reverses_liabilities() {
        let mut model = Model::new();
        model.add_godley(
            table(&[&["", "Cash", "Loan"], &["", "x", "x"]]).with_asset_classes(vec![
                AssetClass::NoAssetClass,
                AssetClass::Asset,
                AssetClass::Liability,
            ]),
        );
        let settings = GodleySettings {
            double_entry_compliant: true,
            ..Default::default()
        };
        let (godley, values, store) = build(&model, &settings).expect("ledger");
        let mut fv = store.flow_vars.clone();
        fv[values.get(":x").and_then(|v| v.idx()).expect("x")] = 1.0;
        let mut sv = vec![0.0; store.stock_vars.len()];
        godley.eval(&mut sv, &fv);
        assert_eq!(sv[values.get(":Cash").and_then(|v| v.idx()).expect("cash")], 1.0);
        assert_eq!(sv[values.get(":Loan").and_then(|v| v.idx()).expect("loan")], -1.0);
    }

    #[test]
    fn shared_asset_liability_pair_is_counted_once() {
        let mut model = Model::new();
        model.add_godley(
            table(&[&["", "Deposits"], &["", "wages"]])
                .with_asset_classes(vec![AssetClass::NoAssetClass, AssetClass::Asset]),
        );
        model.add_godley(
            table(&[&["", "Deposits"], &["", "wages"]])
                .with_asset_classes(vec![AssetClass::NoAssetClass, AssetClass::Liability]),
        );
        let (godley, _, _) = build(&model, &GodleySettings::default()).expect("ledger");
        assert_eq!(godley.len(), 1);
    }

    #[test]
    fn shared_column_rules_are_enforced() {
        let mut model = Model::new();
        model.add_godley(table(&[&["", "A"], &["", "x"]]));
        model.add_godley(table(&[&["", "A"], &["", "x"]]));
        assert_err_contains(build(&model, &GodleySettings::default()), "duplicated column");

        let classes = |c| vec![AssetClass::NoAssetClass, c];
        let mut model = Model::new();
        model.add_godley(table(&[&["", "A"], &["", "x"]]).with_asset_classes(classes(AssetClass::Asset)));
        model.add_godley(table(&[&["", "A"], &["", "x"]]).with_asset_classes(classes(AssetClass::Asset)));
        assert_err_contains(build(&model, &GodleySettings::default()), "not an asset/liability pair");

        let mut model = Model::new();
        model.add_godley(table(&[&["", "A"], &["", "x"]]).with_asset_classes(classes(AssetClass::Asset)));
        model.add_godley(table(&[&["", "A"], &["", "2x"]]).with_asset_classes(classes(AssetClass::Liability)));
        assert_err_contains(build(&model, &GodleySettings::default()), "column :A has mismatched flow :x");

        let mut model = Model::new();
        model.add_godley(table(&[&["", "A"], &["", "x"]]).with_asset_classes(classes(AssetClass::Asset)));
        model.add_godley(table(&[&["", "A"], &["", "x"]]).with_asset_classes(classes(AssetClass::Liability)));
        model.add_godley(table(&[&["", "A"], &["", "x"]]).with_asset_classes(classes(AssetClass::Liability)));
        assert_err_contains(build(&model, &GodleySettings::default()), "more than two columns");
    }

    #[test]
    fn compatibility_mode_sums_shared_columns() {
        let mut model = Model::new();
        model.add_godley(table(&[&["", "A"], &["", "x"]]));
        model.add_godley(table(&[&["", "A"], &["", "x"]]));
        let settings = GodleySettings {
            compatibility: true,
            ..Default::default()
        };
        let (godley, _, _) = build(&model, &settings).expect("ledger");
        assert_eq!(godley.len(), 2);
    }

    #[test]
    fn initial_condition_row_is_case_insensitive() {
        let t = table(&[&["", "A"], &["  initial CONDITIONS ", "7"], &["", "x"]]);
        assert!(t.initial_condition_row(1));
        assert!(!t.initial_condition_row(2));
        assert_eq!(t.initial_condition(1).as_deref(), Some("7"));
        assert_eq!(t.flow_names(), vec!["x".to_string()]);
        let values = {
            let mut model = Model::new();
            model.add_godley(t);
            VariableValues::from_model(&model).expect("values")
        };
        assert_eq!(values.get(":A").map(|v| v.kind), Some(VariableType::Stock));
    }
}
