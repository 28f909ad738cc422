use crate::error::{Result, SimError};
use crate::flow_coef::FlowCoef;
use crate::model::{Item, ItemKind, Model};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    Undefined,
    Constant,
    Parameter,
    Flow,
    Stock,
    Integral,
    TempFlow,
}

impl VariableType {
    /// Flow variables live in the flow vector, everything else is integrated.
    pub fn is_flow_var(self) -> bool {
        !matches!(self, VariableType::Stock | VariableType::Integral)
    }

    pub fn name(self) -> &'static str {
        match self {
            VariableType::Undefined => "undefined",
            VariableType::Constant => "constant",
            VariableType::Parameter => "parameter",
            VariableType::Flow => "flow",
            VariableType::Stock => "stock",
            VariableType::Integral => "integral",
            VariableType::TempFlow => "tempFlow",
        }
    }
}

/// Qualified identifier of a variable value: `scope:name`. Names starting
/// with `:` refer to the global scope.
pub fn value_id(scope: Option<&str>, name: &str) -> String {
    let name = name.trim();
    if name.starts_with(':') {
        name.to_string()
    } else {
        format!("{}:{}", scope.unwrap_or(""), name)
    }
}

/// The name part of a value id.
pub fn uq_name(value_id: &str) -> &str {
    value_id.rsplit(':').next().unwrap_or(value_id)
}

/// Dimensions of a tensor value. Scalars have no dimensions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    pub dims: Vec<usize>,
}

impl TensorShape {
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }
}

/// A reference to storage in the flow or stock vector.
///
/// `constant` is set when the slot holds a value known at compile time,
/// which lets the compiler fold literal zeros.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slot {
    pub idx: usize,
    pub flow: bool,
    pub width: usize,
    pub constant: Option<f64>,
}

impl Slot {
    pub fn flow(idx: usize, width: usize) -> Self {
        Self {
            idx,
            flow: true,
            width,
            constant: None,
        }
    }

    pub fn stock(idx: usize, width: usize) -> Self {
        Self {
            idx,
            flow: false,
            width,
            constant: None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.constant == Some(0.0)
    }

    pub fn same_storage(&self, other: &Slot) -> bool {
        self.idx == other.idx && self.flow == other.flow
    }
}

/// The flat arrays every compiled instruction reads and writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueStore {
    pub flow_vars: Vec<f64>,
    pub stock_vars: Vec<f64>,
}

impl ValueStore {
    pub fn alloc_flow(&mut self, width: usize) -> usize {
        let idx = self.flow_vars.len();
        self.flow_vars.resize(idx + width.max(1), 0.0);
        idx
    }

    pub fn alloc_stock(&mut self, width: usize) -> usize {
        let idx = self.stock_vars.len();
        self.stock_vars.resize(idx + width.max(1), 0.0);
        idx
    }

    pub fn read(&self, slot: &Slot) -> &[f64] {
        let vars = if slot.flow {
            &self.flow_vars
        } else {
            &self.stock_vars
        };
        let end = (slot.idx + slot.width).min(vars.len());
        &vars[slot.idx.min(end)..end]
    }

    pub fn write(&mut self, slot: &Slot, data: &[f64]) {
        let vars = if slot.flow {
            &mut self.flow_vars
        } else {
            &mut self.stock_vars
        };
        for (i, value) in data.iter().take(slot.width).enumerate() {
            if let Some(target) = vars.get_mut(slot.idx + i) {
                *target = *value;
            }
        }
    }
}

/// Named storage for one variable, shared by every graph instance with
/// the same value id.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableValue {
    pub name: String,
    pub value_id: String,
    pub scope: Option<String>,
    pub kind: VariableType,
    pub init: String,
    pub shape: TensorShape,
    /// Initial value supplied by an accounting table rather than the user.
    pub godley_overridden: bool,
    idx: Option<usize>,
}

impl VariableValue {
    pub fn new(value_id: &str, scope: Option<&str>, kind: VariableType, init: &str) -> Self {
        Self {
            name: uq_name(value_id).to_string(),
            value_id: value_id.to_string(),
            scope: scope.map(str::to_string),
            kind,
            init: init.to_string(),
            shape: TensorShape::scalar(),
            godley_overridden: false,
            idx: None,
        }
    }

    pub fn idx(&self) -> Option<usize> {
        self.idx
    }

    pub fn is_flow_var(&self) -> bool {
        self.kind.is_flow_var()
    }

    pub fn width(&self) -> usize {
        self.shape.size().max(1)
    }

    pub fn slot(&self) -> Option<Slot> {
        self.idx.map(|idx| Slot {
            idx,
            flow: self.is_flow_var(),
            width: self.width(),
            constant: None,
        })
    }

    /// Reserves storage in the vector matching this value's type.
    pub fn alloc(&mut self, store: &mut ValueStore) -> Slot {
        if self.idx.is_none() {
            let width = self.width();
            self.idx = Some(if self.is_flow_var() {
                store.alloc_flow(width)
            } else {
                store.alloc_stock(width)
            });
        }
        let idx = self.idx.unwrap_or_default();
        Slot {
            idx,
            flow: self.is_flow_var(),
            width: self.width(),
            constant: None,
        }
    }
}

/// All variable values of a model, keyed by value id.
#[derive(Debug, Clone, Default)]
pub struct VariableValues {
    values: BTreeMap<String, VariableValue>,
}

impl VariableValues {
    /// Collects the values declared by variables, integrals and the columns
    /// and flows of accounting tables.
    pub fn from_model(model: &Model) -> Result<Self> {
        let mut values = Self::default();
        for item in &model.items {
            match &item.kind {
                ItemKind::Variable(var) => values.declare(item, &var.name, var.kind, &var.init)?,
                ItemKind::Integral(integral) => {
                    values.declare(item, &integral.name, VariableType::Integral, &integral.init)?
                }
                _ => {}
            }
        }

        for item in &model.items {
            let ItemKind::Godley(table) = &item.kind else {
                continue;
            };
            let scope = item.scope.as_deref();
            for col in 1..table.cols() {
                let Some(column) = table.column_name(col) else {
                    continue;
                };
                let vid = value_id(scope, column);
                let init = table.initial_condition(col);
                match values.values.get_mut(&vid) {
                    Some(existing) if existing.kind != VariableType::Stock => {
                        return Err(SimError::structural(format!(
                            "accounting column {} clashes with a {} variable",
                            column,
                            existing.kind.name()
                        ))
                        .with_item(item.id));
                    }
                    Some(existing) => {
                        if let Some(init) = init {
                            if !existing.godley_overridden {
                                existing.init = init;
                                existing.godley_overridden = true;
                            }
                        }
                    }
                    None => {
                        let mut value = VariableValue::new(&vid, scope, VariableType::Stock, "0");
                        if let Some(init) = init {
                            value.init = init;
                            value.godley_overridden = true;
                        }
                        values.values.insert(vid, value);
                    }
                }
            }
            for flow in table.flow_names() {
                let vid = value_id(scope, &flow);
                match values.values.get(&vid) {
                    Some(existing) if !existing.is_flow_var() => {
                        return Err(SimError::structural(format!(
                            "{} is used as a flow but is a {} variable",
                            flow,
                            existing.kind.name()
                        ))
                        .with_item(item.id));
                    }
                    Some(_) => {}
                    None => {
                        values
                            .values
                            .insert(vid.clone(), VariableValue::new(&vid, scope, VariableType::Flow, "0"));
                    }
                }
            }
        }

        let ids: Vec<String> = values.values.keys().cloned().collect();
        for vid in ids {
            let shape = values.values.get(&vid).and_then(|v| generator_shape(&v.init));
            if let (Some(shape), Some(value)) = (shape, values.values.get_mut(&vid)) {
                value.shape = shape;
            }
        }
        Ok(values)
    }

    fn declare(&mut self, item: &Item, name: &str, kind: VariableType, init: &str) -> Result<()> {
        if kind == VariableType::Undefined {
            return Err(
                SimError::structural(format!("variable {name} has undefined type")).with_item(item.id)
            );
        }
        let scope = item.scope.as_deref();
        let vid = value_id(scope, name);
        match self.values.get_mut(&vid) {
            Some(existing) => {
                if existing.kind != kind {
                    return Err(SimError::structural(format!(
                        "type mismatch for {}: declared {}, expected {}",
                        name,
                        kind.name(),
                        existing.kind.name()
                    ))
                    .with_item(item.id));
                }
                if existing.init.trim().is_empty() && !init.trim().is_empty() {
                    existing.init = init.to_string();
                }
            }
            None => {
                self.values
                    .insert(vid.clone(), VariableValue::new(&vid, scope, kind, init));
            }
        }
        Ok(())
    }

    pub fn get(&self, value_id: &str) -> Option<&VariableValue> {
        self.values.get(value_id)
    }

    pub fn get_mut(&mut self, value_id: &str) -> Option<&mut VariableValue> {
        self.values.get_mut(value_id)
    }

    pub fn contains(&self, value_id: &str) -> bool {
        self.values.contains_key(value_id)
    }

    pub fn insert(&mut self, value: VariableValue) {
        self.values.insert(value.value_id.clone(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariableValue> {
        self.values.values()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Allocates storage for `value_id`, returning its slot.
    pub fn allocate(&mut self, value_id: &str, store: &mut ValueStore) -> Result<Slot> {
        match self.values.get_mut(value_id) {
            Some(value) => Ok(value.alloc(store)),
            None => Err(SimError::structural(format!("unknown variable {value_id}"))),
        }
    }

    /// Allocates every value that does not yet have storage.
    pub fn allocate_all(&mut self, store: &mut ValueStore) {
        for value in self.values.values_mut() {
            value.alloc(store);
        }
    }

    /// Evaluates the initial value of `value_id`.
    pub fn init_value(&self, value_id: &str) -> Result<Vec<f64>> {
        let mut visited = BTreeSet::new();
        self.init_value_inner(value_id, &mut visited)
    }

    fn init_value_inner(&self, value_id: &str, visited: &mut BTreeSet<String>) -> Result<Vec<f64>> {
        let value = self
            .values
            .get(value_id)
            .ok_or_else(|| SimError::structural(format!("unknown variable {value_id}")))?;
        if !visited.insert(value_id.to_string()) {
            return Err(SimError::structural(format!(
                "circular definition of initial value for {}",
                value.name
            )));
        }

        let result = if let Some(generated) = generate(&value.init) {
            generated
        } else {
            let fc = FlowCoef::parse(&value.init);
            if fc.name.is_empty() {
                vec![fc.coef; value.width()]
            } else {
                let other = self::value_id(value.scope.as_deref(), &fc.name);
                if !self.values.contains_key(&other) {
                    return Err(SimError::structural(format!(
                        "unknown variable {} in initialisation of {}",
                        fc.name, value.name
                    )));
                }
                self.init_value_inner(&other, visited)?
                    .into_iter()
                    .map(|v| fc.coef * v)
                    .collect()
            }
        };
        visited.remove(value_id);
        Ok(result)
    }

    /// Writes the initial value of every allocated value into `store`.
    pub fn reset(&self, store: &mut ValueStore) -> Result<()> {
        for value in self.values.values() {
            if let Some(slot) = value.slot() {
                let init = self.init_value(&value.value_id)?;
                store.write(&slot, &init);
            }
        }
        Ok(())
    }
}

/// Splits `name(a,b,..)` into the name and its integer arguments.
fn parse_generator(init: &str) -> Option<(&str, Vec<usize>)> {
    let init = init.trim();
    let open = init.find('(')?;
    let body = init[open + 1..].strip_suffix(')')?;
    let name = init[..open].trim();
    if !matches!(name, "iota" | "one" | "zero" | "eye") {
        return None;
    }
    let dims = body
        .split(',')
        .map(|arg| arg.trim().parse::<usize>().ok())
        .collect::<Option<Vec<usize>>>()?;
    if dims.is_empty() || dims.contains(&0) {
        return None;
    }
    Some((name, dims))
}

fn generator_shape(init: &str) -> Option<TensorShape> {
    let (name, mut dims) = parse_generator(init)?;
    if name == "eye" && dims.len() == 1 {
        dims.push(dims[0]);
    }
    Some(TensorShape { dims })
}

/// Values of a tensor generator, in row-major order.
fn generate(init: &str) -> Option<Vec<f64>> {
    let (name, _) = parse_generator(init)?;
    let shape = generator_shape(init)?;
    let size = shape.size();
    Some(match name {
        "iota" => (0..size).map(|i| i as f64).collect(),
        "one" => vec![1.0; size],
        "zero" => vec![0.0; size],
        _ => {
            let cols = shape.dims.last().copied().unwrap_or(1);
            (0..size)
                .map(|i| if i / cols == i % cols { 1.0 } else { 0.0 })
                .collect()
        }
    })
}
