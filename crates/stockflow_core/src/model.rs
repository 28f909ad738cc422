//! The graph a host hands to the compiler: items joined by wires.
//!
//! Every item has one output (port 0). Input ports are numbered from 1:
//! variables, locks and unary operations take port 1; binary operations
//! take ports 1 and 2; integrals take the integrand on port 1 and an
//! optional initial value on port 2; switches take the selector on port 1
//! and the cases on ports 2 onwards.

use crate::error::{Result, SimError};
use crate::godley::GodleyTable;
use crate::operation::OperationType;
use crate::value::VariableType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub usize);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// Enclosing group; `None` is the global scope.
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    pub kind: ItemKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemKind {
    Variable(VariableItem),
    Operation(OperationItem),
    Integral(IntegralItem),
    Switch(SwitchItem),
    Lock,
    Godley(GodleyTable),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableItem {
    pub name: String,
    pub kind: VariableType,
    #[serde(default)]
    pub init: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationItem {
    pub op: OperationType,
    /// Lookup table for `data` operations.
    #[serde(default)]
    pub data: Option<DataTable>,
    /// Body of a `user_function` over the arguments `x` and `y`.
    #[serde(default)]
    pub expression: Option<String>,
}

/// An integral operation and the name of the variable it integrates into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegralItem {
    pub name: String,
    #[serde(default)]
    pub init: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchItem {
    pub num_cases: usize,
}

/// Empirical curve used by `data` operations, sorted by `x`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "DataPoints")]
pub struct DataTable {
    points: Vec<(f64, f64)>,
}

/// Unsorted wire form of a [`DataTable`].
#[derive(Deserialize)]
struct DataPoints {
    points: Vec<(f64, f64)>,
}

impl From<DataPoints> for DataTable {
    fn from(data: DataPoints) -> Self {
        DataTable::new(data.points)
    }
}

impl DataTable {
    pub fn new(mut points: Vec<(f64, f64)>) -> Self {
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { points }
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Index of the segment containing `x`, clamped to the table.
    fn segment(&self, x: f64) -> Option<usize> {
        if self.points.len() < 2 {
            return None;
        }
        let upper = self.points.partition_point(|p| p.0 <= x);
        Some(upper.clamp(1, self.points.len() - 1) - 1)
    }

    /// Linear interpolation, clamped to the end values outside the table.
    pub fn interpolate(&self, x: f64) -> f64 {
        let (first, last) = match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return 0.0,
        };
        if x <= first.0 {
            return first.1;
        }
        if x >= last.0 {
            return last.1;
        }
        match self.segment(x) {
            Some(i) => {
                let (x0, y0) = self.points[i];
                let (x1, y1) = self.points[i + 1];
                y0 + (x - x0) * (y1 - y0) / (x1 - x0)
            }
            None => first.1,
        }
    }

    /// Slope of the segment containing `x`; zero outside the table.
    pub fn slope(&self, x: f64) -> f64 {
        let (first, last) = match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return 0.0,
        };
        if x < first.0 || x > last.0 {
            return 0.0;
        }
        match self.segment(x) {
            Some(i) => {
                let (x0, y0) = self.points[i];
                let (x1, y1) = self.points[i + 1];
                (y1 - y0) / (x1 - x0)
            }
            None => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wire {
    pub from: ItemId,
    pub to: ItemId,
    pub port: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Model {
    pub items: Vec<Item>,
    pub wires: Vec<Wire>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: ItemKind) -> ItemId {
        let id = ItemId(self.items.len());
        self.items.push(Item {
            id,
            scope: None,
            x: 0.0,
            y: 0.0,
            kind,
        });
        id
    }

    pub fn add_variable(&mut self, name: &str, kind: VariableType, init: &str) -> ItemId {
        self.push(ItemKind::Variable(VariableItem {
            name: name.to_string(),
            kind,
            init: init.to_string(),
        }))
    }

    pub fn add_operation(&mut self, op: OperationType) -> ItemId {
        self.push(ItemKind::Operation(OperationItem {
            op,
            data: None,
            expression: None,
        }))
    }

    pub fn add_data_operation(&mut self, table: DataTable) -> ItemId {
        self.push(ItemKind::Operation(OperationItem {
            op: OperationType::Data,
            data: Some(table),
            expression: None,
        }))
    }

    pub fn add_user_function(&mut self, expression: &str) -> ItemId {
        self.push(ItemKind::Operation(OperationItem {
            op: OperationType::UserFunction,
            data: None,
            expression: Some(expression.to_string()),
        }))
    }

    pub fn add_integral(&mut self, name: &str, init: &str) -> ItemId {
        self.push(ItemKind::Integral(IntegralItem {
            name: name.to_string(),
            init: init.to_string(),
        }))
    }

    pub fn add_switch(&mut self, num_cases: usize) -> ItemId {
        self.push(ItemKind::Switch(SwitchItem { num_cases }))
    }

    pub fn add_lock(&mut self) -> ItemId {
        self.push(ItemKind::Lock)
    }

    pub fn add_godley(&mut self, table: GodleyTable) -> ItemId {
        self.push(ItemKind::Godley(table))
    }

    /// Wires the output of `from` into input `port` of `to`.
    pub fn connect(&mut self, from: ItemId, to: ItemId, port: usize) {
        self.wires.push(Wire { from, to, port });
    }

    pub fn set_scope(&mut self, id: ItemId, scope: &str) {
        if let Some(item) = self.item_mut(id) {
            item.scope = Some(scope.to_string());
        }
    }

    pub fn set_position(&mut self, id: ItemId, x: f64, y: f64) {
        if let Some(item) = self.item_mut(id) {
            item.x = x;
            item.y = y;
        }
    }

    pub fn item(&self, id: ItemId) -> Option<&Item> {
        match self.items.get(id.0) {
            Some(item) if item.id == id => Some(item),
            _ => self.items.iter().find(|item| item.id == id),
        }
    }

    fn item_mut(&mut self, id: ItemId) -> Option<&mut Item> {
        let pos = match self.items.get(id.0) {
            Some(item) if item.id == id => Some(id.0),
            _ => self.items.iter().position(|item| item.id == id),
        };
        pos.map(move |p| &mut self.items[p])
    }

    /// Wires attached to input `port` of `id`, in insertion order.
    pub fn wires_into(&self, id: ItemId, port: usize) -> impl Iterator<Item = &Wire> + '_ {
        self.wires
            .iter()
            .filter(move |w| w.to == id && w.port == port)
    }

    pub fn has_input(&self, id: ItemId) -> bool {
        self.wires.iter().any(|w| w.to == id && w.port == 1)
    }

    /// Fails if instantaneous dependencies form a loop.
    ///
    /// Integrals and accounting tables break loops because their outputs
    /// only depend on their inputs through the integrator.
    pub fn check_cycles(&self) -> Result<()> {
        let index_of = |id: ItemId| self.items.iter().position(|item| item.id == id);
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); self.items.len()];
        for wire in &self.wires {
            let (Some(from), Some(to)) = (index_of(wire.from), index_of(wire.to)) else {
                continue;
            };
            if matches!(
                self.items[to].kind,
                ItemKind::Integral(_) | ItemKind::Godley(_)
            ) {
                continue;
            }
            edges[from].push(to);
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }
        let mut marks = vec![Mark::Unvisited; self.items.len()];
        for start in 0..self.items.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            marks[start] = Mark::OnStack;
            while let Some(top) = stack.last_mut() {
                let node = top.0;
                if let Some(&succ) = edges[node].get(top.1) {
                    top.1 += 1;
                    match marks[succ] {
                        Mark::OnStack => {
                            return Err(SimError::structural("cyclic network detected")
                                .with_item(self.items[succ].id));
                        }
                        Mark::Unvisited => {
                            marks[succ] = Mark::OnStack;
                            stack.push((succ, 0));
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
        Ok(())
    }
}
