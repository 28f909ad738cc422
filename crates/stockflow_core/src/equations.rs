//! Builds the expression graph of a model and compiles it into an
//! [`EvalProgram`].
//!
//! Construction happens in phases so that every stock already has its
//! integral-input placeholder when flows referring to it are resolved:
//!
//! 1. integral inputs are created for every integral and accounting column,
//! 2. the integrands and column sums are resolved,
//! 3. every remaining flow variable is resolved and ranked by [`order`].
//!
//! [`order`]: SubexpressionCache::order

use crate::dag::{CacheKey, Node, NodeId, OpState, OperationNode, SubexpressionCache, VariableNode};
use crate::error::{Result, SimError};
use crate::eval_op::{EvalOp, EvalProgram, Integral};
use crate::expression::UserFunction;
use crate::flow_coef::FlowCoef;
use crate::godley::GodleySettings;
use crate::model::{Item, ItemId, ItemKind, Model, OperationItem, Wire};
use crate::operation::OperationType;
use crate::value::{value_id, Slot, ValueStore, VariableType, VariableValues};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// How an operation maps over tensor-valued arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorPlan {
    /// Every argument is a scalar.
    ScalarFallback,
    /// Apply elementwise over `width` elements, broadcasting scalars.
    Elementwise(usize),
}

impl TensorPlan {
    pub fn width(self) -> usize {
        match self {
            TensorPlan::ScalarFallback => 1,
            TensorPlan::Elementwise(width) => width,
        }
    }
}

/// Plans an elementwise operation over arguments of the given widths.
/// Non-scalar arguments must all have the same width.
pub fn plan_tensor(widths: impl IntoIterator<Item = usize>) -> Result<TensorPlan> {
    let mut plan = TensorPlan::ScalarFallback;
    for width in widths.into_iter().filter(|&w| w > 1) {
        match plan {
            TensorPlan::ScalarFallback => plan = TensorPlan::Elementwise(width),
            TensorPlan::Elementwise(existing) if existing != width => {
                return Err(SimError::structural(format!(
                    "tensor shape mismatch: {existing} elements vs {width}"
                )));
            }
            TensorPlan::Elementwise(_) => {}
        }
    }
    Ok(plan)
}

/// Instruction sink used while compiling.
struct Emitter<'s> {
    store: &'s mut ValueStore,
    program: EvalProgram,
    results: HashMap<NodeId, Slot>,
}

impl Emitter<'_> {
    fn temp(&mut self, width: usize) -> Slot {
        let width = width.max(1);
        Slot::flow(self.store.alloc_flow(width), width)
    }

    fn emit(&mut self, op: EvalOp) {
        self.program.push(op);
    }
}

struct GodleyColumnTerms {
    name: String,
    item: ItemId,
    positive: Vec<NodeId>,
    negative: Vec<NodeId>,
}

/// The expression graph of one model.
#[derive(Debug)]
pub struct SystemOfEquations<'m> {
    model: &'m Model,
    pub(crate) values: VariableValues,
    pub(crate) cache: SubexpressionCache,
    godley: GodleySettings,
    /// Defining item of every variable with a wired input.
    definitions: HashMap<String, ItemId>,
    /// Flow variables, ranked by order.
    pub(crate) variables: Vec<NodeId>,
    /// Stocks and integrals, by value id.
    pub(crate) integration_variables: Vec<NodeId>,
    pub(crate) derivatives: HashMap<NodeId, NodeId>,
    pub(crate) differentiating: HashSet<NodeId>,
}

impl<'m> SystemOfEquations<'m> {
    pub fn new(model: &'m Model, values: VariableValues, godley: GodleySettings) -> Result<Self> {
        model.check_cycles()?;
        let definitions = definitions(model)?;
        let mut system = Self {
            model,
            values,
            cache: SubexpressionCache::new(),
            godley,
            definitions,
            variables: Vec::new(),
            integration_variables: Vec::new(),
            derivatives: HashMap::new(),
            differentiating: HashSet::new(),
        };

        let mut integration: BTreeMap<String, NodeId> = BTreeMap::new();

        // integral inputs first, so differentiating a stock never has to
        // resolve the stock's own integrand
        for item in &model.items {
            if let ItemKind::Integral(integral) = &item.kind {
                let vid = value_id(item.scope.as_deref(), &integral.name);
                if model.has_input(item.id) {
                    system.add_integral_input(&vid, &integral.name, Some(item.id));
                }
            }
        }
        for vid in system.godley_column_ids() {
            let name = crate::value::uq_name(&vid).to_string();
            system.add_integral_input(&vid, &name, None);
        }

        for item in &model.items {
            let ItemKind::Integral(integral) = &item.kind else {
                continue;
            };
            let vid = value_id(item.scope.as_deref(), &integral.name);
            let var = system.make_var_dag(&vid)?;
            system.cache.set_variable_item(var, item.id);
            integration.insert(vid.clone(), var);
            system.set_integral_init(item, &vid)?;

            let input = model.wires_into(item.id, 1).next().copied();
            if let (Some(wire), Some(ii)) = (input, system.cache.integral_input(&vid)) {
                let rhs = system.node_from_wire(&wire)?;
                system.cache.set_rhs(ii, rhs);
            }
        }

        for (vid, column) in system.process_godley_tables()? {
            let var = system.make_var_dag(&vid)?;
            integration.insert(vid.clone(), var);
            if let Some(ii) = system.cache.integral_input(&vid) {
                system.cache.set_rhs(ii, Some(column));
            }
        }

        let flow_ids: Vec<String> = system
            .values
            .iter()
            .filter(|v| v.is_flow_var())
            .map(|v| v.value_id.clone())
            .collect();
        let mut variables = Vec::with_capacity(flow_ids.len());
        for vid in flow_ids {
            let id = system.make_var_dag(&vid)?;
            if matches!(system.cache.node(id), Node::Variable(_)) {
                variables.push(id);
            }
        }
        // derivative variables created on the way are flows too
        let derived: Vec<String> = system
            .values
            .iter()
            .filter(|v| v.is_flow_var())
            .map(|v| v.value_id.clone())
            .collect();
        for vid in derived {
            if let Some(id) = system.cache.get(&CacheKey::Var(vid)) {
                if !variables.contains(&id) && matches!(system.cache.node(id), Node::Variable(_)) {
                    variables.push(id);
                }
            }
        }

        let max_order = system.cache.len();
        let mut ranked = Vec::with_capacity(variables.len());
        for id in variables {
            ranked.push((system.cache.order(id, max_order)?, id));
        }
        for vid in integration.keys() {
            if let Some(ii) = system.cache.integral_input(vid) {
                system.cache.order(ii, max_order)?;
            }
        }
        ranked.sort_by_key(|(order, _)| *order);
        system.variables = ranked.into_iter().map(|(_, id)| id).collect();
        system.integration_variables = integration.into_values().collect();

        debug!(
            nodes = system.cache.len(),
            flows = system.variables.len(),
            stocks = system.integration_variables.len(),
            "expression graph built"
        );
        Ok(system)
    }

    pub fn model(&self) -> &'m Model {
        self.model
    }

    pub fn values(&self) -> &VariableValues {
        &self.values
    }

    pub fn into_values(self) -> VariableValues {
        self.values
    }

    pub fn cache(&self) -> &SubexpressionCache {
        &self.cache
    }

    /// Flow variables, ordered so that each only depends on earlier ones.
    pub fn variables(&self) -> &[NodeId] {
        &self.variables
    }

    pub fn integration_variables(&self) -> &[NodeId] {
        &self.integration_variables
    }

    fn add_integral_input(&mut self, vid: &str, name: &str, item: Option<ItemId>) {
        let mut node = VariableNode::new(vid, &format!("int_{name}"), VariableType::TempFlow, "");
        node.item = item;
        self.cache.insert_integral_input(vid, Node::IntegralInput(node));
    }

    fn godley_column_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for item in &self.model.items {
            if let ItemKind::Godley(table) = &item.kind {
                for col in 1..table.cols() {
                    if let Some(name) = table.column_name(col) {
                        let vid = value_id(item.scope.as_deref(), name);
                        if !ids.contains(&vid) {
                            ids.push(vid);
                        }
                    }
                }
            }
        }
        ids
    }

    /// The node computing the output of `item`. Accounting tables have no
    /// output and yield `None`. Resolving the same item twice returns the
    /// same node.
    pub fn resolve(&mut self, item: ItemId) -> Result<Option<NodeId>> {
        let model = self.model;
        let item = model
            .item(item)
            .ok_or_else(|| SimError::structural(format!("unknown item {}", item.0)))?;
        let scope = item.scope.as_deref();
        let node = match &item.kind {
            ItemKind::Variable(var) => Some(self.make_var_dag(&value_id(scope, &var.name))?),
            ItemKind::Integral(integral) => {
                Some(self.make_var_dag(&value_id(scope, &integral.name))?)
            }
            ItemKind::Operation(op) => Some(self.make_op_dag(item, op)?),
            ItemKind::Switch(switch) => Some(self.make_switch(item, switch.num_cases)?),
            ItemKind::Lock => Some(self.make_lock(item)?),
            ItemKind::Godley(_) => None,
        };
        Ok(node)
    }

    fn node_from_wire(&mut self, wire: &Wire) -> Result<Option<NodeId>> {
        self.resolve(wire.from)
            .map_err(|e| e.with_item(wire.from))
    }

    /// Nodes wired into `port` of `item`, in wiring order.
    fn port_nodes(&mut self, item: ItemId, port: usize) -> Result<Vec<NodeId>> {
        let wires: Vec<Wire> = self.model.wires_into(item, port).copied().collect();
        let mut nodes = Vec::with_capacity(wires.len());
        for wire in &wires {
            if let Some(node) = self.node_from_wire(wire)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    pub(crate) fn make_var_dag(&mut self, vid: &str) -> Result<NodeId> {
        let key = CacheKey::Var(vid.to_string());
        if let Some(id) = self.cache.get(&key) {
            if self.cache.is_expanding(&key) {
                return Err(SimError::structural(format!("cyclic definition of {vid}"))
                    .with_optional_item(self.definitions.get(vid).copied()));
            }
            return Ok(id);
        }
        let value = self
            .values
            .get(vid)
            .ok_or_else(|| SimError::structural(format!("unknown variable {vid}")))?;
        let (name, kind, init, width) = (
            value.name.clone(),
            value.kind,
            value.init.clone(),
            value.width(),
        );
        trace!(value_id = vid, kind = kind.name(), "resolving variable");

        if kind == VariableType::Constant && width == 1 {
            let constant = self.values.init_value(vid)?.first().copied().unwrap_or(0.0);
            return Ok(self.cache.insert(key, Node::Constant(constant)));
        }

        let mut node = VariableNode::new(vid, &name, kind, &init);
        let definition = self.definitions.get(vid).copied();
        node.item = definition;
        let id = self.cache.insert(key.clone(), Node::Variable(node));

        if let Some(item) = definition {
            self.cache.begin_expanding(key.clone())?;
            let rhs = self.port_nodes(item, 1);
            self.cache.end_expanding(&key);
            let rhs = rhs?.first().copied();
            self.cache.set_rhs(id, rhs);
        }
        Ok(id)
    }

    fn make_op_dag(&mut self, item: &Item, op: &OperationItem) -> Result<NodeId> {
        let key = CacheKey::Item(item.id);
        if let Some(id) = self.cache.get(&key) {
            if self.cache.is_expanding(&key) {
                return Err(SimError::structural("cyclic definition of operation").with_item(item.id));
            }
            return Ok(id);
        }
        trace!(item = item.id.0, op = op.op.name(), "resolving operation");

        match op.op {
            OperationType::Constant => {
                return Err(SimError::structural(
                    "constant operations are deprecated, use a variable instead",
                )
                .with_item(item.id));
            }
            OperationType::Integrate => {
                return Err(SimError::structural("integrals must be integral items").with_item(item.id));
            }
            OperationType::Differentiate => {
                self.cache.begin_expanding(key.clone())?;
                let arg = self.port_nodes(item.id, 1);
                self.cache.end_expanding(&key);
                let derivative = match arg?.first() {
                    Some(&x) => self
                        .derivative(x)
                        .map_err(|e| e.with_item(item.id))?,
                    None => self.cache.zero(),
                };
                self.cache.alias(key, derivative);
                return Ok(derivative);
            }
            _ => {}
        }

        let state = match op.op {
            OperationType::Data => {
                OpState::Data(Arc::new(op.data.clone().unwrap_or_default()))
            }
            OperationType::UserFunction => {
                let expression = op.expression.as_deref().unwrap_or("0");
                let function = UserFunction::compile(expression).map_err(|e| e.with_item(item.id))?;
                OpState::UserFunction(Arc::new(function))
            }
            _ => OpState::None,
        };
        let arity = op.op.arity();
        let node = OperationNode {
            op: op.op,
            arguments: vec![Vec::new(); arity],
            item: Some(item.id),
            state,
        };
        let id = self.cache.insert(key.clone(), Node::Operation(node));

        self.cache.begin_expanding(key.clone())?;
        let mut arguments = Vec::with_capacity(arity);
        let mut failure = None;
        for port in 1..=arity {
            match self.port_nodes(item.id, port) {
                Ok(nodes) => arguments.push(nodes),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.cache.end_expanding(&key);
        if let Some(e) = failure {
            return Err(e);
        }
        self.cache.set_arguments(id, arguments);
        Ok(id)
    }

    /// Compiles a switch into a sum of gated cases:
    /// `case0·(c<1) + Σ case_i·((c<i+1) - (c<i)) + case_last·(1 - (c<n-1))`.
    fn make_switch(&mut self, item: &Item, num_cases: usize) -> Result<NodeId> {
        let key = CacheKey::Item(item.id);
        if let Some(id) = self.cache.get(&key) {
            return Ok(id);
        }
        if num_cases < 2 {
            return Err(SimError::structural("switch needs at least two cases").with_item(item.id));
        }

        self.cache.begin_expanding(key.clone())?;
        let mut ports = Vec::with_capacity(num_cases + 1);
        let mut failure = None;
        for port in 1..=num_cases + 1 {
            match self.port_nodes(item.id, port) {
                Ok(nodes) => ports.push(nodes.first().copied()),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.cache.end_expanding(&key);
        if let Some(e) = failure {
            return Err(e);
        }
        let mut inputs = Vec::with_capacity(ports.len());
        for port in ports {
            inputs.push(port.ok_or_else(|| {
                SimError::structural("input port not wired").with_item(item.id)
            })?);
        }

        let selector = inputs[0];
        let cases = &inputs[1..];
        let below = |cache: &mut SubexpressionCache, bound: usize| {
            let bound = cache.constant(bound as f64);
            cache.binary(OperationType::Lt, selector, bound)
        };
        let mut terms = Vec::with_capacity(num_cases);
        let first = below(&mut self.cache, 1);
        terms.push(self.cache.mul(cases[0], first));
        for (i, &case) in cases.iter().enumerate().take(num_cases - 1).skip(1) {
            let upper = below(&mut self.cache, i + 1);
            let lower = below(&mut self.cache, i);
            let gate = self.cache.sub(upper, lower);
            terms.push(self.cache.mul(case, gate));
        }
        let last = below(&mut self.cache, num_cases - 1);
        let one = self.cache.one();
        let gate = self.cache.sub(one, last);
        terms.push(self.cache.mul(cases[num_cases - 1], gate));

        let mut sum = OperationNode::new(OperationType::Add, vec![terms, Vec::new()]);
        sum.item = Some(item.id);
        Ok(self.cache.insert(key, Node::Operation(sum)))
    }

    fn make_lock(&mut self, item: &Item) -> Result<NodeId> {
        let key = CacheKey::Item(item.id);
        if let Some(id) = self.cache.get(&key) {
            if self.cache.is_expanding(&key) {
                return Err(SimError::structural("cyclic definition of lock").with_item(item.id));
            }
            return Ok(id);
        }
        let id = self.cache.insert(
            key.clone(),
            Node::Lock {
                rhs: None,
                item: Some(item.id),
            },
        );
        self.cache.begin_expanding(key.clone())?;
        let rhs = self.port_nodes(item.id, 1);
        self.cache.end_expanding(&key);
        let rhs = rhs?.first().copied();
        self.cache.set_rhs(id, rhs);
        Ok(id)
    }

    /// Takes the initial value of an integral from whatever is wired into
    /// its second port.
    fn set_integral_init(&mut self, item: &Item, vid: &str) -> Result<()> {
        let Some(wire) = self.model.wires_into(item.id, 2).next() else {
            return Ok(());
        };
        let source = self
            .model
            .item(wire.from)
            .ok_or_else(|| SimError::structural("dangling wire").with_item(item.id))?;
        let init = match &source.kind {
            ItemKind::Variable(var) => var.name.clone(),
            ItemKind::Integral(integral) => integral.name.clone(),
            _ => {
                return Err(SimError::structural(
                    "integral initial value must be a constant, parameter or variable",
                )
                .with_item(item.id));
            }
        };
        if let Some(value) = self.values.get_mut(vid) {
            value.init = init;
        }
        Ok(())
    }

    /// Builds the net-flow node of every accounting column. Shared columns
    /// only take their first occurrence unless compatibility mode sums them.
    fn process_godley_tables(&mut self) -> Result<Vec<(String, NodeId)>> {
        let model = self.model;
        let mut columns: BTreeMap<String, GodleyColumnTerms> = BTreeMap::new();
        for item in &model.items {
            let ItemKind::Godley(table) = &item.kind else {
                continue;
            };
            let scope = item.scope.as_deref();
            for col in 1..table.cols() {
                let Some(name) = table.column_name(col) else {
                    continue;
                };
                let vid = value_id(scope, name);
                if columns.contains_key(&vid) && !self.godley.compatibility {
                    continue;
                }
                let reversed =
                    table.sign_convention_reversed(col, self.godley.double_entry_compliant);
                let mut positive = Vec::new();
                let mut negative = Vec::new();
                for row in 1..table.rows() {
                    if table.initial_condition_row(row) {
                        continue;
                    }
                    let fc = FlowCoef::parse(table.cell(row, col));
                    if fc.name.is_empty() {
                        continue;
                    }
                    let coef = if reversed { -fc.coef } else { fc.coef };
                    let flow = self
                        .make_var_dag(&value_id(scope, &fc.name))
                        .map_err(|e| e.with_item(item.id))?;
                    let term = if coef.abs() == 1.0 {
                        flow
                    } else {
                        let scale = self.cache.constant(coef.abs());
                        self.cache.mul(scale, flow)
                    };
                    if coef < 0.0 {
                        negative.push(term);
                    } else {
                        positive.push(term);
                    }
                }
                let column = columns.entry(vid).or_insert_with(|| GodleyColumnTerms {
                    name: name.to_string(),
                    item: item.id,
                    positive: Vec::new(),
                    negative: Vec::new(),
                });
                column.positive.extend(positive);
                column.negative.extend(negative);
            }
        }

        Ok(columns
            .into_iter()
            .map(|(vid, terms)| {
                let mut column =
                    OperationNode::new(OperationType::Subtract, vec![terms.positive, terms.negative]);
                column.item = Some(terms.item);
                let node = self.cache.insert_anonymous(Node::GodleyColumn {
                    name: terms.name,
                    column,
                });
                (vid, node)
            })
            .collect())
    }

    /// Compiles the flow variables and integrands into an instruction list,
    /// allocating storage in `store` as it goes. Returns the program and
    /// one integral record per stock.
    pub fn populate_eval_ops(&mut self, store: &mut ValueStore) -> Result<(EvalProgram, Vec<Integral>)> {
        let mut emitter = Emitter {
            store,
            program: EvalProgram::default(),
            results: HashMap::new(),
        };
        for var in self.variables.clone() {
            self.add_eval_ops(&mut emitter, var, None)?;
        }

        let mut integrals = Vec::with_capacity(self.integration_variables.len());
        for var in self.integration_variables.clone() {
            let Node::Variable(v) = self.cache.node(var).clone() else {
                continue;
            };
            let stock = self.values.allocate(&v.value_id, emitter.store)?;
            let ii = self
                .cache
                .integral_input(&v.value_id)
                .and_then(|ii| match self.cache.node(ii) {
                    Node::IntegralInput(input) => input.rhs,
                    _ => None,
                });
            let Some(rhs) = ii else {
                if v.kind == VariableType::Integral {
                    return Err(SimError::structural(format!("integral {} not wired", v.name))
                        .with_optional_item(v.item));
                }
                continue;
            };
            let input = self.add_eval_ops(&mut emitter, rhs, None)?;
            integrals.push(Integral {
                stock,
                input,
                item: v.item,
            });
        }

        self.values.allocate_all(emitter.store);
        if emitter.store.stock_vars.is_empty() {
            emitter.store.alloc_stock(1);
        }
        debug!(
            instructions = emitter.program.len(),
            integrals = integrals.len(),
            flows = emitter.store.flow_vars.len(),
            "equations compiled"
        );
        Ok((emitter.program, integrals))
    }

    fn add_eval_ops(&mut self, e: &mut Emitter<'_>, id: NodeId, target: Option<Slot>) -> Result<Slot> {
        let result = match e.results.get(&id) {
            Some(&result) => result,
            None => {
                let result = self.compile_node(e, id, target)?;
                e.results.insert(id, result);
                result
            }
        };
        if let Some(target) = target {
            if target.flow && !target.same_storage(&result) {
                if result.width != 1 && result.width != target.width {
                    return Err(SimError::structural(format!(
                        "tensor shape mismatch: {} elements assigned to {}",
                        result.width, target.width
                    ))
                    .with_optional_item(self.cache.node(id).item()));
                }
                e.emit(EvalOp::copy(target, result).with_item(self.cache.node(id).item()));
            }
        }
        Ok(result)
    }

    fn compile_node(&mut self, e: &mut Emitter<'_>, id: NodeId, target: Option<Slot>) -> Result<Slot> {
        match self.cache.node(id).clone() {
            Node::Constant(value) => {
                let slot = e.temp(1);
                e.store.write(&slot, &[value]);
                Ok(Slot {
                    constant: Some(value),
                    ..slot
                })
            }
            Node::Variable(var) => {
                let slot = self.values.allocate(&var.value_id, e.store)?;
                if let Some(rhs) = var.rhs {
                    if slot.flow {
                        self.add_eval_ops(e, rhs, Some(slot))?;
                    }
                }
                Ok(slot)
            }
            Node::IntegralInput(var) => {
                let rhs = var.rhs.ok_or_else(|| {
                    SimError::structural(format!("{} not defined", var.name))
                        .with_optional_item(var.item)
                })?;
                self.pass_through(e, rhs, target)
            }
            Node::Lock { rhs, item } => {
                let rhs = rhs
                    .ok_or_else(|| SimError::structural("lock not wired").with_optional_item(item))?;
                self.pass_through(e, rhs, target)
            }
            Node::Operation(op) => self.compile_operation(e, &op, target),
            Node::GodleyColumn { column, .. } => self.compile_operation(e, &column, target),
        }
    }

    fn pass_through(&mut self, e: &mut Emitter<'_>, rhs: NodeId, target: Option<Slot>) -> Result<Slot> {
        let result = self.add_eval_ops(e, rhs, target)?;
        Ok(match target {
            Some(target) if target.flow => target,
            _ => result,
        })
    }

    fn compile_operation(
        &mut self,
        e: &mut Emitter<'_>,
        op: &OperationNode,
        target: Option<Slot>,
    ) -> Result<Slot> {
        use OperationType::*;
        match op.op {
            Constant => {
                return Err(SimError::structural(
                    "constant operations are deprecated, use a variable instead",
                )
                .with_optional_item(op.item));
            }
            Integrate | Differentiate => {
                return Err(SimError::structural(format!("unresolved {} operation", op.op))
                    .with_optional_item(op.item));
            }
            _ => {}
        }

        let mut args: Vec<Vec<Slot>> = Vec::with_capacity(op.arguments.len());
        for port in &op.arguments {
            let mut slots = Vec::with_capacity(port.len());
            for &arg in port {
                slots.push(self.add_eval_ops(e, arg, None)?);
            }
            args.push(slots);
        }
        let plan = plan_tensor(args.iter().flatten().map(|s| s.width))
            .map_err(|err| err.with_optional_item(op.item))?;
        let width = plan.width();
        let result = match target {
            Some(target) if target.flow && target.width == width => target,
            _ => e.temp(width),
        };

        match op.op {
            Add => cumulate(e, op, result, &args, Add, Add, 0.0),
            Subtract => cumulate(e, op, result, &args, Subtract, Add, 0.0),
            Multiply => cumulate(e, op, result, &args, Multiply, Multiply, 1.0),
            Divide => cumulate(e, op, result, &args, Divide, Multiply, 1.0),
            Min => cumulate(e, op, result, &args, Min, Min, f64::MAX),
            Max => cumulate(e, op, result, &args, Max, Max, -f64::MAX),
            And => cumulate(e, op, result, &args, And, And, 1.0),
            Or => cumulate(e, op, result, &args, Or, Or, 0.0),
            _ => {
                // comparisons and user functions treat an unwired port as 0
                let placeholders = matches!(op.op, Lt | Le | Eq | Pow | UserFunction);
                let mut inputs = Vec::with_capacity(2);
                for port in 0..op.op.arity() {
                    match args.get(port).map(Vec::as_slice).unwrap_or(&[]) {
                        [slot] => inputs.push(*slot),
                        [] if placeholders => inputs.push(e.temp(1)),
                        _ => {
                            return Err(SimError::structural(
                                "inputs for highlighted operations incorrectly wired",
                            )
                            .with_optional_item(op.item));
                        }
                    }
                }
                e.emit(
                    EvalOp::new(op.op, result, inputs.first().copied(), inputs.get(1).copied())
                        .with_state(op.state.clone())
                        .with_item(op.item),
                );
                Ok(result)
            }
        }
    }
}

/// Folds the arguments of an n-ary operation into `result`: port 0 is
/// accumulated with `accum`, then port 1 (accumulated separately when it
/// has several wires) is applied with `op`.
fn cumulate(
    e: &mut Emitter<'_>,
    node: &OperationNode,
    result: Slot,
    args: &[Vec<Slot>],
    op: OperationType,
    accum: OperationType,
    identity: f64,
) -> Result<Slot> {
    let item = node.item;
    if accum == OperationType::Multiply {
        if op == OperationType::Divide && args.get(1).is_some_and(|d| d.iter().any(Slot::is_zero)) {
            return Err(SimError::numeric("divide by constant zero").with_optional_item(item));
        }
        if args.iter().flatten().any(Slot::is_zero) {
            e.emit(EvalOp::constant(result, 0.0).with_item(item));
            return Ok(result);
        }
    }

    let terms = |port: usize| -> Vec<Slot> {
        args.get(port)
            .map(|slots| {
                slots
                    .iter()
                    .copied()
                    .filter(|s| accum != OperationType::Add || !s.is_zero())
                    .collect()
            })
            .unwrap_or_default()
    };

    match terms(0).split_first() {
        Some((head, rest)) => {
            e.emit(EvalOp::copy(result, *head).with_item(item));
            for term in rest {
                e.emit(EvalOp::new(accum, result, Some(result), Some(*term)).with_item(item));
            }
        }
        None => e.emit(EvalOp::constant(result, identity).with_item(item)),
    }

    match terms(1).as_slice() {
        [] => {}
        [single] => {
            e.emit(EvalOp::new(op, result, Some(result), Some(*single)).with_item(item));
        }
        [head, rest @ ..] => {
            let tmp = e.temp(result.width);
            e.emit(EvalOp::copy(tmp, *head).with_item(item));
            for term in rest {
                e.emit(EvalOp::new(accum, tmp, Some(tmp), Some(*term)).with_item(item));
            }
            e.emit(EvalOp::new(op, result, Some(result), Some(tmp)).with_item(item));
        }
    }
    Ok(result)
}

/// Maps each variable with a wired input to its defining item, rejecting
/// inputs on non-flow variables and variables defined twice.
fn definitions(model: &Model) -> Result<HashMap<String, ItemId>> {
    let mut definitions = HashMap::new();
    for item in &model.items {
        let ItemKind::Variable(var) = &item.kind else {
            continue;
        };
        if !model.has_input(item.id) {
            continue;
        }
        if !matches!(var.kind, VariableType::Flow | VariableType::TempFlow) {
            return Err(SimError::structural(format!(
                "{} variable {} cannot have an input",
                var.kind.name(),
                var.name
            ))
            .with_item(item.id));
        }
        let vid = value_id(item.scope.as_deref(), &var.name);
        if definitions.insert(vid, item.id).is_some() {
            return Err(SimError::structural(format!("variable {} multiply defined", var.name))
                .with_item(item.id));
        }
    }
    Ok(definitions)
}
