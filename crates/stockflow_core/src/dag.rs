//! Expression graph shared by the compiler and the differentiator.
//!
//! Nodes live in an arena owned by [`SubexpressionCache`] and refer to each
//! other through dense [`NodeId`] handles, so shared subexpressions are
//! stored once and the graph needs no reference counting.

use crate::error::{Result, SimError};
use crate::expression::UserFunction;
use crate::model::{DataTable, ItemId};
use crate::operation::OperationType;
use crate::value::VariableType;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub struct VariableNode {
    pub value_id: String,
    pub name: String,
    pub kind: VariableType,
    pub init: String,
    pub rhs: Option<NodeId>,
    /// Integral item owning this variable, if any.
    pub item: Option<ItemId>,
}

impl VariableNode {
    pub fn new(value_id: &str, name: &str, kind: VariableType, init: &str) -> Self {
        Self {
            value_id: value_id.to_string(),
            name: name.to_string(),
            kind,
            init: init.to_string(),
            rhs: None,
            item: None,
        }
    }
}

/// Per-operation state carried into the evaluator.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum OpState {
    #[default]
    None,
    Data(Arc<DataTable>),
    UserFunction(Arc<UserFunction>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationNode {
    pub op: OperationType,
    /// One list of arguments per input port.
    pub arguments: Vec<Vec<NodeId>>,
    pub item: Option<ItemId>,
    pub state: OpState,
}

impl OperationNode {
    pub fn new(op: OperationType, arguments: Vec<Vec<NodeId>>) -> Self {
        Self {
            op,
            arguments,
            item: None,
            state: OpState::None,
        }
    }

    /// The single argument wired into `port`, if any.
    pub fn arg(&self, port: usize) -> Option<NodeId> {
        self.arguments.get(port).and_then(|a| a.first()).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Constant(f64),
    Variable(VariableNode),
    /// The integrand feeding a stock or integral variable.
    IntegralInput(VariableNode),
    Operation(OperationNode),
    /// Net flow into an accounting column: port 0 adds, port 1 subtracts.
    GodleyColumn {
        name: String,
        column: OperationNode,
    },
    /// Passes its input through unchanged.
    Lock {
        rhs: Option<NodeId>,
        item: Option<ItemId>,
    },
}

impl Node {
    /// Binding strength used when rendering: 0 binds tightest.
    pub fn precedence(&self) -> u8 {
        match self {
            Node::Constant(value) if *value < 0.0 => 1,
            Node::Operation(op) => op.op.precedence(),
            Node::GodleyColumn { .. } => 2,
            _ => 0,
        }
    }

    pub fn item(&self) -> Option<ItemId> {
        match self {
            Node::Variable(v) | Node::IntegralInput(v) => v.item,
            Node::Operation(op) => op.item,
            Node::GodleyColumn { column, .. } => column.item,
            Node::Lock { item, .. } => *item,
            Node::Constant(_) => None,
        }
    }

    /// Nodes whose values this node reads when it is evaluated.
    fn dependencies(&self) -> Vec<NodeId> {
        match self {
            Node::Variable(v) | Node::IntegralInput(v) => v.rhs.into_iter().collect(),
            Node::Lock { rhs, .. } => rhs.iter().copied().collect(),
            Node::Operation(op) if op.op != OperationType::Integrate => {
                op.arguments.iter().flatten().copied().collect()
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Item(ItemId),
    Var(String),
}

/// How a node came to be in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Keyed(CacheKey),
    IntegralInput(String),
    Anonymous,
}

/// Structural identity of stateless anonymous nodes, for hash-consing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Structure {
    Constant(u64),
    Op(OperationType, Vec<Vec<NodeId>>),
}

fn structure(node: &Node) -> Option<Structure> {
    match node {
        Node::Constant(value) => Some(Structure::Constant(value.to_bits())),
        Node::Operation(op) if op.item.is_none() && op.state == OpState::None => {
            Some(Structure::Op(op.op, op.arguments.clone()))
        }
        _ => None,
    }
}

/// Owns every node and deduplicates them by item, value id or structure.
#[derive(Debug, Clone)]
pub struct SubexpressionCache {
    nodes: Vec<Node>,
    owners: Vec<Owner>,
    keyed: HashMap<CacheKey, NodeId>,
    integral_inputs: HashMap<String, NodeId>,
    interned: HashMap<Structure, NodeId>,
    expanding: HashSet<CacheKey>,
    orders: Vec<Option<usize>>,
    /// Number of entries in `orders` that are set.
    memoized: usize,
    zero: NodeId,
    one: NodeId,
}

impl Default for SubexpressionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SubexpressionCache {
    pub fn new() -> Self {
        let mut cache = Self {
            nodes: Vec::new(),
            owners: Vec::new(),
            keyed: HashMap::new(),
            integral_inputs: HashMap::new(),
            interned: HashMap::new(),
            expanding: HashSet::new(),
            orders: Vec::new(),
            memoized: 0,
            zero: NodeId(0),
            one: NodeId(0),
        };
        cache.zero = cache.constant(0.0);
        cache.one = cache.constant(1.0);
        cache
    }

    pub fn zero(&self) -> NodeId {
        self.zero
    }

    pub fn one(&self) -> NodeId {
        self.one
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Sets the defining expression of a variable, integral input or lock.
    pub fn set_rhs(&mut self, id: NodeId, rhs: Option<NodeId>) {
        let previous = match &mut self.nodes[id.0] {
            Node::Variable(v) | Node::IntegralInput(v) => std::mem::replace(&mut v.rhs, rhs),
            Node::Lock { rhs: slot, .. } => std::mem::replace(slot, rhs),
            _ => return,
        };
        if previous != rhs {
            self.invalidate_orders();
        }
    }

    /// Replaces the per-port arguments of an operation.
    pub fn set_arguments(&mut self, id: NodeId, arguments: Vec<Vec<NodeId>>) {
        if let Node::Operation(op) = &mut self.nodes[id.0] {
            if op.arguments != arguments {
                op.arguments = arguments;
                self.invalidate_orders();
            }
        }
    }

    /// Records the integral item that owns a variable node.
    pub fn set_variable_item(&mut self, id: NodeId, item: ItemId) {
        if let Node::Variable(v) = &mut self.nodes[id.0] {
            v.item = Some(item);
        }
    }

    /// Rewiring a node can change the order of anything downstream of it.
    fn invalidate_orders(&mut self) {
        if self.memoized > 0 {
            self.orders.iter_mut().for_each(|o| *o = None);
            self.memoized = 0;
        }
    }

    fn push(&mut self, node: Node, owner: Owner) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.owners.push(owner);
        self.orders.push(None);
        id
    }

    pub fn get(&self, key: &CacheKey) -> Option<NodeId> {
        self.keyed.get(key).copied()
    }

    /// Inserts a node under `key`, replacing any previous binding.
    pub fn insert(&mut self, key: CacheKey, node: Node) -> NodeId {
        let id = self.push(node, Owner::Keyed(key.clone()));
        self.keyed.insert(key, id);
        id
    }

    /// Binds `key` to an existing node.
    pub fn alias(&mut self, key: CacheKey, id: NodeId) {
        self.keyed.insert(key, id);
    }

    pub fn integral_input(&self, value_id: &str) -> Option<NodeId> {
        self.integral_inputs.get(value_id).copied()
    }

    pub fn insert_integral_input(&mut self, value_id: &str, node: Node) -> NodeId {
        let id = self.push(node, Owner::IntegralInput(value_id.to_string()));
        self.integral_inputs.insert(value_id.to_string(), id);
        id
    }

    /// Inserts a node with no key. Structurally identical stateless nodes
    /// are returned instead of being duplicated.
    pub fn insert_anonymous(&mut self, node: Node) -> NodeId {
        match structure(&node) {
            Some(key) => {
                if let Some(&id) = self.interned.get(&key) {
                    return id;
                }
                let id = self.push(node, Owner::Anonymous);
                self.interned.insert(key, id);
                id
            }
            None => self.push(node, Owner::Anonymous),
        }
    }

    pub fn reverse_lookup(&self, id: NodeId) -> Option<&Owner> {
        self.owners.get(id.0)
    }

    pub fn constant(&mut self, value: f64) -> NodeId {
        self.insert_anonymous(Node::Constant(value))
    }

    pub fn constant_value(&self, id: NodeId) -> Option<f64> {
        match self.node(id) {
            Node::Constant(value) => Some(*value),
            _ => None,
        }
    }

    pub fn op(&mut self, op: OperationType, arguments: Vec<Vec<NodeId>>) -> NodeId {
        self.insert_anonymous(Node::Operation(OperationNode::new(op, arguments)))
    }

    pub fn unary(&mut self, op: OperationType, x: NodeId) -> NodeId {
        self.op(op, vec![vec![x]])
    }

    pub fn binary(&mut self, op: OperationType, x: NodeId, y: NodeId) -> NodeId {
        self.op(op, vec![vec![x], vec![y]])
    }

    pub fn add(&mut self, x: NodeId, y: NodeId) -> NodeId {
        if x == self.zero {
            return y;
        }
        if y == self.zero {
            return x;
        }
        self.binary(OperationType::Add, x, y)
    }

    pub fn sub(&mut self, x: NodeId, y: NodeId) -> NodeId {
        if y == self.zero {
            return x;
        }
        self.binary(OperationType::Subtract, x, y)
    }

    pub fn mul(&mut self, x: NodeId, y: NodeId) -> NodeId {
        if x == self.zero || y == self.zero {
            return self.zero;
        }
        if x == self.one {
            return y;
        }
        if y == self.one {
            return x;
        }
        self.binary(OperationType::Multiply, x, y)
    }

    pub fn div(&mut self, x: NodeId, y: NodeId) -> NodeId {
        if y == self.one {
            return x;
        }
        self.binary(OperationType::Divide, x, y)
    }

    /// Marks `key` as being expanded. Re-entering a key before it has been
    /// finished means the definitions form a loop.
    pub fn begin_expanding(&mut self, key: CacheKey) -> Result<()> {
        if self.expanding.contains(&key) {
            let what = match &key {
                CacheKey::Var(vid) => vid.clone(),
                CacheKey::Item(item) => format!("item {}", item.0),
            };
            let err = SimError::structural(format!("cyclic definition of {what}"));
            return Err(match key {
                CacheKey::Item(item) => err.with_item(item),
                CacheKey::Var(_) => err,
            });
        }
        self.expanding.insert(key);
        Ok(())
    }

    pub fn end_expanding(&mut self, key: &CacheKey) {
        self.expanding.remove(key);
    }

    pub fn is_expanding(&self, key: &CacheKey) -> bool {
        self.expanding.contains(key)
    }

    /// Dependency depth of `root`: 0 for constants and undefined variables,
    /// one more than the definition for variables, one more than the
    /// deepest argument for operations. Integrals and accounting columns
    /// are 0 because they only depend on the previous state.
    ///
    /// Walks an explicit stack, so nesting deeper than `max_order`, or a
    /// loop, fails with a structural error instead of exhausting the call
    /// stack. Results are memoized per node.
    pub fn order(&mut self, root: NodeId, max_order: usize) -> Result<usize> {
        if let Some(order) = self.orders[root.0] {
            return Ok(order);
        }

        struct Frame {
            id: NodeId,
            deps: Vec<NodeId>,
            next: usize,
        }
        let mut on_path = HashSet::from([root]);
        let mut path = vec![Frame {
            id: root,
            deps: self.node(root).dependencies(),
            next: 0,
        }];

        while let Some(top) = path.last_mut() {
            if let Some(&dep) = top.deps.get(top.next) {
                top.next += 1;
                if self.orders[dep.0].is_some() {
                    continue;
                }
                if on_path.contains(&dep) {
                    return Err(SimError::structural("algebraic loop detected")
                        .with_optional_item(self.node(dep).item()));
                }
                if path.len() > max_order {
                    return Err(SimError::structural("maximum order recursion reached")
                        .with_optional_item(self.node(dep).item()));
                }
                on_path.insert(dep);
                let deps = self.node(dep).dependencies();
                path.push(Frame { id: dep, deps, next: 0 });
            } else {
                let id = top.id;
                let deepest = top
                    .deps
                    .iter()
                    .map(|d| self.orders[d.0].unwrap_or(0))
                    .max();
                let order = match self.node(id) {
                    Node::Constant(_) | Node::GodleyColumn { .. } => 0,
                    Node::Operation(op) if op.op == OperationType::Integrate => 0,
                    Node::Operation(_) => deepest.unwrap_or(0) + 1,
                    _ => deepest.map_or(0, |d| d + 1),
                };
                self.orders[id.0] = Some(order);
                self.memoized += 1;
                on_path.remove(&id);
                path.pop();
            }
        }
        Ok(self.orders[root.0].unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variable(cache: &mut SubexpressionCache, name: &str, rhs: Option<NodeId>) -> NodeId {
        let vid = format!(":{name}");
        let mut node = VariableNode::new(&vid, name, VariableType::Flow, "");
        node.rhs = rhs;
        cache.insert(CacheKey::Var(vid), Node::Variable(node))
    }

    #[test]
    fn structurally_equal_nodes_are_shared() {
        let mut cache = SubexpressionCache::new();
        let x = variable(&mut cache, "x", None);
        let two = cache.constant(2.0);
        let a = cache.binary(OperationType::Multiply, x, two);
        let before = cache.len();
        let b = cache.binary(OperationType::Multiply, x, two);
        assert_eq!(a, b);
        assert_eq!(cache.len(), before);
        assert_eq!(cache.constant(0.0), cache.zero());
        assert_eq!(cache.reverse_lookup(a), Some(&Owner::Anonymous));
    }

    #[test]
    fn identity_shortcuts_avoid_new_nodes() {
        let mut cache = SubexpressionCache::new();
        let x = variable(&mut cache, "x", None);
        let (zero, one) = (cache.zero(), cache.one());
        assert_eq!(cache.mul(x, one), x);
        assert_eq!(cache.mul(zero, x), zero);
        assert_eq!(cache.add(zero, x), x);
        assert_eq!(cache.div(x, one), x);
    }

    #[test]
    fn keyed_lookups_resolve_items_and_values() {
        let mut cache = SubexpressionCache::new();
        let x = variable(&mut cache, "x", None);
        assert_eq!(cache.get(&CacheKey::Var(":x".into())), Some(x));
        cache.alias(CacheKey::Item(ItemId(4)), x);
        assert_eq!(cache.get(&CacheKey::Item(ItemId(4))), Some(x));
        let ii = cache.insert_integral_input(":s", Node::IntegralInput(VariableNode::new(
            ":s", "s", VariableType::TempFlow, "",
        )));
        assert_eq!(cache.integral_input(":s"), Some(ii));
        assert_eq!(
            cache.reverse_lookup(ii),
            Some(&Owner::IntegralInput(":s".into()))
        );
    }

    #[test]
    fn order_counts_definition_depth() {
        let mut cache = SubexpressionCache::new();
        let x = variable(&mut cache, "x", None);
        let sin = cache.unary(OperationType::Sin, x);
        let y = variable(&mut cache, "y", Some(sin));
        let max = cache.len();
        assert_eq!(cache.order(x, max).expect("order"), 0);
        assert_eq!(cache.order(sin, max).expect("order"), 1);
        assert_eq!(cache.order(y, max).expect("order"), 2);
    }

    #[test]
    fn order_detects_loops() {
        let mut cache = SubexpressionCache::new();
        let x = variable(&mut cache, "x", None);
        let sin = cache.unary(OperationType::Sin, x);
        cache.set_rhs(x, Some(sin));
        let max = cache.len();
        let err = cache.order(x, max).expect_err("loop");
        assert!(err.to_string().contains("algebraic loop"));
    }

    /// `x`, `sin(x)`, `sin(sin(x))`, ... `length` levels deep.
    fn sin_chain(cache: &mut SubexpressionCache, length: usize) -> NodeId {
        let x = variable(cache, "x", None);
        (0..length).fold(x, |acc, _| cache.unary(OperationType::Sin, acc))
    }

    #[test]
    fn long_chains_are_ranked_without_recursion() {
        let mut cache = SubexpressionCache::new();
        let top = sin_chain(&mut cache, 20_000);
        let max = cache.len();
        let order = cache.order(top, max).expect("order");
        assert_eq!(order, 20_000);
        assert!(order <= cache.len());
    }

    #[test]
    fn order_is_bounded() {
        let mut cache = SubexpressionCache::new();
        let top = sin_chain(&mut cache, 50);
        let err = cache.order(top, 10).expect_err("too deep");
        assert!(err.to_string().contains("maximum order recursion reached"), "{err}");
    }

    #[test]
    fn rewiring_invalidates_memoized_orders() {
        let mut cache = SubexpressionCache::new();
        let x = variable(&mut cache, "x", None);
        let sin = cache.unary(OperationType::Sin, x);
        let y = variable(&mut cache, "y", Some(sin));
        let max = cache.len();
        assert_eq!(cache.order(y, max).expect("order"), 2);

        cache.set_variable_item(y, ItemId(3));
        cache.set_rhs(y, Some(sin));
        assert_eq!(cache.memoized, 3);

        let deeper = cache.unary(OperationType::Cos, sin);
        let max = cache.len();
        cache.set_rhs(y, Some(deeper));
        assert_eq!(cache.memoized, 0);
        assert_eq!(cache.order(y, max).expect("order"), 3);
    }

    #[test]
    fn expanding_twice_is_a_cycle() {
        let mut cache = SubexpressionCache::new();
        let key = CacheKey::Item(ItemId(1));
        cache.begin_expanding(key.clone()).expect("first entry");
        let err = cache.begin_expanding(key.clone()).expect_err("re-entry");
        assert_eq!(err.item(), Some(ItemId(1)));
        cache.end_expanding(&key);
        assert!(!cache.is_expanding(&key));
    }
}
