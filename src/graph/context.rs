//! Graph context for computation-graph manipulation
//!
//! `GraphContext` is the central structure for working with graphs.
//! It owns the node arena and maintains maps for lookup and traversal.

use rustc_hash::FxHashSet;

use crate::error::{LptResult, TransformError};

use super::maps::{ConsumerMap, NameMap, Node, NodeArena, NodeId};
use super::op::OpKind;

/// Graph context for efficient graph operations
///
/// Nodes live in an arena addressed by stable [`NodeId`] handles. A node is
/// alive while it is reachable from a result or is a parameter; replacing a
/// node detaches it together with every producer left without consumers.
#[derive(Debug, Clone, Default)]
pub struct GraphContext {
    /// Node storage; detached slots are `None`
    pub(crate) nodes: NodeArena,

    /// Maps producer → consumers (one entry per input edge)
    pub(crate) consumer_map: ConsumerMap,

    /// Maps unique node name → handle
    pub(crate) name_map: NameMap,

    /// Graph inputs, in declaration order
    pub(crate) parameters: Vec<NodeId>,

    /// Graph outputs, in declaration order
    pub(crate) results: Vec<NodeId>,
}

impl GraphContext {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Node accessors
    // ========================================================================

    /// Get a node by handle
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    /// Get a node by handle, failing for detached handles
    pub fn node(&self, id: NodeId) -> LptResult<&Node> {
        self.get_node(id)
            .ok_or_else(|| TransformError::NodeNotFound(id.to_string()))
    }

    /// Get a mutable node by handle
    pub(crate) fn node_mut(&mut self, id: NodeId) -> LptResult<&mut Node> {
        self.nodes
            .get_mut(id.index())
            .and_then(|n| n.as_mut())
            .ok_or_else(|| TransformError::NodeNotFound(id.to_string()))
    }

    /// Check if a handle refers to a live node
    pub fn has_node(&self, id: NodeId) -> bool {
        self.get_node(id).is_some()
    }

    /// Get the number of live nodes
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Iterate over live nodes in arena order
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId(i as u32), n)))
    }

    /// Look a node up by its unique name
    pub fn get_node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_map.get(name).copied()
    }

    /// First live node carrying `friendly_name`
    pub fn get_node_by_friendly_name(&self, friendly_name: &str) -> Option<NodeId> {
        self.nodes()
            .find(|(_, n)| n.friendly_name == friendly_name)
            .map(|(id, _)| id)
    }

    /// Operation kind of a node
    pub fn kind(&self, id: NodeId) -> Option<OpKind> {
        self.get_node(id).map(|n| n.kind())
    }

    /// Graph inputs
    pub fn parameters(&self) -> &[NodeId] {
        &self.parameters
    }

    /// Graph outputs
    pub fn results(&self) -> &[NodeId] {
        &self.results
    }

    // ========================================================================
    // Graph traversal
    // ========================================================================

    /// Producer at input `index` of `id`
    pub fn get_input(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.get_node(id).and_then(|n| n.input(index))
    }

    /// Consumers of a node, one entry per input edge
    pub fn get_consumers(&self, id: NodeId) -> &[NodeId] {
        self.consumer_map
            .get(&id)
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    /// Number of input edges fed by a node
    pub fn consumer_count(&self, id: NodeId) -> usize {
        self.get_consumers(id).len()
    }

    /// Check if a node feeds exactly one input edge
    pub fn is_single_use(&self, id: NodeId) -> bool {
        self.consumer_count(id) == 1
    }

    /// Check if a node feeds only result nodes
    pub fn feeds_only_results(&self, id: NodeId) -> bool {
        let consumers = self.get_consumers(id);
        !consumers.is_empty()
            && consumers
                .iter()
                .all(|&c| self.kind(c) == Some(OpKind::Result))
    }

    /// Live nodes in topological order
    ///
    /// Producers always precede consumers. Nodes unreachable from a result
    /// are included after a parameter-first walk so that dangling work
    /// is still visited deterministically.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited: FxHashSet<NodeId> = FxHashSet::default();

        let roots = self
            .results
            .iter()
            .copied()
            .chain(self.nodes().map(|(id, _)| id));

        for root in roots {
            if visited.contains(&root) || !self.has_node(root) {
                continue;
            }
            // Iterative post-order DFS
            let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
            visited.insert(root);
            while let Some((id, next_input)) = stack.pop() {
                let input = self.get_input(id, next_input);
                match input {
                    Some(producer) => {
                        stack.push((id, next_input + 1));
                        if visited.insert(producer) {
                            stack.push((producer, 0));
                        }
                    }
                    None => order.push(id),
                }
            }
        }

        order
    }

    /// Find nodes of a given kind in topological order
    pub fn find_nodes_by_op(&self, kind: OpKind) -> Vec<NodeId> {
        self.topological_order()
            .into_iter()
            .filter(|&id| self.kind(id) == Some(kind))
            .collect()
    }

    /// Check whether `to` is reachable from `from` along consumer edges
    pub fn has_path(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut visited: FxHashSet<NodeId> = FxHashSet::default();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if visited.insert(id) {
                stack.extend_from_slice(self.get_consumers(id));
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::op::Op;
    use crate::tensor::{Constant, ElementType};

    fn make_chain_graph() -> (GraphContext, NodeId, NodeId, NodeId) {
        let mut ctx = GraphContext::new();
        let x = ctx.add_parameter("x", ElementType::F32, vec![1, 3, 4, 4]);
        let scale = ctx.add_constant(Constant::scalar(ElementType::F32, 0.5));
        let mul = ctx.add_node(Op::Multiply, &[x, scale]).unwrap();
        let relu = ctx.add_node(Op::Relu, &[mul]).unwrap();
        ctx.add_result(relu).unwrap();
        (ctx, x, mul, relu)
    }

    #[test]
    fn test_accessors() {
        let (ctx, x, mul, relu) = make_chain_graph();
        assert_eq!(ctx.node_count(), 5);
        assert_eq!(ctx.kind(mul), Some(OpKind::Multiply));
        assert_eq!(ctx.get_input(relu, 0), Some(mul));
        assert_eq!(ctx.get_consumers(x), &[mul]);
        assert!(ctx.is_single_use(mul));
        assert!(ctx.feeds_only_results(relu));
        assert_eq!(ctx.parameters(), &[x]);
    }

    #[test]
    fn test_topological_order() {
        let (ctx, x, mul, relu) = make_chain_graph();
        let order = ctx.topological_order();
        let pos = |id| order.iter().position(|&n| n == id).unwrap();
        assert!(pos(x) < pos(mul));
        assert!(pos(mul) < pos(relu));
        assert_eq!(order.len(), ctx.node_count());
    }

    #[test]
    fn test_has_path() {
        let (ctx, x, _, relu) = make_chain_graph();
        assert!(ctx.has_path(x, relu));
        assert!(!ctx.has_path(relu, x));
    }

    #[test]
    fn test_lookup_by_name() {
        let (mut ctx, _, mul, _) = make_chain_graph();
        ctx.set_friendly_name(mul, "scale_mul").unwrap();
        assert_eq!(ctx.get_node_by_friendly_name("scale_mul"), Some(mul));
        let unique = ctx.node(mul).unwrap().name.clone();
        assert_eq!(ctx.get_node_by_name(&unique), Some(mul));
        assert!(ctx.node(NodeId(99)).is_err());
    }
}
