//! Graph mutation operations
//!
//! Methods for modifying the graph structure: adding, cloning, replacing and
//! detaching nodes. Replacement is the only way an existing node leaves the
//! graph: every consumer edge is rewired first, then the old node and any
//! producer left without consumers are detached.

use smallvec::SmallVec;

use crate::error::{LptResult, TransformError};
use crate::tensor::{Constant, ElementType};

use super::context::GraphContext;
use super::infer::infer_output_type;
use super::maps::{build_consumer_map, build_name_map, Node, NodeId, TypeRelaxed};
use super::op::{Op, OpKind, TensorType};

impl GraphContext {
    // ========================================================================
    // Node creation
    // ========================================================================

    /// Add a graph input
    pub fn add_parameter(
        &mut self,
        friendly_name: &str,
        element_type: ElementType,
        shape: Vec<usize>,
    ) -> NodeId {
        let id = self.next_id();
        let name = format!("{}_{}", OpKind::Parameter.name(), id.index());
        self.name_map.insert(name.clone(), id);
        self.nodes.push(Some(Node {
            name,
            friendly_name: friendly_name.to_string(),
            op: Op::Parameter,
            inputs: SmallVec::new(),
            output: TensorType::new(element_type, shape),
            relaxed: None,
        }));
        self.parameters.push(id);
        id
    }

    /// Add a constant node
    pub fn add_constant(&mut self, constant: Constant) -> NodeId {
        let id = self.next_id();
        let name = format!("{}_{}", OpKind::Constant.name(), id.index());
        let output = TensorType::new(constant.element_type(), constant.shape().to_vec());
        self.name_map.insert(name.clone(), id);
        self.nodes.push(Some(Node {
            friendly_name: name.clone(),
            name,
            op: Op::Constant(constant),
            inputs: SmallVec::new(),
            output,
            relaxed: None,
        }));
        id
    }

    /// Add a node; its output is inferred from the inputs
    pub fn add_node(&mut self, op: Op, inputs: &[NodeId]) -> LptResult<NodeId> {
        self.insert_node(op, inputs, None, None)
    }

    /// Add a type-relaxed node with an optional declared output type
    pub fn add_relaxed_node(
        &mut self,
        op: Op,
        inputs: &[NodeId],
        output_type: Option<ElementType>,
    ) -> LptResult<NodeId> {
        self.insert_node(op, inputs, Some(TypeRelaxed { output_type }), None)
    }

    /// Add a graph output fed by `input`
    pub fn add_result(&mut self, input: NodeId) -> LptResult<NodeId> {
        let id = self.insert_node(Op::Result, &[input], None, None)?;
        self.results.push(id);
        Ok(id)
    }

    /// Copy a node onto new inputs
    ///
    /// The copy keeps the operation, the friendly name and the relaxation
    /// decorator. Nothing is rewired; the caller decides which consumers move.
    pub fn clone_with_new_inputs(&mut self, id: NodeId, inputs: &[NodeId]) -> LptResult<NodeId> {
        let node = self.node(id)?;
        let op = node.op.clone();
        let relaxed = node.relaxed.clone();
        let friendly_name = node.friendly_name.clone();
        self.insert_node(op, inputs, relaxed, Some(friendly_name))
    }

    fn insert_node(
        &mut self,
        op: Op,
        inputs: &[NodeId],
        relaxed: Option<TypeRelaxed>,
        friendly_name: Option<String>,
    ) -> LptResult<NodeId> {
        let id = self.next_id();
        let name = format!("{}_{}", op.kind().name(), id.index());
        let mut node = Node {
            friendly_name: friendly_name.unwrap_or_else(|| name.clone()),
            name,
            op,
            inputs: inputs.iter().copied().collect(),
            output: TensorType::new(ElementType::F32, Vec::new()),
            relaxed,
        };

        let producers = inputs
            .iter()
            .map(|&i| self.node(i))
            .collect::<LptResult<Vec<_>>>()?;
        node.output = infer_output_type(&node, &producers)?;

        for &input in inputs {
            self.consumer_map.entry(input).or_default().push(id);
        }
        self.name_map.insert(node.name.clone(), id);
        self.nodes.push(Some(node));
        Ok(id)
    }

    fn next_id(&self) -> NodeId {
        NodeId(self.nodes.len() as u32)
    }

    // ========================================================================
    // Rewiring
    // ========================================================================

    /// Replace `old` with `new` on every consumer edge, then detach `old`
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> LptResult<()> {
        if old == new {
            return Ok(());
        }
        self.node(old)?;
        self.node(new)?;
        if self.has_path(old, new) {
            return Err(TransformError::InvariantViolation(format!(
                "replacing {} with {} would create a cycle",
                old, new
            )));
        }

        let consumers = self.consumer_map.remove(&old).unwrap_or_default();
        let mut rewired: SmallVec<[NodeId; 4]> = SmallVec::new();
        for &consumer in &consumers {
            if rewired.contains(&consumer) {
                continue;
            }
            rewired.push(consumer);
            let node = self.node_mut(consumer)?;
            for input in node.inputs.iter_mut().filter(|i| **i == old) {
                *input = new;
            }
        }
        self.consumer_map
            .entry(new)
            .or_default()
            .extend(consumers.iter().copied());

        self.remove_dangling(old);
        Ok(())
    }

    /// Rewire input `index` of `consumer` to `producer`
    ///
    /// Only this edge moves; other consumers of the previous producer keep
    /// their edges. The previous producer is detached if it is left unused.
    pub fn set_input(&mut self, consumer: NodeId, index: usize, producer: NodeId) -> LptResult<()> {
        self.node(producer)?;
        let node = self.node_mut(consumer)?;
        let slot = node.inputs.get_mut(index).ok_or_else(|| {
            TransformError::InvalidNode(format!("{} has no input {}", consumer, index))
        })?;
        let previous = std::mem::replace(slot, producer);
        if previous == producer {
            return Ok(());
        }

        if let Some(edges) = self.consumer_map.get_mut(&previous) {
            if let Some(pos) = edges.iter().position(|&c| c == consumer) {
                edges.remove(pos);
            }
        }
        self.consumer_map.entry(producer).or_default().push(consumer);
        self.revalidate(consumer)?;
        self.remove_dangling(previous);
        Ok(())
    }

    /// Set the user-facing name of a node
    pub fn set_friendly_name(&mut self, id: NodeId, friendly_name: impl Into<String>) -> LptResult<()> {
        self.node_mut(id)?.friendly_name = friendly_name.into();
        Ok(())
    }

    // ========================================================================
    // Typing
    // ========================================================================

    /// Wrap a node in the type-relaxation decorator
    ///
    /// The node is replaced by a relaxed copy whose declared output type is
    /// the type it currently produces. Returns the handle now in place.
    pub fn relax(&mut self, id: NodeId) -> LptResult<NodeId> {
        let node = self.node(id)?;
        if node.is_relaxed() {
            return Ok(id);
        }
        let op = node.op.clone();
        let inputs: SmallVec<[NodeId; 4]> = node.inputs.clone();
        let friendly_name = node.friendly_name.clone();
        let relaxed = TypeRelaxed {
            output_type: Some(node.element_type()),
        };
        let relaxed_id = self.insert_node(op, &inputs, Some(relaxed), Some(friendly_name))?;
        self.replace_node(id, relaxed_id)?;
        Ok(relaxed_id)
    }

    /// Declare the output element type of a relaxed node
    pub fn set_output_type(&mut self, id: NodeId, element_type: ElementType) -> LptResult<()> {
        let node = self.node_mut(id)?;
        match node.relaxed.as_mut() {
            Some(relaxed) => relaxed.output_type = Some(element_type),
            None => {
                return Err(TransformError::TypeMismatch(format!(
                    "{} ({}) is not type-relaxed, cannot declare {}",
                    node.name,
                    node.kind(),
                    element_type
                )))
            }
        }
        self.revalidate(id)
    }

    /// Re-infer the output of one node from its current inputs
    pub fn revalidate(&mut self, id: NodeId) -> LptResult<()> {
        let node = self.node(id)?;
        let producers = node
            .inputs
            .iter()
            .map(|&i| self.node(i))
            .collect::<LptResult<Vec<_>>>()?;
        let output = infer_output_type(node, &producers)?;
        self.node_mut(id)?.output = output;
        Ok(())
    }

    /// Re-infer every live node in topological order
    pub fn validate_and_infer_types(&mut self) -> LptResult<()> {
        for id in self.topological_order() {
            self.revalidate(id)?;
        }
        Ok(())
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Detach `id` if nothing consumes it, then walk up its producers
    pub(crate) fn remove_dangling(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let removable = match self.get_node(id) {
                Some(node) => {
                    !matches!(node.kind(), OpKind::Parameter | OpKind::Result)
                        && self.consumer_count(id) == 0
                }
                None => false,
            };
            if !removable {
                continue;
            }
            let Some(node) = self.nodes[id.index()].take() else {
                continue;
            };
            self.name_map.remove(&node.name);
            self.consumer_map.remove(&id);
            for &input in &node.inputs {
                if let Some(edges) = self.consumer_map.get_mut(&input) {
                    if let Some(pos) = edges.iter().position(|&c| c == id) {
                        edges.remove(pos);
                    }
                }
                stack.push(input);
            }
        }
    }

    /// Detach every node that no result depends on
    ///
    /// Parameters are kept. Returns the number of detached nodes.
    pub fn collect_garbage(&mut self) -> usize {
        let mut live = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = self.results.clone();
        stack.extend(self.parameters.iter().copied());
        while let Some(id) = stack.pop() {
            if live[id.index()] {
                continue;
            }
            live[id.index()] = true;
            if let Some(node) = self.get_node(id) {
                stack.extend(node.inputs.iter().copied());
            }
        }

        let mut removed = 0;
        for (index, alive) in live.into_iter().enumerate() {
            if !alive && self.nodes[index].take().is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            self.consumer_map = build_consumer_map(&self.nodes);
            self.name_map = build_name_map(&self.nodes);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_dequantization_graph() -> (GraphContext, NodeId, NodeId, NodeId) {
        let mut ctx = GraphContext::new();
        let x = ctx.add_parameter("x", ElementType::U8, vec![1, 3, 4, 4]);
        let convert = ctx
            .add_node(Op::Convert { destination: ElementType::F32 }, &[x])
            .unwrap();
        let scale = ctx.add_constant(Constant::scalar(ElementType::F32, 0.1));
        let mul = ctx.add_node(Op::Multiply, &[convert, scale]).unwrap();
        let relu = ctx.add_node(Op::Relu, &[mul]).unwrap();
        ctx.add_result(relu).unwrap();
        (ctx, x, mul, relu)
    }

    #[test]
    fn test_add_node_infers_output() {
        let (ctx, _, mul, _) = make_dequantization_graph();
        let node = ctx.node(mul).unwrap();
        assert_eq!(node.element_type(), ElementType::F32);
        assert_eq!(node.shape(), &[1, 3, 4, 4]);
    }

    #[test]
    fn test_add_node_rejects_missing_input() {
        let mut ctx = GraphContext::new();
        assert!(ctx.add_node(Op::Relu, &[NodeId(7)]).is_err());
    }

    #[test]
    fn test_replace_node_rewires_and_detaches() {
        let (mut ctx, x, mul, relu) = make_dequantization_graph();
        let before = ctx.node_count();
        let new_relu = ctx.add_node(Op::Relu, &[x]).unwrap();
        ctx.replace_node(relu, new_relu).unwrap();

        assert!(!ctx.has_node(relu));
        // multiply, its scale and the convert went with the old relu
        assert!(!ctx.has_node(mul));
        assert_eq!(ctx.node_count(), before - 3);
        let result = ctx.results()[0];
        assert_eq!(ctx.get_input(result, 0), Some(new_relu));
        assert_eq!(ctx.get_consumers(new_relu), &[result]);
    }

    #[test]
    fn test_replace_node_rejects_cycle() {
        let (mut ctx, _, mul, relu) = make_dequantization_graph();
        assert!(matches!(
            ctx.replace_node(mul, relu),
            Err(TransformError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_set_input_moves_single_edge() {
        let mut ctx = GraphContext::new();
        let x = ctx.add_parameter("x", ElementType::F32, vec![1, 3]);
        let a = ctx.add_node(Op::Relu, &[x]).unwrap();
        let b = ctx.add_node(Op::Relu, &[x]).unwrap();
        ctx.add_result(a).unwrap();
        ctx.add_result(b).unwrap();
        let y = ctx.add_parameter("y", ElementType::F32, vec![1, 3]);

        ctx.set_input(b, 0, y).unwrap();
        assert_eq!(ctx.get_consumers(x), &[a]);
        assert_eq!(ctx.get_consumers(y), &[b]);
    }

    #[test]
    fn test_clone_keeps_decorator_and_name() {
        let (mut ctx, x, mul, _) = make_dequantization_graph();
        ctx.set_friendly_name(mul, "dq").unwrap();
        let relaxed = ctx.relax(mul).unwrap();
        let scale = ctx.get_input(relaxed, 1).unwrap();
        let copy = ctx.clone_with_new_inputs(relaxed, &[x, scale]).unwrap();
        let node = ctx.node(copy).unwrap();
        assert!(node.is_relaxed());
        assert_eq!(node.friendly_name, "dq");
        // u8 data times f32 scale is accepted on the relaxed copy
        assert_eq!(node.element_type(), ElementType::F32);
    }

    #[test]
    fn test_set_output_type_requires_relaxation() {
        let (mut ctx, _, mul, _) = make_dequantization_graph();
        assert!(ctx.set_output_type(mul, ElementType::U8).is_err());
        let relaxed = ctx.relax(mul).unwrap();
        ctx.set_output_type(relaxed, ElementType::U8).unwrap();
        assert_eq!(ctx.node(relaxed).unwrap().element_type(), ElementType::U8);
    }

    #[test]
    fn test_collect_garbage() {
        let (mut ctx, x, _, _) = make_dequantization_graph();
        let orphan = ctx.add_node(Op::Relu, &[x]).unwrap();
        assert_eq!(ctx.collect_garbage(), 1);
        assert!(!ctx.has_node(orphan));
        assert_eq!(ctx.consumer_count(x), 1);
    }
}
