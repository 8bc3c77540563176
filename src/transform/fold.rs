//! Constant-folding primitives
//!
//! Rules build replacement subgraphs through these helpers so that an
//! operation over constants lands in the graph as a single constant.

use smallvec::SmallVec;

use crate::error::{LptResult, TransformError};
use crate::graph::{evaluate_node, infer_output_type, GraphContext, Node, NodeId, Op, TensorType};
use crate::tensor::{Constant, ElementType};

/// Evaluate `op` over constant inputs
///
/// Returns `None` when any input is not a constant.
pub fn fold(graph: &GraphContext, op: &Op, inputs: &[NodeId]) -> LptResult<Option<Constant>> {
    if !inputs.iter().all(|&i| graph.is_constant(i)) {
        return Ok(None);
    }
    let producers = inputs
        .iter()
        .map(|&i| graph.node(i))
        .collect::<LptResult<Vec<_>>>()?;

    let mut node = Node {
        name: format!("fold_{}", op.kind()),
        friendly_name: String::new(),
        op: op.clone(),
        inputs: inputs.iter().copied().collect::<SmallVec<[NodeId; 4]>>(),
        output: TensorType::new(ElementType::F32, Vec::new()),
        relaxed: None,
    };
    node.output = infer_output_type(&node, &producers)?;

    let values = producers
        .iter()
        .map(|p| {
            p.op.as_constant().map(|c| c.values()).ok_or_else(|| {
                TransformError::Internal(format!("{} is not a constant", p.name))
            })
        })
        .collect::<LptResult<Vec<_>>>()?;
    let output = evaluate_node(&node, &values)?;
    Ok(Some(Constant::new(node.output.element_type, output)))
}

/// Add `op` over `inputs`, folding it into a constant when possible
pub fn make_folded(graph: &mut GraphContext, op: Op, inputs: &[NodeId]) -> LptResult<NodeId> {
    match fold(graph, &op, inputs)? {
        Some(constant) => Ok(graph.add_constant(constant)),
        None => graph.add_node(op, inputs),
    }
}

/// Fold a binary elementwise operation over two constant nodes
pub fn fold_binary(graph: &mut GraphContext, op: Op, lhs: NodeId, rhs: NodeId) -> LptResult<NodeId> {
    match fold(graph, &op, &[lhs, rhs])? {
        Some(constant) => Ok(graph.add_constant(constant)),
        None => Err(TransformError::InvalidConstant(format!(
            "{} over non-constant operands {} and {}",
            op.kind(),
            lhs,
            rhs
        ))),
    }
}

/// Constant payload of `id` broadcast to `shape` and added as a new node
pub fn fold_broadcast(graph: &mut GraphContext, id: NodeId, shape: &[usize]) -> LptResult<NodeId> {
    let constant = constant_of(graph, id)?.broadcast_to(shape)?;
    Ok(graph.add_constant(constant))
}

/// Constant payload of `id` reshaped to `shape` and added as a new node
pub fn fold_reshape(graph: &mut GraphContext, id: NodeId, shape: &[usize]) -> LptResult<NodeId> {
    let constant = constant_of(graph, id)?.reshape(shape)?;
    Ok(graph.add_constant(constant))
}

/// Constant payload of `id` converted to `element_type` and added as a new node
pub fn fold_convert(
    graph: &mut GraphContext,
    id: NodeId,
    element_type: ElementType,
) -> LptResult<NodeId> {
    let constant = constant_of(graph, id)?.convert(element_type);
    Ok(graph.add_constant(constant))
}

/// Constant payload of a node, as an error when it is not a constant
pub fn constant_of(graph: &GraphContext, id: NodeId) -> LptResult<&Constant> {
    graph
        .get_constant(id)
        .ok_or_else(|| TransformError::InvalidConstant(format!("{} is not a constant", id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_binary() {
        let mut graph = GraphContext::new();
        let a = graph.add_constant(
            Constant::from_vec(ElementType::F32, &[1, 3, 1, 1], vec![1.0, 2.0, 3.0]).unwrap(),
        );
        let b = graph.add_constant(Constant::scalar(ElementType::F32, 0.5));
        let folded = fold_binary(&mut graph, Op::Multiply, a, b).unwrap();
        let constant = graph.get_constant(folded).unwrap();
        assert_eq!(constant.shape(), &[1, 3, 1, 1]);
        assert_eq!(constant.to_vec(), vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_make_folded_keeps_non_constant() {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::F32, vec![2]);
        let c = graph.add_constant(Constant::scalar(ElementType::F32, 1.0));
        let add = make_folded(&mut graph, Op::Add, &[x, c]).unwrap();
        assert!(!graph.is_constant(add));
        assert!(fold_binary(&mut graph, Op::Add, x, c).is_err());
    }

    #[test]
    fn test_fold_shape_helpers() {
        let mut graph = GraphContext::new();
        let c = graph.add_constant(Constant::scalar(ElementType::F32, 128.0));
        let b = fold_broadcast(&mut graph, c, &[1, 3, 1, 1]).unwrap();
        assert_eq!(graph.output_shape(b), &[1, 3, 1, 1]);
        let r = fold_reshape(&mut graph, b, &[3, 1, 1]).unwrap();
        assert_eq!(graph.output_shape(r), &[3, 1, 1]);
        let u = fold_convert(&mut graph, r, ElementType::U8).unwrap();
        assert_eq!(graph.output_type(u), Some(ElementType::U8));
    }
}
