//! Convert cleanup
//!
//! An integer-to-float convert becomes a type-relaxed subtract declared as
//! the float type: the zero point of a following subtract is taken over, or
//! a zero is subtracted when there is none. Relaxed arithmetic then reads
//! the integer tensor directly.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op, OpKind};
use crate::low_precision::{LayerTransformation, Params};
use crate::pattern::{MatchResult, Pattern};
use crate::tensor::Constant;
use crate::transform::TransformationContext;

#[derive(Debug, Clone)]
pub struct ConvertTransformation {
    params: Arc<Params>,
}

impl ConvertTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    fn is_dequantization_convert(graph: &GraphContext, convert: NodeId) -> bool {
        let Some(node) = graph.get_node(convert) else {
            return false;
        };
        let integral_input = graph
            .get_input(convert, 0)
            .and_then(|input| graph.output_type(input))
            .map_or(false, |t| t.is_integral());
        matches!(node.op, Op::Convert { destination } if destination.is_real()) && integral_input
    }

    /// Subtract by a constant that is the only consumer of `convert`
    fn zero_point_consumer(graph: &GraphContext, convert: NodeId) -> Option<NodeId> {
        let &[consumer] = graph.get_consumers(convert) else {
            return None;
        };
        let takes_zero_point = graph.kind(consumer) == Some(OpKind::Subtract)
            && graph.get_input(consumer, 0) == Some(convert)
            && graph.get_constant_input(consumer, 1).is_some();
        takes_zero_point.then_some(consumer)
    }
}

impl LayerTransformation for ConvertTransformation {
    fn name(&self) -> &'static str {
        "ConvertTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::Convert)]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        Self::is_dequantization_convert(ctx.graph, node)
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let convert = m.root();
        if !self.can_be_transformed(ctx, convert) {
            return Ok(false);
        }
        let graph = &mut *ctx.graph;
        let node = graph.node(convert)?;
        let float_type = node.element_type();
        let data = node.inputs[0];

        let (replaced, zero_point) = match Self::zero_point_consumer(graph, convert) {
            Some(subtract) => (subtract, graph.get_input(subtract, 1)),
            None => (convert, None),
        };
        let zero_point = match zero_point {
            Some(zp) => zp,
            None => graph.add_constant(Constant::scalar(float_type, 0.0)),
        };
        let friendly_name = graph.node(replaced)?.friendly_name.clone();
        let subtract = graph.add_relaxed_node(Op::Subtract, &[data, zero_point], Some(float_type))?;
        graph.set_friendly_name(subtract, friendly_name)?;
        graph.replace_node(replaced, subtract)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::evaluate;
    use crate::pattern::PatternMatcher;
    use crate::tensor::ElementType;
    use ndarray::{ArrayD, IxDyn};

    fn make_convert_graph(zero_point: Option<f32>) -> (GraphContext, NodeId, NodeId) {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::U8, vec![1, 4]);
        let convert = graph
            .add_node(Op::Convert { destination: ElementType::F32 }, &[x])
            .unwrap();
        let mut last = convert;
        if let Some(zp) = zero_point {
            let zp = graph.add_constant(Constant::scalar(ElementType::F32, zp));
            last = graph.add_node(Op::Subtract, &[last, zp]).unwrap();
        }
        let s = graph.add_constant(Constant::scalar(ElementType::F32, 0.5));
        let mul = graph.add_node(Op::Multiply, &[last, s]).unwrap();
        graph.add_result(mul).unwrap();
        (graph, x, convert)
    }

    fn run(graph: &mut GraphContext, node: NodeId) -> bool {
        let transformation = ConvertTransformation::new(Arc::new(Params::default()));
        let pattern = transformation.patterns().remove(0);
        let m = PatternMatcher::new(graph).match_pattern(&pattern, node).unwrap();
        transformation
            .transform(&mut TransformationContext::new(graph), &m)
            .unwrap()
    }

    #[test]
    fn test_convert_and_zero_point_become_relaxed_subtract() {
        let (mut graph, x, convert) = make_convert_graph(Some(3.0));
        let feeds = [(x, ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![0.0, 3.0, 9.0, 255.0]).unwrap())];
        let before = evaluate(&graph, &feeds).unwrap();
        assert!(run(&mut graph, convert));

        assert!(graph.find_nodes_by_op(OpKind::Convert).is_empty());
        let subtracts = graph.find_nodes_by_op(OpKind::Subtract);
        assert_eq!(subtracts.len(), 1);
        let subtract = graph.node(subtracts[0]).unwrap();
        assert!(subtract.is_relaxed());
        assert_eq!(subtract.element_type(), ElementType::F32);
        assert_eq!(subtract.inputs[0], x);
        assert_eq!(evaluate(&graph, &feeds).unwrap(), before);
    }

    #[test]
    fn test_lone_convert_subtracts_zero() {
        let (mut graph, x, convert) = make_convert_graph(None);
        assert!(run(&mut graph, convert));
        let subtract = graph.find_nodes_by_op(OpKind::Subtract)[0];
        assert_eq!(graph.get_input(subtract, 0), Some(x));
        assert_eq!(graph.get_constant_input(subtract, 1).unwrap().scalar_value(), Some(0.0));
    }

    #[test]
    fn test_ignores_float_to_integer_convert() {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::F32, vec![4]);
        let convert = graph
            .add_node(Op::Convert { destination: ElementType::U8 }, &[x])
            .unwrap();
        graph.add_result(convert).unwrap();
        assert!(!run(&mut graph, convert));
    }
}
