//! MaxPool transformation
//!
//! Max is monotonic under `x -> s * (x - z)` for `s > 0`, so the
//! dequantization moves after the pooling with its zero point intact.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, OpKind};
use crate::low_precision::layer_transformation::{
    can_be_transformed_base, has_positive_scale, move_dequantization_through,
    preserved_output_type, reject,
};
use crate::low_precision::{FakeQuantizeDequantization, LayerTransformation, Params};
use crate::pattern::ops::unary_after_dequantization;
use crate::pattern::{MatchResult, Pattern};
use crate::transform::TransformationContext;

#[derive(Debug, Clone)]
pub struct MaxPoolTransformation {
    params: Arc<Params>,
}

impl MaxPoolTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }
}

impl LayerTransformation for MaxPoolTransformation {
    fn name(&self) -> &'static str {
        "MaxPoolTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![unary_after_dequantization(OpKind::MaxPool)]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        let graph = &*ctx.graph;
        if !can_be_transformed_base(self.name(), &self.params, graph, node, 0) {
            return false;
        }
        let Some(chain) = FakeQuantizeDequantization::extract(graph, node, 0) else {
            return false;
        };
        if !has_positive_scale(graph, &chain) {
            return reject(self.name(), graph, node, "non-positive scale");
        }
        true
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let pool = m.root();
        if !self.can_be_transformed(ctx, pool) {
            return Ok(false);
        }
        let output_type = preserved_output_type(&self.params, ctx.graph, pool);
        move_dequantization_through(ctx.graph, pool, output_type, |c| Ok(c.clone()))?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{evaluate, Op, PoolAttrs};
    use crate::pattern::PatternMatcher;
    use crate::tensor::{Constant, ElementType};
    use ndarray::{ArrayD, IxDyn};

    fn make_max_pool_graph(scale: &[f32], shift: Option<f32>) -> (GraphContext, NodeId, NodeId) {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::U8, vec![1, 3, 4, 4]);
        let mut last = graph
            .add_node(Op::Convert { destination: ElementType::F32 }, &[x])
            .unwrap();
        if let Some(shift) = shift {
            let zp = graph.add_constant(Constant::scalar(ElementType::F32, shift));
            last = graph.add_node(Op::Subtract, &[last, zp]).unwrap();
        }
        let shape: &[usize] = if scale.len() == 1 { &[] } else { &[1, 3, 1, 1] };
        let s = graph.add_constant(Constant::from_vec(ElementType::F32, shape, scale.to_vec()).unwrap());
        let mul = graph.add_node(Op::Multiply, &[last, s]).unwrap();
        let pool = graph
            .add_relaxed_node(Op::MaxPool(PoolAttrs::square(2)), &[mul], None)
            .unwrap();
        graph.set_friendly_name(pool, "maxPool").unwrap();
        graph.add_result(pool).unwrap();
        (graph, x, pool)
    }

    fn run(graph: &mut GraphContext, pool: NodeId) -> bool {
        let transformation = MaxPoolTransformation::new(Arc::new(Params::default()));
        let pattern = transformation.patterns().remove(0);
        let Some(m) = PatternMatcher::new(graph).match_pattern(&pattern, pool) else {
            return false;
        };
        transformation
            .transform(&mut TransformationContext::new(graph), &m)
            .unwrap()
    }

    #[test]
    fn test_keeps_zero_point_and_per_channel_scale() {
        let (mut graph, x, pool) = make_max_pool_graph(&[0.1, 0.2, 0.3], Some(128.0));
        let input = ArrayD::from_shape_fn(IxDyn(&[1, 3, 4, 4]), |i| {
            ((i[1] * 50 + i[2] * 13 + i[3] * 29) % 256) as f32
        });
        let before = evaluate(&graph, &[(x, input.clone())]).unwrap();
        assert!(run(&mut graph, pool));

        let new_pool = graph.find_nodes_by_op(OpKind::MaxPool)[0];
        assert_eq!(graph.get_input(new_pool, 0), Some(x));
        assert_eq!(graph.output_type(new_pool), Some(ElementType::U8));
        let result = graph.results()[0];
        let chain = FakeQuantizeDequantization::extract(&graph, result, 0).unwrap();
        assert_eq!(chain.data, new_pool);
        assert_eq!(chain.shift(&graph).unwrap().scalar_value(), Some(128.0));
        assert_eq!(graph.node(chain.output()).unwrap().friendly_name, "maxPool");

        let after = evaluate(&graph, &[(x, input)]).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_rejects_negative_scale() {
        let (mut graph, _, pool) = make_max_pool_graph(&[0.1, -0.2, 0.3], None);
        assert!(!run(&mut graph, pool));
        assert!(graph.has_node(pool));
    }
}
