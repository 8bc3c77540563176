//! Multiply cleanup
//!
//! Folds consecutive constant multiplies into one, and pulls per-tensor
//! scales out of a product of two dequantized branches:
//!
//! ```text
//! (s1 * a) * (s2 * b) == (a * b) * (s1 * s2)
//! ```

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::{LptResult, TransformError};
use crate::graph::{GraphContext, NodeId, Op, OpKind};
use crate::low_precision::layer_transformation::reject;
use crate::low_precision::network_helper::exclusive_dequantization;
use crate::low_precision::{FakeQuantizeDequantization, LayerTransformation, Params};
use crate::pattern::{MatchResult, Pattern};
use crate::tensor::Constant;
use crate::transform::{constant_of, TransformationContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MultiplyPlan {
    /// `Multiply(Multiply(x, c1), c2)` with a single-use inner multiply
    MergeConstants { inner: NodeId },
    /// Both operands end in a zero-point-free per-tensor dequantization
    ScalesOut,
}

#[derive(Debug, Clone)]
pub struct MultiplyTransformation {
    params: Arc<Params>,
}

impl MultiplyTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    fn plan(&self, graph: &GraphContext, node: NodeId) -> Option<MultiplyPlan> {
        if let Some((data, _)) = graph.split_constant_operand(node) {
            let merges = graph.kind(data) == Some(OpKind::Multiply)
                && graph.is_single_use(data)
                && graph.split_constant_operand(data).is_some();
            return merges.then_some(MultiplyPlan::MergeConstants { inner: data });
        }

        let lowerable = (0..2).all(|i| {
            FakeQuantizeDequantization::extract(graph, node, i).map_or(false, |chain| {
                chain.multiply.is_some()
                    && chain.subtract.is_none()
                    && chain.scale(graph).map_or(false, Constant::is_scalar_like)
            })
        });
        if !lowerable {
            reject(self.name(), graph, node, "operands are not per-tensor dequantizations");
            return None;
        }
        Some(MultiplyPlan::ScalesOut)
    }

    fn merge_constants(graph: &mut GraphContext, node: NodeId, inner: NodeId) -> LptResult<NodeId> {
        let float_type = graph.node(node)?.element_type();
        let lost = |id: NodeId| TransformError::InvariantViolation(format!("{} lost its constant", id));
        let (_, outer_constant) = graph.split_constant_operand(node).ok_or_else(|| lost(node))?;
        let (x, inner_constant) = graph.split_constant_operand(inner).ok_or_else(|| lost(inner))?;
        let merged = constant_of(graph, inner_constant)?.zip_with(
            constant_of(graph, outer_constant)?,
            float_type,
            |a, b| a * b,
        )?;
        let merged = graph.add_constant(merged);
        let multiply = graph.clone_with_new_inputs(node, &[x, merged])?;
        graph.replace_node(node, multiply)?;
        Ok(multiply)
    }

    fn pull_scales_out(graph: &mut GraphContext, node: NodeId) -> LptResult<NodeId> {
        let float_type = graph.node(node)?.element_type();
        let friendly_name = graph.node(node)?.friendly_name.clone();
        let mut inputs = [node, node];
        let mut scale = 1.0;
        for (i, input) in inputs.iter_mut().enumerate() {
            let chain = exclusive_dequantization(graph, node, i)?;
            scale *= chain.scale(graph).map_or(1.0, |c| c.value_at(0));
            *input = chain.convert.unwrap_or(chain.data);
        }
        let product = graph.clone_with_new_inputs(node, &inputs)?;
        graph.set_friendly_name(product, format!("{}_original", friendly_name))?;
        let scale = graph.add_constant(Constant::scalar(float_type, scale));
        let multiply = graph.add_node(Op::Multiply, &[product, scale])?;
        graph.set_friendly_name(multiply, friendly_name)?;
        graph.replace_node(node, multiply)?;
        Ok(multiply)
    }
}

impl LayerTransformation for MultiplyTransformation {
    fn name(&self) -> &'static str {
        "MultiplyTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::Multiply)]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        self.plan(ctx.graph, node).is_some()
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let node = m.root();
        match self.plan(ctx.graph, node) {
            Some(MultiplyPlan::MergeConstants { inner }) => {
                Self::merge_constants(ctx.graph, node, inner)?;
            }
            Some(MultiplyPlan::ScalesOut) => {
                Self::pull_scales_out(ctx.graph, node)?;
            }
            None => return Ok(false),
        }
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

    fn run(graph: &mut GraphContext, node: NodeId) -> bool {
        let transformation = MultiplyTransformation::new(Arc::new(Params::default()));
        let pattern = transformation.patterns().remove(0);
        let m = PatternMatcher::new(graph).match_pattern(&pattern, node).unwrap();
        transformation
            .transform(&mut TransformationContext::new(graph), &m)
            .unwrap()
    }

    #[test]
    fn test_merges_constant_multiplies() {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::F32, vec![1, 3, 2, 2]);
        let c1 = graph.add_constant(Constant::scalar(ElementType::F32, 0.5));
        let inner = graph.add_node(Op::Multiply, &[x, c1]).unwrap();
        let c2 = graph.add_constant(
            Constant::from_vec(ElementType::F32, &[1, 3, 1, 1], vec![1.0, 2.0, 4.0]).unwrap(),
        );
        let outer = graph.add_node(Op::Multiply, &[inner, c2]).unwrap();
        graph.add_result(outer).unwrap();

        assert!(run(&mut graph, outer));
        let result = graph.results()[0];
        let merged = graph.get_input(result, 0).unwrap();
        assert_eq!(graph.get_input(merged, 0), Some(x));
        assert_eq!(graph.get_constant_input(merged, 1).unwrap().to_vec(), vec![0.5, 1.0, 2.0]);
        assert!(!graph.has_node(inner));
    }

    #[test]
    fn test_keeps_shared_inner_multiply() {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::F32, vec![4]);
        let c = graph.add_constant(Constant::scalar(ElementType::F32, 2.0));
        let inner = graph.add_node(Op::Multiply, &[x, c]).unwrap();
        let outer = graph.add_node(Op::Multiply, &[inner, c]).unwrap();
        graph.add_result(inner).unwrap();
        graph.add_result(outer).unwrap();
        assert!(!run(&mut graph, outer));
    }

    #[test]
    fn test_pulls_scales_out_of_product() {
        let mut graph = GraphContext::new();
        let a = graph.add_parameter("a", ElementType::U8, vec![1, 4]);
        let b = graph.add_parameter("b", ElementType::U8, vec![1, 4]);
        let mut operands = Vec::new();
        for (x, s) in [(a, 0.5), (b, 0.25)] {
            let convert = graph
                .add_node(Op::Convert { destination: ElementType::F32 }, &[x])
                .unwrap();
            let s = graph.add_constant(Constant::scalar(ElementType::F32, s));
            operands.push(graph.add_node(Op::Multiply, &[convert, s]).unwrap());
        }
        let product = graph.add_node(Op::Multiply, &operands).unwrap();
        graph.add_result(product).unwrap();

        let feeds = [
            (a, ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![1.0, 2.0, 3.0, 4.0]).unwrap()),
            (b, ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![8.0, 6.0, 4.0, 2.0]).unwrap()),
        ];
        let before = evaluate(&graph, &feeds).unwrap();
        assert!(run(&mut graph, product));
        let result = graph.results()[0];
        let last = graph.get_input(result, 0).unwrap();
        assert_eq!(graph.get_constant_input(last, 1).unwrap().scalar_value(), Some(0.125));
        assert_eq!(evaluate(&graph, &feeds).unwrap(), before);
    }
}
