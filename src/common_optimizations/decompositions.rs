//! Decompositions into Add and Multiply
//!
//! ```text
//! a - b          => a + b * -1
//! a / b          => a * b ^ -1
//! -x             => x * -1
//! batch_norm(x)  => x * (gamma / sqrt(var + eps)) + (beta - mean * gamma / sqrt(var + eps))
//! ```
//!
//! Constant operands are folded on the spot. A Subtract that belongs to a
//! dequantization is left alone.

use tracing::trace;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op, OpKind};
use crate::pattern::{MatchResult, Pattern};
use crate::tensor::{channel_shape, Constant};
use crate::transform::{make_folded, RewriteRule, TransformationContext};

use super::MatcherPass;

/// Subtract to Add of the negated operand
#[derive(Debug, Default, Clone, Copy)]
pub struct ConvertSubtract;

/// Divide to Multiply by the reciprocal
#[derive(Debug, Default, Clone, Copy)]
pub struct ConvertDivide;

/// Negative to Multiply by minus one
#[derive(Debug, Default, Clone, Copy)]
pub struct ConvertNegative;

/// Inference batch norm to per-channel Multiply and Add
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchNormDecomposition;

fn is_real(graph: &GraphContext, id: NodeId) -> bool {
    graph.output_type(id).map_or(false, |t| t.is_real())
}

/// Subtract applied to integer-origin values
fn is_dequantization_subtract(graph: &GraphContext, id: NodeId) -> bool {
    let Some(node) = graph.get_node(id) else {
        return false;
    };
    let Some(data) = node.input(0) else {
        return false;
    };
    let from_integer = |n: NodeId| graph.output_type(n).map_or(false, |t| t.is_integral());
    node.is_relaxed()
        || from_integer(data)
        || (graph.kind(data) == Some(OpKind::Convert)
            && graph.get_input(data, 0).map_or(false, from_integer))
}

/// `op(input, value)` with `value` a scalar of the type of `id`, folded when `input` is constant
fn with_scalar(graph: &mut GraphContext, id: NodeId, op: Op, input: NodeId, value: f32) -> LptResult<NodeId> {
    let element_type = graph.node(id)?.element_type();
    let scalar = graph.add_constant(Constant::scalar(element_type, value));
    make_folded(graph, op, &[input, scalar])
}

impl MatcherPass for ConvertSubtract {
    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::Subtract)]
    }
}

impl RewriteRule for ConvertSubtract {
    fn name(&self) -> &str {
        "ConvertSubtract"
    }

    fn apply(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let sub = m.root();
        let graph = &mut *ctx.graph;
        if !is_real(graph, sub) || is_dequantization_subtract(graph, sub) {
            return Ok(false);
        }
        let node = graph.node(sub)?;
        let (a, b) = (node.inputs[0], node.inputs[1]);
        let friendly_name = node.friendly_name.clone();
        let negated = with_scalar(graph, sub, Op::Multiply, b, -1.0)?;
        let add = graph.add_node(Op::Add, &[a, negated])?;
        graph.set_friendly_name(add, friendly_name)?;
        graph.replace_node(sub, add)?;
        Ok(true)
    }
}

impl MatcherPass for ConvertDivide {
    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::Divide)]
    }
}

impl RewriteRule for ConvertDivide {
    fn name(&self) -> &str {
        "ConvertDivide"
    }

    fn apply(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let div = m.root();
        let graph = &mut *ctx.graph;
        if !is_real(graph, div) {
            return Ok(false);
        }
        let node = graph.node(div)?;
        let (a, b) = (node.inputs[0], node.inputs[1]);
        let friendly_name = node.friendly_name.clone();
        let reciprocal = with_scalar(graph, div, Op::Power, b, -1.0)?;
        let mul = graph.add_node(Op::Multiply, &[a, reciprocal])?;
        graph.set_friendly_name(mul, friendly_name)?;
        graph.replace_node(div, mul)?;
        Ok(true)
    }
}

impl MatcherPass for ConvertNegative {
    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::Negative)]
    }
}

impl RewriteRule for ConvertNegative {
    fn name(&self) -> &str {
        "ConvertNegative"
    }

    fn apply(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let neg = m.root();
        let graph = &mut *ctx.graph;
        if !is_real(graph, neg) {
            return Ok(false);
        }
        let node = graph.node(neg)?;
        let (x, friendly_name) = (node.inputs[0], node.friendly_name.clone());
        let mul = with_scalar(graph, neg, Op::Multiply, x, -1.0)?;
        graph.set_friendly_name(mul, friendly_name)?;
        graph.replace_node(neg, mul)?;
        Ok(true)
    }
}

impl MatcherPass for BatchNormDecomposition {
    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::BatchNormInference).with_inputs([
            Pattern::any(),
            Pattern::constant(),
            Pattern::constant(),
            Pattern::constant(),
            Pattern::constant(),
        ])]
    }
}

impl RewriteRule for BatchNormDecomposition {
    fn name(&self) -> &str {
        "BatchNormDecomposition"
    }

    fn apply(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let bn = m.root();
        let graph = &mut *ctx.graph;
        let node = graph.node(bn)?;
        let Op::BatchNormInference { epsilon } = node.op else {
            return Ok(false);
        };
        let (element_type, friendly_name) = (node.element_type(), node.friendly_name.clone());
        let x = node.inputs[0];
        let rank = graph.output_rank(bn);
        let Some(channels) = graph.output_channels(bn) else {
            return Ok(false);
        };
        let param = |index: usize| graph.get_constant_input(bn, index).map(Constant::to_vec);
        let (Some(gamma), Some(beta), Some(mean), Some(variance)) = (param(1), param(2), param(3), param(4))
        else {
            trace!(node = %bn, "batch norm parameters are not constant");
            return Ok(false);
        };

        let multiplier: Vec<f32> = gamma
            .iter()
            .zip(&variance)
            .map(|(g, v)| g / (v + epsilon).sqrt())
            .collect();
        let shift: Vec<f32> = beta
            .iter()
            .zip(&mean)
            .zip(&multiplier)
            .map(|((b, m), k)| b - m * k)
            .collect();

        let shape = channel_shape(rank, channels);
        let multiplier = graph.add_constant(Constant::from_vec(element_type, &shape, multiplier)?);
        let shift = graph.add_constant(Constant::from_vec(element_type, &shape, shift)?);
        let mul = graph.add_node(Op::Multiply, &[x, multiplier])?;
        let add = graph.add_node(Op::Add, &[mul, shift])?;
        graph.set_friendly_name(add, friendly_name)?;
        graph.replace_node(bn, add)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::evaluate;
    use crate::tensor::ElementType;
    use crate::traits::Transformer;
    use ndarray::{ArrayD, Dimension, IxDyn};

    fn feed(x: NodeId, shape: &[usize]) -> Vec<(NodeId, ArrayD<f32>)> {
        vec![(x, ArrayD::from_shape_fn(IxDyn(shape), |i| i.slice().iter().sum::<usize>() as f32 + 0.5))]
    }

    fn assert_close(a: &[ArrayD<f32>], b: &[ArrayD<f32>]) {
        for (x, y) in a[0].iter().zip(b[0].iter()) {
            assert!((x - y).abs() < 1e-5, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_arithmetic_decompositions() {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::F32, vec![2, 3]);
        let c = graph.add_constant(Constant::from_vec(ElementType::F32, &[3], vec![1.0, 2.0, 4.0]).unwrap());
        let sub = graph.add_node(Op::Subtract, &[x, c]).unwrap();
        let div = graph.add_node(Op::Divide, &[sub, c]).unwrap();
        let neg = graph.add_node(Op::Negative, &[div]).unwrap();
        graph.add_result(neg).unwrap();
        let inputs = feed(x, &[2, 3]);
        let before = evaluate(&graph, &inputs).unwrap();

        assert_eq!(ConvertSubtract.transform(&mut graph).unwrap().transforms_applied, 1);
        assert_eq!(ConvertDivide.transform(&mut graph).unwrap().transforms_applied, 1);
        assert_eq!(ConvertNegative.transform(&mut graph).unwrap().transforms_applied, 1);
        for kind in [OpKind::Subtract, OpKind::Divide, OpKind::Negative, OpKind::Power] {
            assert!(graph.find_nodes_by_op(kind).is_empty(), "{} left", kind);
        }
        assert_close(&before, &evaluate(&graph, &inputs).unwrap());
    }

    #[test]
    fn test_dequantization_subtract_is_kept() {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::U8, vec![1, 3]);
        let convert = graph
            .add_node(Op::Convert { destination: ElementType::F32 }, &[x])
            .unwrap();
        let zp = graph.add_constant(Constant::scalar(ElementType::F32, 128.0));
        let sub = graph.add_node(Op::Subtract, &[convert, zp]).unwrap();
        graph.add_result(sub).unwrap();

        assert_eq!(ConvertSubtract.transform(&mut graph).unwrap().transforms_applied, 0);
        assert!(graph.has_node(sub));
    }

    #[test]
    fn test_batch_norm_decomposition() {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::F32, vec![1, 2, 2, 2]);
        let params: Vec<NodeId> = [[2.0, 0.5], [0.1, -0.3], [1.0, 2.0], [0.25, 4.0]]
            .iter()
            .map(|v| graph.add_constant(Constant::from_vec(ElementType::F32, &[2], v.to_vec()).unwrap()))
            .collect();
        let bn = graph
            .add_node(
                Op::BatchNormInference { epsilon: 1e-5 },
                &[x, params[0], params[1], params[2], params[3]],
            )
            .unwrap();
        graph.set_friendly_name(bn, "bn").unwrap();
        graph.add_result(bn).unwrap();
        let inputs = feed(x, &[1, 2, 2, 2]);
        let before = evaluate(&graph, &inputs).unwrap();

        let stats = BatchNormDecomposition.transform(&mut graph).unwrap();
        assert_eq!(stats.transforms_applied, 1);
        let add = graph.get_input(graph.results()[0], 0).unwrap();
        assert_eq!(graph.kind(add), Some(OpKind::Add));
        assert_eq!(graph.node(add).unwrap().friendly_name, "bn");
        assert_eq!(graph.get_constant_input(add, 1).unwrap().shape(), &[1, 2, 1, 1]);
        assert_close(&before, &evaluate(&graph, &inputs).unwrap());
    }
}
