//! MatMul transformation
//!
//! With per-tensor scales on both operands the product of the scales moves
//! after the multiplication. The second operand is either a fake-quantize on
//! constant weights, decomposed here, or another dequantized activation.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op, OpKind};
use crate::low_precision::layer_transformation::{
    can_be_transformed_base, is_dequantization_supported, reject,
};
use crate::low_precision::network_helper::{decompose_weights, exclusive_dequantization};
use crate::low_precision::{FakeQuantizeDequantization, LayerTransformation, Params};
use crate::pattern::{MatchResult, Pattern};
use crate::tensor::Constant;
use crate::transform::TransformationContext;

use super::weightable::{is_scalar_scale, plan_weights, WeightsPlan};

/// How the second operand is lowered
#[derive(Debug, Clone)]
enum SecondOperand {
    Weights(WeightsPlan),
    Dequantized,
}

#[derive(Debug, Clone)]
pub struct MatMulTransformation {
    params: Arc<Params>,
}

impl MatMulTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    fn plan(&self, graph: &GraphContext, node: NodeId) -> Option<SecondOperand> {
        let name = self.name();
        if !can_be_transformed_base(name, &self.params, graph, node, 0) {
            return None;
        }
        let chain = FakeQuantizeDequantization::extract(graph, node, 0)?;
        if !is_scalar_scale(chain.scale(graph)) {
            reject(name, graph, node, "per-channel scale on first operand");
            return None;
        }

        let second = graph.get_input(node, 1)?;
        if graph.kind(second) == Some(OpKind::FakeQuantize) {
            let plan = plan_weights(name, &self.params, graph, node)?;
            if plan.details.intervals_count() != 1 {
                reject(name, graph, node, "per-channel weights");
                return None;
            }
            return Some(SecondOperand::Weights(plan));
        }

        let other = FakeQuantizeDequantization::extract(graph, node, 1)?;
        if other.multiply.is_none() || !is_dequantization_supported(&self.params, graph, &other) {
            reject(name, graph, node, "second operand is not dequantized");
            return None;
        }
        if !is_scalar_scale(other.scale(graph)) {
            reject(name, graph, node, "per-channel scale on second operand");
            return None;
        }
        Some(SecondOperand::Dequantized)
    }

    fn lower(&self, graph: &mut GraphContext, node: NodeId, second: &SecondOperand) -> LptResult<NodeId> {
        let layer = graph.node(node)?;
        let op = layer.op.clone();
        let relaxed = layer.is_relaxed();
        let float_type = layer.element_type();
        let friendly_name = layer.friendly_name.clone();

        let first = exclusive_dequantization(graph, node, 0)?;
        let first_scale = first.scale(graph).map_or(1.0, |s| s.value_at(0));
        let first_input = first.subtract.unwrap_or(first.data);

        let (second_input, second_scale) = match second {
            SecondOperand::Weights(plan) => {
                let decomposed = decompose_weights(
                    graph,
                    plan.fq,
                    &plan.details,
                    &plan.precision,
                    self.params.update_precisions,
                    self.params.weights_to_const,
                )?;
                let chain = decomposed.dequantization;
                let scale = chain.scale(graph).map_or(1.0, |s| s.value_at(0));
                (chain.subtract.unwrap_or(chain.data), scale)
            }
            SecondOperand::Dequantized => {
                let chain = exclusive_dequantization(graph, node, 1)?;
                let scale = chain.scale(graph).map_or(1.0, |s| s.value_at(0));
                (chain.subtract.unwrap_or(chain.data), scale)
            }
        };

        let inputs = [first_input, second_input];
        let lowered = if relaxed {
            graph.add_relaxed_node(op, &inputs, self.params.update_precisions.then_some(float_type))?
        } else {
            graph.add_node(op, &inputs)?
        };
        graph.set_friendly_name(lowered, format!("{}_original", friendly_name))?;
        let scale = graph.add_constant(Constant::scalar(float_type, first_scale * second_scale));
        let multiply = graph.add_node(Op::Multiply, &[lowered, scale])?;
        graph.set_friendly_name(multiply, friendly_name)?;
        graph.replace_node(node, multiply)?;
        Ok(multiply)
    }
}

impl LayerTransformation for MatMulTransformation {
    fn name(&self) -> &'static str {
        "MatMulTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::MatMul).with_inputs([
            Pattern::op(OpKind::Multiply),
            Pattern::any_of(&[OpKind::FakeQuantize, OpKind::Multiply]),
        ])]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        self.plan(ctx.graph, node).is_some()
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let node = m.root();
        let Some(second) = self.plan(ctx.graph, node) else {
            return Ok(false);
        };
        self.lower(ctx.graph, node, &second)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        false
    }
}
