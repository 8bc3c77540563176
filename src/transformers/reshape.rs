//! Reshape transformation
//!
//! A per-tensor dequantization commutes with any reshape. A per-channel one
//! survives only when the reshape keeps the batch and channel axes, in which
//! case its constants are re-laid out as `[1, C, 1, ...]` for the output
//! rank.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, OpKind};
use crate::low_precision::layer_transformation::{
    can_be_transformed_base, move_dequantization_through, preserved_output_type, reject,
    to_scalar,
};
use crate::low_precision::network_helper::aligned_shape;
use crate::low_precision::{FakeQuantizeDequantization, LayerTransformation, Params};
use crate::pattern::{MatchResult, Pattern};
use crate::tensor::{channel_shape, is_per_tensor, numel, Constant};
use crate::transform::TransformationContext;

#[derive(Debug, Clone)]
pub struct ReshapeTransformation {
    params: Arc<Params>,
}

impl ReshapeTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    /// Check that dequantization constants of the given shapes survive
    /// reshaping `input` into `output`
    pub fn can_be_transformed_shapes(
        subtract: Option<&[usize]>,
        multiply: Option<&[usize]>,
        input: &[usize],
        output: &[usize],
    ) -> bool {
        [subtract, multiply]
            .into_iter()
            .flatten()
            .all(|shape| Self::constant_survives(shape, input, output))
    }

    fn constant_survives(shape: &[usize], input: &[usize], output: &[usize]) -> bool {
        if is_per_tensor(shape) {
            return true;
        }
        if shape.len() > input.len() {
            return false;
        }
        let aligned = aligned_shape(shape, input.len());
        if aligned.len() < 2 || aligned[0] != 1 || aligned[2..].iter().any(|&d| d != 1) {
            return false;
        }
        output.len() >= 2 && output[0] == input[0] && output[1] == input[1]
    }

    fn relayout(constant: &Constant, output_rank: usize) -> LptResult<Constant> {
        if is_per_tensor(constant.shape()) {
            return to_scalar(constant);
        }
        constant.reshape(&channel_shape(output_rank, numel(constant.shape())))
    }
}

impl LayerTransformation for ReshapeTransformation {
    fn name(&self) -> &'static str {
        "ReshapeTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::Reshape).with_inputs([
            Pattern::op(OpKind::Multiply),
            Pattern::constant(),
        ])]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        let graph = &*ctx.graph;
        if !can_be_transformed_base(self.name(), &self.params, graph, node, 0) {
            return false;
        }
        let Some(chain) = FakeQuantizeDequantization::extract(graph, node, 0) else {
            return false;
        };
        let survives = Self::can_be_transformed_shapes(
            chain.shift(graph).map(Constant::shape),
            chain.scale(graph).map(Constant::shape),
            graph.output_shape(chain.output()),
            graph.output_shape(node),
        );
        if !survives {
            return reject(self.name(), graph, node, "channel layout is not kept");
        }
        true
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let node = m.root();
        if !self.can_be_transformed(ctx, node) {
            return Ok(false);
        }
        let rank = ctx.graph.output_rank(node);
        let output_type = preserved_output_type(&self.params, ctx.graph, node);
        move_dequantization_through(ctx.graph, node, output_type, |c| Self::relayout(c, rank))?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        true
    }
}
