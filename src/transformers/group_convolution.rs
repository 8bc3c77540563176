//! GroupConvolution transformation
//!
//! Same lowering as [`super::convolution`]. A depthwise convolution keeps
//! each input channel in its own group, so a per-channel data scale is
//! allowed there and spreads to the output channels of its group.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, OpKind};
use crate::low_precision::layer_transformation::{can_be_transformed_base, reject};
use crate::low_precision::{FakeQuantizeDequantization, LayerTransformation, Params};
use crate::pattern::{MatchResult, Pattern};
use crate::tensor::Constant;
use crate::transform::TransformationContext;

use super::weightable::{is_scalar_scale, lower_weightable, plan_weights, WeightsPlan};

#[derive(Debug, Clone)]
pub struct GroupConvolutionTransformation {
    params: Arc<Params>,
}

impl GroupConvolutionTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    /// Weights `[G, O/G, I/G, kh, kw]` with one input channel per group
    fn is_depthwise(graph: &GraphContext, node: NodeId) -> bool {
        graph
            .get_input(node, 1)
            .map_or(false, |w| graph.output_shape(w).get(2) == Some(&1))
    }

    fn plan(&self, graph: &GraphContext, node: NodeId) -> Option<WeightsPlan> {
        if !can_be_transformed_base(self.name(), &self.params, graph, node, 0) {
            return None;
        }
        let chain = FakeQuantizeDequantization::extract(graph, node, 0)?;
        if !is_scalar_scale(chain.scale(graph)) && !Self::is_depthwise(graph, node) {
            reject(self.name(), graph, node, "per-channel data scale across a group");
            return None;
        }
        plan_weights(self.name(), &self.params, graph, node)
    }

    /// Data scale per output channel
    fn spread(scale: &Constant, out_channels: usize) -> Vec<f32> {
        if scale.is_scalar_like() {
            return vec![scale.value_at(0)];
        }
        let per_group = (out_channels / scale.len().max(1)).max(1);
        (0..out_channels)
            .map(|o| scale.value_at(o / per_group))
            .collect()
    }
}

impl LayerTransformation for GroupConvolutionTransformation {
    fn name(&self) -> &'static str {
        "GroupConvolutionTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::GroupConvolution).with_inputs([
            Pattern::op(OpKind::Multiply),
            Pattern::op(OpKind::FakeQuantize),
        ])]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        self.plan(ctx.graph, node).is_some()
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let conv = m.root();
        let Some(plan) = self.plan(ctx.graph, conv) else {
            return Ok(false);
        };
        lower_weightable(&self.params, ctx.graph, conv, &plan, Self::spread)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        false
    }

    fn is_quantized(&self, graph: &GraphContext, node: NodeId) -> bool {
        plan_weights(self.name(), &self.params, graph, node).is_some()
    }
}
