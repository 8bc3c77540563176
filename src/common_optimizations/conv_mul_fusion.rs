//! Multiply folded into convolution weights
//!
//! `conv(x, W) * s == conv(x, W * s)` when `s` holds one value per output
//! channel. Only float convolutions over constant weights are fused;
//! quantized weights stay behind their fake-quantize.

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, OpKind};
use crate::low_precision::network_helper::is_channel_constant_for;
use crate::pattern::{MatchResult, Pattern};
use crate::tensor::Constant;
use crate::transform::{RewriteRule, TransformationContext};

use super::MatcherPass;

/// Fuse a per-output-channel Multiply into Convolution weights
#[derive(Debug, Default, Clone, Copy)]
pub struct ConvolutionMultiplyFusion;

/// Fuse a per-output-channel Multiply into GroupConvolution weights
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupConvolutionMultiplyFusion;

/// Convolution under `multiply` and the multiplier laid out over its weights
fn fusion(graph: &GraphContext, multiply: NodeId, kind: OpKind) -> Option<(NodeId, Constant)> {
    let (conv, multiplier) = graph.split_constant_operand(multiply)?;
    let node = graph.get_node(conv)?;
    if node.kind() != kind || node.is_relaxed() || !graph.is_single_use(conv) {
        return None;
    }
    let weights = graph.get_constant_input(conv, 1)?;
    let multiplier = graph.get_constant(multiplier)?;
    let out_shape = graph.output_shape(conv);
    if !weights.element_type().is_real()
        || graph.output_shape(multiply) != out_shape
        || !is_channel_constant_for(multiplier, out_shape)
    {
        return None;
    }

    let out_channels = graph.output_channels(conv)?;
    // weights are [O, I, kh, kw] or [G, O/G, I/G, kh, kw]
    let mut layout = vec![1; weights.shape().len()];
    match kind {
        OpKind::GroupConvolution => {
            layout[0] = *weights.shape().first()?;
            layout[1] = *weights.shape().get(1)?;
        }
        _ => layout[0] = out_channels,
    }
    let laid_out = if multiplier.is_scalar_like() {
        Constant::scalar(weights.element_type(), multiplier.value_at(0))
    } else {
        multiplier.reshape(&layout).ok()?
    };
    Some((conv, laid_out))
}

fn fuse(ctx: &mut TransformationContext<'_>, multiply: NodeId, kind: OpKind) -> LptResult<bool> {
    let graph = &mut *ctx.graph;
    let Some((conv, multiplier)) = fusion(graph, multiply, kind) else {
        return Ok(false);
    };
    let node = graph.node(conv)?;
    let (x, w) = (node.inputs[0], node.inputs[1]);
    let friendly_name = graph.node(multiply)?.friendly_name.clone();
    let weights = graph
        .get_constant(w)
        .map(|c| c.zip_with(&multiplier, c.element_type(), |a, b| a * b))
        .transpose()?;
    let Some(weights) = weights else {
        return Ok(false);
    };
    let weights = graph.add_constant(weights);
    let fused = graph.clone_with_new_inputs(conv, &[x, weights])?;
    graph.set_friendly_name(fused, friendly_name)?;
    graph.replace_node(multiply, fused)?;
    Ok(true)
}

impl MatcherPass for ConvolutionMultiplyFusion {
    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::Multiply)
            .with_predicate(|graph, id| fusion(graph, id, OpKind::Convolution).is_some())]
    }
}

impl RewriteRule for ConvolutionMultiplyFusion {
    fn name(&self) -> &str {
        "ConvolutionMultiplyFusion"
    }

    fn apply(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        fuse(ctx, m.root(), OpKind::Convolution)
    }
}

impl MatcherPass for GroupConvolutionMultiplyFusion {
    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::Multiply)
            .with_predicate(|graph, id| fusion(graph, id, OpKind::GroupConvolution).is_some())]
    }
}

impl RewriteRule for GroupConvolutionMultiplyFusion {
    fn name(&self) -> &str {
        "GroupConvolutionMultiplyFusion"
    }

    fn apply(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        fuse(ctx, m.root(), OpKind::GroupConvolution)
    }
}
