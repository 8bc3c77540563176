//! Shared lowering for layers with quantized weights
//!
//! Convolution and group convolution follow the same recipe: the data
//! dequantization and the decomposed weight dequantization are both pulled
//! out of the layer and recombined as one per-output-channel multiply after
//! it.
//!
//! ```text
//! conv(s_d * (x - z_d), s_w * (q - z_w)) == conv(x - z_d, q - z_w) * (s_d * s_w)
//! ```
//!
//! Zero points stay on their paths. A convert that would feed the layer
//! directly is folded away so the layer reads the integer tensor.

#![allow(missing_docs)]

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op, OpKind};
use crate::low_precision::layer_transformation::reject;
use crate::low_precision::network_helper::{
    aligned_shape, decompose_weights, exclusive_dequantization, normalize_zero_point_shape,
};
use crate::low_precision::quantization_details::{
    get_data_precision, DataPrecision, QuantizationDetails,
};
use crate::low_precision::Params;
use crate::tensor::{Constant, ElementType};

/// Weight fake-quantize of a layer together with its lowering decision
#[derive(Debug, Clone)]
pub(crate) struct WeightsPlan {
    pub fq: NodeId,
    pub details: QuantizationDetails,
    pub precision: DataPrecision,
}

/// Check that every weight range only varies along the output-channel axes
///
/// Those are the leading axis of convolution weights and the leading two of
/// grouped weights. Matrix weights must use per-tensor ranges.
fn ranges_follow_output_channels(graph: &GraphContext, node: NodeId, fq: NodeId) -> bool {
    let channel_axes = match graph.kind(node) {
        Some(OpKind::Convolution) => 1,
        Some(OpKind::GroupConvolution) => 2,
        _ => 0,
    };
    let rank = graph.output_rank(fq);
    (1..5).all(|index| match graph.get_constant_input(fq, index) {
        Some(range) if range.is_scalar_like() => true,
        Some(range) => {
            range.shape().len() <= rank
                && aligned_shape(range.shape(), rank)
                    .iter()
                    .skip(channel_axes)
                    .all(|&dim| dim == 1)
        }
        None => false,
    })
}

/// Check the weight input (index 1) of a weighted layer
pub(crate) fn plan_weights(
    transformation: &str,
    params: &Params,
    graph: &GraphContext,
    node: NodeId,
) -> Option<WeightsPlan> {
    let fq = graph.get_input(node, 1)?;
    let Some(details) = QuantizationDetails::from_fake_quantize(graph, fq) else {
        reject(transformation, graph, node, "weight ranges are not constant");
        return None;
    };
    if !QuantizationDetails::is_supported_level(details.levels) {
        reject(transformation, graph, node, "unsupported weight levels");
        return None;
    }
    if !graph.get_input(fq, 0).map_or(false, |w| graph.is_constant(w)) {
        reject(transformation, graph, node, "weights are not constant");
        return None;
    }
    if !graph.is_single_use(fq) {
        reject(transformation, graph, node, "weights are shared");
        return None;
    }
    if !ranges_follow_output_channels(graph, node, fq) {
        reject(transformation, graph, node, "weight ranges vary outside output channels");
        return None;
    }
    let out_channels = graph.output_channels(node)?;
    let intervals = details.intervals_count();
    if intervals != 1 && intervals != out_channels {
        reject(transformation, graph, node, "weight intervals are not per output channel");
        return None;
    }
    let Some(precision) = get_data_precision(
        &details,
        &params.precisions_on_weights,
        params.support_asymmetric_quantization,
    ) else {
        reject(transformation, graph, node, "no weight precision");
        return None;
    };
    Some(WeightsPlan {
        fq,
        details,
        precision,
    })
}

/// Lower a weighted layer whose eligibility was checked
///
/// `data_scale` receives the data scale and the output channel count and
/// returns either one value or one value per output channel.
pub(crate) fn lower_weightable(
    params: &Params,
    graph: &mut GraphContext,
    node: NodeId,
    plan: &WeightsPlan,
    data_scale: impl Fn(&Constant, usize) -> Vec<f32>,
) -> LptResult<NodeId> {
    let layer = graph.node(node)?;
    let op = layer.op.clone();
    let relaxed = layer.is_relaxed();
    let float_type = layer.element_type();
    let friendly_name = layer.friendly_name.clone();
    let rank = layer.shape().len();
    let out_channels = layer.shape().get(1).copied().unwrap_or(1);
    let in_channels = graph
        .get_input(node, 0)
        .and_then(|data| graph.output_channels(data))
        .unwrap_or(1);

    let mut chain = exclusive_dequantization(graph, node, 0)?;
    normalize_zero_point_shape(graph, &mut chain, rank, in_channels)?;
    let data_input = chain.subtract.unwrap_or(chain.data);
    let data_scale = match chain.scale(graph) {
        Some(scale) => data_scale(scale, out_channels),
        None => vec![1.0],
    };

    let weights = decompose_weights(
        graph,
        plan.fq,
        &plan.details,
        &plan.precision,
        params.update_precisions,
        params.weights_to_const,
    )?;
    let weight_chain = weights.dequantization;
    let weight_input = weight_chain.subtract.unwrap_or(weight_chain.data);
    let weight_scale = weight_chain
        .scale(graph)
        .map(Constant::to_vec)
        .unwrap_or_else(|| vec![1.0]);

    let combined = combine_scales(&data_scale, &weight_scale, out_channels, float_type)?;

    let inputs = [data_input, weight_input];
    let lowered = if relaxed {
        graph.add_relaxed_node(op, &inputs, params.update_precisions.then_some(float_type))?
    } else {
        graph.add_node(op, &inputs)?
    };
    graph.set_friendly_name(lowered, format!("{}_original", friendly_name))?;
    let scale = graph.add_constant(combined);
    let multiply = graph.add_node(Op::Multiply, &[lowered, scale])?;
    graph.set_friendly_name(multiply, friendly_name)?;
    graph.replace_node(node, multiply)?;
    Ok(multiply)
}

/// Product of data and weight scales laid out for the layer output
///
/// Per-output-channel scales take the `[O, 1, 1]` shape, which broadcasts
/// along axis 1 of the `[N, O, H, W]` output.
fn combine_scales(
    data: &[f32],
    weights: &[f32],
    out_channels: usize,
    float_type: ElementType,
) -> LptResult<Constant> {
    let at = |values: &[f32], i: usize| if values.len() == 1 { values[0] } else { values[i] };
    if data.len() <= 1 && weights.len() <= 1 {
        return Ok(Constant::scalar(float_type, at(data, 0) * at(weights, 0)));
    }
    let values = (0..out_channels)
        .map(|o| at(data, o) * at(weights, o))
        .collect::<Vec<_>>();
    Constant::from_vec(float_type, &[out_channels, 1, 1], values)
}

/// Check that a data scale holds one value
pub(crate) fn is_scalar_scale(scale: Option<&Constant>) -> bool {
    scale.map_or(true, Constant::is_scalar_like)
}
