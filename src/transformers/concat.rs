//! Concat transformation
//!
//! Every input of the concatenation comes straight from a per-tensor
//! fake-quantize. The inputs are re-quantized onto the union of their output
//! intervals so one integer tensor and one dequantization after the concat
//! describe all of them.
//!
//! For an input interval `[ol, oh]` inside the union `[U_low, U_high]` with
//! union scale `s`, the quantized interval becomes
//!
//! ```text
//! ol' = (ol - U_low) / s + min
//! oh' = (oh - U_low) / s + min
//! ```
//!
//! With [`QuantizedTensorAlignment::UpdateLevel`] the levels are recomputed
//! as `round(oh') - round(ol') + 1` so the step stays one integer unit. With
//! [`QuantizedTensorAlignment::None`] the levels are kept and the concat is
//! only lowered when the bounds and the step already are integral.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op, OpKind};
use crate::low_precision::layer_transformation::reject;
use crate::low_precision::params::QuantizedTensorAlignment;
use crate::low_precision::quantization_details::{
    get_data_precision, DataPrecision, QuantizationDetails,
};
use crate::low_precision::{LayerTransformation, Params};
use crate::pattern::{MatchResult, Pattern};
use crate::tensor::Constant;
use crate::transform::TransformationContext;

const INTEGRAL_TOLERANCE: f32 = 1e-4;

/// Re-quantized interval of one concat input
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct AlignedInterval {
    pub levels: usize,
    pub output_low: f32,
    pub output_high: f32,
}

#[derive(Debug, Clone)]
struct ConcatPlan {
    parents: Vec<(NodeId, QuantizationDetails)>,
    intervals: Vec<AlignedInterval>,
    union: QuantizationDetails,
    precision: DataPrecision,
}

#[derive(Debug, Clone)]
pub struct ConcatTransformation {
    params: Arc<Params>,
}

/// Per-tensor fake-quantize parent of `node` on input `index`
pub(crate) fn fake_quantize_parent(
    graph: &GraphContext,
    node: NodeId,
    index: usize,
) -> Option<(NodeId, QuantizationDetails)> {
    let fq = graph.get_input(node, index)?;
    let details = QuantizationDetails::from_fake_quantize(graph, fq)?;
    let lowerable = QuantizationDetails::is_supported_level(details.levels)
        && details.intervals_count() == 1
        && graph.is_single_use(fq)
        && graph.get_input(fq, 0).map_or(false, |d| !graph.is_constant(d))
        && graph.output_type(fq).map_or(false, |t| t.is_real());
    lowerable.then_some((fq, details))
}

/// Details of the interval covering every parent
pub(crate) fn union_details(parents: &[(NodeId, QuantizationDetails)]) -> Option<QuantizationDetails> {
    let (_, first) = parents.first()?;
    let low = parents
        .iter()
        .map(|(_, d)| d.min_output_low())
        .fold(f32::INFINITY, f32::min);
    let high = parents
        .iter()
        .map(|(_, d)| d.max_output_high())
        .fold(f32::NEG_INFINITY, f32::max);
    Some(QuantizationDetails {
        levels: first.levels,
        input_low: vec![low],
        input_high: vec![high],
        output_low: vec![low],
        output_high: vec![high],
    })
}

fn is_integral(value: f32) -> bool {
    (value - value.round()).abs() < INTEGRAL_TOLERANCE
}

impl ConcatTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    /// Interval of `details` re-quantized onto the union
    pub(crate) fn align(
        details: &QuantizationDetails,
        union: &QuantizationDetails,
        precision: &DataPrecision,
        alignment: QuantizedTensorAlignment,
    ) -> Option<AlignedInterval> {
        let (scale, _) = precision.scale_shift(union, 0);
        let union_low = union.output_low_value(0);
        let low = (details.output_low_value(0) - union_low) / scale + precision.min;
        let high = (details.output_high_value(0) - union_low) / scale + precision.min;
        match alignment {
            QuantizedTensorAlignment::UpdateLevel => {
                let (low, high) = (low.round(), high.round());
                Some(AlignedInterval {
                    levels: (high - low).abs() as usize + 1,
                    output_low: low,
                    output_high: high,
                })
            }
            QuantizedTensorAlignment::None => {
                let step = (high - low) / (details.levels - 1) as f32;
                (is_integral(low) && is_integral(step)).then_some(AlignedInterval {
                    levels: details.levels,
                    output_low: low.round(),
                    output_high: high.round(),
                })
            }
        }
    }

    fn plan(&self, graph: &GraphContext, concat: NodeId) -> Option<ConcatPlan> {
        let name = self.name();
        let node = graph.get_node(concat)?;
        if self.params.update_precisions && !node.is_relaxed() {
            reject(name, graph, concat, "not type-relaxed");
            return None;
        }
        let parents = (0..node.inputs.len())
            .map(|i| fake_quantize_parent(graph, concat, i))
            .collect::<Option<Vec<_>>>();
        let Some(parents) = parents else {
            reject(name, graph, concat, "input is not a per-tensor fake-quantize");
            return None;
        };
        let union = union_details(&parents)?;
        let Some(precision) = get_data_precision(
            &union,
            &self.params.precisions_on_activations,
            self.params.support_asymmetric_quantization,
        ) else {
            reject(name, graph, concat, "no precision for the union interval");
            return None;
        };
        let alignment = self.params.quantized_tensor_alignment_on_activations;
        let intervals = parents
            .iter()
            .map(|(_, details)| Self::align(details, &union, &precision, alignment))
            .collect::<Option<Vec<_>>>();
        let Some(intervals) = intervals else {
            reject(name, graph, concat, "intervals do not align");
            return None;
        };
        Some(ConcatPlan {
            parents,
            intervals,
            union,
            precision,
        })
    }

    fn lower(&self, graph: &mut GraphContext, concat: NodeId, plan: &ConcatPlan) -> LptResult<NodeId> {
        let node = graph.node(concat)?;
        let op = node.op.clone();
        let relaxed = node.is_relaxed();
        let float_type = node.element_type();
        let friendly_name = node.friendly_name.clone();
        let update = self.params.update_precisions;
        let quantized_type = update.then_some(plan.precision.precision);

        let mut inputs = Vec::with_capacity(plan.parents.len());
        for ((fq, _), interval) in plan.parents.iter().zip(&plan.intervals) {
            let fq_node = graph.node(*fq)?;
            let fq_name = fq_node.friendly_name.clone();
            let fq_inputs = fq_node.inputs.clone();
            let low = graph.add_constant(Constant::scalar(float_type, interval.output_low));
            let high = graph.add_constant(Constant::scalar(float_type, interval.output_high));
            let requantized = graph.add_relaxed_node(
                Op::FakeQuantize {
                    levels: interval.levels,
                },
                &[fq_inputs[0], fq_inputs[1], fq_inputs[2], low, high],
                quantized_type,
            )?;
            graph.set_friendly_name(requantized, fq_name)?;
            inputs.push(requantized);
        }

        let lowered = if relaxed {
            graph.add_relaxed_node(op, &inputs, quantized_type)?
        } else {
            graph.add_node(op, &inputs)?
        };
        graph.set_friendly_name(lowered, format!("{}_original", friendly_name))?;

        let (scale, shift) = plan.precision.scale_shift(&plan.union, 0);
        let mut last = lowered;
        if update {
            last = graph.add_node(Op::Convert { destination: float_type }, &[last])?;
        }
        if shift != 0.0 {
            let shift = graph.add_constant(Constant::scalar(float_type, shift));
            last = graph.add_node(Op::Subtract, &[last, shift])?;
        }
        let scale = graph.add_constant(Constant::scalar(float_type, scale));
        last = graph.add_node(Op::Multiply, &[last, scale])?;
        graph.set_friendly_name(last, friendly_name)?;
        graph.replace_node(concat, last)?;
        Ok(last)
    }
}

impl LayerTransformation for ConcatTransformation {
    fn name(&self) -> &'static str {
        "ConcatTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::Concat)]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        self.plan(ctx.graph, node).is_some()
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let concat = m.root();
        let Some(plan) = self.plan(ctx.graph, concat) else {
            return Ok(false);
        };
        self.lower(ctx.graph, concat, &plan)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        true
    }
}
