//! Concat transformation keeping one dequantization per input channel
//!
//! Each concat input keeps its own quantization interval. The scales and
//! shifts of the branches are laid out along the channel axis and applied as
//! one dequantization after the concat, so no branch is re-quantized.
//!
//! An input may reach its fake-quantize through precision-preserving
//! single-input operations that keep the channel layout; those are rebuilt
//! over the quantized values.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op, OpKind};
use crate::low_precision::layer_transformation::reject;
use crate::low_precision::network_helper::is_channel_constant_for;
use crate::low_precision::quantization_details::{
    get_data_precision, DataPrecision, QuantizationDetails,
};
use crate::low_precision::{LayerTransformation, Params};
use crate::pattern::{MatchResult, Pattern};
use crate::tensor::{channel_shape, normalize_axis, Constant};
use crate::transform::TransformationContext;

#[derive(Debug, Clone)]
struct Branch {
    fq: NodeId,
    /// Operations between the fake-quantize and the concat, nearest first
    path: Vec<NodeId>,
    details: QuantizationDetails,
    precision: DataPrecision,
    channels: usize,
}

#[derive(Debug, Clone)]
pub struct ConcatMultiChannelsTransformation {
    params: Arc<Params>,
}

impl ConcatMultiChannelsTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    /// Operation a branch may pass through on its way up to the fake-quantize
    fn is_transparent(ctx: &TransformationContext<'_>, node: NodeId, precision: &DataPrecision) -> bool {
        let graph = &*ctx.graph;
        let Some(n) = graph.get_node(node) else {
            return false;
        };
        let keeps_layout = n.inputs.len() == 1
            && graph.output_channels(node) == graph.output_channels(n.inputs[0])
            && graph.output_rank(node) == graph.output_rank(n.inputs[0]);
        let commutes = match n.kind() {
            OpKind::MaxPool => true,
            OpKind::Relu => !precision.has_zero_point,
            _ => false,
        };
        keeps_layout && commutes && ctx.is_precision_preserved(node) && graph.is_single_use(node)
    }

    fn branch(&self, ctx: &TransformationContext<'_>, concat: NodeId, index: usize) -> Option<Branch> {
        let graph = &*ctx.graph;
        let channels = graph.output_channels(graph.get_input(concat, index)?)?;
        let mut path = Vec::new();
        let mut current = graph.get_input(concat, index)?;
        while graph.kind(current)? != OpKind::FakeQuantize {
            path.push(current);
            current = graph.get_input(current, 0)?;
        }
        let fq = current;
        let details = QuantizationDetails::from_fake_quantize(graph, fq)?;
        let intervals = details.intervals_count();
        let fq_shape = graph.output_shape(fq);
        let lowerable = QuantizationDetails::is_supported_level(details.levels)
            && (intervals == 1 || intervals == channels)
            && (1..=4).all(|i| {
                graph
                    .get_constant_input(fq, i)
                    .map_or(false, |c| is_channel_constant_for(c, fq_shape))
            })
            && graph.is_single_use(fq)
            && graph.get_input(fq, 0).map_or(false, |d| !graph.is_constant(d))
            && graph.output_type(fq).map_or(false, |t| t.is_real());
        if !lowerable {
            return None;
        }
        let precision = get_data_precision(
            &details,
            &self.params.precisions_on_activations,
            self.params.support_asymmetric_quantization,
        )?;
        if !path.iter().all(|&n| Self::is_transparent(ctx, n, &precision)) {
            return None;
        }
        Some(Branch {
            fq,
            path,
            details,
            precision,
            channels,
        })
    }

    fn plan(&self, ctx: &TransformationContext<'_>, concat: NodeId) -> Option<Vec<Branch>> {
        let name = self.name();
        let graph = &*ctx.graph;
        let node = graph.get_node(concat)?;
        let Op::Concat { axis } = node.op else {
            return None;
        };
        if normalize_axis(axis, graph.output_rank(concat)).ok()? != 1 {
            reject(name, graph, concat, "not a channel concat");
            return None;
        }
        if self.params.update_precisions && !node.is_relaxed() {
            reject(name, graph, concat, "not type-relaxed");
            return None;
        }
        let branches = (0..node.inputs.len())
            .map(|i| self.branch(ctx, concat, i))
            .collect::<Option<Vec<_>>>();
        let Some(branches) = branches else {
            reject(name, graph, concat, "input does not come from a fake-quantize");
            return None;
        };
        let first = branches.first()?.precision.precision;
        if branches.iter().any(|b| b.precision.precision != first) {
            reject(name, graph, concat, "inputs need different precisions");
            return None;
        }
        Some(branches)
    }

    fn lower(&self, graph: &mut GraphContext, concat: NodeId, branches: &[Branch]) -> LptResult<NodeId> {
        let node = graph.node(concat)?;
        let op = node.op.clone();
        let relaxed = node.is_relaxed();
        let float_type = node.element_type();
        let friendly_name = node.friendly_name.clone();
        let rank = graph.output_rank(concat);
        let update = self.params.update_precisions;

        let mut inputs = Vec::with_capacity(branches.len());
        let mut scales = Vec::new();
        let mut shifts = Vec::new();
        for branch in branches {
            let precision = &branch.precision;
            let fq_node = graph.node(branch.fq)?;
            let fq_name = fq_node.friendly_name.clone();
            let fq_inputs = fq_node.inputs.clone();
            let low = graph.add_constant(Constant::scalar(float_type, precision.min));
            let high = graph.add_constant(Constant::scalar(float_type, precision.max));
            let mut last = graph.add_relaxed_node(
                Op::FakeQuantize {
                    levels: branch.details.levels,
                },
                &[fq_inputs[0], fq_inputs[1], fq_inputs[2], low, high],
                update.then_some(precision.precision),
            )?;
            graph.set_friendly_name(last, format!("{}_original", fq_name))?;
            for &intermediate in branch.path.iter().rev() {
                last = graph.clone_with_new_inputs(intermediate, &[last])?;
                if update && graph.node(last)?.is_relaxed() {
                    graph.set_output_type(last, precision.precision)?;
                }
            }
            inputs.push(last);

            for c in 0..branch.channels {
                let (scale, shift) = precision.scale_shift(&branch.details, c);
                scales.push(scale);
                shifts.push(shift);
            }
        }

        let lowered = if relaxed {
            graph.add_relaxed_node(op, &inputs, update.then_some(branches[0].precision.precision))?
        } else {
            graph.add_node(op, &inputs)?
        };
        graph.set_friendly_name(lowered, format!("{}_original", friendly_name))?;

        let shape = channel_shape(rank, scales.len());
        let mut last = lowered;
        if update {
            last = graph.add_node(Op::Convert { destination: float_type }, &[last])?;
        }
        if shifts.iter().any(|&s| s != 0.0) {
            let shift = graph.add_constant(Constant::from_vec(float_type, &shape, shifts)?);
            last = graph.add_node(Op::Subtract, &[last, shift])?;
        }
        let scale = graph.add_constant(Constant::from_vec(float_type, &shape, scales)?);
        last = graph.add_node(Op::Multiply, &[last, scale])?;
        graph.set_friendly_name(last, friendly_name)?;
        graph.replace_node(concat, last)?;
        Ok(last)
    }
}

impl LayerTransformation for ConcatMultiChannelsTransformation {
    fn name(&self) -> &'static str {
        "ConcatMultiChannelsTransformation"
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
        self.plan(ctx, node).is_some()
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let concat = m.root();
        let Some(branches) = self.plan(ctx, concat) else {
            return Ok(false);
        };
        self.lower(ctx.graph, concat, &branches)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{evaluate, PoolAttrs};
    use crate::low_precision::FakeQuantizeDequantization;
    use crate::pattern::PatternMatcher;
    use crate::tensor::ElementType;
    use ndarray::{ArrayD, IxDyn};

    fn add_fake_quantize(graph: &mut GraphContext, x: NodeId, low: f32, high: f32) -> NodeId {
        let ranges: Vec<NodeId> = [low, high, low, high]
            .iter()
            .map(|&v| graph.add_constant(Constant::scalar(ElementType::F32, v)))
            .collect();
        graph
            .add_relaxed_node(
                Op::FakeQuantize { levels: 256 },
                &[x, ranges[0], ranges[1], ranges[2], ranges[3]],
                None,
            )
            .unwrap()
    }

    fn make_concat_graph(second_low: f32, second_high: f32) -> (GraphContext, [NodeId; 2], NodeId) {
        let mut graph = GraphContext::new();
        let a = graph.add_parameter("a", ElementType::F32, vec![1, 2, 2, 2]);
        let b = graph.add_parameter("b", ElementType::F32, vec![1, 1, 2, 2]);
        let fq_a = add_fake_quantize(&mut graph, a, 0.0, 2.55);
        let fq_b = add_fake_quantize(&mut graph, b, second_low, second_high);
        let pool = graph
            .add_relaxed_node(Op::MaxPool(PoolAttrs::square(1)), &[fq_b], None)
            .unwrap();
        let concat = graph
            .add_relaxed_node(Op::Concat { axis: 1 }, &[fq_a, pool], None)
            .unwrap();
        graph.set_friendly_name(concat, "concat").unwrap();
        graph.add_result(concat).unwrap();
        (graph, [a, b], concat)
    }

    fn run(graph: &mut GraphContext, concat: NodeId) -> bool {
        let transformation = ConcatMultiChannelsTransformation::new(Arc::new(Params::default()));
        let pattern = transformation.patterns().remove(0);
        let m = PatternMatcher::new(graph).match_pattern(&pattern, concat).unwrap();
        transformation
            .transform(&mut TransformationContext::new(graph), &m)
            .unwrap()
    }

    #[test]
    fn test_scales_concatenated_per_channel() {
        let (mut graph, [a, b], concat) = make_concat_graph(0.0, 1.275);
        let feeds = [
            (a, ArrayD::from_shape_fn(IxDyn(&[1, 2, 2, 2]), |i| (i[1] * 4 + i[2] * 2 + i[3]) as f32 * 0.3)),
            (b, ArrayD::from_shape_fn(IxDyn(&[1, 1, 2, 2]), |i| (i[2] * 2 + i[3]) as f32 * 0.4)),
        ];
        let before = evaluate(&graph, &feeds).unwrap();
        assert!(run(&mut graph, concat));

        let result = graph.results()[0];
        let chain = FakeQuantizeDequantization::extract(&graph, result, 0).unwrap();
        assert!(chain.subtract.is_none());
        let scale = chain.scale(&graph).unwrap();
        assert_eq!(scale.shape(), &[1, 3, 1, 1]);
        for (value, expected) in scale.to_vec().into_iter().zip([0.01, 0.01, 0.005]) {
            assert!((value - expected).abs() < 1e-6);
        }
        assert_eq!(graph.output_type(chain.data), Some(ElementType::U8));
        let pool = graph.find_nodes_by_op(OpKind::MaxPool)[0];
        assert_eq!(graph.output_type(pool), Some(ElementType::U8));

        let after = evaluate(&graph, &feeds).unwrap();
        for (x, y) in before[0].iter().zip(after[0].iter()) {
            assert!((x - y).abs() < 1e-5, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_mismatched_precisions_are_rejected() {
        // [-1.28, 1.27] detects as i8 while the first branch is u8
        let (mut graph, _, concat) = make_concat_graph(-1.28, 1.27);
        assert!(!run(&mut graph, concat));
        assert_eq!(graph.find_nodes_by_op(OpKind::FakeQuantize).len(), 2);
    }
}
