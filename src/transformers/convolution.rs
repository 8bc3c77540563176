//! Convolution transformation
//!
//! The data scale must be per-tensor: a per-input-channel scale is summed
//! across channels by the convolution and cannot move past it. The weight
//! fake-quantize is decomposed and its per-output-channel scale joins the
//! data scale after the layer. See [`super::weightable`].

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, OpKind};
use crate::low_precision::layer_transformation::{can_be_transformed_base, reject};
use crate::low_precision::{FakeQuantizeDequantization, LayerTransformation, Params};
use crate::pattern::{MatchResult, Pattern};
use crate::transform::TransformationContext;

use super::weightable::{is_scalar_scale, lower_weightable, plan_weights, WeightsPlan};

#[derive(Debug, Clone)]
pub struct ConvolutionTransformation {
    params: Arc<Params>,
}

impl ConvolutionTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    fn plan(&self, graph: &GraphContext, node: NodeId) -> Option<WeightsPlan> {
        if !can_be_transformed_base(self.name(), &self.params, graph, node, 0) {
            return None;
        }
        let chain = FakeQuantizeDequantization::extract(graph, node, 0)?;
        if !is_scalar_scale(chain.scale(graph)) {
            reject(self.name(), graph, node, "per-channel data scale");
            return None;
        }
        plan_weights(self.name(), &self.params, graph, node)
    }
}

impl LayerTransformation for ConvolutionTransformation {
    fn name(&self) -> &'static str {
        "ConvolutionTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::Convolution).with_inputs([
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
        lower_weightable(&self.params, ctx.graph, conv, &plan, |scale, _| {
            vec![scale.value_at(0)]
        })?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        false
    }

    fn is_quantized(&self, graph: &GraphContext, node: NodeId) -> bool {
        plan_weights(self.name(), &self.params, graph, node).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FakeQuantizeOnData, GraphBuilder};
    use crate::graph::{evaluate, ConvolutionAttrs, Op};
    use crate::low_precision::LowPrecisionTransformer;
    use crate::pattern::PatternMatcher;
    use crate::tensor::{Constant, ElementType};
    use ndarray::{ArrayD, IxDyn};

    /// `x: u8[1,3,4,4] -> convert -> [subtract] -> multiply -> conv(w: fq(f32[2,3,1,1]))`
    fn make_conv_graph(
        data_scale: Constant,
        zero_point: Option<f32>,
    ) -> (GraphContext, NodeId, NodeId, NodeId) {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::U8, vec![1, 3, 4, 4]);
        let mut last = graph
            .add_node(Op::Convert { destination: ElementType::F32 }, &[x])
            .unwrap();
        if let Some(zp) = zero_point {
            let zp = graph.add_constant(Constant::scalar(ElementType::F32, zp));
            last = graph.add_node(Op::Subtract, &[last, zp]).unwrap();
        }
        let s = graph.add_constant(data_scale);
        let mul = graph.add_node(Op::Multiply, &[last, s]).unwrap();

        let weights = graph.add_constant(
            Constant::from_vec(
                ElementType::F32,
                &[2, 3, 1, 1],
                vec![0.5, -0.25, 1.0, -1.28, 0.03, 0.77],
            )
            .unwrap(),
        );
        let ranges: Vec<NodeId> = [-1.28, 1.27, -1.28, 1.27]
            .iter()
            .map(|&v| graph.add_constant(Constant::scalar(ElementType::F32, v)))
            .collect();
        let fq = graph
            .add_relaxed_node(
                Op::FakeQuantize { levels: 256 },
                &[weights, ranges[0], ranges[1], ranges[2], ranges[3]],
                None,
            )
            .unwrap();
        let conv = graph
            .add_relaxed_node(Op::Convolution(ConvolutionAttrs::default()), &[mul, fq], None)
            .unwrap();
        graph.set_friendly_name(conv, "convolution").unwrap();
        graph.add_result(conv).unwrap();
        (graph, x, conv, mul)
    }

    fn run(graph: &mut GraphContext, conv: NodeId, params: Params) -> bool {
        let transformation = ConvolutionTransformation::new(Arc::new(params));
        let pattern = transformation.patterns().remove(0);
        let m = PatternMatcher::new(graph).match_pattern(&pattern, conv).unwrap();
        transformation
            .transform(&mut TransformationContext::new(graph), &m)
            .unwrap()
    }

    fn input() -> ArrayD<f32> {
        ArrayD::from_shape_fn(IxDyn(&[1, 3, 4, 4]), |i| ((i[1] * 71 + i[2] * 23 + i[3] * 11) % 256) as f32)
    }

    #[test]
    fn test_scales_move_after_convolution() {
        let (mut graph, x, conv, _) = make_conv_graph(Constant::scalar(ElementType::F32, 0.1), None);
        let before = evaluate(&graph, &[(x, input())]).unwrap();
        assert!(run(&mut graph, conv, Params::default()));

        let result = graph.results()[0];
        let multiply = graph.get_input(result, 0).unwrap();
        assert_eq!(graph.kind(multiply), Some(OpKind::Multiply));
        assert_eq!(graph.node(multiply).unwrap().friendly_name, "convolution");
        let new_conv = graph.get_input(multiply, 0).unwrap();
        assert_eq!(graph.node(new_conv).unwrap().friendly_name, "convolution_original");
        assert_eq!(graph.get_input(new_conv, 0), Some(x));
        let weights = graph.get_input(new_conv, 1).unwrap();
        assert_eq!(graph.output_type(weights), Some(ElementType::I8));
        assert!(graph.is_constant(weights));
        let scale = graph.get_constant_input(multiply, 1).unwrap();
        assert!((scale.value_at(0) - 0.001).abs() < 1e-7);

        let after = evaluate(&graph, &[(x, input())]).unwrap();
        for (a, b) in before[0].iter().zip(after[0].iter()) {
            assert!((a - b).abs() <= 1e-3 * a.abs().max(1.0));
        }
    }

    #[test]
    fn test_zero_point_stays_on_data_path() {
        let (mut graph, x, conv, _) =
            make_conv_graph(Constant::scalar(ElementType::F32, 0.1), Some(128.0));
        let before = evaluate(&graph, &[(x, input())]).unwrap();
        assert!(run(&mut graph, conv, Params::default()));

        let new_conv = graph.find_nodes_by_op(OpKind::Convolution)[0];
        let data = graph.get_input(new_conv, 0).unwrap();
        assert_eq!(graph.kind(data), Some(OpKind::Subtract));
        assert_eq!(graph.get_constant_input(data, 1).unwrap().shape(), &[1, 3, 1, 1]);

        let after = evaluate(&graph, &[(x, input())]).unwrap();
        for (a, b) in before[0].iter().zip(after[0].iter()) {
            assert!((a - b).abs() <= 1e-3 * a.abs().max(1.0));
        }
    }

    #[test]
    fn test_shared_dequantization_is_cloned() {
        let (mut graph, x, conv, mul) = make_conv_graph(Constant::scalar(ElementType::F32, 0.1), None);
        let sibling = graph.add_node(Op::Relu, &[mul]).unwrap();
        graph.add_result(sibling).unwrap();
        assert!(run(&mut graph, conv, Params::default()));

        assert!(graph.has_node(mul));
        assert_eq!(graph.get_input(sibling, 0), Some(mul));
        assert_eq!(graph.get_constant_input(mul, 1).unwrap().scalar_value(), Some(0.1));
        let new_conv = graph.find_nodes_by_op(OpKind::Convolution)[0];
        assert_eq!(graph.get_input(new_conv, 0), Some(x));
    }

    #[test]
    fn test_rejects_per_channel_data_scale() {
        let scale = Constant::from_vec(ElementType::F32, &[1, 3, 1, 1], vec![0.1, 0.2, 0.3]).unwrap();
        let (mut graph, _, conv, _) = make_conv_graph(scale, None);
        assert!(!run(&mut graph, conv, Params::default()));
        assert!(graph.has_node(conv));
    }

    /// `x: f32[1,3,4,4] -> fq(0, 2.55) -> conv(w: fq(weights, ranges))`
    fn make_float_conv_graph(
        weights: Constant,
        range_shape: &[usize],
        low: Vec<f32>,
        high: Vec<f32>,
    ) -> (GraphContext, NodeId) {
        let mut builder = GraphBuilder::new();
        let x = builder.parameter("x", ElementType::F32, vec![1, 3, 4, 4]);
        let data = builder
            .fake_quantize(x, &FakeQuantizeOnData::new(256, 0.0, 2.55))
            .unwrap();
        let w = builder.constant(weights);
        let w = builder
            .fake_quantize(w, &FakeQuantizeOnData::per_channel(256, range_shape, low, high))
            .unwrap();
        let conv = builder
            .node(Op::Convolution(ConvolutionAttrs::default()), &[data, w])
            .unwrap();
        builder.result(conv).unwrap();
        (builder.build().unwrap(), x)
    }

    fn float_input() -> ArrayD<f32> {
        input().mapv(|v| v * 0.01)
    }

    #[test]
    fn test_per_output_channel_weights_through_pipeline() {
        let weights = Constant::from_vec(
            ElementType::F32,
            &[2, 3, 1, 1],
            vec![0.5, -0.25, 1.0, -0.3, 0.03, 0.6],
        )
        .unwrap();
        let (mut graph, x) =
            make_float_conv_graph(weights, &[2, 1, 1, 1], vec![-1.28, -0.64], vec![1.27, 0.635]);
        let before = evaluate(&graph, &[(x, float_input())]).unwrap();
        LowPrecisionTransformer::default().run(&mut graph).unwrap();

        let conv = graph.find_nodes_by_op(OpKind::Convolution)[0];
        let weights = graph.get_input(conv, 1).unwrap();
        assert!(graph.is_constant(weights));
        assert_eq!(graph.output_type(weights), Some(ElementType::I8));
        let multiply = graph.get_consumers(conv)[0];
        assert_eq!(graph.kind(multiply), Some(OpKind::Multiply));
        let scale = graph.get_constant_input(multiply, 1).unwrap().to_vec();
        assert_eq!(scale.len(), 2);
        assert!((scale[0] - 0.0001).abs() < 1e-8);
        assert!((scale[1] - 0.00005).abs() < 1e-8);

        let after = evaluate(&graph, &[(x, float_input())]).unwrap();
        for (a, b) in before[0].iter().zip(after[0].iter()) {
            assert!((a - b).abs() <= 1e-3 * a.abs().max(1.0), "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_per_input_channel_weights_stay_float() {
        let weights = Constant::from_vec(
            ElementType::F32,
            &[3, 3, 1, 1],
            vec![0.5, -0.25, 0.01, -1.0, 0.3, -0.02, 1.2, 0.6, 0.03],
        )
        .unwrap();
        let (mut graph, x) = make_float_conv_graph(
            weights,
            &[1, 3, 1, 1],
            vec![-1.28, -0.64, -0.032],
            vec![1.27, 0.635, 0.03175],
        );
        let before = evaluate(&graph, &[(x, float_input())]).unwrap();
        LowPrecisionTransformer::default().run(&mut graph).unwrap();

        let conv = graph.find_nodes_by_op(OpKind::Convolution)[0];
        let weights = graph.get_input(conv, 1).unwrap();
        assert_eq!(graph.kind(weights), Some(OpKind::FakeQuantize));
        assert_eq!(graph.output_type(weights), Some(ElementType::F32));

        let after = evaluate(&graph, &[(x, float_input())]).unwrap();
        for (a, b) in before[0].iter().zip(after[0].iter()) {
            assert!((a - b).abs() <= 1e-3 * a.abs().max(1.0), "{} vs {}", a, b);
        }
    }
}
