//! Fake-quantize decomposition
//!
//! Splits an activation fake-quantize into a quantizing fake-quantize that
//! produces integer values and the dequantization that restores the original
//! interval.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId};
use crate::low_precision::layer_transformation::reject;
use crate::low_precision::network_helper::decompose_fake_quantize;
use crate::low_precision::quantization_details::{
    get_data_precision, DataPrecision, QuantizationDetails,
};
use crate::low_precision::{LayerTransformation, Params};
use crate::pattern::ops::fake_quantize_with_constant_ranges;
use crate::pattern::{MatchResult, Pattern};
use crate::transform::TransformationContext;

/// Decompose activation fake-quantizes
#[derive(Debug, Clone)]
pub struct FakeQuantizeTransformation {
    params: Arc<Params>,
}

impl FakeQuantizeTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    /// Details and precision when `fq` is eligible
    fn plan(&self, graph: &GraphContext, fq: NodeId) -> Option<(QuantizationDetails, DataPrecision)> {
        let name = self.name();
        let Some(details) = QuantizationDetails::from_fake_quantize(graph, fq) else {
            reject(name, graph, fq, "ranges are not constant");
            return None;
        };
        if !QuantizationDetails::is_supported_level(details.levels) {
            reject(name, graph, fq, "unsupported levels");
            return None;
        }
        let data = graph.get_input(fq, 0)?;
        if graph.is_constant(data) {
            reject(name, graph, fq, "weights are decomposed by their consumer");
            return None;
        }
        if graph.output_type(fq).map_or(true, |t| t.is_integral()) {
            reject(name, graph, fq, "already quantized");
            return None;
        }
        if !self.params.quantize_outputs && graph.feeds_only_results(fq) {
            reject(name, graph, fq, "feeds only graph outputs");
            return None;
        }
        let Some(precision) = get_data_precision(
            &details,
            &self.params.precisions_on_activations,
            self.params.support_asymmetric_quantization,
        ) else {
            reject(name, graph, fq, "no data precision");
            return None;
        };
        if !precision.has_zero_point && details.outputs_are(precision.min, precision.max) {
            reject(name, graph, fq, "output interval is already quantized");
            return None;
        }
        Some((details, precision))
    }
}

impl LayerTransformation for FakeQuantizeTransformation {
    fn name(&self) -> &'static str {
        "FakeQuantizeTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![fake_quantize_with_constant_ranges()]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        self.plan(ctx.graph, node).is_some()
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let fq = m.root();
        let Some((details, precision)) = self.plan(ctx.graph, fq) else {
            return Ok(false);
        };
        decompose_fake_quantize(
            ctx.graph,
            fq,
            &details,
            &precision,
            self.params.update_precisions,
        )?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Op, OpKind};
    use crate::low_precision::FakeQuantizeDequantization;
    use crate::pattern::PatternMatcher;
    use crate::tensor::{Constant, ElementType};

    fn make_fq_graph(low: f32, high: f32, float_type: ElementType) -> (GraphContext, NodeId) {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", float_type, vec![1, 3, 4, 4]);
        let ranges: Vec<NodeId> = [low, high, low, high]
            .iter()
            .map(|&v| graph.add_constant(Constant::scalar(float_type, v)))
            .collect();
        let fq = graph
            .add_relaxed_node(
                Op::FakeQuantize { levels: 256 },
                &[x, ranges[0], ranges[1], ranges[2], ranges[3]],
                Some(float_type),
            )
            .unwrap();
        graph.set_friendly_name(fq, "fakeQuantize").unwrap();
        let relu = graph.add_node(Op::Relu, &[fq]).unwrap();
        graph.add_result(relu).unwrap();
        (graph, fq)
    }

    fn run(graph: &mut GraphContext, fq: NodeId, params: Params) -> bool {
        let transformation = FakeQuantizeTransformation::new(Arc::new(params));
        let pattern = transformation.patterns().remove(0);
        let m = PatternMatcher::new(graph).match_pattern(&pattern, fq).unwrap();
        let mut ctx = TransformationContext::new(graph);
        transformation.transform(&mut ctx, &m).unwrap()
    }

    fn output_chain(graph: &GraphContext) -> FakeQuantizeDequantization {
        let relu = graph.find_nodes_by_op(OpKind::Relu)[0];
        FakeQuantizeDequantization::extract(graph, relu, 0).unwrap()
    }

    #[test]
    fn test_u8_interval() {
        let (mut graph, fq) = make_fq_graph(0.0, 2.55, ElementType::F32);
        assert!(run(&mut graph, fq, Params::default()));

        let chain = output_chain(&graph);
        assert!(chain.subtract.is_none());
        let scale = chain.scale(&graph).unwrap().scalar_value().unwrap();
        assert!((scale - 0.01).abs() < 1e-6);
        let quantized = chain.data;
        assert_eq!(graph.output_type(quantized), Some(ElementType::U8));
        assert_eq!(graph.get_constant_input(quantized, 3).unwrap().scalar_value(), Some(0.0));
        assert_eq!(graph.get_constant_input(quantized, 4).unwrap().scalar_value(), Some(255.0));
        let multiply = graph.node(chain.multiply.unwrap()).unwrap();
        assert_eq!(multiply.friendly_name, "fakeQuantize");
    }

    #[test]
    fn test_asymmetric_u8_interval() {
        let (mut graph, fq) = make_fq_graph(-1.23, 2.55, ElementType::F32);
        assert!(run(&mut graph, fq, Params::u8_i8()));
        let chain = output_chain(&graph);
        let shift = chain.shift(&graph).unwrap().scalar_value().unwrap();
        let scale = chain.scale(&graph).unwrap().scalar_value().unwrap();
        assert!((shift - 82.97619).abs() < 1e-3);
        assert!((scale - 0.014823529).abs() < 1e-6);
    }

    #[test]
    fn test_asymmetric_f16_interval() {
        let (mut graph, fq) = make_fq_graph(-1.23, 2.55, ElementType::F16);
        assert!(run(&mut graph, fq, Params::u8_i8()));
        let chain = output_chain(&graph);
        assert_eq!(chain.shift(&graph).unwrap().scalar_value(), Some(83.0));
        assert_eq!(
            graph.output_type(chain.multiply.unwrap()),
            Some(ElementType::F16)
        );
    }

    #[test]
    fn test_i8_interval() {
        let (mut graph, fq) = make_fq_graph(-1.28, 1.27, ElementType::F32);
        assert!(run(&mut graph, fq, Params::i8_i8()));
        let chain = output_chain(&graph);
        assert!(chain.subtract.is_none());
        assert_eq!(graph.output_type(chain.data), Some(ElementType::I8));
        assert_eq!(graph.get_constant_input(chain.data, 3).unwrap().scalar_value(), Some(-128.0));
    }

    #[test]
    fn test_without_precision_update() {
        let (mut graph, fq) = make_fq_graph(0.0, 2.55, ElementType::F32);
        assert!(run(&mut graph, fq, Params::default().with_update_precisions(false)));
        let chain = output_chain(&graph);
        assert!(chain.convert.is_none());
        assert_eq!(graph.output_type(chain.data), Some(ElementType::F32));
    }

    #[test]
    fn test_rejections() {
        let (mut graph, fq) = make_fq_graph(-1.23, 2.55, ElementType::F32);
        let params = Params::default().with_support_asymmetric_quantization(false);
        assert!(!run(&mut graph, fq, params));
        assert_eq!(graph.find_nodes_by_op(OpKind::FakeQuantize), vec![fq]);

        let (mut graph, fq) = make_fq_graph(0.0, 255.0, ElementType::F32);
        assert!(!run(&mut graph, fq, Params::default()));
    }

    #[test]
    fn test_output_quantization_flag() {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::F32, vec![1, 3]);
        let ranges: Vec<NodeId> = [0.0, 2.55, 0.0, 2.55]
            .iter()
            .map(|&v| graph.add_constant(Constant::scalar(ElementType::F32, v)))
            .collect();
        let fq = graph
            .add_relaxed_node(
                Op::FakeQuantize { levels: 256 },
                &[x, ranges[0], ranges[1], ranges[2], ranges[3]],
                None,
            )
            .unwrap();
        graph.add_result(fq).unwrap();
        let mut copy = graph.clone();

        assert!(!run(&mut graph, fq, Params::default().with_quantize_outputs(false)));
        assert!(run(&mut copy, fq, Params::default()));
    }
}
