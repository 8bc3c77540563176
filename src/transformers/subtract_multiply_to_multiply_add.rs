//! Subtract-multiply to multiply-add
//!
//! Rewrites a dequantization into the scale-shift form some backends expect:
//!
//! ```text
//! s * (x - z) == s * x + (-s * z)
//! ```
//!
//! Both constants come out per channel, `[1, C, 1, ...]`. A chain without a
//! zero point gets a zero bias. The multiply reads the tensor below the
//! convert, type-relaxed to the float output.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op, OpKind};
use crate::low_precision::layer_transformation::reject;
use crate::low_precision::network_helper::channel_constant;
use crate::low_precision::{FakeQuantizeDequantization, LayerTransformation, Params};
use crate::pattern::ops::binary_with_constant;
use crate::pattern::{MatchResult, Pattern};
use crate::transform::TransformationContext;

#[derive(Debug, Clone)]
pub struct SubtractMultiplyToMultiplyAddTransformation {
    params: Arc<Params>,
}

impl SubtractMultiplyToMultiplyAddTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    fn chain(&self, graph: &GraphContext, multiply: NodeId) -> Option<FakeQuantizeDequantization> {
        let chain = FakeQuantizeDequantization::from_output(graph, multiply);
        if chain.multiply != Some(multiply) {
            reject(self.name(), graph, multiply, "no dequantization scale");
            return None;
        }
        if chain.subtract.is_none() && chain.convert.is_none() && self.feeds_bias(graph, multiply) {
            reject(self.name(), graph, multiply, "already in multiply-add form");
            return None;
        }
        graph.output_channels(multiply)?;
        Some(chain)
    }

    fn feeds_bias(&self, graph: &GraphContext, multiply: NodeId) -> bool {
        match graph.get_consumers(multiply) {
            [add] => {
                graph.kind(*add) == Some(OpKind::Add)
                    && graph.get_input(*add, 0) == Some(multiply)
                    && graph.get_constant_input(*add, 1).is_some()
            }
            _ => false,
        }
    }
}

impl LayerTransformation for SubtractMultiplyToMultiplyAddTransformation {
    fn name(&self) -> &'static str {
        "SubtractMultiplyToMultiplyAddTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![binary_with_constant(OpKind::Multiply)]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        self.chain(ctx.graph, node).is_some()
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let multiply = m.root();
        let Some(chain) = self.chain(ctx.graph, multiply) else {
            return Ok(false);
        };
        let graph = &mut *ctx.graph;
        let node = graph.node(multiply)?;
        let float_type = node.element_type();
        let friendly_name = node.friendly_name.clone();
        let rank = node.shape().len();
        let channels = graph.output_channels(multiply).unwrap_or(1);

        let Some(scale) = chain.scale(graph) else {
            return Ok(false);
        };
        let scale = channel_constant(scale, rank, channels)?.convert(float_type);
        let bias = match chain.shift(graph) {
            Some(zero_point) => zero_point
                .zip_with(&scale, float_type, |z, s| -s * z)
                .and_then(|b| channel_constant(&b, rank, channels))?,
            None => scale.map(|_| 0.0),
        };

        let data = chain.data;
        let scale = graph.add_constant(scale);
        let scaled = if graph.output_type(data) == Some(float_type) {
            graph.add_node(Op::Multiply, &[data, scale])?
        } else {
            graph.add_relaxed_node(Op::Multiply, &[data, scale], Some(float_type))?
        };
        let bias = graph.add_constant(bias);
        let add = graph.add_node(Op::Add, &[scaled, bias])?;
        graph.set_friendly_name(add, friendly_name)?;
        graph.replace_node(multiply, add)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        false
    }
}
