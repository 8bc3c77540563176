//! AvgPool transformation
//!
//! Averaging is linear, so the scale moves after the pooling. The zero point
//! moves too unless padded cells take part in the average. The pooled output
//! is fractional, so the rebuilt pooling produces the float type.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op, OpKind};
use crate::low_precision::layer_transformation::{
    can_be_transformed_base, move_dequantization_through, reject,
};
use crate::low_precision::{FakeQuantizeDequantization, LayerTransformation, Params};
use crate::pattern::ops::unary_after_dequantization;
use crate::pattern::{MatchResult, Pattern};
use crate::transform::TransformationContext;

#[derive(Debug, Clone)]
pub struct AvgPoolTransformation {
    params: Arc<Params>,
}

impl AvgPoolTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    /// Padded zeros are averaged in and would scale the zero point
    fn counts_padding(graph: &GraphContext, node: NodeId) -> bool {
        match graph.get_node(node).map(|n| &n.op) {
            Some(Op::AvgPool(attrs)) => {
                !attrs.exclude_pad
                    && attrs.pads_begin.iter().chain(&attrs.pads_end).any(|&p| p > 0)
            }
            _ => false,
        }
    }
}

impl LayerTransformation for AvgPoolTransformation {
    fn name(&self) -> &'static str {
        "AvgPoolTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![unary_after_dequantization(OpKind::AvgPool)]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        let graph = &*ctx.graph;
        if !can_be_transformed_base(self.name(), &self.params, graph, node, 0) {
            return false;
        }
        let Some(chain) = FakeQuantizeDequantization::extract(graph, node, 0) else {
            return false;
        };
        if chain.subtract.is_some() && Self::counts_padding(graph, node) {
            return reject(self.name(), graph, node, "zero point with counted padding");
        }
        true
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let pool = m.root();
        if !self.can_be_transformed(ctx, pool) {
            return Ok(false);
        }
        let float_type = ctx.graph.node(pool)?.element_type();
        let output_type = self.params.update_precisions.then_some(float_type);
        move_dequantization_through(ctx.graph, pool, output_type, |c| Ok(c.clone()))?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        false
    }
}
