//! Relu transformation
//!
//! `relu(s * x) == s * relu(x)` for `s > 0`, so a zero-point-free
//! dequantization with positive scales moves after the activation.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, OpKind};
use crate::low_precision::layer_transformation::{
    can_be_transformed_base, has_positive_scale, has_zero_shift, move_dequantization_through,
    preserved_output_type, reject,
};
use crate::low_precision::{FakeQuantizeDequantization, LayerTransformation, Params};
use crate::pattern::ops::unary_after_dequantization;
use crate::pattern::{MatchResult, Pattern};
use crate::transform::TransformationContext;

#[derive(Debug, Clone)]
pub struct ReluTransformation {
    params: Arc<Params>,
}

impl ReluTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }
}

impl LayerTransformation for ReluTransformation {
    fn name(&self) -> &'static str {
        "ReluTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![unary_after_dequantization(OpKind::Relu)]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        let graph = &*ctx.graph;
        if !can_be_transformed_base(self.name(), &self.params, graph, node, 0) {
            return false;
        }
        let Some(chain) = FakeQuantizeDequantization::extract(graph, node, 0) else {
            return false;
        };
        if !has_zero_shift(graph, &chain) {
            return reject(self.name(), graph, node, "zero point before activation");
        }
        if !has_positive_scale(graph, &chain) {
            return reject(self.name(), graph, node, "non-positive scale");
        }
        true
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let relu = m.root();
        if !self.can_be_transformed(ctx, relu) {
            return Ok(false);
        }
        let output_type = preserved_output_type(&self.params, ctx.graph, relu);
        move_dequantization_through(ctx.graph, relu, output_type, |c| Ok(c.clone()))?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        true
    }
}
