//! DepthToSpace transformation
//!
//! The rearrangement moves channel values into space, so only a per-tensor
//! dequantization commutes with it.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, OpKind};
use crate::low_precision::layer_transformation::{
    can_be_transformed_base, move_dequantization_through, preserved_output_type, reject,
    to_scalar,
};
use crate::low_precision::{FakeQuantizeDequantization, LayerTransformation, Params};
use crate::pattern::ops::unary_after_dequantization;
use crate::pattern::{MatchResult, Pattern};
use crate::transform::TransformationContext;

#[derive(Debug, Clone)]
pub struct DepthToSpaceTransformation {
    params: Arc<Params>,
}

impl DepthToSpaceTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }
}

impl LayerTransformation for DepthToSpaceTransformation {
    fn name(&self) -> &'static str {
        "DepthToSpaceTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![unary_after_dequantization(OpKind::DepthToSpace)]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        let graph = &*ctx.graph;
        if !can_be_transformed_base(self.name(), &self.params, graph, node, 0) {
            return false;
        }
        let Some(chain) = FakeQuantizeDequantization::extract(graph, node, 0) else {
            return false;
        };
        if !chain.is_per_tensor(graph) {
            return reject(self.name(), graph, node, "per-channel dequantization");
        }
        true
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let node = m.root();
        if !self.can_be_transformed(ctx, node) {
            return Ok(false);
        }
        let output_type = preserved_output_type(&self.params, ctx.graph, node);
        move_dequantization_through(ctx.graph, node, output_type, to_scalar)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        true
    }
}
