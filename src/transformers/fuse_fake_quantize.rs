//! Fuse-fake-quantize cleanup
//!
//! Elementwise operations by a constant that feed a fake-quantize are
//! folded into its input thresholds:
//!
//! ```text
//! fq(x * c, il, ih) == fq(x, il / c, ih / c)    c > 0
//! fq(x / c, il, ih) == fq(x, il * c, ih * c)    c > 0
//! fq(x - c, il, ih) == fq(x, il + c, ih + c)
//! fq(x + c, il, ih) == fq(x, il - c, ih - c)
//! ```

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, OpKind};
use crate::low_precision::{LayerTransformation, Params};
use crate::pattern::ops::fake_quantize_with_constant_ranges;
use crate::pattern::{MatchResult, Pattern};
use crate::tensor::{broadcasts_to, Constant};
use crate::transform::TransformationContext;

#[derive(Debug, Clone)]
pub struct FuseFakeQuantizeTransformation {
    params: Arc<Params>,
}

/// One foldable link above a fake-quantize
struct Link<'g> {
    kind: OpKind,
    data: NodeId,
    constant: &'g Constant,
}

impl FuseFakeQuantizeTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    fn link(graph: &GraphContext, node: NodeId) -> Option<Link<'_>> {
        let kind = graph.kind(node)?;
        let (data, constant) = match kind {
            OpKind::Multiply | OpKind::Add => graph.split_constant_operand(node)?,
            OpKind::Subtract | OpKind::Divide => {
                let constant = graph.get_input(node, 1)?;
                (graph.get_input(node, 0)?, constant)
            }
            _ => return None,
        };
        let constant = graph.get_constant(constant)?;
        if !graph.is_single_use(node) || graph.is_constant(data) {
            return None;
        }
        if !graph.output_type(data).map_or(false, |t| t.is_real()) {
            return None;
        }
        if !broadcasts_to(constant.shape(), graph.output_shape(data)) {
            return None;
        }
        if matches!(kind, OpKind::Multiply | OpKind::Divide) && !constant.all(|c| c > 0.0) {
            return None;
        }
        Some(Link {
            kind,
            data,
            constant,
        })
    }

    /// New data input and input thresholds, if any link folds
    fn fold(graph: &GraphContext, fq: NodeId) -> LptResult<Option<(NodeId, Constant, Constant)>> {
        let (Some(mut low), Some(mut high)) = (
            graph.get_constant_input(fq, 1).cloned(),
            graph.get_constant_input(fq, 2).cloned(),
        ) else {
            return Ok(None);
        };
        let Some(mut data) = graph.get_input(fq, 0) else {
            return Ok(None);
        };
        let element_type = low.element_type();
        let mut folded = false;
        while let Some(link) = Self::link(graph, data) {
            let f: fn(f32, f32) -> f32 = match link.kind {
                OpKind::Multiply => |t, c| t / c,
                OpKind::Divide => |t, c| t * c,
                OpKind::Subtract => |t, c| t + c,
                _ => |t, c| t - c,
            };
            low = low.zip_with(link.constant, element_type, f)?;
            high = high.zip_with(link.constant, element_type, f)?;
            data = link.data;
            folded = true;
        }
        Ok(folded.then_some((data, low, high)))
    }
}

impl LayerTransformation for FuseFakeQuantizeTransformation {
    fn name(&self) -> &'static str {
        "FuseFakeQuantizeTransformation"
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
        matches!(Self::fold(ctx.graph, node), Ok(Some(_)))
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let fq = m.root();
        let Some((data, low, high)) = Self::fold(ctx.graph, fq)? else {
            return Ok(false);
        };
        let graph = &mut *ctx.graph;
        let (Some(output_low), Some(output_high)) = (graph.get_input(fq, 3), graph.get_input(fq, 4))
        else {
            return Ok(false);
        };
        let low = graph.add_constant(low);
        let high = graph.add_constant(high);
        let fused = graph.clone_with_new_inputs(fq, &[data, low, high, output_low, output_high])?;
        graph.replace_node(fq, fused)?;
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        false
    }
}
