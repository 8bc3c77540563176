//! Add transformation
//!
//! Two shapes are handled.
//!
//! A constant addend is absorbed into the zero point:
//!
//! ```text
//! s * (x - z) + b == s * (x - (z - b / s))
//! ```
//!
//! Two dequantized branches share the scale of one of them, so that branch
//! loses its multiply and a single multiply follows the addition:
//!
//! ```text
//! f + s_e * y == s_e * (f / s_e + y)
//! ```

#![allow(missing_docs)]

use std::sync::Arc;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op, OpKind};
use crate::low_precision::layer_transformation::{can_be_transformed_base, reject};
use crate::low_precision::network_helper::{exclusive_dequantization, is_channel_constant_for};
use crate::low_precision::{FakeQuantizeDequantization, LayerTransformation, Params};
use crate::pattern::{MatchResult, Pattern};
use crate::tensor::Constant;
use crate::transform::TransformationContext;

/// Which rewrite an eligible addition takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddPlan {
    /// Input `dequantized` carries the chain, the other input is a constant
    ConstantAddend { dequantized: usize },
    /// Input `empty` loses its multiply, the other input is rescaled
    TwoBranches { empty: usize },
}

#[derive(Debug, Clone)]
pub struct AddTransformation {
    params: Arc<Params>,
}

impl AddTransformation {
    pub fn new(params: Arc<Params>) -> Self {
        Self { params }
    }

    fn has_multiply(graph: &GraphContext, node: NodeId, index: usize) -> bool {
        FakeQuantizeDequantization::extract(graph, node, index)
            .map_or(false, |chain| chain.multiply.is_some())
    }

    fn plan(&self, graph: &GraphContext, add: NodeId) -> Option<AddPlan> {
        let name = self.name();
        let constant_input = (0..2).find(|&i| graph.get_constant_input(add, i).is_some());
        let plan = match constant_input {
            Some(c) => AddPlan::ConstantAddend { dequantized: 1 - c },
            None if Self::has_multiply(graph, add, 1) => AddPlan::TwoBranches { empty: 1 },
            None => AddPlan::TwoBranches { empty: 0 },
        };
        let index = match plan {
            AddPlan::ConstantAddend { dequantized } => dequantized,
            AddPlan::TwoBranches { empty } => empty,
        };
        if !Self::has_multiply(graph, add, index) {
            reject(name, graph, add, "no dequantization multiply");
            return None;
        }
        if !can_be_transformed_base(name, &self.params, graph, add, index) {
            return None;
        }
        let chain = FakeQuantizeDequantization::extract(graph, add, index)?;
        let scale = chain.scale(graph)?;
        if !scale.all(|v| v != 0.0) {
            reject(name, graph, add, "zero scale");
            return None;
        }
        let output_shape = graph.output_shape(add);
        let other_ok = match plan {
            AddPlan::ConstantAddend { dequantized } => graph
                .get_constant_input(add, 1 - dequantized)
                .map_or(false, |b| is_channel_constant_for(b, output_shape)),
            AddPlan::TwoBranches { empty } => {
                let other = FakeQuantizeDequantization::extract(graph, add, 1 - empty)?;
                other
                    .scale(graph)
                    .map_or(true, |s| is_channel_constant_for(s, output_shape))
            }
        };
        if !other_ok {
            reject(name, graph, add, "other operand varies beyond channels");
            return None;
        }
        Some(plan)
    }

    fn fold_constant(
        &self,
        graph: &mut GraphContext,
        add: NodeId,
        dequantized: usize,
    ) -> LptResult<NodeId> {
        let node = graph.node(add)?;
        let float_type = node.element_type();
        let friendly_name = node.friendly_name.clone();
        let addend = graph
            .get_constant_input(add, 1 - dequantized)
            .cloned()
            .unwrap_or_else(|| Constant::scalar(float_type, 0.0));

        let chain = exclusive_dequantization(graph, add, dequantized)?;
        let scale = chain
            .scale(graph)
            .cloned()
            .unwrap_or_else(|| Constant::scalar(float_type, 1.0));
        let offset = addend.zip_with(&scale, float_type, |b, s| b / s)?;
        let shift = match chain.shift(graph) {
            Some(z) => z.zip_with(&offset, float_type, |z, o| z - o)?,
            None => offset.map(|o| -o),
        };

        let below = chain.convert.unwrap_or(chain.data);
        let shift = graph.add_constant(shift);
        let subtract = graph.add_node(Op::Subtract, &[below, shift])?;
        let scale = graph.add_constant(scale);
        let multiply = graph.add_node(Op::Multiply, &[subtract, scale])?;
        graph.set_friendly_name(multiply, friendly_name)?;
        graph.replace_node(add, multiply)?;
        Ok(multiply)
    }

    fn merge_branches(&self, graph: &mut GraphContext, add: NodeId, empty: usize) -> LptResult<NodeId> {
        let node = graph.node(add)?;
        let op = node.op.clone();
        let relaxed = node.is_relaxed();
        let float_type = node.element_type();
        let friendly_name = node.friendly_name.clone();

        let empty_chain = exclusive_dequantization(graph, add, empty)?;
        let full_chain = exclusive_dequantization(graph, add, 1 - empty)?;
        let empty_scale = empty_chain
            .scale(graph)
            .cloned()
            .unwrap_or_else(|| Constant::scalar(float_type, 1.0));

        let (below, ratio) = match (full_chain.multiply, full_chain.scale(graph)) {
            (Some(multiply), Some(scale)) => (
                graph.get_input(multiply, 0).unwrap_or(full_chain.data),
                scale.zip_with(&empty_scale, float_type, |f, e| f / e)?,
            ),
            _ => (full_chain.output(), empty_scale.map(|e| 1.0 / e)),
        };
        let ratio = graph.add_constant(ratio);
        let rescaled = graph.add_node(Op::Multiply, &[below, ratio])?;
        let empty_input = empty_chain.subtract.or(empty_chain.convert).unwrap_or(empty_chain.data);

        let mut inputs = [rescaled, rescaled];
        inputs[empty] = empty_input;
        let sum = if relaxed {
            graph.add_relaxed_node(op, &inputs, Some(float_type))?
        } else {
            graph.add_node(op, &inputs)?
        };
        graph.set_friendly_name(sum, format!("{}_original", friendly_name))?;
        let scale = graph.add_constant(empty_scale);
        let multiply = graph.add_node(Op::Multiply, &[sum, scale])?;
        graph.set_friendly_name(multiply, friendly_name)?;
        graph.replace_node(add, multiply)?;
        Ok(multiply)
    }
}

impl LayerTransformation for AddTransformation {
    fn name(&self) -> &'static str {
        "AddTransformation"
    }

    fn with_params(params: Arc<Params>) -> Self {
        Self::new(params)
    }

    fn params(&self) -> &Arc<Params> {
        &self.params
    }

    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::op(OpKind::Add)]
    }

    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        self.plan(ctx.graph, node).is_some()
    }

    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let add = m.root();
        match self.plan(ctx.graph, add) {
            Some(AddPlan::ConstantAddend { dequantized }) => {
                self.fold_constant(ctx.graph, add, dequantized)?;
            }
            Some(AddPlan::TwoBranches { empty }) => {
                self.merge_branches(ctx.graph, add, empty)?;
            }
            None => return Ok(false),
        }
        Ok(true)
    }

    fn is_precision_preserved(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        false
    }
}
