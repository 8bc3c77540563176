//! Layer transformation interface and the eligibility checks every rule shares

use std::sync::Arc;

use tracing::trace;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId};
use crate::pattern::{is_relaxed_op, MatchResult, Pattern};
use crate::tensor::{Constant, ElementType};
use crate::transform::TransformationContext;

use super::dequantization::FakeQuantizeDequantization;
use super::network_helper::{
    exclusive_dequantization, is_channel_constant_for, move_dequantization_after,
};
use super::params::Params;

/// One low-precision rewrite, dedicated to an operation kind
///
/// `transform` must re-check `can_be_transformed` before it mutates the
/// graph: the match was made against the graph as it was when the node was
/// offered, and earlier rewrites in the same pass may have changed its
/// neighborhood.
pub trait LayerTransformation {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Build the transformation over shared parameters
    fn with_params(params: Arc<Params>) -> Self
    where
        Self: Sized;

    /// Parameters the transformation was built with
    fn params(&self) -> &Arc<Params>;

    /// Patterns this transformation registers
    fn patterns(&self) -> Vec<Pattern>;

    /// Eligibility gate; never mutates
    fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool;

    /// Rewrite the match; `Ok(false)` leaves the graph untouched
    fn transform(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool>;

    /// Check if the operation passes its input precision through unchanged
    fn is_precision_preserved(&self, graph: &GraphContext, node: NodeId) -> bool;

    /// Check if the inputs of `node` carry a lowerable dequantization
    fn is_quantized(&self, _graph: &GraphContext, _node: NodeId) -> bool {
        true
    }

    /// Allowed activation precisions
    fn precisions_on_activations(&self) -> &[ElementType] {
        &self.params().precisions_on_activations
    }
}

/// Log an eligibility rejection and return `false`
pub(crate) fn reject(transformation: &str, graph: &GraphContext, node: NodeId, reason: &str) -> bool {
    let name = graph
        .get_node(node)
        .map(|n| n.friendly_name.as_str())
        .unwrap_or_default();
    trace!(transformation, node = name, reason, "not transformed");
    false
}

/// Eligibility shared by the rules that move a dequantization past `node`
///
/// Input `index` must carry a dequantization whose origin precision is
/// allowed, whose `Convert` matches the origin being integral, and whose
/// constants only vary along the channel axis. When precisions are updated
/// a node of a relaxable kind must be type-relaxed; the others take their
/// input type anyway.
pub fn can_be_transformed_base(
    transformation: &str,
    params: &Params,
    graph: &GraphContext,
    node: NodeId,
    index: usize,
) -> bool {
    let Some(chain) = FakeQuantizeDequantization::extract(graph, node, index) else {
        return reject(transformation, graph, node, "missing input");
    };
    if chain.empty() {
        return reject(transformation, graph, node, "no dequantization");
    }
    if !is_dequantization_supported(params, graph, &chain) {
        return reject(transformation, graph, node, "unsupported dequantization");
    }
    let Some(n) = graph.get_node(node) else {
        return false;
    };
    if params.update_precisions && is_relaxed_op(n.kind()) && !n.is_relaxed() {
        return reject(transformation, graph, node, "not type-relaxed");
    }
    true
}

/// Check that a chain is one the rewrites can move
pub fn is_dequantization_supported(
    params: &Params,
    graph: &GraphContext,
    chain: &FakeQuantizeDequantization,
) -> bool {
    let Some(data_type) = chain.data_precision(graph) else {
        return false;
    };
    if data_type.is_integral() {
        if chain.convert.is_none() || !params.precisions_on_activations.contains(&data_type) {
            return false;
        }
    } else if chain.convert.is_some() {
        return false;
    }

    let shape = graph.output_shape(chain.output());
    [chain.subtract_constant, chain.multiply_constant]
        .into_iter()
        .flatten()
        .filter_map(|c| graph.get_constant(c))
        .all(|c| is_channel_constant_for(c, shape))
}

/// Element type a precision-preserving node should declare after the move
///
/// The origin type of the dequantization on input 0 is handed through when
/// precisions are updated and the node is relaxed; otherwise inference
/// decides.
pub fn preserved_output_type(
    params: &Params,
    graph: &GraphContext,
    node: NodeId,
) -> Option<ElementType> {
    let relaxed = graph.get_node(node).map_or(false, |n| n.is_relaxed());
    if !params.update_precisions || !relaxed {
        return None;
    }
    FakeQuantizeDequantization::extract(graph, node, 0)?.data_precision(graph)
}

/// Move the dequantization on input 0 of a single-data-input node after it
///
/// `relayout` maps each dequantization constant onto the node output.
pub fn move_dequantization_through(
    graph: &mut GraphContext,
    node: NodeId,
    output_type: Option<ElementType>,
    relayout: impl Fn(&Constant) -> LptResult<Constant>,
) -> LptResult<NodeId> {
    let chain = exclusive_dequantization(graph, node, 0)?;
    let shift = chain.shift(graph).map(&relayout).transpose()?;
    let scale = chain.scale(graph).map(&relayout).transpose()?;
    move_dequantization_after(graph, node, &chain, shift, scale, output_type)
}

/// Constant collapsed to a rank-0 value; only valid for scalar-like constants
pub fn to_scalar(constant: &Constant) -> LptResult<Constant> {
    Ok(Constant::scalar(constant.element_type(), constant.value_at(0)))
}

/// Check that every scale of the chain is strictly positive
pub fn has_positive_scale(graph: &GraphContext, chain: &FakeQuantizeDequantization) -> bool {
    chain.scale(graph).map_or(true, |c| c.all(|v| v > 0.0))
}

/// Check that the chain subtracts nothing
pub fn has_zero_shift(graph: &GraphContext, chain: &FakeQuantizeDequantization) -> bool {
    chain.shift(graph).map_or(true, |c| c.all(|v| v == 0.0))
}
