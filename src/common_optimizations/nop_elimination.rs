//! Identity elimination

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op, OpKind};
use crate::pattern::{MatchResult, Pattern};
use crate::transform::{RewriteRule, TransformationContext};

use super::MatcherPass;

/// Remove operations that return their data input unchanged
///
/// Covers converts to the same type, reshapes to the same shape,
/// single-input concats, multiplication or division by one and addition or
/// subtraction of zero. Type-relaxed nodes are kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopElimination;

fn identity_input(graph: &GraphContext, id: NodeId) -> Option<NodeId> {
    let node = graph.get_node(id)?;
    if node.is_relaxed() {
        return None;
    }
    let data = match node.op {
        Op::Convert { .. } | Op::Reshape { .. } => node.input(0)?,
        Op::Concat { .. } if node.inputs.len() == 1 => node.input(0)?,
        Op::Multiply | Op::Add => {
            let (data, constant) = graph.split_constant_operand(id)?;
            let value = if node.op == Op::Multiply { 1.0 } else { 0.0 };
            graph.get_constant(constant).filter(|c| c.all(|v| v == value))?;
            data
        }
        Op::Divide | Op::Subtract => {
            let value = if node.op == Op::Divide { 1.0 } else { 0.0 };
            graph.get_constant_input(id, 1).filter(|c| c.all(|v| v == value))?;
            node.input(0)?
        }
        _ => return None,
    };
    let unchanged = graph.output_shape(data) == node.shape()
        && graph.output_type(data) == Some(node.element_type());
    unchanged.then_some(data)
}

impl MatcherPass for NopElimination {
    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::any_of(&[
            OpKind::Convert,
            OpKind::Reshape,
            OpKind::Concat,
            OpKind::Multiply,
            OpKind::Add,
            OpKind::Divide,
            OpKind::Subtract,
        ])
        .with_predicate(|graph, id| identity_input(graph, id).is_some())]
    }
}

impl RewriteRule for NopElimination {
    fn name(&self) -> &str {
        "NopElimination"
    }

    fn apply(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let Some(data) = identity_input(ctx.graph, m.root()) else {
            return Ok(false);
        };
        ctx.graph.replace_node(m.root(), data)?;
        Ok(true)
    }
}
