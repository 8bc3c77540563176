//! Fusion of constant Add and Multiply chains
//!
//! ```text
//! (x * a) * b  =>  x * (a * b)
//! (x + a) + b  =>  x + (a + b)
//! (x + a) * b  =>  x * b + a * b
//! ```
//!
//! The inner operation must have no other consumer and the constants must
//! not broadcast `x` to a larger shape.

#![allow(missing_docs)]

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op, OpKind};
use crate::pattern::{MatchResult, Pattern};
use crate::transform::{fold_binary, RewriteRule, TransformationContext};

use super::MatcherPass;

#[derive(Debug, Default, Clone, Copy)]
pub struct LinOpSequenceFusion;

#[derive(Debug, Clone, Copy)]
struct Sequence {
    x: NodeId,
    inner: OpKind,
    inner_constant: NodeId,
    outer_constant: NodeId,
}

fn sequence(graph: &GraphContext, outer: NodeId) -> Option<Sequence> {
    let outer_kind = graph.kind(outer)?;
    let (inner, outer_constant) = graph.split_constant_operand(outer)?;
    let inner_kind = graph.kind(inner)?;
    let (x, inner_constant) = graph.split_constant_operand(inner)?;
    let fusible = matches!(
        (inner_kind, outer_kind),
        (OpKind::Multiply, OpKind::Multiply) | (OpKind::Add, OpKind::Add) | (OpKind::Add, OpKind::Multiply)
    );
    let plain = [outer, inner]
        .iter()
        .all(|&n| graph.get_node(n).map_or(false, |n| !n.is_relaxed() && n.element_type().is_real()));
    let keeps_shape = graph.output_shape(x) == graph.output_shape(outer);
    (fusible && plain && keeps_shape && graph.is_single_use(inner)).then_some(Sequence {
        x,
        inner: inner_kind,
        inner_constant,
        outer_constant,
    })
}

impl MatcherPass for LinOpSequenceFusion {
    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::any_of(&[OpKind::Add, OpKind::Multiply])
            .with_predicate(|graph, id| sequence(graph, id).is_some())]
    }
}

impl RewriteRule for LinOpSequenceFusion {
    fn name(&self) -> &str {
        "LinOpSequenceFusion"
    }

    fn apply(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let outer = m.root();
        let graph = &mut *ctx.graph;
        let Some(seq) = sequence(graph, outer) else {
            return Ok(false);
        };
        let outer_op = graph.node(outer)?.op.clone();
        let friendly_name = graph.node(outer)?.friendly_name.clone();

        let fused = match (seq.inner, &outer_op) {
            (OpKind::Add, Op::Multiply) => {
                let scaled = graph.add_node(Op::Multiply, &[seq.x, seq.outer_constant])?;
                let bias = fold_binary(graph, Op::Multiply, seq.inner_constant, seq.outer_constant)?;
                graph.add_node(Op::Add, &[scaled, bias])?
            }
            (_, op) => {
                let merged = fold_binary(graph, op.clone(), seq.inner_constant, seq.outer_constant)?;
                graph.add_node(op.clone(), &[seq.x, merged])?
            }
        };
        graph.set_friendly_name(fused, friendly_name)?;
        graph.replace_node(outer, fused)?;
        Ok(true)
    }
}
