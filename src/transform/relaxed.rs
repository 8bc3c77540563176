//! Type-relaxation pass
//!
//! Wraps every node of a relaxable kind in the [`TypeRelaxed`] decorator so
//! later rewrites may assign integer types to nodes that were built as
//! floating point.
//!
//! [`TypeRelaxed`]: crate::graph::TypeRelaxed

use tracing::trace;

use crate::error::LptResult;
use crate::graph::OpKind;
use crate::pattern::{MatchResult, Pattern, RELAXED_OPS};

use super::context::TransformationContext;
use super::core::{GraphRewrite, RewriteRule};

/// Replaces relaxable nodes with relaxed copies
#[derive(Debug, Clone)]
pub struct TypeRelaxedReplacer {
    kinds: Vec<OpKind>,
}

impl TypeRelaxedReplacer {
    /// Relax the default set of kinds
    pub fn new() -> Self {
        Self {
            kinds: RELAXED_OPS.to_vec(),
        }
    }

    /// Relax only the given kinds
    pub fn with_kinds(kinds: &[OpKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
        }
    }

    /// Register the matcher in a pass
    pub fn register_matcher_in<'r>(&'r self, pass: &mut GraphRewrite<'r>) {
        let pattern =
            Pattern::any_of(&self.kinds).with_predicate(|ctx, id| {
                ctx.get_node(id).map_or(false, |n| !n.is_relaxed())
            });
        pass.add_matcher(pattern, self);
    }
}

impl Default for TypeRelaxedReplacer {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteRule for TypeRelaxedReplacer {
    fn name(&self) -> &str {
        "TypeRelaxedReplacer"
    }

    fn apply(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let relaxed = ctx.graph.relax(m.root())?;
        trace!(node = %relaxed, "relaxed");
        Ok(relaxed != m.root())
    }
}
