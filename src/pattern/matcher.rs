//! Pattern matching engine for computation graphs
//!
//! A [`Pattern`] is a tree template rooted at the node being matched. Each
//! template node constrains the operation kind, optionally constrains the
//! inputs positionally, and may carry a label. A successful match returns a
//! [`MatchResult`] mapping labels to node handles; transformations read their
//! operands from it instead of receiving a callback.
//!
//! Matching walks the template once, so it runs in time linear in the
//! template size and never backtracks.

use smallvec::SmallVec;

use crate::graph::{GraphContext, NodeId, OpKind};

/// Extra structural check evaluated on a candidate node
pub type PatternPredicate = fn(&GraphContext, NodeId) -> bool;

/// Structural template matched against a node and its producers
#[derive(Debug, Clone)]
pub struct Pattern {
    kinds: SmallVec<[OpKind; 2]>,
    label: Option<&'static str>,
    inputs: Option<Vec<Pattern>>,
    predicate: Option<PatternPredicate>,
}

impl Pattern {
    /// Wildcard matching any node
    pub fn any() -> Self {
        Self {
            kinds: SmallVec::new(),
            label: None,
            inputs: None,
            predicate: None,
        }
    }

    /// Match a node of the given kind
    pub fn op(kind: OpKind) -> Self {
        Self::any_of(&[kind])
    }

    /// Match a node of any of the given kinds
    pub fn any_of(kinds: &[OpKind]) -> Self {
        Self {
            kinds: kinds.iter().copied().collect(),
            ..Self::any()
        }
    }

    /// Match a constant
    pub fn constant() -> Self {
        Self::op(OpKind::Constant)
    }

    /// Bind the matched node under `label`
    ///
    /// A label used at several places must bind the same node everywhere.
    pub fn label(mut self, label: &'static str) -> Self {
        self.label = Some(label);
        self
    }

    /// Constrain the inputs positionally; the input count must match exactly
    pub fn with_inputs<I>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = Pattern>,
    {
        self.inputs = Some(inputs.into_iter().collect());
        self
    }

    /// Require an extra predicate on the matched node
    pub fn with_predicate(mut self, predicate: PatternPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Kinds accepted at the root; empty for wildcards
    pub fn root_kinds(&self) -> &[OpKind] {
        &self.kinds
    }

    /// Number of template nodes
    pub fn size(&self) -> usize {
        1 + self
            .inputs
            .as_ref()
            .map_or(0, |inputs| inputs.iter().map(Pattern::size).sum())
    }

    fn accepts_kind(&self, kind: OpKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// Result of a successful pattern match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    root: NodeId,
    bindings: SmallVec<[(&'static str, NodeId); 4]>,
}

impl MatchResult {
    /// The node the match started from
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Node bound under `label`
    pub fn get(&self, label: &str) -> Option<NodeId> {
        self.bindings
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, id)| *id)
    }

    /// All label bindings in template order
    pub fn bindings(&self) -> impl Iterator<Item = (&'static str, NodeId)> + '_ {
        self.bindings.iter().copied()
    }

    /// Number of bound labels
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Check if no label was bound
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Pattern matcher over a graph
pub struct PatternMatcher<'a> {
    ctx: &'a GraphContext,
}

impl<'a> PatternMatcher<'a> {
    /// Create a new pattern matcher
    pub fn new(ctx: &'a GraphContext) -> Self {
        Self { ctx }
    }

    /// Match `pattern` rooted at `node`
    ///
    /// # Returns
    /// * `Some(MatchResult)` with every labeled node bound
    /// * `None` if the node or any constrained producer does not fit
    pub fn match_pattern(&self, pattern: &Pattern, node: NodeId) -> Option<MatchResult> {
        let mut result = MatchResult {
            root: node,
            bindings: SmallVec::new(),
        };
        if self.match_node(pattern, node, &mut result) {
            Some(result)
        } else {
            None
        }
    }

    fn match_node(&self, pattern: &Pattern, id: NodeId, result: &mut MatchResult) -> bool {
        let Some(node) = self.ctx.get_node(id) else {
            return false;
        };
        if !pattern.accepts_kind(node.kind()) {
            return false;
        }
        if let Some(predicate) = pattern.predicate {
            if !predicate(self.ctx, id) {
                return false;
            }
        }
        if let Some(label) = pattern.label {
            match result.get(label) {
                Some(bound) if bound != id => return false,
                Some(_) => {}
                None => result.bindings.push((label, id)),
            }
        }
        match &pattern.inputs {
            None => true,
            Some(inputs) => {
                inputs.len() == node.inputs.len()
                    && inputs
                        .iter()
                        .zip(node.inputs.iter())
                        .all(|(p, &input)| self.match_node(p, input, result))
            }
        }
    }

    /// Find all matches of a pattern in the graph, in topological order
    pub fn find_all_matches(&self, pattern: &Pattern) -> Vec<MatchResult> {
        self.ctx
            .topological_order()
            .into_iter()
            .filter_map(|id| self.match_pattern(pattern, id))
            .collect()
    }

    /// Check if the producer feeds only this consumer
    ///
    /// Used to verify that moving the producer is safe.
    pub fn is_fusible_connection(&self, producer: NodeId, consumer: NodeId) -> bool {
        let consumers = self.ctx.get_consumers(producer);
        !consumers.is_empty() && consumers.iter().all(|&c| c == consumer)
    }
}

/// Create a pattern matcher for the given context
pub fn matcher(ctx: &GraphContext) -> PatternMatcher<'_> {
    PatternMatcher::new(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ConvolutionAttrs, Op};
    use crate::tensor::{Constant, ElementType};

    fn make_conv_graph() -> (GraphContext, NodeId, NodeId, NodeId) {
        let mut ctx = GraphContext::new();
        let x = ctx.add_parameter("x", ElementType::F32, vec![1, 3, 4, 4]);
        let scale = ctx.add_constant(Constant::scalar(ElementType::F32, 0.1));
        let mul = ctx.add_node(Op::Multiply, &[x, scale]).unwrap();
        let w = ctx.add_constant(Constant::filled(ElementType::F32, &[2, 3, 1, 1], 1.0));
        let conv = ctx
            .add_node(Op::Convolution(ConvolutionAttrs::default()), &[mul, w])
            .unwrap();
        ctx.add_result(conv).unwrap();
        (ctx, mul, w, conv)
    }

    #[test]
    fn test_match_binds_labels() {
        let (ctx, mul, w, conv) = make_conv_graph();
        let pattern = Pattern::op(OpKind::Convolution).label("conv").with_inputs([
            Pattern::op(OpKind::Multiply)
                .label("multiply")
                .with_inputs([Pattern::any(), Pattern::constant().label("scale")]),
            Pattern::constant().label("weights"),
        ]);
        let m = matcher(&ctx).match_pattern(&pattern, conv).unwrap();
        assert_eq!(m.root(), conv);
        assert_eq!(m.get("conv"), Some(conv));
        assert_eq!(m.get("multiply"), Some(mul));
        assert_eq!(m.get("weights"), Some(w));
        assert!(m.get("scale").is_some());
        assert_eq!(m.len(), 4);
        assert_eq!(pattern.size(), 5);
    }

    #[test]
    fn test_kind_mismatch() {
        let (ctx, _, _, conv) = make_conv_graph();
        let pattern = Pattern::op(OpKind::Convolution)
            .with_inputs([Pattern::op(OpKind::Subtract), Pattern::any()]);
        assert!(matcher(&ctx).match_pattern(&pattern, conv).is_none());
    }

    #[test]
    fn test_input_count_must_match() {
        let (ctx, _, _, conv) = make_conv_graph();
        let pattern = Pattern::op(OpKind::Convolution).with_inputs([Pattern::any()]);
        assert!(matcher(&ctx).match_pattern(&pattern, conv).is_none());
    }

    #[test]
    fn test_label_reuse_requires_same_node() {
        let mut ctx = GraphContext::new();
        let x = ctx.add_parameter("x", ElementType::F32, vec![2]);
        let y = ctx.add_parameter("y", ElementType::F32, vec![2]);
        let same = ctx.add_node(Op::Add, &[x, x]).unwrap();
        let different = ctx.add_node(Op::Add, &[x, y]).unwrap();

        let pattern = Pattern::op(OpKind::Add)
            .with_inputs([Pattern::any().label("operand"), Pattern::any().label("operand")]);
        let m = matcher(&ctx);
        assert!(m.match_pattern(&pattern, same).is_some());
        assert!(m.match_pattern(&pattern, different).is_none());
    }

    #[test]
    fn test_predicate() {
        let (ctx, mul, _, _) = make_conv_graph();
        let pattern = Pattern::op(OpKind::Multiply)
            .with_predicate(|ctx, id| ctx.is_single_use(id));
        assert!(matcher(&ctx).match_pattern(&pattern, mul).is_some());
        let never = Pattern::op(OpKind::Multiply).with_predicate(|_, _| false);
        assert!(matcher(&ctx).match_pattern(&never, mul).is_none());
    }

    #[test]
    fn test_find_all_matches() {
        let (ctx, _, _, _) = make_conv_graph();
        let constants = matcher(&ctx).find_all_matches(&Pattern::constant());
        assert_eq!(constants.len(), 2);
        let any_of = Pattern::any_of(&[OpKind::Multiply, OpKind::Convolution]);
        assert_eq!(matcher(&ctx).find_all_matches(&any_of).len(), 2);
    }

    #[test]
    fn test_is_fusible_connection() {
        let (ctx, mul, _, conv) = make_conv_graph();
        assert!(matcher(&ctx).is_fusible_connection(mul, conv));
        assert!(!matcher(&ctx).is_fusible_connection(conv, mul));
    }
}
