//! Constant folding
//!
//! Any operation whose inputs are all constants is evaluated and replaced by
//! one constant, except fake-quantize nodes and integer-to-float converts:
//! those carry quantization structure the low-precision engine reads.

use tracing::trace;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op};
use crate::pattern::{MatchResult, Pattern};
use crate::transform::{fold, RewriteRule, TransformationContext};

use super::MatcherPass;

/// Fold operations over constants
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstantFolding;

fn is_foldable(graph: &GraphContext, id: NodeId) -> bool {
    let Some(node) = graph.get_node(id) else {
        return false;
    };
    let keeps_structure = match node.op {
        Op::Parameter | Op::Constant(_) | Op::Result | Op::FakeQuantize { .. } => true,
        Op::Convert { destination } => {
            destination.is_real()
                && node
                    .input(0)
                    .and_then(|i| graph.output_type(i))
                    .map_or(false, |t| t.is_integral())
        }
        _ => false,
    };
    !keeps_structure && !node.inputs.is_empty() && graph.all_inputs_constant(id)
}

impl MatcherPass for ConstantFolding {
    fn patterns(&self) -> Vec<Pattern> {
        vec![Pattern::any().with_predicate(is_foldable)]
    }
}

impl RewriteRule for ConstantFolding {
    fn name(&self) -> &str {
        "ConstantFolding"
    }

    fn apply(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let id = m.root();
        let node = ctx.graph.node(id)?;
        let (op, inputs) = (node.op.clone(), node.inputs.clone());
        let (element_type, friendly_name) = (node.element_type(), node.friendly_name.clone());
        let Some(folded) = fold(ctx.graph, &op, &inputs)? else {
            return Ok(false);
        };
        let folded = if folded.element_type() == element_type {
            folded
        } else {
            folded.convert(element_type)
        };
        let constant = ctx.graph.add_constant(folded);
        ctx.graph.set_friendly_name(constant, friendly_name)?;
        ctx.graph.replace_node(id, constant)?;
        trace!(node = %id, kind = %op.kind(), "folded");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OpKind;
    use crate::tensor::{Constant, ElementType};
    use crate::traits::Transformer;

    #[test]
    fn test_folds_constant_subgraph() {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::F32, vec![1, 3]);
        let a = graph.add_constant(Constant::scalar(ElementType::F32, 2.0));
        let b = graph.add_constant(Constant::scalar(ElementType::F32, 3.0));
        let sum = graph.add_node(Op::Add, &[a, b]).unwrap();
        let neg = graph.add_node(Op::Negative, &[sum]).unwrap();
        let mul = graph.add_node(Op::Multiply, &[x, neg]).unwrap();
        graph.add_result(mul).unwrap();

        let stats = ConstantFolding.transform(&mut graph).unwrap();
        assert_eq!(stats.transforms_applied, 2);
        let operand = graph.get_input(mul, 1).unwrap();
        assert_eq!(graph.get_constant(operand).unwrap().scalar_value(), Some(-5.0));
        assert!(graph.find_nodes_by_op(OpKind::Add).is_empty());
    }

    #[test]
    fn test_keeps_quantization_structure() {
        let mut graph = GraphContext::new();
        let w = graph.add_constant(Constant::from_vec(ElementType::I8, &[2], vec![-3.0, 7.0]).unwrap());
        let convert = graph
            .add_node(Op::Convert { destination: ElementType::F32 }, &[w])
            .unwrap();
        graph.add_result(convert).unwrap();

        let data = graph.add_constant(Constant::scalar(ElementType::F32, 1.0));
        let ranges: Vec<NodeId> = [0.0, 2.55, 0.0, 2.55]
            .iter()
            .map(|&v| graph.add_constant(Constant::scalar(ElementType::F32, v)))
            .collect();
        let fq = graph
            .add_node(
                Op::FakeQuantize { levels: 256 },
                &[data, ranges[0], ranges[1], ranges[2], ranges[3]],
            )
            .unwrap();
        graph.add_result(fq).unwrap();

        let stats = ConstantFolding.transform(&mut graph).unwrap();
        assert_eq!(stats.transforms_applied, 0);
        assert!(graph.has_node(convert));
        assert!(graph.has_node(fq));
    }
}
