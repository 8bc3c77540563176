//! Dequantization chain extraction
//!
//! A dequantization chain is the `Convert → Subtract(zero point) →
//! Multiply(scale)` sequence that turns a low-precision tensor back into real
//! values. Every link is optional, but present links always appear in that
//! order, and the subtract and multiply always take a constant as their
//! second operand.

use crate::graph::{GraphContext, NodeId, OpKind};
use crate::tensor::{is_per_channel, is_per_tensor, Constant, ElementType};

/// Dequantization chain found above a node input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeQuantizeDequantization {
    /// Origin of the chain: the first node that is not a link
    pub data: NodeId,
    /// Element type conversion
    pub convert: Option<NodeId>,
    /// Zero-point subtraction
    pub subtract: Option<NodeId>,
    /// Zero-point constant
    pub subtract_constant: Option<NodeId>,
    /// Scale multiplication
    pub multiply: Option<NodeId>,
    /// Scale constant
    pub multiply_constant: Option<NodeId>,
}

impl FakeQuantizeDequantization {
    /// Chain without links over `data`
    pub fn empty_over(data: NodeId) -> Self {
        Self {
            data,
            convert: None,
            subtract: None,
            subtract_constant: None,
            multiply: None,
            multiply_constant: None,
        }
    }

    /// Extract the chain feeding input `index` of `node`
    pub fn extract(graph: &GraphContext, node: NodeId, index: usize) -> Option<Self> {
        graph
            .get_input(node, index)
            .map(|input| Self::from_output(graph, input))
    }

    /// Extract the chain ending at `last`
    ///
    /// `last` is the node whose output carries the dequantized value; when it
    /// is not a link itself the chain is empty and `data` is `last`.
    pub fn from_output(graph: &GraphContext, last: NodeId) -> Self {
        let mut chain = Self::empty_over(last);
        let mut current = last;

        if let Some(constant) = constant_operand(graph, current, OpKind::Multiply) {
            chain.multiply = Some(current);
            chain.multiply_constant = Some(constant);
            current = first_input(graph, current);
        }
        if let Some(constant) = constant_operand(graph, current, OpKind::Subtract) {
            chain.subtract = Some(current);
            chain.subtract_constant = Some(constant);
            current = first_input(graph, current);
        }
        if graph.kind(current) == Some(OpKind::Convert) {
            chain.convert = Some(current);
            current = first_input(graph, current);
        }

        chain.data = current;
        chain
    }

    /// True when no link was found
    pub fn empty(&self) -> bool {
        self.convert.is_none() && self.subtract.is_none() && self.multiply.is_none()
    }

    /// Check if moving this chain would affect another consumer
    ///
    /// True when `data` or any link feeds a node outside the chain.
    pub fn is_shared(&self, graph: &GraphContext) -> bool {
        if self.empty() {
            return false;
        }
        self.links()
            .into_iter()
            .rev()
            .skip(1)
            .chain(std::iter::once(self.data))
            .any(|id| graph.consumer_count(id) > 1)
    }

    /// Links present, from the data side to the output side
    pub fn links(&self) -> Vec<NodeId> {
        [self.convert, self.subtract, self.multiply]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Node that carries the dequantized value
    pub fn output(&self) -> NodeId {
        self.multiply
            .or(self.subtract)
            .or(self.convert)
            .unwrap_or(self.data)
    }

    /// Element type of the chain origin
    pub fn data_precision(&self, graph: &GraphContext) -> Option<ElementType> {
        graph.output_type(self.data)
    }

    /// Scale constant payload
    pub fn scale<'g>(&self, graph: &'g GraphContext) -> Option<&'g Constant> {
        self.multiply_constant.and_then(|c| graph.get_constant(c))
    }

    /// Zero-point constant payload
    pub fn shift<'g>(&self, graph: &'g GraphContext) -> Option<&'g Constant> {
        self.subtract_constant.and_then(|c| graph.get_constant(c))
    }

    /// Check that every constant holds a single value
    pub fn is_per_tensor(&self, graph: &GraphContext) -> bool {
        self.constants(graph).all(|c| is_per_tensor(c.shape()) || c.is_scalar_like())
    }

    /// Check that every constant varies at most along axis 1
    pub fn is_per_channel(&self, graph: &GraphContext) -> bool {
        self.constants(graph).all(|c| is_per_channel(c.shape()))
    }

    fn constants<'g>(&self, graph: &'g GraphContext) -> impl Iterator<Item = &'g Constant> {
        [self.subtract_constant, self.multiply_constant]
            .into_iter()
            .flatten()
            .filter_map(move |id| graph.get_constant(id))
    }
}

fn constant_operand(graph: &GraphContext, id: NodeId, kind: OpKind) -> Option<NodeId> {
    if graph.kind(id) != Some(kind) {
        return None;
    }
    graph.get_input(id, 1).filter(|&c| graph.is_constant(c))
}

fn first_input(graph: &GraphContext, id: NodeId) -> NodeId {
    graph.get_input(id, 0).unwrap_or(id)
}
