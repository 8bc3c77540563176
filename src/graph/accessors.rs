//! Typed accessors over graph nodes
//!
//! Convenience lookups for constants, operand positions and tensor layout.

use crate::tensor::{Constant, ElementType};

use super::context::GraphContext;
use super::maps::NodeId;
use super::op::OpKind;

impl GraphContext {
    // ========================================================================
    // Constant accessors
    // ========================================================================

    /// Constant payload of a node
    pub fn get_constant(&self, id: NodeId) -> Option<&Constant> {
        self.get_node(id).and_then(|n| n.op.as_constant())
    }

    /// Check if a node is a constant
    pub fn is_constant(&self, id: NodeId) -> bool {
        self.get_constant(id).is_some()
    }

    /// Constant feeding input `index` of `id`
    pub fn get_constant_input(&self, id: NodeId, index: usize) -> Option<&Constant> {
        self.get_input(id, index).and_then(|i| self.get_constant(i))
    }

    /// Check if every input of a node is a constant
    pub fn all_inputs_constant(&self, id: NodeId) -> bool {
        self.get_node(id).map_or(false, |n| {
            !n.inputs.is_empty() && n.inputs.iter().all(|&i| self.is_constant(i))
        })
    }

    // ========================================================================
    // Output accessors
    // ========================================================================

    /// Output shape of a node, empty for detached handles
    pub fn output_shape(&self, id: NodeId) -> &[usize] {
        self.get_node(id).map(|n| n.shape()).unwrap_or(&[])
    }

    /// Output element type of a node
    pub fn output_type(&self, id: NodeId) -> Option<ElementType> {
        self.get_node(id).map(|n| n.element_type())
    }

    /// Output rank of a node
    pub fn output_rank(&self, id: NodeId) -> usize {
        self.output_shape(id).len()
    }

    /// Channel count (axis 1) of a node output
    pub fn output_channels(&self, id: NodeId) -> Option<usize> {
        self.output_shape(id).get(1).copied()
    }

    // ========================================================================
    // Operand accessors
    // ========================================================================

    /// Position of `producer` among the inputs of `consumer`
    pub fn input_index(&self, consumer: NodeId, producer: NodeId) -> Option<usize> {
        self.get_node(consumer)
            .and_then(|n| n.inputs.iter().position(|&i| i == producer))
    }

    /// Check if input `index` of `id` is produced by a node of `kind`
    pub fn input_is(&self, id: NodeId, index: usize, kind: OpKind) -> bool {
        self.get_input(id, index).and_then(|i| self.kind(i)) == Some(kind)
    }

    /// The non-constant operand of a binary node with one constant operand
    ///
    /// Returns `(data, constant)` handles.
    pub fn split_constant_operand(&self, id: NodeId) -> Option<(NodeId, NodeId)> {
        let lhs = self.get_input(id, 0)?;
        let rhs = self.get_input(id, 1)?;
        match (self.is_constant(lhs), self.is_constant(rhs)) {
            (false, true) => Some((lhs, rhs)),
            (true, false) => Some((rhs, lhs)),
            _ => None,
        }
    }
}
