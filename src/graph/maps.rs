//! Graph map types and builders
//!
//! Defines the arena node storage and the maps used for efficient traversal.

use std::fmt;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::tensor::ElementType;

use super::op::{Op, OpKind, TensorType};

/// Stable handle of a node in the arena
///
/// Handles are never reused, so a handle to a detached node stays invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Arena slot index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Type-relaxation decorator
///
/// A relaxed node may carry an output element type that differs from what
/// inference would derive from its inputs, and its inputs may disagree on
/// element type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeRelaxed {
    /// Declared output element type
    pub output_type: Option<ElementType>,
}

/// Node stored in the arena
#[derive(Debug, Clone)]
pub struct Node {
    /// Unique name
    pub name: String,
    /// User-facing name, preserved across rewrites
    pub friendly_name: String,
    /// Operation
    pub op: Op,
    /// Producers, in input order
    pub inputs: SmallVec<[NodeId; 4]>,
    /// Output type
    pub output: TensorType,
    /// Type-relaxation decorator
    pub relaxed: Option<TypeRelaxed>,
}

impl Node {
    /// Operation kind
    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    /// Producer at input `index`
    pub fn input(&self, index: usize) -> Option<NodeId> {
        self.inputs.get(index).copied()
    }

    /// Check for the type-relaxation decorator
    pub fn is_relaxed(&self) -> bool {
        self.relaxed.is_some()
    }

    /// Output element type
    pub fn element_type(&self) -> ElementType {
        self.output.element_type
    }

    /// Output shape
    pub fn shape(&self) -> &[usize] {
        &self.output.shape
    }
}

/// Arena of nodes; detached slots are `None`
pub type NodeArena = Vec<Option<Node>>;

/// Type alias for consumer map: producer → consumers, one entry per edge
/// SmallVec optimized for common case of 1-4 consumers
pub type ConsumerMap = FxHashMap<NodeId, SmallVec<[NodeId; 4]>>;

/// Type alias for name map: unique name → node
pub type NameMap = FxHashMap<String, NodeId>;

/// Build consumer map from the arena
///
/// Maps each producer to the nodes that consume it.
pub fn build_consumer_map(nodes: &NodeArena) -> ConsumerMap {
    let mut map: ConsumerMap = FxHashMap::default();

    for (index, node) in nodes.iter().enumerate() {
        let Some(node) = node else { continue };
        for &input in &node.inputs {
            map.entry(input).or_default().push(NodeId(index as u32));
        }
    }

    map
}

/// Build name map from the arena
pub fn build_name_map(nodes: &NodeArena) -> NameMap {
    nodes
        .iter()
        .enumerate()
        .filter_map(|(index, node)| {
            node.as_ref()
                .map(|n| (n.name.clone(), NodeId(index as u32)))
        })
        .collect()
}
