//! Transformation context
//!
//! Wraps the target graph for the duration of one transform run.

use crate::graph::{GraphContext, NodeId};
use crate::traits::LayerTransformationsManager;

/// Graph under rewrite plus the registry queries rules may consult
pub struct TransformationContext<'a> {
    /// Graph being rewritten
    pub graph: &'a mut GraphContext,
    manager: Option<&'a dyn LayerTransformationsManager>,
}

impl<'a> TransformationContext<'a> {
    /// Wrap a graph without a registry
    pub fn new(graph: &'a mut GraphContext) -> Self {
        Self {
            graph,
            manager: None,
        }
    }

    /// Wrap a graph with the registry that drives the run
    pub fn with_manager(
        graph: &'a mut GraphContext,
        manager: &'a dyn LayerTransformationsManager,
    ) -> Self {
        Self {
            graph,
            manager: Some(manager),
        }
    }

    /// Check if the registry reports `node` as precision preserving
    ///
    /// Without a registry the static operation-kind table decides.
    pub fn is_precision_preserved(&self, node: NodeId) -> bool {
        match self.manager {
            Some(manager) => manager.is_precision_preserved(self.graph, node),
            None => self
                .graph
                .kind(node)
                .map_or(false, crate::pattern::is_precision_preserving_op),
        }
    }

    /// Check if the registry reports `node` as quantized
    pub fn is_quantized(&self, node: NodeId) -> bool {
        self.manager
            .map_or(false, |manager| manager.is_quantized(self.graph, node))
    }
}
