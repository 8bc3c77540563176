//! Core traits for lpt-optimizer
//!
//! Defines the fundamental interfaces for graph-level transformation.

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId};
use crate::transform::TransformStats;

/// Transformer trait for graph transformations
///
/// This is the core abstraction for whole-graph pipelines. Both the
/// low-precision orchestrator and the common optimizations implement it.
///
/// # Example
///
/// ```ignore
/// struct MyTransformer;
///
/// impl Transformer for MyTransformer {
///     fn name(&self) -> &str {
///         "MyTransformer"
///     }
///
///     fn transform(&self, graph: &mut GraphContext) -> LptResult<TransformStats> {
///         Ok(TransformStats::default())
///     }
/// }
/// ```
pub trait Transformer {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Transform the graph in place
    ///
    /// # Returns
    /// * `LptResult<TransformStats>` - Accumulated statistics or an error
    fn transform(&self, graph: &mut GraphContext) -> LptResult<TransformStats>;
}

/// Registry queries consumed by rules and neighboring subsystems
pub trait LayerTransformationsManager {
    /// Check if the inputs of `node` carry a lowerable dequantization
    fn is_quantized(&self, graph: &GraphContext, node: NodeId) -> bool;

    /// Check if `node` propagates its input precision unchanged
    fn is_precision_preserved(&self, graph: &GraphContext, node: NodeId) -> bool;
}

/// Chainable transformer that applies multiple transformers in sequence
pub struct TransformerChain {
    transformers: Vec<Box<dyn Transformer>>,
}

impl TransformerChain {
    /// Create a new empty transformer chain
    pub fn new() -> Self {
        Self {
            transformers: Vec::new(),
        }
    }

    /// Add a transformer to the chain
    #[allow(clippy::should_implement_trait)]
    pub fn add<T: Transformer + 'static>(mut self, transformer: T) -> Self {
        self.transformers.push(Box::new(transformer));
        self
    }

    /// Number of chained transformers
    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    /// Check if the chain is empty
    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }
}

impl Default for TransformerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer for TransformerChain {
    fn name(&self) -> &str {
        "TransformerChain"
    }

    fn transform(&self, graph: &mut GraphContext) -> LptResult<TransformStats> {
        let mut stats = TransformStats::default();
        for transformer in &self.transformers {
            stats.merge(&transformer.transform(graph)?);
        }
        Ok(stats)
    }
}
