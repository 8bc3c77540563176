//! # LPT Optimizer
//!
//! Low-precision graph transformations for quantized neural-network
//! inference.
//!
//! The crate rewrites a dataflow graph carrying fake-quantize nodes into a
//! graph that executes in integer precision: fake-quantizes are decomposed
//! into a quantizing fake-quantize plus a dequantization chain
//! (`Convert -> Subtract -> Multiply`), and every supported layer moves that
//! chain past itself so the layer runs on integer data.
//!
//! ## Features
//!
//! - **Pattern Matching**: structural templates rooted at the node under test
//! - **Layer Transformations**: one rewrite per operation kind, behind a registry
//! - **Orchestration**: five ordered phases with checked invariants
//! - **Common Optimizations**: constant folding, identity elimination,
//!   decompositions and linear-operation fusion
//!
//! ## Example
//!
//! ```ignore
//! use lpt_optimizer::prelude::*;
//!
//! let pipeline = TransformerChain::new()
//!     .add(CommonOptimizations::default())
//!     .add(LowPrecisionTransformer::new(
//!         LowPrecisionTransformations::create_default(Params::u8_i8()),
//!     ));
//! let stats = pipeline.transform(&mut graph)?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

// ============================================================================
// Module declarations
// ============================================================================

pub mod builder;
pub mod common_optimizations;
pub mod error;
pub mod graph;
pub mod low_precision;
pub mod pattern;
pub mod tensor;
pub mod traits;
pub mod transform;
pub mod transformers;

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Prelude module - import commonly used types with `use lpt_optimizer::prelude::*`
pub mod prelude {
    pub use crate::builder::{DequantizationOperations, FakeQuantizeOnData, GraphBuilder};
    pub use crate::common_optimizations::CommonOptimizations;
    pub use crate::error::{LptResult, TransformError};
    pub use crate::graph::{GraphContext, NodeId, Op, OpKind};
    pub use crate::low_precision::{
        LayerTransformation, LowPrecisionTransformations, LowPrecisionTransformer, Params,
        QuantizedTensorAlignment,
    };
    pub use crate::pattern::{MatchResult, Pattern, PatternMatcher};
    pub use crate::tensor::{Constant, ElementType};
    pub use crate::traits::{Transformer, TransformerChain};
    pub use crate::transform::{TransformConfig, TransformStats};
    pub use crate::transformers::Transformation;
}

// ============================================================================
// Crate-level re-exports
// ============================================================================

pub use error::{LptResult, TransformError};
pub use traits::Transformer;

// ============================================================================
// Version information
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use super::*;
    use crate::graph::{evaluate, ConvolutionAttrs, PoolAttrs};
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    /// FQ -> Convolution(FQ weights) -> BatchNorm -> MaxPool -> Result
    fn make_float_model() -> (GraphContext, NodeId) {
        let mut builder = GraphBuilder::new();
        let x = builder.parameter("x", ElementType::F32, vec![1, 2, 3, 3]);
        let fq = builder.fake_quantize(x, &FakeQuantizeOnData::new(256, 0.0, 2.55)).unwrap();
        let w = builder
            .constant_values(ElementType::F32, &[2, 2, 1, 1], vec![0.5, -0.25, 0.125, 0.75])
            .unwrap();
        let w = builder
            .fake_quantize(w, &FakeQuantizeOnData::new(256, -1.28, 1.27))
            .unwrap();
        let conv = builder
            .node(Op::Convolution(ConvolutionAttrs::default()), &[fq, w])
            .unwrap();
        let bn_params: Vec<NodeId> = [[1.0, 2.0], [0.5, -0.5], [0.0, 0.25], [1.0, 4.0]]
            .iter()
            .map(|v| builder.constant_values(ElementType::F32, &[2], v.to_vec()).unwrap())
            .collect();
        let bn = builder
            .node(
                Op::BatchNormInference { epsilon: 0.0 },
                &[conv, bn_params[0], bn_params[1], bn_params[2], bn_params[3]],
            )
            .unwrap();
        let pool = builder.node(Op::MaxPool(PoolAttrs::square(1)), &[bn]).unwrap();
        let pool = builder.named(pool, "pool").unwrap();
        builder.result(pool).unwrap();
        (builder.build().unwrap(), x)
    }

    #[test]
    fn test_full_pipeline() {
        let (mut graph, x) = make_float_model();
        let input = ArrayD::from_shape_fn(IxDyn(&[1, 2, 3, 3]), |i| {
            ((i[1] * 9 + i[2] * 3 + i[3]) as f32 * 0.13) % 2.55
        });
        let before = evaluate(&graph, &[(x, input.clone())]).unwrap();

        let pipeline = TransformerChain::new()
            .add(CommonOptimizations::default())
            .add(LowPrecisionTransformer::default());
        let stats = pipeline.transform(&mut graph).unwrap();
        assert!(stats.changed());

        assert!(graph.find_nodes_by_op(OpKind::BatchNormInference).is_empty());
        let conv = graph.find_nodes_by_op(OpKind::Convolution)[0];
        let data = graph.get_input(conv, 0).unwrap();
        assert_eq!(graph.output_type(data), Some(ElementType::U8));

        let after = evaluate(&graph, &[(x, input)]).unwrap();
        for (a, b) in before[0].iter().zip(after[0].iter()) {
            assert!((a - b).abs() < 0.05, "{} vs {}", a, b);
        }
    }
}
