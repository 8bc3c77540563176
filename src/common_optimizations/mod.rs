//! Common graph optimizations
//!
//! Float-level cleanups that run before the low-precision engine. Every
//! optimization is a [`MatcherPass`]: a rewrite rule plus the patterns it
//! matches, run as one [`GraphRewrite`] over the whole graph.
//!
//! - [`ConstantFolding`]: evaluate operations over constants
//! - [`NopElimination`]: drop identity operations
//! - [`decompositions`]: rewrite Subtract, Divide, Negative and batch norm
//!   into Add and Multiply
//! - [`LinOpSequenceFusion`]: merge chains of constant Add and Multiply
//! - [`conv_mul_fusion`]: fold a constant Multiply into convolution weights
//!
//! Folding never touches fake-quantize nodes or integer-to-float converts,
//! so the quantization structure survives for the low-precision engine.
//!
//! # Example
//!
//! ```ignore
//! use lpt_optimizer::common_optimizations::CommonOptimizations;
//! use lpt_optimizer::low_precision::LowPrecisionTransformer;
//! use lpt_optimizer::traits::{Transformer, TransformerChain};
//!
//! let pipeline = TransformerChain::new()
//!     .add(CommonOptimizations::default())
//!     .add(LowPrecisionTransformer::default());
//! let stats = pipeline.transform(&mut graph)?;
//! ```

use tracing::info;

use crate::error::LptResult;
use crate::graph::GraphContext;
use crate::pattern::Pattern;
use crate::traits::Transformer;
use crate::transform::{GraphRewrite, RewriteRule, TransformStats, TransformationContext};

/// Constant folding
pub mod constant_folding;
/// Multiply folded into convolution weights
pub mod conv_mul_fusion;
/// Subtract, Divide, Negative and batch-norm decompositions
pub mod decompositions;
/// Constant Add and Multiply chain fusion
pub mod lin_op_sequence_fusion;
/// Identity elimination
pub mod nop_elimination;

pub use constant_folding::ConstantFolding;
pub use conv_mul_fusion::{ConvolutionMultiplyFusion, GroupConvolutionMultiplyFusion};
pub use decompositions::{BatchNormDecomposition, ConvertDivide, ConvertNegative, ConvertSubtract};
pub use lin_op_sequence_fusion::LinOpSequenceFusion;
pub use nop_elimination::NopElimination;

/// A rewrite rule together with the patterns it is offered
pub trait MatcherPass: RewriteRule {
    /// Patterns the rule matches
    fn patterns(&self) -> Vec<Pattern>;
}

/// Run one matcher pass over the whole graph
pub fn run_matcher_pass<P: MatcherPass>(rule: &P, graph: &mut GraphContext) -> LptResult<TransformStats> {
    let mut pass = GraphRewrite::new(rule.name());
    for pattern in rule.patterns() {
        pass.add_matcher(pattern, rule);
    }
    pass.run(&mut TransformationContext::new(graph))
}

macro_rules! matcher_pass_transformer {
    ($($pass:ty),* $(,)?) => {
        $(
            impl Transformer for $pass {
                fn name(&self) -> &str {
                    RewriteRule::name(self)
                }

                fn transform(&self, graph: &mut GraphContext) -> LptResult<TransformStats> {
                    run_matcher_pass(self, graph)
                }
            }
        )*
    };
}

matcher_pass_transformer!(
    ConstantFolding,
    NopElimination,
    ConvertSubtract,
    ConvertDivide,
    ConvertNegative,
    BatchNormDecomposition,
    LinOpSequenceFusion,
    ConvolutionMultiplyFusion,
    GroupConvolutionMultiplyFusion,
);

/// Common-optimization pipeline
#[derive(Debug, Clone)]
pub struct CommonOptimizations {
    /// Run the Subtract, Divide, Negative and batch-norm decompositions
    pub decompose: bool,
    /// Run the linear-operation and convolution fusions
    pub fuse: bool,
}

impl Default for CommonOptimizations {
    fn default() -> Self {
        Self {
            decompose: true,
            fuse: true,
        }
    }
}

impl CommonOptimizations {
    /// Pipeline with every stage enabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Folding and elimination only
    pub fn fold_only() -> Self {
        Self {
            decompose: false,
            fuse: false,
        }
    }
}

impl Transformer for CommonOptimizations {
    fn name(&self) -> &str {
        "CommonOptimizations"
    }

    fn transform(&self, graph: &mut GraphContext) -> LptResult<TransformStats> {
        let mut total = TransformStats::default();

        total.merge(&ConstantFolding.transform(graph)?);
        total.merge(&NopElimination.transform(graph)?);
        total.merge(&ConstantFolding.transform(graph)?);

        if self.decompose {
            total.merge(&ConvertSubtract.transform(graph)?);
            total.merge(&ConvertDivide.transform(graph)?);
            total.merge(&ConvertNegative.transform(graph)?);
            total.merge(&BatchNormDecomposition.transform(graph)?);
        }

        if self.fuse {
            total.merge(&LinOpSequenceFusion.transform(graph)?);
            total.merge(&ConstantFolding.transform(graph)?);
            total.merge(&ConvolutionMultiplyFusion.transform(graph)?);
            total.merge(&GroupConvolutionMultiplyFusion.transform(graph)?);
        }

        total.merge(&ConstantFolding.transform(graph)?);
        info!(
            applied = total.transforms_applied,
            eliminated = total.nodes_eliminated,
            "common optimizations finished"
        );
        Ok(total)
    }
}
