//! Low-precision layer transformations
//!
//! One transformation per operation kind. Each implements
//! [`LayerTransformation`]; the closed [`Transformation`] enum wraps them so
//! a registry can hold a heterogeneous set and register their matchers in a
//! rewrite pass.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lpt_optimizer::low_precision::Params;
//! use lpt_optimizer::transform::{GraphRewrite, TransformationContext};
//! use lpt_optimizer::transformers::{ReluTransformation, Transformation};
//!
//! let relu = Transformation::from(ReluTransformation::new(Arc::new(Params::default())));
//! let mut pass = GraphRewrite::new("main");
//! relu.register_matcher_in(&mut pass);
//! pass.run(&mut TransformationContext::new(&mut graph))?;
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId};
use crate::low_precision::{LayerTransformation, Params};
use crate::pattern::{MatchResult, Pattern};
use crate::transform::{GraphRewrite, RewriteRule, TransformationContext};

/// Add
pub mod add;
/// AvgPool
pub mod avg_pool;
/// Concat over the union interval
pub mod concat;
/// Concat with per-channel dequantization
pub mod concat_multi_channels;
/// Integer-to-float Convert
pub mod convert;
/// Convolution
pub mod convolution;
/// DepthToSpace
pub mod depth_to_space;
/// Fake-quantize decomposition
pub mod fake_quantize;
/// Fold dequantization into fake-quantize thresholds
pub mod fuse_fake_quantize;
/// GroupConvolution
pub mod group_convolution;
/// MatMul
pub mod mat_mul;
/// MaxPool
pub mod max_pool;
/// Multiply folding
pub mod multiply;
/// Relu
pub mod relu;
/// Reshape
pub mod reshape;
/// Subtract-multiply to multiply-add
pub mod subtract_multiply_to_multiply_add;
pub(crate) mod weightable;

pub use add::AddTransformation;
pub use avg_pool::AvgPoolTransformation;
pub use concat::ConcatTransformation;
pub use concat_multi_channels::ConcatMultiChannelsTransformation;
pub use convert::ConvertTransformation;
pub use convolution::ConvolutionTransformation;
pub use depth_to_space::DepthToSpaceTransformation;
pub use fake_quantize::FakeQuantizeTransformation;
pub use fuse_fake_quantize::FuseFakeQuantizeTransformation;
pub use group_convolution::GroupConvolutionTransformation;
pub use mat_mul::MatMulTransformation;
pub use max_pool::MaxPoolTransformation;
pub use multiply::MultiplyTransformation;
pub use relu::ReluTransformation;
pub use reshape::ReshapeTransformation;
pub use subtract_multiply_to_multiply_add::SubtractMultiplyToMultiplyAddTransformation;

macro_rules! transformations {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        /// Every layer transformation, as one closed set
        #[derive(Debug, Clone)]
        pub enum Transformation {
            $(
                #[allow(missing_docs)]
                $variant($ty),
            )*
        }

        impl Transformation {
            fn inner(&self) -> &dyn LayerTransformation {
                match self {
                    $(Self::$variant(t) => t as &dyn LayerTransformation,)*
                }
            }

            /// Same transformation built over other parameters
            pub fn rebuild(&self, params: Arc<Params>) -> Self {
                match self {
                    $(Self::$variant(_) => Self::$variant(<$ty>::new(params)),)*
                }
            }
        }

        $(
            impl From<$ty> for Transformation {
                fn from(transformation: $ty) -> Self {
                    Self::$variant(transformation)
                }
            }
        )*
    };
}

transformations! {
    Add(AddTransformation),
    AvgPool(AvgPoolTransformation),
    Concat(ConcatTransformation),
    ConcatMultiChannels(ConcatMultiChannelsTransformation),
    Convert(ConvertTransformation),
    Convolution(ConvolutionTransformation),
    DepthToSpace(DepthToSpaceTransformation),
    FakeQuantize(FakeQuantizeTransformation),
    FuseFakeQuantize(FuseFakeQuantizeTransformation),
    GroupConvolution(GroupConvolutionTransformation),
    MatMul(MatMulTransformation),
    MaxPool(MaxPoolTransformation),
    Multiply(MultiplyTransformation),
    Relu(ReluTransformation),
    Reshape(ReshapeTransformation),
    SubtractMultiplyToMultiplyAdd(SubtractMultiplyToMultiplyAddTransformation),
}

impl Transformation {
    /// Name used in logs
    pub fn name(&self) -> &'static str {
        self.inner().name()
    }

    /// Parameters the transformation was built with
    pub fn params(&self) -> &Arc<Params> {
        self.inner().params()
    }

    /// Patterns the transformation matches
    pub fn patterns(&self) -> Vec<Pattern> {
        self.inner().patterns()
    }

    /// Register every pattern of the transformation in a pass
    pub fn register_matcher_in<'r>(&'r self, pass: &mut GraphRewrite<'r>) {
        for pattern in self.patterns() {
            pass.add_matcher(pattern, self);
        }
    }

    /// Eligibility gate; never mutates
    pub fn can_be_transformed(&self, ctx: &TransformationContext<'_>, node: NodeId) -> bool {
        self.inner().can_be_transformed(ctx, node)
    }

    /// Check if the operation passes its input precision through unchanged
    pub fn is_precision_preserved(&self, graph: &GraphContext, node: NodeId) -> bool {
        self.inner().is_precision_preserved(graph, node)
    }

    /// Check if the inputs of `node` carry a lowerable dequantization
    pub fn is_quantized(&self, graph: &GraphContext, node: NodeId) -> bool {
        self.inner().is_quantized(graph, node)
    }
}

impl RewriteRule for Transformation {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn apply(&self, ctx: &mut TransformationContext<'_>, m: &MatchResult) -> LptResult<bool> {
        let friendly_name = ctx
            .graph
            .get_node(m.root())
            .map(|n| n.friendly_name.clone())
            .unwrap_or_default();
        let applied = self.inner().transform(ctx, m)?;
        if applied {
            debug!(transformation = self.name(), node = %friendly_name, "transformed");
        }
        Ok(applied)
    }
}
