//! Common low-precision operation patterns
//!
//! Operation-kind groups and pre-built templates shared by the layer
//! transformations.

use crate::graph::OpKind;

use super::matcher::Pattern;

/// Kinds wrapped in the type-relaxation decorator before rewriting
pub const RELAXED_OPS: &[OpKind] = &[
    OpKind::AvgPool,
    OpKind::Concat,
    OpKind::Convolution,
    OpKind::FakeQuantize,
    OpKind::GroupConvolution,
    OpKind::Relu,
    OpKind::MaxPool,
    OpKind::Add,
    OpKind::Subtract,
    OpKind::Multiply,
    OpKind::MatMul,
];

/// Operations whose output precision equals their input precision
pub const PRECISION_PRESERVING_OPS: &[OpKind] = &[
    OpKind::MaxPool,
    OpKind::Relu,
    OpKind::Concat,
    OpKind::Reshape,
    OpKind::DepthToSpace,
];

/// Check if a kind is wrapped by the type-relaxation phase
pub fn is_relaxed_op(kind: OpKind) -> bool {
    RELAXED_OPS.contains(&kind)
}

/// Check if a kind propagates its input precision unchanged
pub fn is_precision_preserving_op(kind: OpKind) -> bool {
    PRECISION_PRESERVING_OPS.contains(&kind)
}

// ============================================================================
// Pre-built templates
// ============================================================================

/// `kind(data, Constant)` with the data bound as `data` and the constant as `constant`
pub fn binary_with_constant(kind: OpKind) -> Pattern {
    Pattern::op(kind).with_inputs([
        Pattern::any().label("data"),
        Pattern::constant().label("constant"),
    ])
}

/// Fake-quantize whose four range inputs are constants
///
/// Binds `data`, `input_low`, `input_high`, `output_low`, `output_high`.
pub fn fake_quantize_with_constant_ranges() -> Pattern {
    Pattern::op(OpKind::FakeQuantize).with_inputs([
        Pattern::any().label("data"),
        Pattern::constant().label("input_low"),
        Pattern::constant().label("input_high"),
        Pattern::constant().label("output_low"),
        Pattern::constant().label("output_high"),
    ])
}

/// Single-input operation of `kind` fed by a dequantization multiply
///
/// Binds `multiply`.
pub fn unary_after_dequantization(kind: OpKind) -> Pattern {
    Pattern::op(kind).with_inputs([Pattern::op(OpKind::Multiply).label("multiply")])
}
