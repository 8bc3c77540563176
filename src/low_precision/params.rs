//! Transformation parameters
//!
//! One immutable [`Params`] value is shared by every transformation of a
//! registry. Reconfiguring means building a new value and a new registry.

use crate::tensor::ElementType;

/// How fake-quantize intervals are aligned when several must agree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantizedTensorAlignment {
    /// Keep levels; only lower precision when every step is integral
    None,
    /// Recompute levels so each quantization step stays one integer unit
    UpdateLevel,
}

/// Immutable configuration shared by all transformations in a run
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    /// Assign integer element types to rewritten nodes
    pub update_precisions: bool,
    /// Alignment policy for activations
    pub quantized_tensor_alignment_on_activations: QuantizedTensorAlignment,
    /// Alignment policy for weights
    pub quantized_tensor_alignment_on_weights: QuantizedTensorAlignment,
    /// Allow zero points
    pub support_asymmetric_quantization: bool,
    /// Allowed activation precisions, in preference order
    pub precisions_on_activations: Vec<ElementType>,
    /// Allowed weight precisions, in preference order
    pub precisions_on_weights: Vec<ElementType>,
    /// Quantize fake-quantizes that feed only graph outputs
    pub quantize_outputs: bool,
    /// Fold weight fake-quantizes into quantized constants
    pub weights_to_const: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            update_precisions: true,
            quantized_tensor_alignment_on_activations: QuantizedTensorAlignment::UpdateLevel,
            quantized_tensor_alignment_on_weights: QuantizedTensorAlignment::None,
            support_asymmetric_quantization: true,
            precisions_on_activations: vec![ElementType::U8, ElementType::I8],
            precisions_on_weights: vec![ElementType::I8],
            quantize_outputs: true,
            weights_to_const: true,
        }
    }
}

impl Params {
    /// Unsigned activations, signed weights
    pub fn u8_i8() -> Self {
        Self {
            precisions_on_activations: vec![ElementType::U8],
            precisions_on_weights: vec![ElementType::I8],
            ..Self::default()
        }
    }

    /// Signed activations and weights
    pub fn i8_i8() -> Self {
        Self {
            precisions_on_activations: vec![ElementType::I8],
            precisions_on_weights: vec![ElementType::I8],
            ..Self::default()
        }
    }

    /// Unsigned activations and weights
    pub fn u8_u8() -> Self {
        Self {
            precisions_on_activations: vec![ElementType::U8],
            precisions_on_weights: vec![ElementType::U8],
            ..Self::default()
        }
    }

    /// Set `update_precisions`
    pub fn with_update_precisions(mut self, value: bool) -> Self {
        self.update_precisions = value;
        self
    }

    /// Set `quantized_tensor_alignment_on_activations`
    pub fn with_quantized_tensor_alignment_on_activations(
        mut self,
        value: QuantizedTensorAlignment,
    ) -> Self {
        self.quantized_tensor_alignment_on_activations = value;
        self
    }

    /// Set `quantized_tensor_alignment_on_weights`
    pub fn with_quantized_tensor_alignment_on_weights(
        mut self,
        value: QuantizedTensorAlignment,
    ) -> Self {
        self.quantized_tensor_alignment_on_weights = value;
        self
    }

    /// Set `support_asymmetric_quantization`
    pub fn with_support_asymmetric_quantization(mut self, value: bool) -> Self {
        self.support_asymmetric_quantization = value;
        self
    }

    /// Set `precisions_on_activations`
    pub fn with_precisions_on_activations(mut self, value: Vec<ElementType>) -> Self {
        self.precisions_on_activations = value;
        self
    }

    /// Set `precisions_on_weights`
    pub fn with_precisions_on_weights(mut self, value: Vec<ElementType>) -> Self {
        self.precisions_on_weights = value;
        self
    }

    /// Set `quantize_outputs`
    pub fn with_quantize_outputs(mut self, value: bool) -> Self {
        self.quantize_outputs = value;
        self
    }

    /// Set `weights_to_const`
    pub fn with_weights_to_const(mut self, value: bool) -> Self {
        self.weights_to_const = value;
        self
    }
}
