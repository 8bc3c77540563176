//! Low-precision transformation engine
//!
//! Fake-quantize operations are decomposed into an integer-producing
//! fake-quantize followed by a dequantization chain
//! (`Convert -> Subtract -> Multiply`), and the chains are then moved down
//! past every layer that can run on the integer values:
//!
//! - [`dequantization`]: extraction of a chain from a node input
//! - [`quantization_details`]: interval details and precision selection
//! - [`network_helper`]: graph helpers shared by the transformations
//! - [`layer_transformation`]: the per-operation interface and shared checks
//! - [`registry`]: transformations keyed by operation kind
//! - [`transformer`]: the phase-ordered orchestrator
//!
//! # Example
//!
//! ```ignore
//! use lpt_optimizer::low_precision::{LowPrecisionTransformer, Params};
//!
//! let transformer = LowPrecisionTransformer::with_params(Params::u8_i8());
//! let stats = transformer.run(&mut graph)?;
//! ```

pub mod dequantization;
pub mod layer_transformation;
pub mod network_helper;
pub mod params;
pub mod quantization_details;
pub mod registry;
pub mod transformer;

pub use dequantization::FakeQuantizeDequantization;
pub use layer_transformation::LayerTransformation;
pub use params::{Params, QuantizedTensorAlignment};
pub use quantization_details::{get_data_precision, DataPrecision, QuantizationDetails};
pub use registry::LowPrecisionTransformations;
pub use transformer::{
    LowPrecisionStats, LowPrecisionTransformer, Phase, PhaseInvariant, PhaseReport,
};
