//! Tensor utilities for graph values
//!
//! This module provides utilities for working with graph tensors:
//! - Element types and their numeric ranges (`dtype`)
//! - Shape utilities (`shape`)
//! - Typed constant data backed by ndarray (`constant`)
//!
//! # Example
//!
//! ```ignore
//! use lpt_optimizer::tensor::{Constant, ElementType};
//!
//! let scale = Constant::from_vec(ElementType::F32, &[1, 3, 1, 1], vec![0.1, 0.2, 0.3])?;
//! let zero_point = Constant::scalar(ElementType::F32, 128.0);
//! let bias = scale.zip_with(&zero_point, ElementType::F32, |s, z| -s * z)?;
//! ```

pub mod constant;
pub mod dtype;
pub mod shape;

// Re-export commonly used items
pub use constant::Constant;
pub use dtype::ElementType;
pub use shape::{
    broadcast_shape, broadcasts_to, channel_shape, is_broadcastable, is_per_channel,
    is_per_tensor, normalize_axis, numel,
};
