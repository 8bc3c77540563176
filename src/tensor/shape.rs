//! Shape utilities for graph tensors
//!
//! Functions for working with static tensor shapes and dimensions.

use crate::error::{LptResult, TransformError};

/// Calculate total number of elements from shape
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Check if two shapes are broadcastable (numpy rules)
pub fn is_broadcastable(shape_a: &[usize], shape_b: &[usize]) -> bool {
    let len_a = shape_a.len();
    let len_b = shape_b.len();
    let max_len = len_a.max(len_b);

    for i in 0..max_len {
        // Index from the right (broadcasting aligns from trailing dimensions)
        let dim_a = if i < len_a { shape_a[len_a - 1 - i] } else { 1 };
        let dim_b = if i < len_b { shape_b[len_b - 1 - i] } else { 1 };

        if dim_a != dim_b && dim_a != 1 && dim_b != 1 {
            return false;
        }
    }
    true
}

/// Compute broadcast output shape
pub fn broadcast_shape(shape_a: &[usize], shape_b: &[usize]) -> LptResult<Vec<usize>> {
    if !is_broadcastable(shape_a, shape_b) {
        return Err(TransformError::ShapeInferenceFailed(format!(
            "Shapes {:?} and {:?} are not broadcastable",
            shape_a, shape_b
        )));
    }

    let len_a = shape_a.len();
    let len_b = shape_b.len();
    let max_len = len_a.max(len_b);
    let mut result = vec![0usize; max_len];

    for i in 0..max_len {
        let dim_a = if i < len_a { shape_a[len_a - 1 - i] } else { 1 };
        let dim_b = if i < len_b { shape_b[len_b - 1 - i] } else { 1 };
        result[max_len - 1 - i] = dim_a.max(dim_b);
    }

    Ok(result)
}

/// Check if `shape` broadcasts to exactly `target` without growing it
pub fn broadcasts_to(shape: &[usize], target: &[usize]) -> bool {
    shape.len() <= target.len()
        && broadcast_shape(shape, target).map_or(false, |s| s == target)
}

/// Normalize axis to positive index
pub fn normalize_axis(axis: i64, ndim: usize) -> LptResult<usize> {
    let ndim_i64 = ndim as i64;
    let normalized = if axis < 0 { axis + ndim_i64 } else { axis };

    if normalized < 0 || normalized >= ndim_i64 {
        return Err(TransformError::InvalidNode(format!(
            "Axis {} out of bounds for ndim {}",
            axis, ndim
        )));
    }

    Ok(normalized as usize)
}

/// Shape `[1, C, 1, ...]` of the given rank
///
/// Rank below 2 degrades to `[C]`.
pub fn channel_shape(rank: usize, channels: usize) -> Vec<usize> {
    if rank < 2 {
        return vec![channels];
    }
    let mut shape = vec![1; rank];
    shape[1] = channels;
    shape
}

/// True when the shape holds a single element
pub fn is_per_tensor(shape: &[usize]) -> bool {
    numel(shape) <= 1
}

/// True when every non-unit dimension of `shape` sits on axis 1
///
/// Shapes of rank below 2 only qualify when they are per-tensor.
pub fn is_per_channel(shape: &[usize]) -> bool {
    if is_per_tensor(shape) {
        return true;
    }
    shape.len() >= 2
        && shape
            .iter()
            .enumerate()
            .all(|(axis, &dim)| axis == 1 || dim == 1)
}
