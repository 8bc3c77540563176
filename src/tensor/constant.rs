//! Constant tensor data
//!
//! Values are held as `ArrayD<f32>` tagged with the element type they
//! represent. Storing rounds every value to that type, so an `f16` constant
//! already carries half-precision values and an `i8` constant carries
//! saturated integers.

use ndarray::{ArrayD, IxDyn, Zip};

use crate::error::{LptResult, TransformError};

use super::dtype::ElementType;
use super::shape::{broadcast_shape, numel};

/// Typed constant tensor
#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    element_type: ElementType,
    values: ArrayD<f32>,
}

impl Constant {
    /// Create a constant, rounding the values to `element_type`
    pub fn new(element_type: ElementType, values: ArrayD<f32>) -> Self {
        let values = if element_type == ElementType::F32 {
            values
        } else {
            values.mapv(|v| element_type.round(v))
        };
        Self {
            element_type,
            values,
        }
    }

    /// Create from a flat vector; a single value fills the whole shape
    pub fn from_vec(
        element_type: ElementType,
        shape: &[usize],
        values: Vec<f32>,
    ) -> LptResult<Self> {
        let count = numel(shape);
        let values = if values.len() == 1 && count != 1 {
            vec![values[0]; count]
        } else {
            values
        };
        if values.len() != count {
            return Err(TransformError::InvalidConstant(format!(
                "{} values do not fill shape {:?}",
                values.len(),
                shape
            )));
        }
        let array = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Self::new(element_type, array))
    }

    /// Rank-0 constant
    pub fn scalar(element_type: ElementType, value: f32) -> Self {
        Self::new(element_type, ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// Constant of `shape` filled with `value`
    pub fn filled(element_type: ElementType, shape: &[usize], value: f32) -> Self {
        Self::new(element_type, ArrayD::from_elem(IxDyn(shape), value))
    }

    /// Element type
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Shape
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    /// Raw values
    pub fn values(&self) -> &ArrayD<f32> {
        &self.values
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for zero-element constants
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values in logical order
    pub fn to_vec(&self) -> Vec<f32> {
        self.values.iter().copied().collect()
    }

    /// Value at flat index; a single-element constant answers every index
    pub fn value_at(&self, index: usize) -> f32 {
        if self.values.len() == 1 {
            return self.values.iter().next().copied().unwrap_or_default();
        }
        self.values.iter().nth(index).copied().unwrap_or_default()
    }

    /// True when every element holds the same value
    pub fn is_scalar_like(&self) -> bool {
        let mut iter = self.values.iter();
        match iter.next() {
            Some(first) => iter.all(|v| v == first),
            None => false,
        }
    }

    /// The common value of a scalar-like constant
    pub fn scalar_value(&self) -> Option<f32> {
        if self.is_scalar_like() {
            self.values.iter().next().copied()
        } else {
            None
        }
    }

    /// Check a predicate on every element
    pub fn all(&self, predicate: impl Fn(f32) -> bool) -> bool {
        self.values.iter().all(|&v| predicate(v))
    }

    /// Broadcast to `shape` (numpy rules)
    pub fn broadcast_to(&self, shape: &[usize]) -> LptResult<Self> {
        let view = self.values.broadcast(IxDyn(shape)).ok_or_else(|| {
            TransformError::InvalidConstant(format!(
                "cannot broadcast {:?} to {:?}",
                self.shape(),
                shape
            ))
        })?;
        Ok(Self {
            element_type: self.element_type,
            values: view.to_owned(),
        })
    }

    /// Reinterpret the values under a new shape with the same element count
    pub fn reshape(&self, shape: &[usize]) -> LptResult<Self> {
        Self::from_vec(self.element_type, shape, self.to_vec()).and_then(|c| {
            if numel(shape) == self.len() {
                Ok(c)
            } else {
                Err(TransformError::InvalidConstant(format!(
                    "cannot reshape {:?} to {:?}",
                    self.shape(),
                    shape
                )))
            }
        })
    }

    /// Convert to another element type
    pub fn convert(&self, element_type: ElementType) -> Self {
        Self::new(element_type, self.values.clone())
    }

    /// Apply `f` elementwise, keeping the element type
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self::new(self.element_type, self.values.mapv(f))
    }

    /// Combine with `other` elementwise under broadcasting
    pub fn zip_with(
        &self,
        other: &Constant,
        element_type: ElementType,
        f: impl Fn(f32, f32) -> f32,
    ) -> LptResult<Self> {
        let shape = broadcast_shape(self.shape(), other.shape())?;
        let lhs = self.broadcast_to(&shape)?;
        let rhs = other.broadcast_to(&shape)?;
        let values = Zip::from(&lhs.values)
            .and(&rhs.values)
            .map_collect(|&a, &b| f(a, b));
        Ok(Self::new(element_type, values))
    }

    /// Read the values as integer dimensions (for shape operands)
    pub fn as_dims(&self) -> Vec<i64> {
        self.values.iter().map(|&v| v as i64).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_fills_single_value() {
        let c = Constant::from_vec(ElementType::F32, &[1, 3, 1, 1], vec![0.5]).unwrap();
        assert_eq!(c.to_vec(), vec![0.5, 0.5, 0.5]);
        assert!(c.is_scalar_like());
        assert_eq!(c.scalar_value(), Some(0.5));
    }

    #[test]
    fn test_from_vec_rejects_bad_count() {
        assert!(Constant::from_vec(ElementType::F32, &[2, 2], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn test_rounding_on_construction() {
        let c = Constant::from_vec(ElementType::I8, &[3], vec![-200.0, 1.4, 126.6]).unwrap();
        assert_eq!(c.to_vec(), vec![-128.0, 1.0, 127.0]);
        let h = Constant::scalar(ElementType::F16, 82.97619);
        assert_eq!(h.to_vec(), vec![83.0]);
    }

    #[test]
    fn test_broadcast_and_reshape() {
        let c = Constant::scalar(ElementType::F32, 2.0);
        let b = c.broadcast_to(&[1, 3, 1, 1]).unwrap();
        assert_eq!(b.shape(), &[1, 3, 1, 1]);
        let r = b.reshape(&[3, 1, 1]).unwrap();
        assert_eq!(r.shape(), &[3, 1, 1]);
        assert!(r.reshape(&[2]).is_err());
    }

    #[test]
    fn test_zip_with_broadcasts() {
        let a = Constant::from_vec(ElementType::F32, &[3, 1, 1], vec![1.0, 2.0, 3.0]).unwrap();
        let b = Constant::scalar(ElementType::F32, 0.5);
        let c = a.zip_with(&b, ElementType::F32, |x, y| x * y).unwrap();
        assert_eq!(c.shape(), &[3, 1, 1]);
        assert_eq!(c.to_vec(), vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_value_at() {
        let a = Constant::from_vec(ElementType::F32, &[3], vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(a.value_at(2), 3.0);
        let s = Constant::scalar(ElementType::F32, 7.0);
        assert_eq!(s.value_at(5), 7.0);
    }
}
