//! Element types carried by graph tensors
//!
//! Maps each element type to its numeric range and the rounding applied when
//! a real value is stored in it.

use std::fmt;

use crate::error::{LptResult, TransformError};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementType {
    /// Boolean
    Boolean,
    /// IEEE half precision
    F16,
    /// IEEE single precision
    F32,
    /// Signed 8-bit integer
    I8,
    /// Unsigned 8-bit integer
    U8,
    /// Signed 32-bit integer
    I32,
    /// Signed 64-bit integer
    I64,
}

impl ElementType {
    /// Short lowercase name, e.g. `u8`
    pub fn name(self) -> &'static str {
        match self {
            ElementType::Boolean => "boolean",
            ElementType::F16 => "f16",
            ElementType::F32 => "f32",
            ElementType::I8 => "i8",
            ElementType::U8 => "u8",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
        }
    }

    /// Parse a short name back into an element type
    pub fn from_name(name: &str) -> LptResult<Self> {
        match name {
            "boolean" => Ok(ElementType::Boolean),
            "f16" => Ok(ElementType::F16),
            "f32" => Ok(ElementType::F32),
            "i8" => Ok(ElementType::I8),
            "u8" => Ok(ElementType::U8),
            "i32" => Ok(ElementType::I32),
            "i64" => Ok(ElementType::I64),
            other => Err(TransformError::TypeMismatch(format!(
                "unknown element type '{}'",
                other
            ))),
        }
    }

    /// Size in bytes
    pub fn size(self) -> usize {
        match self {
            ElementType::Boolean | ElementType::I8 | ElementType::U8 => 1,
            ElementType::F16 => 2,
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::I64 => 8,
        }
    }

    /// Bit width
    pub fn bitwidth(self) -> usize {
        self.size() * 8
    }

    /// Check if floating point
    pub fn is_real(self) -> bool {
        matches!(self, ElementType::F16 | ElementType::F32)
    }

    /// Check if integer
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            ElementType::I8 | ElementType::U8 | ElementType::I32 | ElementType::I64
        )
    }

    /// Check if signed
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ElementType::F16
                | ElementType::F32
                | ElementType::I8
                | ElementType::I32
                | ElementType::I64
        )
    }

    /// Smallest representable value
    pub fn min_value(self) -> f64 {
        match self {
            ElementType::Boolean | ElementType::U8 => 0.0,
            ElementType::I8 => i8::MIN as f64,
            ElementType::I32 => i32::MIN as f64,
            ElementType::I64 => i64::MIN as f64,
            ElementType::F16 => half::f16::MIN.to_f64(),
            ElementType::F32 => f32::MIN as f64,
        }
    }

    /// Largest representable value
    pub fn max_value(self) -> f64 {
        match self {
            ElementType::Boolean => 1.0,
            ElementType::U8 => u8::MAX as f64,
            ElementType::I8 => i8::MAX as f64,
            ElementType::I32 => i32::MAX as f64,
            ElementType::I64 => i64::MAX as f64,
            ElementType::F16 => half::f16::MAX.to_f64(),
            ElementType::F32 => f32::MAX as f64,
        }
    }

    /// Round a real value to what this element type can hold
    ///
    /// Integers round half away from zero and saturate.
    pub fn round(self, value: f32) -> f32 {
        match self {
            ElementType::F32 => value,
            ElementType::F16 => half::f16::from_f32(value).to_f32(),
            ElementType::Boolean => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            _ => {
                let rounded = value.round() as f64;
                rounded.clamp(self.min_value(), self.max_value()) as f32
            }
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
