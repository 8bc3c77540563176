//! Operation kinds and their attributes

use std::fmt;

use crate::tensor::{Constant, ElementType};

/// Operation kind, used as the key for transformation lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    /// Graph input
    Parameter,
    /// Constant tensor
    Constant,
    /// Graph output
    Result,
    /// Element type conversion
    Convert,
    /// Elementwise addition
    Add,
    /// Elementwise subtraction
    Subtract,
    /// Elementwise multiplication
    Multiply,
    /// Elementwise division
    Divide,
    /// Elementwise power
    Power,
    /// Elementwise negation
    Negative,
    /// Simulated quantization
    FakeQuantize,
    /// 2D convolution, NCHW data and OIHW weights
    Convolution,
    /// Grouped 2D convolution, GOIHW weights
    GroupConvolution,
    /// Matrix multiplication
    MatMul,
    /// Average pooling
    AvgPool,
    /// Max pooling
    MaxPool,
    /// Rectified linear unit
    Relu,
    /// Concatenation
    Concat,
    /// Reshape with a constant target shape
    Reshape,
    /// Depth to space rearrangement
    DepthToSpace,
    /// Inference-mode batch normalization
    BatchNormInference,
}

impl OpKind {
    /// Every kind, in declaration order
    pub const ALL: [OpKind; 21] = [
        OpKind::Parameter,
        OpKind::Constant,
        OpKind::Result,
        OpKind::Convert,
        OpKind::Add,
        OpKind::Subtract,
        OpKind::Multiply,
        OpKind::Divide,
        OpKind::Power,
        OpKind::Negative,
        OpKind::FakeQuantize,
        OpKind::Convolution,
        OpKind::GroupConvolution,
        OpKind::MatMul,
        OpKind::AvgPool,
        OpKind::MaxPool,
        OpKind::Relu,
        OpKind::Concat,
        OpKind::Reshape,
        OpKind::DepthToSpace,
        OpKind::BatchNormInference,
    ];

    /// Operation type name
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Parameter => "Parameter",
            OpKind::Constant => "Constant",
            OpKind::Result => "Result",
            OpKind::Convert => "Convert",
            OpKind::Add => "Add",
            OpKind::Subtract => "Subtract",
            OpKind::Multiply => "Multiply",
            OpKind::Divide => "Divide",
            OpKind::Power => "Power",
            OpKind::Negative => "Negative",
            OpKind::FakeQuantize => "FakeQuantize",
            OpKind::Convolution => "Convolution",
            OpKind::GroupConvolution => "GroupConvolution",
            OpKind::MatMul => "MatMul",
            OpKind::AvgPool => "AvgPool",
            OpKind::MaxPool => "MaxPool",
            OpKind::Relu => "Relu",
            OpKind::Concat => "Concat",
            OpKind::Reshape => "Reshape",
            OpKind::DepthToSpace => "DepthToSpace",
            OpKind::BatchNormInference => "BatchNormInference",
        }
    }

    /// Look a kind up by its type name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// Number of inputs the operation takes
    pub fn arity(self) -> usize {
        match self {
            OpKind::Parameter | OpKind::Constant => 0,
            OpKind::Result
            | OpKind::Convert
            | OpKind::Negative
            | OpKind::AvgPool
            | OpKind::MaxPool
            | OpKind::Relu
            | OpKind::DepthToSpace => 1,
            OpKind::Add
            | OpKind::Subtract
            | OpKind::Multiply
            | OpKind::Divide
            | OpKind::Power
            | OpKind::Convolution
            | OpKind::GroupConvolution
            | OpKind::MatMul
            | OpKind::Reshape => 2,
            OpKind::FakeQuantize | OpKind::BatchNormInference => 5,
            // variadic
            OpKind::Concat => 0,
        }
    }

    /// Elementwise binary arithmetic
    pub fn is_binary_elementwise(self) -> bool {
        matches!(
            self,
            OpKind::Add | OpKind::Subtract | OpKind::Multiply | OpKind::Divide | OpKind::Power
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Convolution attributes for the two spatial axes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvolutionAttrs {
    /// Strides
    pub strides: [usize; 2],
    /// Padding at the start of each spatial axis
    pub pads_begin: [usize; 2],
    /// Padding at the end of each spatial axis
    pub pads_end: [usize; 2],
    /// Dilations
    pub dilations: [usize; 2],
}

impl Default for ConvolutionAttrs {
    fn default() -> Self {
        Self {
            strides: [1, 1],
            pads_begin: [0, 0],
            pads_end: [0, 0],
            dilations: [1, 1],
        }
    }
}

/// Pooling attributes for the two spatial axes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAttrs {
    /// Kernel size
    pub kernel: [usize; 2],
    /// Strides
    pub strides: [usize; 2],
    /// Padding at the start of each spatial axis
    pub pads_begin: [usize; 2],
    /// Padding at the end of each spatial axis
    pub pads_end: [usize; 2],
    /// Average pooling ignores padded cells when dividing
    pub exclude_pad: bool,
}

impl PoolAttrs {
    /// Square kernel with stride equal to the kernel and no padding
    pub fn square(size: usize) -> Self {
        Self {
            kernel: [size, size],
            strides: [size, size],
            pads_begin: [0, 0],
            pads_end: [0, 0],
            exclude_pad: true,
        }
    }
}

/// Element ordering of DepthToSpace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthToSpaceMode {
    /// Depth is split as `[block, block, C']`
    BlocksFirst,
    /// Depth is split as `[C', block, block]`
    DepthFirst,
}

/// Operation with its attributes
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Graph input
    Parameter,
    /// Constant tensor
    Constant(Constant),
    /// Graph output
    Result,
    /// Element type conversion
    Convert {
        /// Target element type
        destination: ElementType,
    },
    /// Elementwise addition
    Add,
    /// Elementwise subtraction
    Subtract,
    /// Elementwise multiplication
    Multiply,
    /// Elementwise division
    Divide,
    /// Elementwise power
    Power,
    /// Elementwise negation
    Negative,
    /// Simulated quantization: data, input low/high, output low/high
    FakeQuantize {
        /// Number of quantization levels
        levels: usize,
    },
    /// 2D convolution
    Convolution(ConvolutionAttrs),
    /// Grouped 2D convolution
    GroupConvolution(ConvolutionAttrs),
    /// Matrix multiplication
    MatMul {
        /// Transpose the last two axes of the first input
        transpose_a: bool,
        /// Transpose the last two axes of the second input
        transpose_b: bool,
    },
    /// Average pooling
    AvgPool(PoolAttrs),
    /// Max pooling
    MaxPool(PoolAttrs),
    /// Rectified linear unit
    Relu,
    /// Concatenation
    Concat {
        /// Concatenation axis, negative counts from the end
        axis: i64,
    },
    /// Reshape; the second input is a constant target shape
    Reshape {
        /// A zero in the target copies the input dimension
        special_zero: bool,
    },
    /// Depth to space rearrangement
    DepthToSpace {
        /// Spatial block size
        block_size: usize,
        /// Element ordering
        mode: DepthToSpaceMode,
    },
    /// Batch normalization: data, gamma, beta, mean, variance
    BatchNormInference {
        /// Added to the variance
        epsilon: f32,
    },
}

impl Op {
    /// Operation kind
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Parameter => OpKind::Parameter,
            Op::Constant(_) => OpKind::Constant,
            Op::Result => OpKind::Result,
            Op::Convert { .. } => OpKind::Convert,
            Op::Add => OpKind::Add,
            Op::Subtract => OpKind::Subtract,
            Op::Multiply => OpKind::Multiply,
            Op::Divide => OpKind::Divide,
            Op::Power => OpKind::Power,
            Op::Negative => OpKind::Negative,
            Op::FakeQuantize { .. } => OpKind::FakeQuantize,
            Op::Convolution(_) => OpKind::Convolution,
            Op::GroupConvolution(_) => OpKind::GroupConvolution,
            Op::MatMul { .. } => OpKind::MatMul,
            Op::AvgPool(_) => OpKind::AvgPool,
            Op::MaxPool(_) => OpKind::MaxPool,
            Op::Relu => OpKind::Relu,
            Op::Concat { .. } => OpKind::Concat,
            Op::Reshape { .. } => OpKind::Reshape,
            Op::DepthToSpace { .. } => OpKind::DepthToSpace,
            Op::BatchNormInference { .. } => OpKind::BatchNormInference,
        }
    }

    /// Constant payload, if any
    pub fn as_constant(&self) -> Option<&Constant> {
        match self {
            Op::Constant(c) => Some(c),
            _ => None,
        }
    }
}

/// Element type and static shape of a node output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorType {
    /// Element type
    pub element_type: ElementType,
    /// Static shape
    pub shape: Vec<usize>,
}

impl TensorType {
    /// Create a tensor type
    pub fn new(element_type: ElementType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            element_type,
            shape: shape.into(),
        }
    }

    /// Rank
    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.element_type, self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in OpKind::ALL {
            assert_eq!(OpKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(OpKind::from_name("Gemm"), None);
    }

    #[test]
    fn test_op_kind() {
        assert_eq!(Op::FakeQuantize { levels: 256 }.kind(), OpKind::FakeQuantize);
        assert_eq!(
            Op::Convolution(ConvolutionAttrs::default()).kind(),
            OpKind::Convolution
        );
        assert_eq!(OpKind::FakeQuantize.arity(), 5);
        assert!(OpKind::Subtract.is_binary_elementwise());
        assert!(!OpKind::Relu.is_binary_elementwise());
    }
}
