//! Error types for lpt-optimizer
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Main error type for graph transformation operations
#[derive(Error, Debug)]
pub enum TransformError {
    /// Pattern matching failed
    #[error("Pattern matching failed: {0}")]
    PatternNotMatched(String),

    /// Node handle does not refer to a live node
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Invalid node configuration
    #[error("Invalid node: {0}")]
    InvalidNode(String),

    /// A transformation the pipeline depends on is not registered
    #[error("Missing required transformation: {0}")]
    MissingTransformation(String),

    /// Element types disagree on a node that is not type-relaxed
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Shape inference failed
    #[error("Shape inference failed: {0}")]
    ShapeInferenceFailed(String),

    /// Constant data does not fit the requested shape or type
    #[error("Invalid constant: {0}")]
    InvalidConstant(String),

    /// Operation kind is not handled by the caller
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Reference evaluation failed
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// A matched subgraph is not in the shape its rule expects
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// ndarray shape error
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for transformation operations
pub type LptResult<T> = Result<T, TransformError>;
