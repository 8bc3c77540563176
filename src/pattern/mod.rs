//! Pattern matching module for low-precision graph rewriting
//!
//! This module provides tools for identifying subgraphs that a layer
//! transformation can rewrite.
//!
//! # Overview
//!
//! The pattern matching system works by:
//! 1. Describing a template rooted at the node being matched
//! 2. Constraining producers positionally, with optional labels
//! 3. Returning a label → handle mapping on success
//!
//! # Example
//!
//! ```ignore
//! use lpt_optimizer::graph::OpKind;
//! use lpt_optimizer::pattern::{Pattern, PatternMatcher};
//!
//! let pattern = Pattern::op(OpKind::Convolution).with_inputs([
//!     Pattern::op(OpKind::Multiply).label("dequantization"),
//!     Pattern::op(OpKind::FakeQuantize).label("weights"),
//! ]);
//!
//! let matcher = PatternMatcher::new(&ctx);
//! for m in matcher.find_all_matches(&pattern) {
//!     let weights = m.get("weights");
//! }
//! ```

pub mod matcher;
pub mod ops;

// Re-export main types
pub use matcher::{matcher, MatchResult, Pattern, PatternMatcher, PatternPredicate};
pub use ops::{is_precision_preserving_op, is_relaxed_op, PRECISION_PRESERVING_OPS, RELAXED_OPS};
