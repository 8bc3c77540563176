//! Graph transformation module
//!
//! This module provides the rewrite-pass infrastructure shared by the
//! low-precision pipeline and the common optimizations:
//!
//! - [`GraphRewrite`]: one topological pass over registered matchers
//! - [`TransformationContext`]: the graph under rewrite plus registry queries
//! - [`fold`]: constant-folding primitives
//! - [`relaxed`]: the type-relaxation pass
//!
//! # Example
//!
//! ```ignore
//! use lpt_optimizer::transform::{GraphRewrite, TransformationContext};
//!
//! let mut pass = GraphRewrite::new("cleanup");
//! pass.add_matcher(pattern, &rule);
//! let stats = pass.run(&mut TransformationContext::new(&mut graph))?;
//! ```

pub mod context;
pub mod core;
pub mod fold;
pub mod relaxed;

// Re-export main types and functions
pub use context::TransformationContext;
pub use core::{GraphRewrite, RewriteRule, TransformConfig, TransformStats};
pub use fold::{
    constant_of, fold, fold_binary, fold_broadcast, fold_convert, fold_reshape, make_folded,
};
pub use relaxed::TypeRelaxedReplacer;
