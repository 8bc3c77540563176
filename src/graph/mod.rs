//! Graph manipulation module
//!
//! This module provides the core infrastructure for working with
//! computation graphs:
//!
//! - [`GraphContext`]: arena of nodes with stable [`NodeId`] handles
//! - [`maps`]: node storage types and map builders
//! - [`op`]: operation kinds, attributes and tensor types
//! - [`infer`]: output type and shape inference
//! - [`eval`]: reference evaluation
//!
//! # Example
//!
//! ```ignore
//! use lpt_optimizer::graph::{GraphContext, Op};
//! use lpt_optimizer::tensor::{Constant, ElementType};
//!
//! let mut ctx = GraphContext::new();
//! let x = ctx.add_parameter("x", ElementType::F32, vec![1, 3, 8, 8]);
//! let scale = ctx.add_constant(Constant::scalar(ElementType::F32, 0.5));
//! let mul = ctx.add_node(Op::Multiply, &[x, scale])?;
//! ctx.add_result(mul)?;
//!
//! // Traverse graph
//! let consumers = ctx.get_consumers(x);
//! if ctx.is_single_use(mul) {
//!     // Safe to move...
//! }
//! ```
//!
//! # Maps
//!
//! The context maintains several maps for O(1) lookups:
//!
//! | Map | Description |
//! |-----|-------------|
//! | `nodes` | handle → node (arena, detached slots are empty) |
//! | `consumer_map` | producer → consumer handles, one per edge |
//! | `name_map` | unique name → handle |

pub mod accessors;
pub mod context;
pub mod eval;
pub mod infer;
pub mod maps;
pub mod mutators;
pub mod op;

// Re-export main types
pub use context::GraphContext;
pub use eval::{evaluate, evaluate_node};
pub use infer::infer_output_type;
pub use maps::{ConsumerMap, NameMap, Node, NodeArena, NodeId, TypeRelaxed};
pub use op::{ConvolutionAttrs, DepthToSpaceMode, Op, OpKind, PoolAttrs, TensorType};
