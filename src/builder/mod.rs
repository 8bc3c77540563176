//! Graph assembly helpers
//!
//! - [`GraphBuilder`]: fluent construction of a [`GraphContext`](crate::graph::GraphContext)
//! - [`FakeQuantizeOnData`]: description of a fake-quantize on a data path
//! - [`DequantizationOperations`]: description of a `Convert`/`Subtract`/`Multiply` chain
//!
//! # Example
//!
//! ```ignore
//! use lpt_optimizer::builder::{DequantizationOperations, FakeQuantizeOnData, GraphBuilder};
//!
//! let mut builder = GraphBuilder::new();
//! let x = builder.parameter("x", ElementType::U8, vec![1, 3, 4, 4]);
//! let deq = builder.dequantization(
//!     x,
//!     &DequantizationOperations::new()
//!         .convert(ElementType::F32)
//!         .subtract(128.0)
//!         .multiply(0.02),
//! )?;
//! let relu = builder.relaxed(Op::Relu, &[deq], None)?;
//! builder.result(relu)?;
//! let graph = builder.build()?;
//! ```

/// Fluent graph builder
pub mod graph_builder;
/// Fake-quantize and dequantization descriptors
pub mod subgraph;

pub use graph_builder::GraphBuilder;
pub use subgraph::{
    make_dequantization, make_fake_quantize, DequantizationOperations, DequantizationValues,
    FakeQuantizeOnData,
};
