//! Fluent graph builder

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op};
use crate::tensor::{Constant, ElementType};

use super::subgraph::{make_dequantization, make_fake_quantize, DequantizationOperations, FakeQuantizeOnData};

/// Builder over a fresh [`GraphContext`]
///
/// Node-adding methods return the new handle so branches can be wired by
/// hand; [`build`](Self::build) re-infers every type before handing the
/// graph out.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: GraphContext,
}

impl GraphBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a graph input
    pub fn parameter(&mut self, name: &str, element_type: ElementType, shape: Vec<usize>) -> NodeId {
        self.graph.add_parameter(name, element_type, shape)
    }

    /// Add a constant
    pub fn constant(&mut self, constant: Constant) -> NodeId {
        self.graph.add_constant(constant)
    }

    /// Add a constant from flat values
    pub fn constant_values(
        &mut self,
        element_type: ElementType,
        shape: &[usize],
        values: Vec<f32>,
    ) -> LptResult<NodeId> {
        let constant = Constant::from_vec(element_type, shape, values)?;
        Ok(self.graph.add_constant(constant))
    }

    /// Add an operation
    pub fn node(&mut self, op: Op, inputs: &[NodeId]) -> LptResult<NodeId> {
        self.graph.add_node(op, inputs)
    }

    /// Add a type-relaxed operation
    pub fn relaxed(
        &mut self,
        op: Op,
        inputs: &[NodeId],
        output_type: Option<ElementType>,
    ) -> LptResult<NodeId> {
        self.graph.add_relaxed_node(op, inputs, output_type)
    }

    /// Add a fake-quantize behind `data`
    pub fn fake_quantize(&mut self, data: NodeId, fq: &FakeQuantizeOnData) -> LptResult<NodeId> {
        make_fake_quantize(&mut self.graph, data, fq)
    }

    /// Add a dequantization chain behind `data`
    pub fn dequantization(
        &mut self,
        data: NodeId,
        operations: &DequantizationOperations,
    ) -> LptResult<NodeId> {
        make_dequantization(&mut self.graph, data, operations)
    }

    /// Name a node
    pub fn named(&mut self, id: NodeId, friendly_name: &str) -> LptResult<NodeId> {
        self.graph.set_friendly_name(id, friendly_name)?;
        Ok(id)
    }

    /// Add a graph output
    pub fn result(&mut self, input: NodeId) -> LptResult<NodeId> {
        self.graph.add_result(input)
    }

    /// Graph under construction
    pub fn graph(&self) -> &GraphContext {
        &self.graph
    }

    /// Finish: validate and return the graph
    pub fn build(mut self) -> LptResult<GraphContext> {
        self.graph.validate_and_infer_types()?;
        Ok(self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{evaluate, ConvolutionAttrs, OpKind};
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_build_quantized_convolution() {
        let mut builder = GraphBuilder::new();
        let x = builder.parameter("x", ElementType::F32, vec![1, 2, 3, 3]);
        let fq = builder.fake_quantize(x, &FakeQuantizeOnData::new(256, 0.0, 2.55)).unwrap();
        let w = builder
            .constant_values(ElementType::F32, &[1, 2, 1, 1], vec![0.5, -0.5])
            .unwrap();
        let conv = builder
            .node(Op::Convolution(ConvolutionAttrs::default()), &[fq, w])
            .unwrap();
        let conv = builder.named(conv, "conv").unwrap();
        builder.result(conv).unwrap();
        let graph = builder.build().unwrap();

        assert_eq!(graph.find_nodes_by_op(OpKind::FakeQuantize).len(), 1);
        assert_eq!(graph.output_shape(conv), &[1, 1, 3, 3]);
        assert_eq!(graph.get_node_by_friendly_name("conv"), Some(conv));

        let input = ArrayD::from_elem(IxDyn(&[1, 2, 3, 3]), 1.0);
        let out = evaluate(&graph, &[(x, input)]).unwrap();
        assert!(out[0].iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_build_rejects_mismatched_types() {
        let mut builder = GraphBuilder::new();
        let x = builder.parameter("x", ElementType::U8, vec![1, 3]);
        let c = builder.constant(Constant::scalar(ElementType::F32, 1.0));
        assert!(builder.node(Op::Add, &[x, c]).is_err());
        assert_eq!(builder.graph().node_count(), 2);
    }
}
