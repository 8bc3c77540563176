//! Fake-quantize and dequantization descriptors
//!
//! Descriptors are plain data; [`make_fake_quantize`] and
//! [`make_dequantization`] materialize them behind a data node.

use crate::error::LptResult;
use crate::graph::{GraphContext, NodeId, Op};
use crate::tensor::{Constant, ElementType};

/// A fake-quantize on a data path
#[derive(Debug, Clone, PartialEq)]
pub struct FakeQuantizeOnData {
    /// Quantization levels
    pub levels: usize,
    /// Shape of the four range constants
    pub constant_shape: Vec<usize>,
    /// Input low values
    pub input_low: Vec<f32>,
    /// Input high values
    pub input_high: Vec<f32>,
    /// Output low values
    pub output_low: Vec<f32>,
    /// Output high values
    pub output_high: Vec<f32>,
    /// Declared output type; set makes the node type-relaxed
    pub output_type: Option<ElementType>,
}

impl FakeQuantizeOnData {
    /// Per-tensor fake-quantize with equal input and output ranges
    pub fn new(levels: usize, low: f32, high: f32) -> Self {
        Self::per_channel(levels, &[], vec![low], vec![high])
    }

    /// Fake-quantize with range constants of `shape`
    pub fn per_channel(levels: usize, shape: &[usize], low: Vec<f32>, high: Vec<f32>) -> Self {
        Self {
            levels,
            constant_shape: shape.to_vec(),
            input_low: low.clone(),
            input_high: high.clone(),
            output_low: low,
            output_high: high,
            output_type: None,
        }
    }

    /// Replace the output range
    pub fn with_output(mut self, low: Vec<f32>, high: Vec<f32>) -> Self {
        self.output_low = low;
        self.output_high = high;
        self
    }

    /// Declare the output type
    pub fn with_output_type(mut self, output_type: ElementType) -> Self {
        self.output_type = Some(output_type);
        self
    }

    /// True when no fake-quantize is described
    pub fn is_empty(&self) -> bool {
        self.levels == 0
    }
}

/// Values of one dequantization constant
#[derive(Debug, Clone, PartialEq)]
pub struct DequantizationValues {
    /// Flat values; a single value fills the shape
    pub values: Vec<f32>,
    /// Constant shape; empty for a scalar
    pub shape: Vec<usize>,
}

impl DequantizationValues {
    fn constant(&self, element_type: ElementType) -> LptResult<Constant> {
        Constant::from_vec(element_type, &self.shape, self.values.clone())
    }
}

/// A `Convert` -> `Subtract` -> `Multiply` chain; every step is optional
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DequantizationOperations {
    /// Destination of the convert
    pub convert: Option<ElementType>,
    /// Zero point
    pub subtract: Option<DequantizationValues>,
    /// Scale
    pub multiply: Option<DequantizationValues>,
}

impl DequantizationOperations {
    /// Empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert to `destination`
    pub fn convert(mut self, destination: ElementType) -> Self {
        self.convert = Some(destination);
        self
    }

    /// Subtract a scalar
    pub fn subtract(self, value: f32) -> Self {
        self.subtract_values(vec![value], &[])
    }

    /// Subtract a constant of `shape`
    pub fn subtract_values(mut self, values: Vec<f32>, shape: &[usize]) -> Self {
        self.subtract = Some(DequantizationValues {
            values,
            shape: shape.to_vec(),
        });
        self
    }

    /// Multiply by a scalar
    pub fn multiply(self, value: f32) -> Self {
        self.multiply_values(vec![value], &[])
    }

    /// Multiply by a constant of `shape`
    pub fn multiply_values(mut self, values: Vec<f32>, shape: &[usize]) -> Self {
        self.multiply = Some(DequantizationValues {
            values,
            shape: shape.to_vec(),
        });
        self
    }

    /// True when the chain has no step
    pub fn is_empty(&self) -> bool {
        self.convert.is_none() && self.subtract.is_none() && self.multiply.is_none()
    }
}

/// Add a fake-quantize behind `data`; an empty descriptor returns `data`
pub fn make_fake_quantize(
    graph: &mut GraphContext,
    data: NodeId,
    fq: &FakeQuantizeOnData,
) -> LptResult<NodeId> {
    if fq.is_empty() {
        return Ok(data);
    }
    let element_type = graph.node(data)?.element_type();
    let mut inputs = vec![data];
    for values in [&fq.input_low, &fq.input_high, &fq.output_low, &fq.output_high] {
        let constant = Constant::from_vec(element_type, &fq.constant_shape, values.clone())?;
        inputs.push(graph.add_constant(constant));
    }
    let op = Op::FakeQuantize { levels: fq.levels };
    match fq.output_type {
        Some(output_type) => graph.add_relaxed_node(op, &inputs, Some(output_type)),
        None => graph.add_node(op, &inputs),
    }
}

/// Add a dequantization chain behind `data`; returns the last node
///
/// Constants take the type the chain computes in: the convert destination,
/// or the data type when there is no convert. A subtract over integer data
/// is type-relaxed to a float output.
pub fn make_dequantization(
    graph: &mut GraphContext,
    data: NodeId,
    operations: &DequantizationOperations,
) -> LptResult<NodeId> {
    let mut last = data;
    if let Some(destination) = operations.convert {
        last = graph.add_node(Op::Convert { destination }, &[last])?;
    }
    let data_type = graph.node(last)?.element_type();
    let float_type = if data_type.is_real() {
        data_type
    } else {
        ElementType::F32
    };
    if let Some(subtract) = &operations.subtract {
        let zero_point = graph.add_constant(subtract.constant(float_type)?);
        last = if data_type.is_real() {
            graph.add_node(Op::Subtract, &[last, zero_point])?
        } else {
            graph.add_relaxed_node(Op::Subtract, &[last, zero_point], Some(float_type))?
        };
    }
    if let Some(multiply) = &operations.multiply {
        let scale = graph.add_constant(multiply.constant(float_type)?);
        let input_type = graph.node(last)?.element_type();
        last = if input_type.is_real() {
            graph.add_node(Op::Multiply, &[last, scale])?
        } else {
            graph.add_relaxed_node(Op::Multiply, &[last, scale], Some(float_type))?
        };
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OpKind;
    use crate::low_precision::{FakeQuantizeDequantization, QuantizationDetails};

    #[test]
    fn test_fake_quantize_descriptor() {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::F32, vec![1, 2, 4, 4]);
        let fq = FakeQuantizeOnData::per_channel(256, &[1, 2, 1, 1], vec![0.0], vec![2.55, 1.275])
            .with_output(vec![0.0], vec![255.0])
            .with_output_type(ElementType::U8);
        let node = make_fake_quantize(&mut graph, x, &fq).unwrap();

        assert_eq!(graph.output_type(node), Some(ElementType::U8));
        let details = QuantizationDetails::from_fake_quantize(&graph, node).unwrap();
        assert_eq!(details.levels, 256);
        assert_eq!(details.input_low_value(1), 0.0);
        assert_eq!(details.input_high_value(1), 1.275);
        assert_eq!(details.output_high_value(1), 255.0);

        let empty = FakeQuantizeOnData::new(0, 0.0, 0.0);
        assert_eq!(make_fake_quantize(&mut graph, x, &empty).unwrap(), x);
    }

    #[test]
    fn test_dequantization_chain_is_extracted() {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::U8, vec![1, 3, 2, 2]);
        let operations = DequantizationOperations::new()
            .convert(ElementType::F32)
            .subtract(128.0)
            .multiply_values(vec![0.1, 0.2, 0.3], &[1, 3, 1, 1]);
        let last = make_dequantization(&mut graph, x, &operations).unwrap();
        let relu = graph.add_node(Op::Relu, &[last]).unwrap();

        let chain = FakeQuantizeDequantization::extract(&graph, relu, 0).unwrap();
        assert_eq!(chain.data, x);
        assert!(chain.convert.is_some());
        assert_eq!(chain.shift(&graph).unwrap().scalar_value(), Some(128.0));
        assert_eq!(chain.scale(&graph).unwrap().to_vec(), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_subtract_without_convert_is_relaxed() {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", ElementType::U8, vec![1, 3]);
        let operations = DequantizationOperations::new().subtract(1.0).multiply(0.5);
        let last = make_dequantization(&mut graph, x, &operations).unwrap();
        let subtract = graph.get_input(last, 0).unwrap();
        assert_eq!(graph.kind(subtract), Some(OpKind::Subtract));
        assert!(graph.node(subtract).unwrap().is_relaxed());
        assert_eq!(graph.output_type(last), Some(ElementType::F32));
        assert!(!graph.node(last).unwrap().is_relaxed());
        assert!(DequantizationOperations::new().is_empty());
    }
}
