//! Graph helpers shared by the layer transformations
//!
//! Every helper builds its replacement nodes first and rewires last, so a
//! failure part-way leaves at most unreferenced nodes behind for the pass
//! cleanup to collect.

use crate::error::{LptResult, TransformError};
use crate::graph::{GraphContext, NodeId, Op};
use crate::tensor::{channel_shape, numel, Constant, ElementType};
use crate::transform::fold;

use super::dequantization::FakeQuantizeDequantization;
use super::quantization_details::{DataPrecision, QuantizationDetails};

/// Nodes created by a fake-quantize decomposition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecomposedFakeQuantize {
    /// Fake-quantize (or folded constant) producing quantized values
    pub quantized: NodeId,
    /// Dequantization chain now standing in for the original output
    pub dequantization: FakeQuantizeDequantization,
}

/// Shape used for per-interval constants of a fake-quantize
fn interval_shape(graph: &GraphContext, fq: NodeId) -> Vec<usize> {
    (1..=4)
        .filter_map(|i| graph.get_constant_input(fq, i))
        .max_by_key(|c| c.len())
        .map(|c| c.shape().to_vec())
        .unwrap_or_default()
}

/// Split a fake-quantize into a quantizing fake-quantize and its dequantization
///
/// The new fake-quantize keeps the input interval and outputs `[min, max]`
/// of `precision`; when `update_precision` is set it produces the integer
/// type and a `Convert` back to the original float type follows. A
/// `Subtract` is emitted only when some shift is non-zero. The final
/// `Multiply` takes over the friendly name of `fq`.
pub fn decompose_fake_quantize(
    graph: &mut GraphContext,
    fq: NodeId,
    details: &QuantizationDetails,
    precision: &DataPrecision,
    update_precision: bool,
) -> LptResult<DecomposedFakeQuantize> {
    let node = graph.node(fq)?;
    let Op::FakeQuantize { levels } = node.op else {
        return Err(TransformError::InvariantViolation(format!(
            "{} is not a fake-quantize",
            node.name
        )));
    };
    let friendly_name = node.friendly_name.clone();
    let float_type = node.element_type();
    let inputs = node.inputs.clone();
    if inputs.len() != 5 {
        return Err(TransformError::InvalidNode(format!(
            "{} has {} inputs",
            friendly_name,
            inputs.len()
        )));
    }

    let shape = interval_shape(graph, fq);
    let count = numel(&shape).max(1);
    let mut scales = Vec::with_capacity(count);
    let mut shifts = Vec::with_capacity(count);
    for i in 0..count {
        let (scale, shift) = precision.scale_shift(details, i);
        scales.push(scale);
        shifts.push(shift);
    }

    let output_low = graph.add_constant(Constant::filled(float_type, &shape, precision.min));
    let output_high = graph.add_constant(Constant::filled(float_type, &shape, precision.max));
    let output_type = update_precision.then_some(precision.precision);
    let quantized = graph.add_relaxed_node(
        Op::FakeQuantize { levels },
        &[inputs[0], inputs[1], inputs[2], output_low, output_high],
        output_type,
    )?;
    graph.set_friendly_name(quantized, format!("{}_original", friendly_name))?;

    let mut chain = FakeQuantizeDequantization::empty_over(quantized);
    let mut last = quantized;
    if update_precision {
        last = graph.add_node(Op::Convert { destination: float_type }, &[last])?;
        chain.convert = Some(last);
    }
    if shifts.iter().any(|&s| s != 0.0) {
        let shift = graph.add_constant(Constant::from_vec(float_type, &shape, shifts)?);
        last = graph.add_node(Op::Subtract, &[last, shift])?;
        chain.subtract = Some(last);
        chain.subtract_constant = Some(shift);
    }
    let scale = graph.add_constant(Constant::from_vec(float_type, &shape, scales)?);
    last = graph.add_node(Op::Multiply, &[last, scale])?;
    chain.multiply = Some(last);
    chain.multiply_constant = Some(scale);

    graph.set_friendly_name(last, friendly_name)?;
    graph.replace_node(fq, last)?;
    Ok(DecomposedFakeQuantize {
        quantized,
        dequantization: chain,
    })
}

/// Decompose a fake-quantize on constant weights
///
/// With `weights_to_const` the quantizing fake-quantize is folded into a
/// constant holding the quantized values.
pub fn decompose_weights(
    graph: &mut GraphContext,
    fq: NodeId,
    details: &QuantizationDetails,
    precision: &DataPrecision,
    update_precision: bool,
    weights_to_const: bool,
) -> LptResult<DecomposedFakeQuantize> {
    let mut decomposed = decompose_fake_quantize(graph, fq, details, precision, update_precision)?;
    if !weights_to_const {
        return Ok(decomposed);
    }

    let node = graph.node(decomposed.quantized)?;
    let (op, inputs) = (node.op.clone(), node.inputs.clone());
    let Some(folded) = fold(graph, &op, &inputs)? else {
        return Ok(decomposed);
    };
    let folded = if update_precision {
        folded.convert(precision.precision)
    } else {
        folded
    };
    let constant = graph.add_constant(folded);
    graph.replace_node(decomposed.quantized, constant)?;
    decomposed.quantized = constant;
    decomposed.dequantization.data = constant;
    Ok(decomposed)
}

/// Copy a dequantization chain so one consumer can own it
///
/// The copy starts from the same `data` and uses fresh constants. Nothing is
/// rewired.
pub fn clone_dequantization(
    graph: &mut GraphContext,
    chain: &FakeQuantizeDequantization,
) -> LptResult<FakeQuantizeDequantization> {
    let mut copy = FakeQuantizeDequantization::empty_over(chain.data);
    let mut last = chain.data;

    if let Some(convert) = chain.convert {
        last = graph.clone_with_new_inputs(convert, &[last])?;
        rename_copy(graph, convert, last)?;
        copy.convert = Some(last);
    }
    if let (Some(subtract), Some(constant)) = (chain.subtract, chain.subtract_constant) {
        let constant = copy_constant(graph, constant)?;
        last = graph.clone_with_new_inputs(subtract, &[last, constant])?;
        rename_copy(graph, subtract, last)?;
        copy.subtract = Some(last);
        copy.subtract_constant = Some(constant);
    }
    if let (Some(multiply), Some(constant)) = (chain.multiply, chain.multiply_constant) {
        let constant = copy_constant(graph, constant)?;
        last = graph.clone_with_new_inputs(multiply, &[last, constant])?;
        rename_copy(graph, multiply, last)?;
        copy.multiply = Some(last);
        copy.multiply_constant = Some(constant);
    }
    Ok(copy)
}

/// Dequantization on input `index` of `node`, owned by `node` alone
///
/// A shared chain is cloned and only the edge into `node` is moved onto the
/// copy; sibling consumers keep the original chain.
pub fn exclusive_dequantization(
    graph: &mut GraphContext,
    node: NodeId,
    index: usize,
) -> LptResult<FakeQuantizeDequantization> {
    let chain = FakeQuantizeDequantization::extract(graph, node, index).ok_or_else(|| {
        TransformError::InvalidNode(format!("{} has no input {}", node, index))
    })?;
    if !chain.is_shared(graph) && graph.consumer_count(chain.output()) == 1 {
        return Ok(chain);
    }
    if chain.empty() {
        return Ok(chain);
    }
    let copy = clone_dequantization(graph, &chain)?;
    graph.set_input(node, index, copy.output())?;
    Ok(copy)
}

fn rename_copy(graph: &mut GraphContext, original: NodeId, copy: NodeId) -> LptResult<()> {
    let name = format!("{}_new", graph.node(original)?.friendly_name);
    graph.set_friendly_name(copy, name)
}

fn copy_constant(graph: &mut GraphContext, id: NodeId) -> LptResult<NodeId> {
    let constant = fold::constant_of(graph, id)?.clone();
    Ok(graph.add_constant(constant))
}

/// Give every constant of the chain the rank-`rank` channel shape
///
/// Scalars and per-channel vectors of lower rank are broadcast to
/// `[1, C, 1, ...]`; the link is rebuilt over the folded constant.
pub fn normalize_dequantization_shape(
    graph: &mut GraphContext,
    chain: &mut FakeQuantizeDequantization,
    rank: usize,
    channels: usize,
) -> LptResult<()> {
    normalize_zero_point_shape(graph, chain, rank, channels)?;
    let target = channel_shape(rank, channels);
    if let (Some(multiply), Some(constant)) = (chain.multiply, chain.multiply_constant) {
        if let Some(folded) = broadcast_constant_to(graph, constant, &target)? {
            graph.set_input(multiply, 1, folded)?;
            chain.multiply_constant = Some(folded);
        }
    }
    Ok(())
}

/// Give the zero-point constant the rank-`rank` channel shape
pub fn normalize_zero_point_shape(
    graph: &mut GraphContext,
    chain: &mut FakeQuantizeDequantization,
    rank: usize,
    channels: usize,
) -> LptResult<()> {
    let target = channel_shape(rank, channels);
    if let (Some(subtract), Some(constant)) = (chain.subtract, chain.subtract_constant) {
        if let Some(folded) = broadcast_constant_to(graph, constant, &target)? {
            graph.set_input(subtract, 1, folded)?;
            chain.subtract_constant = Some(folded);
        }
    }
    Ok(())
}

fn broadcast_constant_to(
    graph: &mut GraphContext,
    id: NodeId,
    target: &[usize],
) -> LptResult<Option<NodeId>> {
    let constant = fold::constant_of(graph, id)?;
    if constant.shape() == target {
        return Ok(None);
    }
    let laid_out = to_layout(constant, target)?;
    Ok(Some(graph.add_constant(laid_out)))
}

/// Constant laid out as `[1, C, 1, ...]` for a rank-`rank` tensor
///
/// One value per channel is reshaped; anything else is broadcast.
pub fn channel_constant(constant: &Constant, rank: usize, channels: usize) -> LptResult<Constant> {
    to_layout(constant, &channel_shape(rank, channels))
}

fn to_layout(constant: &Constant, target: &[usize]) -> LptResult<Constant> {
    let channels = numel(target);
    if constant.len() == channels && channels > 1 {
        constant.reshape(target)
    } else {
        constant.broadcast_to(target)
    }
}

/// Rebuild `operation` over the chain origin and apply the dequantization after it
///
/// Input 0 of `operation` must carry `chain`. The remaining inputs are kept.
/// `shift` and `scale` are the constants for the moved links, already in the
/// layout of the operation output. A `Convert` back to the float type is
/// inserted when the rebuilt operation produces an integer type. The last
/// node takes over the friendly name of `operation`.
pub fn move_dequantization_after(
    graph: &mut GraphContext,
    operation: NodeId,
    chain: &FakeQuantizeDequantization,
    shift: Option<Constant>,
    scale: Option<Constant>,
    output_type: Option<ElementType>,
) -> LptResult<NodeId> {
    let node = graph.node(operation)?;
    let op = node.op.clone();
    let relaxed = node.is_relaxed();
    let float_type = node.element_type();
    let friendly_name = node.friendly_name.clone();
    let mut inputs = node.inputs.clone();
    inputs[0] = chain.data;

    let rebuilt = if relaxed {
        graph.add_relaxed_node(op, &inputs, output_type)?
    } else if output_type.is_some() {
        return Err(TransformError::TypeMismatch(format!(
            "{} is not type-relaxed",
            friendly_name
        )));
    } else {
        graph.add_node(op, &inputs)?
    };
    graph.set_friendly_name(rebuilt, format!("{}_original", friendly_name))?;

    let mut last = rebuilt;
    if graph.output_type(last).map_or(false, |t| t.is_integral()) {
        last = graph.add_node(Op::Convert { destination: float_type }, &[last])?;
    }
    if let Some(shift) = shift {
        let shift = graph.add_constant(shift.convert(float_type));
        last = graph.add_node(Op::Subtract, &[last, shift])?;
    }
    if let Some(scale) = scale {
        let scale = graph.add_constant(scale.convert(float_type));
        last = graph.add_node(Op::Multiply, &[last, scale])?;
    }

    graph.set_friendly_name(last, friendly_name)?;
    graph.replace_node(operation, last)?;
    Ok(last)
}

/// Check that a dequantization constant may be applied to a tensor of `shape`
///
/// The constant must broadcast to the tensor and vary along the channel axis
/// only.
pub fn is_channel_constant_for(constant: &Constant, shape: &[usize]) -> bool {
    if constant.is_scalar_like() {
        return true;
    }
    let c = constant.shape();
    c.len() <= shape.len()
        && crate::tensor::broadcasts_to(c, shape)
        && crate::tensor::is_per_channel(&aligned_shape(c, shape.len()))
}

/// Left-pad `shape` with ones up to `rank`
pub fn aligned_shape(shape: &[usize], rank: usize) -> Vec<usize> {
    let mut aligned = vec![1; rank.saturating_sub(shape.len())];
    aligned.extend_from_slice(shape);
    aligned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{evaluate, OpKind};
    use crate::low_precision::quantization_details::get_data_precision;
    use ndarray::{ArrayD, IxDyn};

    fn make_fq_graph(low: f32, high: f32, float_type: ElementType) -> (GraphContext, NodeId, NodeId) {
        let mut graph = GraphContext::new();
        let x = graph.add_parameter("x", float_type, vec![1, 3, 2, 2]);
        let il = graph.add_constant(Constant::scalar(float_type, low));
        let ih = graph.add_constant(Constant::scalar(float_type, high));
        let ol = graph.add_constant(Constant::scalar(float_type, low));
        let oh = graph.add_constant(Constant::scalar(float_type, high));
        let fq = graph
            .add_node(Op::FakeQuantize { levels: 256 }, &[x, il, ih, ol, oh])
            .unwrap();
        graph.set_friendly_name(fq, "fq").unwrap();
        graph.add_result(fq).unwrap();
        (graph, x, fq)
    }

    fn decompose(graph: &mut GraphContext, fq: NodeId, update: bool) -> DecomposedFakeQuantize {
        let details = QuantizationDetails::from_fake_quantize(graph, fq).unwrap();
        let precision = get_data_precision(&details, &[ElementType::U8], true).unwrap();
        decompose_fake_quantize(graph, fq, &details, &precision, update).unwrap()
    }

    #[test]
    fn test_decompose_u8() {
        let (mut graph, _, fq) = make_fq_graph(0.0, 2.55, ElementType::F32);
        let d = decompose(&mut graph, fq, true);

        let chain = d.dequantization;
        assert!(chain.subtract.is_none());
        assert!(chain.convert.is_some());
        let scale = chain.scale(&graph).unwrap().scalar_value().unwrap();
        assert!((scale - 0.01).abs() < 1e-6);

        let quantized = graph.node(d.quantized).unwrap();
        assert_eq!(quantized.element_type(), ElementType::U8);
        assert_eq!(graph.get_constant_input(d.quantized, 4).unwrap().scalar_value(), Some(255.0));
        let multiply = chain.multiply.unwrap();
        assert_eq!(graph.node(multiply).unwrap().friendly_name, "fq");
        assert_eq!(graph.output_type(multiply), Some(ElementType::F32));
    }

    #[test]
    fn test_decompose_asymmetric_f16_rounds_shift() {
        let (mut graph, _, fq) = make_fq_graph(-1.23, 2.55, ElementType::F16);
        let d = decompose(&mut graph, fq, true);
        let shift = d.dequantization.shift(&graph).unwrap().scalar_value().unwrap();
        assert_eq!(shift, 83.0);
    }

    #[test]
    fn test_decompose_without_precision_update() {
        let (mut graph, _, fq) = make_fq_graph(-1.23, 2.55, ElementType::F32);
        let d = decompose(&mut graph, fq, false);
        assert!(d.dequantization.convert.is_none());
        assert_eq!(graph.output_type(d.quantized), Some(ElementType::F32));
        let shift = d.dequantization.shift(&graph).unwrap().scalar_value().unwrap();
        assert!((shift - 82.97619).abs() < 1e-3);
    }

    #[test]
    fn test_decomposition_preserves_values() {
        let (mut graph, x, fq) = make_fq_graph(-1.23, 2.55, ElementType::F32);
        let input = ArrayD::from_shape_fn(IxDyn(&[1, 3, 2, 2]), |i| i[1] as f32 - 1.0 + i[3] as f32 * 0.37);
        let before = evaluate(&graph, &[(x, input.clone())]).unwrap();
        decompose(&mut graph, fq, true);
        let after = evaluate(&graph, &[(x, input)]).unwrap();
        for (a, b) in before[0].iter().zip(after[0].iter()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_clone_dequantization() {
        let (mut graph, _, fq) = make_fq_graph(-1.23, 2.55, ElementType::F32);
        let d = decompose(&mut graph, fq, true);
        let copy = clone_dequantization(&mut graph, &d.dequantization).unwrap();
        assert_eq!(copy.data, d.dequantization.data);
        assert_ne!(copy.multiply, d.dequantization.multiply);
        assert_ne!(copy.subtract_constant, d.dequantization.subtract_constant);
        assert_eq!(graph.node(copy.multiply.unwrap()).unwrap().friendly_name, "fq_new");
        assert_eq!(graph.kind(copy.subtract.unwrap()), Some(OpKind::Subtract));
    }

    #[test]
    fn test_normalize_dequantization_shape() {
        let (mut graph, _, fq) = make_fq_graph(-1.23, 2.55, ElementType::F32);
        let mut chain = decompose(&mut graph, fq, true).dequantization;
        normalize_dequantization_shape(&mut graph, &mut chain, 4, 3).unwrap();
        assert_eq!(chain.shift(&graph).unwrap().shape(), &[1, 3, 1, 1]);
        assert_eq!(chain.scale(&graph).unwrap().shape(), &[1, 3, 1, 1]);
        assert_eq!(graph.get_input(chain.subtract.unwrap(), 1), chain.subtract_constant);
    }

    #[test]
    fn test_is_channel_constant_for() {
        let per_channel = Constant::filled(ElementType::F32, &[3, 1, 1], 0.1);
        assert!(is_channel_constant_for(&per_channel, &[1, 3, 4, 4]));
        let spatial =
            Constant::from_vec(ElementType::F32, &[1, 1, 1, 2], vec![0.1, 0.2]).unwrap();
        assert!(!is_channel_constant_for(&spatial, &[1, 3, 4, 2]));
        assert_eq!(aligned_shape(&[3, 1, 1], 4), vec![1, 3, 1, 1]);
    }
}
