//! Output type and shape inference
//!
//! Non-relaxed nodes require their typed inputs to agree on element type.
//! Relaxed nodes accept disagreeing inputs and report their declared output
//! type when one is set.

use crate::error::{LptResult, TransformError};
use crate::tensor::{broadcast_shape, broadcasts_to, normalize_axis, numel, ElementType};

use super::maps::Node;
use super::op::{Op, OpKind, TensorType};

/// Infer the output of `node` from its producers
pub fn infer_output_type(node: &Node, inputs: &[&Node]) -> LptResult<TensorType> {
    check_arity(node, inputs.len())?;

    let mut output = match &node.op {
        Op::Parameter => node.output.clone(),
        Op::Constant(c) => TensorType::new(c.element_type(), c.shape().to_vec()),
        Op::Result | Op::Negative | Op::Relu => inputs[0].output.clone(),
        Op::Convert { destination } => TensorType::new(*destination, inputs[0].shape().to_vec()),
        Op::Add | Op::Subtract | Op::Multiply | Op::Divide | Op::Power => {
            let shape = broadcast_shape(inputs[0].shape(), inputs[1].shape())?;
            TensorType::new(unify_types(node, inputs)?, shape)
        }
        Op::FakeQuantize { levels } => {
            if *levels < 2 {
                return Err(invalid(node, format!("{} quantization levels", levels)));
            }
            let data = inputs[0].shape();
            for range in &inputs[1..] {
                if !broadcasts_to(range.shape(), data) {
                    return Err(TransformError::ShapeInferenceFailed(format!(
                        "{}: range {:?} does not broadcast to {:?}",
                        node.name,
                        range.shape(),
                        data
                    )));
                }
            }
            let element_type = unify_types(node, inputs)?;
            if !node.is_relaxed() && !element_type.is_real() {
                return Err(TransformError::TypeMismatch(format!(
                    "{}: fake-quantize over {}",
                    node.name, element_type
                )));
            }
            TensorType::new(element_type, data.to_vec())
        }
        Op::Convolution(attrs) | Op::GroupConvolution(attrs) => {
            let data = inputs[0].shape();
            let weights = inputs[1].shape();
            let grouped = node.kind() == OpKind::GroupConvolution;
            let expected_rank = if grouped { 5 } else { 4 };
            if data.len() != 4 || weights.len() != expected_rank {
                return Err(shape_error(
                    node,
                    format!("data {:?} with weights {:?}", data, weights),
                ));
            }
            let (out_channels, in_channels, kernel) = if grouped {
                (weights[0] * weights[1], weights[0] * weights[2], &weights[3..])
            } else {
                (weights[0], weights[1], &weights[2..])
            };
            if data[1] != in_channels {
                return Err(shape_error(
                    node,
                    format!("{} input channels, weights expect {}", data[1], in_channels),
                ));
            }
            let mut shape = vec![data[0], out_channels, 0, 0];
            for axis in 0..2 {
                shape[axis + 2] = spatial_output(
                    node,
                    data[axis + 2],
                    kernel[axis],
                    attrs.strides[axis],
                    attrs.pads_begin[axis] + attrs.pads_end[axis],
                    attrs.dilations[axis],
                )?;
            }
            TensorType::new(unify_types(node, inputs)?, shape)
        }
        Op::AvgPool(attrs) | Op::MaxPool(attrs) => {
            let data = inputs[0].shape();
            if data.len() != 4 {
                return Err(shape_error(node, format!("pooling over {:?}", data)));
            }
            let mut shape = data.to_vec();
            for axis in 0..2 {
                shape[axis + 2] = spatial_output(
                    node,
                    data[axis + 2],
                    attrs.kernel[axis],
                    attrs.strides[axis],
                    attrs.pads_begin[axis] + attrs.pads_end[axis],
                    1,
                )?;
            }
            TensorType::new(inputs[0].element_type(), shape)
        }
        Op::MatMul {
            transpose_a,
            transpose_b,
        } => {
            let shape = matmul_shape(node, inputs[0].shape(), inputs[1].shape(), *transpose_a, *transpose_b)?;
            TensorType::new(unify_types(node, inputs)?, shape)
        }
        Op::Concat { axis } => {
            if inputs.is_empty() {
                return Err(invalid(node, "concat without inputs".to_string()));
            }
            let first = inputs[0].shape();
            let axis = normalize_axis(*axis, first.len())?;
            let mut shape = first.to_vec();
            shape[axis] = 0;
            for input in inputs {
                let s = input.shape();
                let compatible = s.len() == first.len()
                    && s.iter()
                        .zip(first)
                        .enumerate()
                        .all(|(i, (a, b))| i == axis || a == b);
                if !compatible {
                    return Err(shape_error(
                        node,
                        format!("cannot concat {:?} with {:?} on axis {}", first, s, axis),
                    ));
                }
                shape[axis] += s[axis];
            }
            TensorType::new(unify_types(node, inputs)?, shape)
        }
        Op::Reshape { special_zero } => {
            let target = inputs[1]
                .op
                .as_constant()
                .ok_or_else(|| invalid(node, "reshape target is not a constant".to_string()))?;
            let shape = reshape_target(node, inputs[0].shape(), &target.as_dims(), *special_zero)?;
            TensorType::new(inputs[0].element_type(), shape)
        }
        Op::DepthToSpace { block_size, .. } => {
            let data = inputs[0].shape();
            let block = *block_size;
            if data.len() != 4 || block == 0 || data[1] % (block * block) != 0 {
                return Err(shape_error(
                    node,
                    format!("depth-to-space block {} over {:?}", block, data),
                ));
            }
            TensorType::new(
                inputs[0].element_type(),
                vec![data[0], data[1] / (block * block), data[2] * block, data[3] * block],
            )
        }
        Op::BatchNormInference { .. } => {
            let data = inputs[0].shape();
            if data.len() < 2 {
                return Err(shape_error(node, format!("batch norm over {:?}", data)));
            }
            for param in &inputs[1..] {
                if numel(param.shape()) != data[1] {
                    return Err(shape_error(
                        node,
                        format!("parameter {:?} for {} channels", param.shape(), data[1]),
                    ));
                }
            }
            TensorType::new(unify_types(node, inputs)?, data.to_vec())
        }
    };

    if let Some(declared) = node.relaxed.as_ref().and_then(|r| r.output_type) {
        output.element_type = declared;
    }
    Ok(output)
}

fn check_arity(node: &Node, actual: usize) -> LptResult<()> {
    let kind = node.kind();
    let expected = kind.arity();
    let ok = match kind {
        OpKind::Concat => actual >= 1,
        _ => actual == expected,
    };
    if ok {
        Ok(())
    } else {
        Err(invalid(
            node,
            format!("{} takes {} inputs, got {}", kind, expected, actual),
        ))
    }
}

/// Common element type of the inputs
fn unify_types(node: &Node, inputs: &[&Node]) -> LptResult<ElementType> {
    let first = inputs[0].element_type();
    if node.is_relaxed() {
        return Ok(inputs
            .iter()
            .map(|i| i.element_type())
            .find(|t| t.is_real())
            .unwrap_or(first));
    }
    match inputs.iter().find(|i| i.element_type() != first) {
        None => Ok(first),
        Some(other) => Err(TransformError::TypeMismatch(format!(
            "{} ({}): inputs disagree, {} vs {}",
            node.name,
            node.kind(),
            first,
            other.element_type()
        ))),
    }
}

fn spatial_output(
    node: &Node,
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> LptResult<usize> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return Err(invalid(node, "zero kernel, stride or dilation".to_string()));
    }
    let effective = (kernel - 1) * dilation + 1;
    let padded = input + padding;
    if padded < effective {
        return Err(shape_error(
            node,
            format!("kernel {} exceeds padded input {}", effective, padded),
        ));
    }
    Ok((padded - effective) / stride + 1)
}

fn matmul_shape(
    node: &Node,
    a: &[usize],
    b: &[usize],
    transpose_a: bool,
    transpose_b: bool,
) -> LptResult<Vec<usize>> {
    if a.len() < 2 || b.len() < 2 {
        return Err(shape_error(node, format!("matmul of {:?} and {:?}", a, b)));
    }
    let (m, k) = last_two(a, transpose_a);
    let (k2, n) = last_two(b, transpose_b);
    if k != k2 {
        return Err(shape_error(
            node,
            format!("inner dimensions {} and {} differ", k, k2),
        ));
    }
    let mut shape = broadcast_shape(&a[..a.len() - 2], &b[..b.len() - 2])?;
    shape.push(m);
    shape.push(n);
    Ok(shape)
}

fn last_two(shape: &[usize], transpose: bool) -> (usize, usize) {
    let rows = shape[shape.len() - 2];
    let cols = shape[shape.len() - 1];
    if transpose {
        (cols, rows)
    } else {
        (rows, cols)
    }
}

/// Resolve a reshape target against the input shape
pub fn reshape_target(
    node: &Node,
    input: &[usize],
    target: &[i64],
    special_zero: bool,
) -> LptResult<Vec<usize>> {
    let mut shape = Vec::with_capacity(target.len());
    let mut inferred = None;
    for (axis, &dim) in target.iter().enumerate() {
        match dim {
            -1 if inferred.is_none() => {
                inferred = Some(axis);
                shape.push(1);
            }
            0 if special_zero => {
                let copied = input.get(axis).copied().ok_or_else(|| {
                    shape_error(node, format!("zero at axis {} beyond input rank", axis))
                })?;
                shape.push(copied);
            }
            d if d > 0 => shape.push(d as usize),
            d => return Err(shape_error(node, format!("invalid target dimension {}", d))),
        }
    }
    let total = numel(input);
    if let Some(axis) = inferred {
        let known = numel(&shape);
        if known == 0 || total % known != 0 {
            return Err(shape_error(
                node,
                format!("cannot infer -1 for {:?} from {:?}", target, input),
            ));
        }
        shape[axis] = total / known;
    }
    if numel(&shape) != total {
        return Err(shape_error(
            node,
            format!("cannot reshape {:?} to {:?}", input, shape),
        ));
    }
    Ok(shape)
}

fn invalid(node: &Node, message: String) -> TransformError {
    TransformError::InvalidNode(format!("{}: {}", node.name, message))
}

fn shape_error(node: &Node, message: String) -> TransformError {
    TransformError::ShapeInferenceFailed(format!("{} ({}): {}", node.name, node.kind(), message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::maps::TypeRelaxed;
    use crate::graph::op::{ConvolutionAttrs, PoolAttrs};
    use crate::tensor::Constant;
    use smallvec::SmallVec;

    fn make_node(op: Op, element_type: ElementType, shape: &[usize]) -> Node {
        Node {
            name: format!("{}_test", op.kind()),
            friendly_name: String::new(),
            op,
            inputs: SmallVec::new(),
            output: TensorType::new(element_type, shape.to_vec()),
            relaxed: None,
        }
    }

    fn param(element_type: ElementType, shape: &[usize]) -> Node {
        make_node(Op::Parameter, element_type, shape)
    }

    #[test]
    fn test_binary_broadcast() {
        let a = param(ElementType::F32, &[1, 3, 8, 8]);
        let b = param(ElementType::F32, &[1, 3, 1, 1]);
        let mul = make_node(Op::Multiply, ElementType::F32, &[]);
        let out = infer_output_type(&mul, &[&a, &b]).unwrap();
        assert_eq!(out.shape, vec![1, 3, 8, 8]);
    }

    #[test]
    fn test_strict_types_reject_mix() {
        let a = param(ElementType::U8, &[1, 3]);
        let b = param(ElementType::F32, &[1, 3]);
        let sub = make_node(Op::Subtract, ElementType::F32, &[]);
        assert!(matches!(
            infer_output_type(&sub, &[&a, &b]),
            Err(TransformError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_relaxed_types_accept_mix() {
        let a = param(ElementType::U8, &[1, 3, 8, 8]);
        let w = param(ElementType::I8, &[4, 3, 3, 3]);
        let mut conv = make_node(
            Op::Convolution(ConvolutionAttrs::default()),
            ElementType::F32,
            &[],
        );
        conv.relaxed = Some(TypeRelaxed {
            output_type: Some(ElementType::F32),
        });
        let out = infer_output_type(&conv, &[&a, &w]).unwrap();
        assert_eq!(out, TensorType::new(ElementType::F32, vec![1, 4, 6, 6]));
    }

    #[test]
    fn test_group_convolution_shape() {
        let a = param(ElementType::F32, &[1, 4, 5, 5]);
        let w = param(ElementType::F32, &[2, 3, 2, 1, 1]);
        let conv = make_node(
            Op::GroupConvolution(ConvolutionAttrs::default()),
            ElementType::F32,
            &[],
        );
        assert_eq!(infer_output_type(&conv, &[&a, &w]).unwrap().shape, vec![1, 6, 5, 5]);
    }

    #[test]
    fn test_pool_shape() {
        let a = param(ElementType::U8, &[1, 3, 8, 8]);
        let pool = make_node(Op::MaxPool(PoolAttrs::square(2)), ElementType::U8, &[]);
        let out = infer_output_type(&pool, &[&a]).unwrap();
        assert_eq!(out, TensorType::new(ElementType::U8, vec![1, 3, 4, 4]));
    }

    #[test]
    fn test_concat_shape() {
        let a = param(ElementType::F32, &[1, 3, 4, 4]);
        let b = param(ElementType::F32, &[1, 5, 4, 4]);
        let concat = make_node(Op::Concat { axis: 1 }, ElementType::F32, &[]);
        assert_eq!(infer_output_type(&concat, &[&a, &b]).unwrap().shape, vec![1, 8, 4, 4]);
    }

    #[test]
    fn test_reshape_target() {
        let data = param(ElementType::F32, &[1, 3, 4, 5]);
        let target = make_node(
            Op::Constant(Constant::from_vec(ElementType::I64, &[3], vec![0.0, 3.0, -1.0]).unwrap()),
            ElementType::I64,
            &[3],
        );
        let reshape = make_node(Op::Reshape { special_zero: true }, ElementType::F32, &[]);
        assert_eq!(infer_output_type(&reshape, &[&data, &target]).unwrap().shape, vec![1, 3, 20]);
    }

    #[test]
    fn test_matmul_shape() {
        let a = param(ElementType::F32, &[2, 4, 8]);
        let b = param(ElementType::F32, &[16, 8]);
        let mm = make_node(
            Op::MatMul {
                transpose_a: false,
                transpose_b: true,
            },
            ElementType::F32,
            &[],
        );
        assert_eq!(infer_output_type(&mm, &[&a, &b]).unwrap().shape, vec![2, 4, 16]);
    }

    #[test]
    fn test_fake_quantize_range_must_broadcast() {
        let data = param(ElementType::F32, &[1, 3, 4, 4]);
        let good = param(ElementType::F32, &[1, 3, 1, 1]);
        let bad = param(ElementType::F32, &[1, 4, 1, 1]);
        let fq = make_node(Op::FakeQuantize { levels: 256 }, ElementType::F32, &[]);
        assert!(infer_output_type(&fq, &[&data, &good, &good, &good, &good]).is_ok());
        assert!(infer_output_type(&fq, &[&data, &bad, &good, &good, &good]).is_err());
    }

    #[test]
    fn test_arity_checked() {
        let a = param(ElementType::F32, &[1]);
        let add = make_node(Op::Add, ElementType::F32, &[]);
        assert!(matches!(
            infer_output_type(&add, &[&a]),
            Err(TransformError::InvalidNode(_))
        ));
    }
}
