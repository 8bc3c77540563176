//! Reference evaluation
//!
//! Straightforward kernels for every operation kind. They back constant
//! folding and let tests compare a rewritten graph against its original.
//! Values are computed in `f32` and rounded to each node's declared output
//! element type.

use ndarray::{concatenate, Array4, ArrayD, ArrayView4, Axis, Ix4, IxDyn, Zip};
use rustc_hash::FxHashMap;

use crate::error::{LptResult, TransformError};
use crate::tensor::{broadcast_shape, normalize_axis, ElementType};

use super::context::GraphContext;
use super::maps::{Node, NodeId};
use super::op::{ConvolutionAttrs, DepthToSpaceMode, Op, PoolAttrs};

/// Evaluate every result of the graph for the given parameter values
pub fn evaluate(ctx: &GraphContext, feeds: &[(NodeId, ArrayD<f32>)]) -> LptResult<Vec<ArrayD<f32>>> {
    let mut values: FxHashMap<NodeId, ArrayD<f32>> = feeds.iter().cloned().collect();

    for id in ctx.topological_order() {
        if values.contains_key(&id) {
            continue;
        }
        let node = ctx.node(id)?;
        let output = {
            let inputs = node
                .inputs
                .iter()
                .map(|i| {
                    values.get(i).ok_or_else(|| {
                        TransformError::Evaluation(format!("{}: no value for input {}", node.name, i))
                    })
                })
                .collect::<LptResult<Vec<_>>>()?;
            evaluate_node(node, &inputs)?
        };
        values.insert(id, output);
    }

    ctx.results()
        .iter()
        .map(|r| {
            values
                .remove(r)
                .ok_or_else(|| TransformError::Evaluation(format!("result {} not computed", r)))
        })
        .collect()
}

/// Evaluate a single node on concrete input values
pub fn evaluate_node(node: &Node, inputs: &[&ArrayD<f32>]) -> LptResult<ArrayD<f32>> {
    let mut output = match &node.op {
        Op::Parameter => {
            return Err(TransformError::Evaluation(format!(
                "parameter {} has no value",
                node.friendly_name
            )))
        }
        Op::Constant(c) => return Ok(c.values().clone()),
        Op::Result => inputs[0].clone(),
        Op::Convert { destination } => {
            let destination = *destination;
            inputs[0].mapv(|v| destination.round(v))
        }
        Op::Add => binary(inputs, |a, b| a + b)?,
        Op::Subtract => binary(inputs, |a, b| a - b)?,
        Op::Multiply => binary(inputs, |a, b| a * b)?,
        Op::Divide => binary(inputs, |a, b| a / b)?,
        Op::Power => binary(inputs, f32::powf)?,
        Op::Negative => inputs[0].mapv(|v| -v),
        Op::Relu => inputs[0].mapv(|v| v.max(0.0)),
        Op::FakeQuantize { levels } => fake_quantize(inputs, *levels)?,
        Op::Convolution(attrs) => {
            let weights = inputs[1].view().into_dimensionality::<Ix4>()?;
            convolution(inputs[0], weights, attrs, 1)?
        }
        Op::GroupConvolution(attrs) => {
            let s = inputs[1].shape();
            if s.len() != 5 {
                return Err(TransformError::Evaluation(format!(
                    "{}: group weights {:?}",
                    node.name, s
                )));
            }
            let flat = ArrayD::from_shape_vec(
                IxDyn(&[s[0] * s[1], s[2], s[3], s[4]]),
                inputs[1].iter().copied().collect(),
            )?;
            let weights = flat.view().into_dimensionality::<Ix4>()?;
            convolution(inputs[0], weights, attrs, s[0])?
        }
        Op::MatMul {
            transpose_a,
            transpose_b,
        } => matmul(inputs[0], inputs[1], *transpose_a, *transpose_b, &node.output.shape)?,
        Op::AvgPool(attrs) => pool(inputs[0], attrs, PoolMode::Average)?,
        Op::MaxPool(attrs) => pool(inputs[0], attrs, PoolMode::Max)?,
        Op::Concat { axis } => {
            let axis = normalize_axis(*axis, inputs[0].ndim())?;
            let views: Vec<_> = inputs.iter().map(|a| a.view()).collect();
            concatenate(Axis(axis), &views)?
        }
        Op::Reshape { .. } => ArrayD::from_shape_vec(
            IxDyn(&node.output.shape),
            inputs[0].iter().copied().collect(),
        )?,
        Op::DepthToSpace { block_size, mode } => depth_to_space(inputs[0], *block_size, *mode)?,
        Op::BatchNormInference { epsilon } => batch_norm(inputs, *epsilon)?,
    };

    let element_type = node.element_type();
    if element_type != ElementType::F32 {
        output.mapv_inplace(|v| element_type.round(v));
    }
    Ok(output)
}

fn binary(inputs: &[&ArrayD<f32>], f: impl Fn(f32, f32) -> f32) -> LptResult<ArrayD<f32>> {
    let shape = broadcast_shape(inputs[0].shape(), inputs[1].shape())?;
    let lhs = broadcast_view(inputs[0], &shape)?;
    let rhs = broadcast_view(inputs[1], &shape)?;
    Ok(Zip::from(&lhs).and(&rhs).map_collect(|&a, &b| f(a, b)))
}

fn broadcast_view<'a>(
    array: &'a ArrayD<f32>,
    shape: &[usize],
) -> LptResult<ndarray::ArrayViewD<'a, f32>> {
    array.broadcast(IxDyn(shape)).ok_or_else(|| {
        TransformError::Evaluation(format!(
            "cannot broadcast {:?} to {:?}",
            array.shape(),
            shape
        ))
    })
}

fn fake_quantize(inputs: &[&ArrayD<f32>], levels: usize) -> LptResult<ArrayD<f32>> {
    let shape = inputs[0].shape().to_vec();
    let input_low = broadcast_view(inputs[1], &shape)?;
    let input_high = broadcast_view(inputs[2], &shape)?;
    let output_low = broadcast_view(inputs[3], &shape)?;
    let output_high = broadcast_view(inputs[4], &shape)?;
    let steps = (levels - 1) as f32;

    Ok(Zip::from(inputs[0])
        .and(&input_low)
        .and(&input_high)
        .and(&output_low)
        .and(&output_high)
        .map_collect(|&x, &il, &ih, &ol, &oh| {
            if x <= il.min(ih) {
                ol
            } else if x > il.max(ih) {
                oh
            } else {
                ((x - il) / (ih - il) * steps).round_ties_even() / steps * (oh - ol) + ol
            }
        }))
}

fn spatial_index(out: usize, stride: usize, offset: usize, pad: usize) -> Option<usize> {
    (out * stride + offset).checked_sub(pad)
}

fn convolution(
    data: &ArrayD<f32>,
    weights: ArrayView4<'_, f32>,
    attrs: &ConvolutionAttrs,
    groups: usize,
) -> LptResult<ArrayD<f32>> {
    let x = data.view().into_dimensionality::<Ix4>()?;
    let (batch, _, height, width) = x.dim();
    let (out_channels, group_channels, kernel_h, kernel_w) = weights.dim();
    let per_group = out_channels / groups.max(1);
    let out_h = (height + attrs.pads_begin[0] + attrs.pads_end[0]
        - ((kernel_h - 1) * attrs.dilations[0] + 1))
        / attrs.strides[0]
        + 1;
    let out_w = (width + attrs.pads_begin[1] + attrs.pads_end[1]
        - ((kernel_w - 1) * attrs.dilations[1] + 1))
        / attrs.strides[1]
        + 1;

    let mut out = Array4::<f32>::zeros((batch, out_channels, out_h, out_w));
    for n in 0..batch {
        for o in 0..out_channels {
            let group = o / per_group.max(1);
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = 0.0f32;
                    for ic in 0..group_channels {
                        let c = group * group_channels + ic;
                        for ky in 0..kernel_h {
                            let Some(iy) = spatial_index(oy, attrs.strides[0], ky * attrs.dilations[0], attrs.pads_begin[0])
                            else {
                                continue;
                            };
                            if iy >= height {
                                continue;
                            }
                            for kx in 0..kernel_w {
                                let Some(ix) = spatial_index(ox, attrs.strides[1], kx * attrs.dilations[1], attrs.pads_begin[1])
                                else {
                                    continue;
                                };
                                if ix >= width {
                                    continue;
                                }
                                acc += x[[n, c, iy, ix]] * weights[[o, ic, ky, kx]];
                            }
                        }
                    }
                    out[[n, o, oy, ox]] = acc;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

#[derive(Clone, Copy)]
enum PoolMode {
    Average,
    Max,
}

fn pool(data: &ArrayD<f32>, attrs: &PoolAttrs, mode: PoolMode) -> LptResult<ArrayD<f32>> {
    let x = data.view().into_dimensionality::<Ix4>()?;
    let (batch, channels, height, width) = x.dim();
    let out_h = (height + attrs.pads_begin[0] + attrs.pads_end[0] - attrs.kernel[0]) / attrs.strides[0] + 1;
    let out_w = (width + attrs.pads_begin[1] + attrs.pads_end[1] - attrs.kernel[1]) / attrs.strides[1] + 1;

    let mut out = Array4::<f32>::zeros((batch, channels, out_h, out_w));
    for n in 0..batch {
        for c in 0..channels {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = match mode {
                        PoolMode::Average => 0.0f32,
                        PoolMode::Max => f32::NEG_INFINITY,
                    };
                    let mut count = 0usize;
                    for ky in 0..attrs.kernel[0] {
                        let Some(iy) = spatial_index(oy, attrs.strides[0], ky, attrs.pads_begin[0]) else {
                            continue;
                        };
                        if iy >= height {
                            continue;
                        }
                        for kx in 0..attrs.kernel[1] {
                            let Some(ix) = spatial_index(ox, attrs.strides[1], kx, attrs.pads_begin[1]) else {
                                continue;
                            };
                            if ix >= width {
                                continue;
                            }
                            let v = x[[n, c, iy, ix]];
                            acc = match mode {
                                PoolMode::Average => acc + v,
                                PoolMode::Max => acc.max(v),
                            };
                            count += 1;
                        }
                    }
                    out[[n, c, oy, ox]] = match mode {
                        PoolMode::Max if count == 0 => 0.0,
                        PoolMode::Max => acc,
                        PoolMode::Average => {
                            let divisor = if attrs.exclude_pad {
                                count.max(1)
                            } else {
                                attrs.kernel[0] * attrs.kernel[1]
                            };
                            acc / divisor as f32
                        }
                    };
                }
            }
        }
    }
    Ok(out.into_dyn())
}

/// Flat offset of a batch index into a broadcast batch shape
fn batch_offset(index: &[usize], shape: &[usize]) -> usize {
    let skip = index.len() - shape.len();
    let mut offset = 0;
    for (axis, &dim) in shape.iter().enumerate() {
        let i = if dim == 1 { 0 } else { index[skip + axis] };
        offset = offset * dim + i;
    }
    offset
}

fn matmul(
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    transpose_a: bool,
    transpose_b: bool,
    output_shape: &[usize],
) -> LptResult<ArrayD<f32>> {
    let a_shape = a.shape();
    let b_shape = b.shape();
    let (a_rows, a_cols) = (a_shape[a_shape.len() - 2], a_shape[a_shape.len() - 1]);
    let (b_rows, b_cols) = (b_shape[b_shape.len() - 2], b_shape[b_shape.len() - 1]);
    let (m, k) = if transpose_a { (a_cols, a_rows) } else { (a_rows, a_cols) };
    let n = if transpose_b { b_rows } else { b_cols };

    let a_values: Vec<f32> = a.iter().copied().collect();
    let b_values: Vec<f32> = b.iter().copied().collect();
    let batch_shape = &output_shape[..output_shape.len() - 2];
    let batch_count: usize = batch_shape.iter().product();

    let mut out = Vec::with_capacity(batch_count * m * n);
    let mut index = vec![0usize; batch_shape.len()];
    for _ in 0..batch_count {
        let a_base = batch_offset(&index, &a_shape[..a_shape.len() - 2]) * a_rows * a_cols;
        let b_base = batch_offset(&index, &b_shape[..b_shape.len() - 2]) * b_rows * b_cols;
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f32;
                for p in 0..k {
                    let av = if transpose_a {
                        a_values[a_base + p * a_cols + i]
                    } else {
                        a_values[a_base + i * a_cols + p]
                    };
                    let bv = if transpose_b {
                        b_values[b_base + j * b_cols + p]
                    } else {
                        b_values[b_base + p * b_cols + j]
                    };
                    acc += av * bv;
                }
                out.push(acc);
            }
        }
        // advance the batch index, last axis fastest
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < batch_shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Ok(ArrayD::from_shape_vec(IxDyn(output_shape), out)?)
}

fn depth_to_space(data: &ArrayD<f32>, block: usize, mode: DepthToSpaceMode) -> LptResult<ArrayD<f32>> {
    let x = data.view().into_dimensionality::<Ix4>()?;
    let (batch, channels, height, width) = x.dim();
    let out_channels = channels / (block * block);
    let mut out = Array4::<f32>::zeros((batch, out_channels, height * block, width * block));
    for n in 0..batch {
        for c in 0..out_channels {
            for h in 0..height {
                for w in 0..width {
                    for i in 0..block {
                        for j in 0..block {
                            let source = match mode {
                                DepthToSpaceMode::BlocksFirst => (i * block + j) * out_channels + c,
                                DepthToSpaceMode::DepthFirst => c * block * block + i * block + j,
                            };
                            out[[n, c, h * block + i, w * block + j]] = x[[n, source, h, w]];
                        }
                    }
                }
            }
        }
    }
    Ok(out.into_dyn())
}

fn batch_norm(inputs: &[&ArrayD<f32>], epsilon: f32) -> LptResult<ArrayD<f32>> {
    let flat = |a: &ArrayD<f32>| a.iter().copied().collect::<Vec<f32>>();
    let gamma = flat(inputs[1]);
    let beta = flat(inputs[2]);
    let mean = flat(inputs[3]);
    let variance = flat(inputs[4]);

    let mut out = inputs[0].clone();
    for (index, value) in out.indexed_iter_mut() {
        let c = index[1];
        *value = (*value - mean[c]) / (variance[c] + epsilon).sqrt() * gamma[c] + beta[c];
    }
    Ok(out)
}
