//! Parallel CPU backend
//!
//! # CPU Backend
//!
//! Host implementations of every kernel on [`Device`]. Buffers are plain
//! `Vec`s, so the host view *is* the storage and the transfer calls are
//! no-ops.
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon), split over
//!   batch columns, output features or weight columns depending on which
//!   axis keeps writes disjoint
//! - Deterministic results: every output element is reduced by exactly one
//!   task in a fixed order
//!
//! ## Implemented Kernels
//!
//! - `conv2d` / `conv2d_backward`: valid-mode cross-correlation and its
//!   feature-map, bias and input gradients
//! - `max_pool` / `max_pool_backward`: non-overlapping max pooling
//! - `dot_bias` / `dot_bias_backward`: affine layer and its gradients
//! - `activation` / `activation_backward`: sigmoid, relu, tanh
//! - `softmax_log_loss` / `softmax_log_loss_backward`: stable softmax with
//!   cross-entropy cost
//! - `add` / `product`: elementwise arithmetic with aliasing support

use rayon::prelude::*;

use crate::backend::Backend;
use crate::error::DeviceError;
use crate::ops::dispatch::{
    ActivationMode, ClassGeometry, ConvGeometry, DenseGeometry, Device, Element, PoolGeometry,
    Src,
};

/// Host device. Kernels complete before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cpu;

impl Device for Cpu {
    const KIND: Backend = Backend::Cpu;

    type Buffer<T: Element> = Vec<T>;

    fn alloc<T: Element>(len: usize) -> Result<Vec<T>, DeviceError> {
        Ok(vec![T::zeroed(); len])
    }

    fn host<T: Element>(buffer: &Vec<T>) -> &[T] {
        buffer
    }

    fn host_mut<T: Element>(buffer: &mut Vec<T>) -> &mut [T] {
        buffer
    }

    fn upload<T: Element>(_: &mut Vec<T>) -> Result<(), DeviceError> {
        Ok(())
    }

    fn download<T: Element>(_: &mut Vec<T>) -> Result<(), DeviceError> {
        Ok(())
    }

    fn zero<T: Element>(buffer: &mut Vec<T>) -> Result<(), DeviceError> {
        buffer.fill(T::zeroed());
        Ok(())
    }

    fn conv2d(
        input: &Vec<f32>,
        feature_map: &Vec<f32>,
        bias: &Vec<f32>,
        output: &mut Vec<f32>,
        g: &ConvGeometry,
    ) -> Result<(), DeviceError> {
        conv2d(input, feature_map, bias, output, g);
        Ok(())
    }

    fn conv2d_backward(
        input: &Vec<f32>,
        feature_map: &Vec<f32>,
        output_grad: &Vec<f32>,
        feature_map_grad: &mut Vec<f32>,
        bias_grad: &mut Vec<f32>,
        input_grad: Option<&mut Vec<f32>>,
        g: &ConvGeometry,
    ) -> Result<(), DeviceError> {
        conv2d_feature_map_grad(input, output_grad, feature_map_grad, g);
        row_sum(output_grad, bias_grad, g.features);
        if let Some(input_grad) = input_grad {
            conv2d_input_grad(feature_map, output_grad, input_grad, g);
        }
        Ok(())
    }

    fn max_pool(
        input: &Vec<f32>,
        output: &mut Vec<f32>,
        g: &PoolGeometry,
    ) -> Result<(), DeviceError> {
        max_pool(input, output, g);
        Ok(())
    }

    fn max_pool_backward(
        input: &Vec<f32>,
        output: &Vec<f32>,
        output_grad: &Vec<f32>,
        input_grad: &mut Vec<f32>,
        g: &PoolGeometry,
    ) -> Result<(), DeviceError> {
        max_pool_backward(input, output, output_grad, input_grad, g);
        Ok(())
    }

    fn dot_bias(
        input: &Vec<f32>,
        weight: &Vec<f32>,
        bias: &Vec<f32>,
        output: &mut Vec<f32>,
        g: &DenseGeometry,
    ) -> Result<(), DeviceError> {
        dot_bias(input, weight, bias, output, g);
        Ok(())
    }

    fn dot_bias_backward(
        input: &Vec<f32>,
        output_delta: &Vec<f32>,
        weight: &Vec<f32>,
        weight_grad: &mut Vec<f32>,
        bias_grad: &mut Vec<f32>,
        input_delta: Option<&mut Vec<f32>>,
        g: &DenseGeometry,
    ) -> Result<(), DeviceError> {
        dot_bias_weight_grad(input, output_delta, weight_grad, g);
        row_sum(output_delta, bias_grad, g.outputs);
        if let Some(input_delta) = input_delta {
            dot_bias_input_delta(weight, output_delta, input_delta, g);
        }
        Ok(())
    }

    fn activation(
        mode: ActivationMode,
        input: Src<'_, Vec<f32>>,
        output: &mut Vec<f32>,
    ) -> Result<(), DeviceError> {
        match input {
            Src::Buf(x) => output
                .par_iter_mut()
                .zip(x.par_iter())
                .for_each(|(y, &x)| *y = mode.apply(x)),
            Src::Dst => output.par_iter_mut().for_each(|y| *y = mode.apply(*y)),
        }
        Ok(())
    }

    fn activation_backward(
        mode: ActivationMode,
        output: &Vec<f32>,
        output_delta: Src<'_, Vec<f32>>,
        input_delta: &mut Vec<f32>,
    ) -> Result<(), DeviceError> {
        match output_delta {
            Src::Buf(delta) => input_delta
                .par_iter_mut()
                .zip(output.par_iter())
                .zip(delta.par_iter())
                .for_each(|((d, &o), &g)| *d = mode.derivative(o, g)),
            Src::Dst => input_delta
                .par_iter_mut()
                .zip(output.par_iter())
                .for_each(|(d, &o)| *d = mode.derivative(o, *d)),
        }
        Ok(())
    }

    fn softmax_log_loss(
        input: &Vec<f32>,
        label: &Vec<u32>,
        output: &mut Vec<f32>,
        cost: &mut Vec<f32>,
        g: &ClassGeometry,
    ) -> Result<(), DeviceError> {
        let classes = g.classes;
        check_labels(label, classes)?;
        output
            .par_chunks_mut(classes)
            .zip(cost.par_iter_mut())
            .enumerate()
            .for_each(|(n, (probs, cost))| {
                let target = label[n] as usize;
                let x = &input[n * classes..(n + 1) * classes];

                let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let sum: f32 = x.iter().map(|&v| (v - max).exp()).sum();
                for (p, &v) in probs.iter_mut().zip(x) {
                    *p = (v - max).exp() / sum;
                }
                // log-sum-exp form of -log(softmax[target])
                *cost = sum.ln() - (x[target] - max);
            });
        Ok(())
    }

    fn softmax_log_loss_backward(
        output: &Vec<f32>,
        label: &Vec<u32>,
        input_grad: &mut Vec<f32>,
        g: &ClassGeometry,
    ) -> Result<(), DeviceError> {
        let classes = g.classes;
        check_labels(label, classes)?;
        input_grad
            .par_chunks_mut(classes)
            .enumerate()
            .for_each(|(n, grad)| {
                grad.copy_from_slice(&output[n * classes..(n + 1) * classes]);
                grad[label[n] as usize] -= 1.0;
            });
        Ok(())
    }

    fn add(
        a: Src<'_, Vec<f32>>,
        b: Src<'_, Vec<f32>>,
        rate: f32,
        result: &mut Vec<f32>,
    ) -> Result<(), DeviceError> {
        binary(a, b, result, |x, y| x + rate * y);
        Ok(())
    }

    fn product(
        a: Src<'_, Vec<f32>>,
        b: Src<'_, Vec<f32>>,
        result: &mut Vec<f32>,
    ) -> Result<(), DeviceError> {
        binary(a, b, result, |x, y| x * y);
        Ok(())
    }
}

/// Rejects the whole batch before any output is written.
fn check_labels(label: &[u32], classes: usize) -> Result<(), DeviceError> {
    match label.iter().position(|&l| l as usize >= classes) {
        Some(column) => Err(DeviceError::InvalidLabel {
            column,
            label: label[column],
            classes,
        }),
        None => Ok(()),
    }
}

/// Valid-mode cross-correlation, one task per batch image.
fn conv2d(input: &[f32], fm: &[f32], bias: &[f32], output: &mut [f32], g: &ConvGeometry) {
    let (ow, oh) = (g.out_width(), g.out_height());
    let (c_len, kw, kh) = (g.channels, g.kernel_width, g.kernel_height);
    let kernel_len = g.kernel_len();

    output
        .par_chunks_mut(g.out_image_len())
        .enumerate()
        .for_each(|(n, out)| {
            let image = &input[n * g.image_len()..(n + 1) * g.image_len()];
            for y in 0..oh {
                for x in 0..ow {
                    for (f, kernel) in fm.chunks_exact(kernel_len).enumerate() {
                        let mut acc = bias[f];
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let src = c_len * ((x + kx) + g.width * (y + ky));
                                let k = c_len * (kx + kw * ky);
                                for c in 0..c_len {
                                    acc += image[src + c] * kernel[k + c];
                                }
                            }
                        }
                        out[f + g.features * (x + ow * y)] = acc;
                    }
                }
            }
        });
}

/// Cross-correlation of the input with the output gradient, one task per
/// feature map.
fn conv2d_feature_map_grad(input: &[f32], grad: &[f32], fm_grad: &mut [f32], g: &ConvGeometry) {
    let (ow, oh) = (g.out_width(), g.out_height());
    let (c_len, kw, kh) = (g.channels, g.kernel_width, g.kernel_height);

    fm_grad
        .par_chunks_mut(g.kernel_len())
        .enumerate()
        .for_each(|(f, kernel_grad)| {
            kernel_grad.fill(0.0);
            for n in 0..g.batch {
                let image = &input[n * g.image_len()..(n + 1) * g.image_len()];
                let out = &grad[n * g.out_image_len()..(n + 1) * g.out_image_len()];
                for y in 0..oh {
                    for x in 0..ow {
                        let gv = out[f + g.features * (x + ow * y)];
                        if gv == 0.0 {
                            continue;
                        }
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let src = c_len * ((x + kx) + g.width * (y + ky));
                                let k = c_len * (kx + kw * ky);
                                for c in 0..c_len {
                                    kernel_grad[k + c] += image[src + c] * gv;
                                }
                            }
                        }
                    }
                }
            }
        });
}

/// Full convolution of the output gradient with the flipped feature maps,
/// written in scatter form: every output cell adds its kernel footprint back
/// onto the input positions it read. One task per batch image.
fn conv2d_input_grad(fm: &[f32], grad: &[f32], input_grad: &mut [f32], g: &ConvGeometry) {
    let (ow, oh) = (g.out_width(), g.out_height());
    let (c_len, kw, kh) = (g.channels, g.kernel_width, g.kernel_height);
    let kernel_len = g.kernel_len();

    input_grad
        .par_chunks_mut(g.image_len())
        .enumerate()
        .for_each(|(n, image_grad)| {
            image_grad.fill(0.0);
            let out = &grad[n * g.out_image_len()..(n + 1) * g.out_image_len()];
            for y in 0..oh {
                for x in 0..ow {
                    for (f, kernel) in fm.chunks_exact(kernel_len).enumerate() {
                        let gv = out[f + g.features * (x + ow * y)];
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let dst = c_len * ((x + kx) + g.width * (y + ky));
                                let k = c_len * (kx + kw * ky);
                                for c in 0..c_len {
                                    image_grad[dst + c] += gv * kernel[k + c];
                                }
                            }
                        }
                    }
                }
            }
        });
}

/// `sums[r] = Σ_j values[r + rows * j]`, the reduction behind both bias
/// gradients.
fn row_sum(values: &[f32], sums: &mut [f32], rows: usize) {
    sums.par_iter_mut().enumerate().for_each(|(r, sum)| {
        *sum = values.iter().skip(r).step_by(rows).sum();
    });
}

fn max_pool(input: &[f32], output: &mut [f32], g: &PoolGeometry) {
    let (ow, oh, s, c_len) = (g.out_width(), g.out_height(), g.window, g.channels);

    output
        .par_chunks_mut(g.out_image_len())
        .enumerate()
        .for_each(|(n, out)| {
            let image = &input[n * g.image_len()..(n + 1) * g.image_len()];
            for y in 0..oh {
                for x in 0..ow {
                    for c in 0..c_len {
                        let mut best = image[c + c_len * (x * s + g.width * (y * s))];
                        for dy in 0..s {
                            for dx in 0..s {
                                let v = image[c + c_len * ((x * s + dx) + g.width * (y * s + dy))];
                                if v > best {
                                    best = v;
                                }
                            }
                        }
                        out[c + c_len * (x + ow * y)] = best;
                    }
                }
            }
        });
}

fn max_pool_backward(
    input: &[f32],
    output: &[f32],
    output_grad: &[f32],
    input_grad: &mut [f32],
    g: &PoolGeometry,
) {
    let (ow, oh, s, c_len) = (g.out_width(), g.out_height(), g.window, g.channels);

    input_grad
        .par_chunks_mut(g.image_len())
        .enumerate()
        .for_each(|(n, image_grad)| {
            image_grad.fill(0.0);
            let image = &input[n * g.image_len()..(n + 1) * g.image_len()];
            let pooled = &output[n * g.out_image_len()..(n + 1) * g.out_image_len()];
            let grad = &output_grad[n * g.out_image_len()..(n + 1) * g.out_image_len()];
            for y in 0..oh {
                for x in 0..ow {
                    for c in 0..c_len {
                        let cell = c + c_len * (x + ow * y);
                        let target = pooled[cell];
                        'window: for dy in 0..s {
                            for dx in 0..s {
                                let at = c + c_len * ((x * s + dx) + g.width * (y * s + dy));
                                if image[at] == target {
                                    image_grad[at] = grad[cell];
                                    break 'window;
                                }
                            }
                        }
                    }
                }
            }
        });
}

/// One task per batch column; weight columns are contiguous so each input
/// element scales one of them into the output column.
fn dot_bias(input: &[f32], weight: &[f32], bias: &[f32], output: &mut [f32], g: &DenseGeometry) {
    output
        .par_chunks_mut(g.outputs)
        .enumerate()
        .for_each(|(n, out)| {
            out.copy_from_slice(bias);
            let column = &input[n * g.inputs..(n + 1) * g.inputs];
            for (w, &xi) in weight.chunks_exact(g.outputs).zip(column) {
                for (o, &wo) in out.iter_mut().zip(w) {
                    *o += wo * xi;
                }
            }
        });
}

/// `WeightGrad = OutputDelta · Inputᵀ`, one task per weight column.
fn dot_bias_weight_grad(input: &[f32], delta: &[f32], weight_grad: &mut [f32], g: &DenseGeometry) {
    weight_grad
        .par_chunks_mut(g.outputs)
        .enumerate()
        .for_each(|(i, column)| {
            column.fill(0.0);
            for (n, d) in delta.chunks_exact(g.outputs).enumerate() {
                let a = input[i + g.inputs * n];
                for (wg, &dv) in column.iter_mut().zip(d) {
                    *wg += dv * a;
                }
            }
        });
}

/// `InputDelta = Weightᵀ · OutputDelta`, one task per batch column.
fn dot_bias_input_delta(weight: &[f32], delta: &[f32], input_delta: &mut [f32], g: &DenseGeometry) {
    input_delta
        .par_chunks_mut(g.inputs)
        .enumerate()
        .for_each(|(n, column)| {
            let d = &delta[n * g.outputs..(n + 1) * g.outputs];
            for (id, w) in column.iter_mut().zip(weight.chunks_exact(g.outputs)) {
                *id = w.iter().zip(d).map(|(&wv, &dv)| wv * dv).sum();
            }
        });
}

fn binary<F>(a: Src<'_, Vec<f32>>, b: Src<'_, Vec<f32>>, result: &mut [f32], op: F)
where
    F: Fn(f32, f32) -> f32 + Sync,
{
    result.par_iter_mut().enumerate().for_each(|(i, r)| {
        let x = match a {
            Src::Buf(a) => a[i],
            Src::Dst => *r,
        };
        let y = match b {
            Src::Buf(b) => b[i],
            Src::Dst => *r,
        };
        *r = op(x, y);
    });
}
