//! Trains a small convolutional classifier on synthetic 28x28 images.
//!
//! conv 5x5x20 → sigmoid → 2x2 max-pool → dense 100 → sigmoid → dense 10 →
//! softmax log-loss, with hand-wired derivatives and gradient-descent updates.
//!
//! Run with `cargo run --example conv_net` (add `--features wgpu` to train on
//! the GPU when an adapter is present).

use std::error::Error;

use pairgrad::nn::*;
use pairgrad::ops::{ActivationMode, Cpu, Device};
use pairgrad::tensors::{Tensor, TensorRef};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SIDE: usize = 28;
const CLASSES: usize = 10;
const BATCH: usize = 10;
const FEATURES: usize = 20;
const KERNEL: usize = 5;
const HIDDEN: usize = 100;
const TRAIN: usize = 300;
const TEST: usize = 100;
const EPOCHS: usize = 4;
const DECAY: f32 = 0.95;

/// Image with a bright 6x6 patch whose position encodes the class, plus noise.
fn sample(rng: &mut StdRng, class: usize) -> Vec<f32> {
    let (px, py) = (2 + (class % 5) * 5, 4 + (class / 5) * 12);
    let mut image = vec![0.0; SIDE * SIDE];
    for (i, v) in image.iter_mut().enumerate() {
        let (x, y) = (i % SIDE, i / SIDE);
        let patch = (px..px + 6).contains(&x) && (py..py + 6).contains(&y);
        let base = if patch { 1.0 } else { 0.0 };
        *v = base + rng.random_range(-0.2..0.2);
    }
    image
}

fn dataset(rng: &mut StdRng, len: usize) -> (Vec<f32>, Vec<u32>) {
    let mut images = Vec::with_capacity(len * SIDE * SIDE);
    let mut labels = Vec::with_capacity(len);
    for _ in 0..len {
        let class = rng.random_range(0..CLASSES);
        images.extend(sample(rng, class));
        labels.push(class as u32);
    }
    (images, labels)
}

fn zeros<D: Device>(shape: &[usize]) -> Result<TensorRef<D>, pairgrad::Error> {
    let mut t = Tensor::new(shape);
    t.init()?;
    Ok(t.into_ref())
}

fn random<D: Device>(shape: &[usize], seed: u64) -> Result<TensorRef<D>, pairgrad::Error> {
    let mut t = Tensor::new(shape);
    t.init()?;
    t.randomize_with_seed(seed)?;
    Ok(t.into_ref())
}

fn load<D: Device, T: pairgrad::ops::Element>(
    tensor: &TensorRef<D, T>,
    data: &[T],
) -> Result<(), pairgrad::Error> {
    let mut t = tensor.borrow_mut();
    t.as_mut_slice().copy_from_slice(data);
    t.copy_from_host_to_device()
}

fn train<D: Device>() -> Result<(), Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(2024);
    let (train_images, train_labels) = dataset(&mut rng, TRAIN);
    let (test_images, test_labels) = dataset(&mut rng, TEST);

    let out_side = SIDE - KERNEL + 1;
    let pooled_side = out_side / 2;
    let flat = FEATURES * pooled_side * pooled_side;

    // activations
    let image = zeros::<D>(&[1, SIDE, SIDE, BATCH])?;
    let label: TensorRef<D, u32> = {
        let mut t = Tensor::new([1, BATCH]);
        t.init()?;
        t.into_ref()
    };
    let conv_out = zeros::<D>(&[FEATURES, out_side, out_side, BATCH])?;
    let pooled = zeros::<D>(&[FEATURES, pooled_side, pooled_side, BATCH])?;
    let hidden = zeros::<D>(&[HIDDEN, BATCH])?;
    let scores = zeros::<D>(&[CLASSES, BATCH])?;
    let probs = zeros::<D>(&[CLASSES, BATCH])?;
    let cost = zeros::<D>(&[1, BATCH])?;

    // parameters
    let fm = random::<D>(&[1, KERNEL, KERNEL, FEATURES], 1)?;
    let conv_bias = zeros::<D>(&[FEATURES])?;
    let w1 = random::<D>(&[HIDDEN, flat], 2)?;
    let b1 = zeros::<D>(&[HIDDEN])?;
    let w2 = random::<D>(&[CLASSES, HIDDEN], 3)?;
    let b2 = zeros::<D>(&[CLASSES])?;

    // gradients
    let score_grad = zeros::<D>(&[CLASSES, BATCH])?;
    let hidden_grad = zeros::<D>(&[HIDDEN, BATCH])?;
    let pooled_grad = zeros::<D>(&[flat, BATCH])?;
    let conv_grad = zeros::<D>(&[FEATURES, out_side, out_side, BATCH])?;
    let fm_grad = zeros::<D>(&[1, KERNEL, KERNEL, FEATURES])?;
    let conv_bias_grad = zeros::<D>(&[FEATURES])?;
    let w1_grad = zeros::<D>(&[HIDDEN, flat])?;
    let b1_grad = zeros::<D>(&[HIDDEN])?;
    let w2_grad = zeros::<D>(&[CLASSES, HIDDEN])?;
    let b2_grad = zeros::<D>(&[CLASSES])?;

    let mut conv = Convolution::<D>::new();
    conv.input.bind(&image);
    conv.feature_map.bind(&fm);
    conv.bias.bind(&conv_bias);
    conv.output.bind(&conv_out);
    conv.init()?;

    let mut conv_act = Activation::<D>::new(ActivationMode::Sigmoid);
    conv_act.input.bind(&conv_out);
    conv_act.output.bind(&conv_out);
    conv_act.init()?;

    let mut pool = MaxPooling::<D>::new();
    pool.input.bind(&conv_out);
    pool.output.bind(&pooled);
    pool.init()?;
    pooled.borrow_mut().reshape([flat, BATCH])?;

    let mut dense1 = DotProductWithBias::<D>::new();
    dense1.input.bind(&pooled);
    dense1.weight.bind(&w1);
    dense1.bias.bind(&b1);
    dense1.output.bind(&hidden);
    dense1.init()?;

    let mut hidden_act = Activation::<D>::new(ActivationMode::Sigmoid);
    hidden_act.input.bind(&hidden);
    hidden_act.output.bind(&hidden);
    hidden_act.init()?;

    let mut dense2 = DotProductWithBias::<D>::new();
    dense2.input.bind(&hidden);
    dense2.weight.bind(&w2);
    dense2.bias.bind(&b2);
    dense2.output.bind(&scores);
    dense2.init()?;

    let mut loss = SoftmaxLogLoss::<D>::new();
    loss.input.bind(&scores);
    loss.label.bind(&label);
    loss.output.bind(&probs);
    loss.cost.bind(&cost);
    loss.init()?;

    let mut loss_d = SoftmaxLogLossDerivative::<D>::new();
    loss_d.output.bind(&probs);
    loss_d.label.bind(&label);
    loss_d.input_grad.bind(&score_grad);

    let mut dense2_d = DotProductWithBiasDerivative::<D>::new();
    dense2_d.input_activation.bind(&hidden);
    dense2_d.output_delta.bind(&score_grad);
    dense2_d.weight.bind(&w2);
    dense2_d.weight_grad.bind(&w2_grad);
    dense2_d.bias_grad.bind(&b2_grad);
    dense2_d.input_delta.bind(&hidden_grad);

    let mut hidden_act_d = ActivationDerivative::<D>::new(ActivationMode::Sigmoid);
    hidden_act_d.output.bind(&hidden);
    hidden_act_d.output_delta.bind(&hidden_grad);
    hidden_act_d.input_delta.bind(&hidden_grad);

    let mut dense1_d = DotProductWithBiasDerivative::<D>::new();
    dense1_d.input_activation.bind(&pooled);
    dense1_d.output_delta.bind(&hidden_grad);
    dense1_d.weight.bind(&w1);
    dense1_d.weight_grad.bind(&w1_grad);
    dense1_d.bias_grad.bind(&b1_grad);
    dense1_d.input_delta.bind(&pooled_grad);

    let mut pool_d = MaxPoolingDerivative::<D>::new();
    pool_d.input.bind(&conv_out);
    pool_d.output.bind(&pooled);
    pool_d.output_grad.bind(&pooled_grad);
    pool_d.input_grad.bind(&conv_grad);

    let mut conv_act_d = ActivationDerivative::<D>::new(ActivationMode::Sigmoid);
    conv_act_d.output.bind(&conv_out);
    conv_act_d.output_delta.bind(&conv_grad);
    conv_act_d.input_delta.bind(&conv_grad);

    let mut conv_d = ConvolutionDerivative::<D>::new();
    conv_d.prev_activation.bind(&image);
    conv_d.feature_map.bind(&fm);
    conv_d.output_grad.bind(&conv_grad);
    conv_d.feature_map_grad.bind(&fm_grad);
    conv_d.bias_grad.bind(&conv_bias_grad);

    let mut updates = [
        ElementwiseAdd::update(&fm, &fm_grad),
        ElementwiseAdd::update(&conv_bias, &conv_bias_grad),
        ElementwiseAdd::update(&w1, &w1_grad),
        ElementwiseAdd::update(&b1, &b1_grad),
        ElementwiseAdd::update(&w2, &w2_grad),
        ElementwiseAdd::update(&b2, &b2_grad),
    ];

    let forward: [&dyn Operator; 7] = [
        &conv, &conv_act, &pool, &dense1, &hidden_act, &dense2, &loss,
    ];
    let mut backward: [&mut dyn Operator; 7] = [
        &mut loss_d,
        &mut dense2_d,
        &mut hidden_act_d,
        &mut dense1_d,
        &mut pool_d,
        &mut conv_act_d,
        &mut conv_d,
    ];
    for op in backward.iter_mut() {
        op.init()?;
    }
    for update in updates.iter_mut() {
        update.init()?;
    }

    let image_len = SIDE * SIDE * BATCH;
    let mut lr = 0.5f32;
    println!("Training on {} ({} samples, batch {BATCH})", D::KIND, TRAIN);

    for epoch in 0..EPOCHS {
        for update in updates.iter_mut() {
            update.set_rate(-lr / BATCH as f32);
        }
        let mut epoch_cost = 0.0;
        for b in 0..TRAIN / BATCH {
            load(&image, &train_images[b * image_len..(b + 1) * image_len])?;
            load(&label, &train_labels[b * BATCH..(b + 1) * BATCH])?;
            for op in forward.iter() {
                op.evaluate()?;
            }
            for op in backward.iter() {
                op.evaluate()?;
            }
            for update in updates.iter() {
                update.evaluate()?;
            }
            let mut host = cost.borrow_mut();
            host.copy_from_device_to_host()?;
            epoch_cost += host.as_slice().iter().sum::<f32>();
        }

        let mut correct = 0;
        for b in 0..TEST / BATCH {
            load(&image, &test_images[b * image_len..(b + 1) * image_len])?;
            load(&label, &test_labels[b * BATCH..(b + 1) * BATCH])?;
            for op in forward.iter() {
                op.evaluate()?;
            }
            let mut host = probs.borrow_mut();
            host.copy_from_device_to_host()?;
            let predicted = predictions(&*host)?;
            correct += predicted
                .iter()
                .zip(&test_labels[b * BATCH..(b + 1) * BATCH])
                .filter(|(p, l)| p == l)
                .count();
        }

        println!(
            "EPOCH {epoch}: cost={:.4}, lr={lr:.4}, accuracy={:.1}%",
            epoch_cost / TRAIN as f32,
            100.0 * correct as f32 / TEST as f32
        );
        lr *= DECAY;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    #[cfg(any(feature = "wgpu", feature = "cuda"))]
    if pairgrad::ops::wgpu::is_available() {
        return train::<pairgrad::ops::Gpu>();
    }
    train::<Cpu>()
}
