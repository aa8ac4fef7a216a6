use pairgrad::error::{DeviceError, Error};
use pairgrad::nn::*;
use pairgrad::ops::{ActivationMode, Cpu};
use pairgrad::tensors::{Tensor, TensorRef};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn tensor(shape: &[usize], data: Vec<f32>) -> TensorRef<Cpu> {
    Tensor::from_vec(shape, data).unwrap().into_ref()
}

fn zeros(shape: &[usize]) -> TensorRef<Cpu> {
    let mut t = Tensor::new(shape);
    t.init().unwrap();
    t.into_ref()
}

fn labels(data: Vec<u32>) -> TensorRef<Cpu, u32> {
    let n = data.len();
    Tensor::from_vec([1, n], data).unwrap().into_ref()
}

fn seeded(shape: &[usize], seed: u64) -> TensorRef<Cpu> {
    let mut t = Tensor::new(shape);
    t.init().unwrap();
    t.randomize_with_seed(seed).unwrap();
    t.into_ref()
}

fn assert_close(got: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(got.len(), expected.len());
    for (i, (g, e)) in got.iter().zip(expected).enumerate() {
        assert!((g - e).abs() <= tol, "element {i}: got {g}, expected {e}");
    }
}

#[test]
fn test_convolution_gradients_match_finite_differences() {
    let mut rng = StdRng::seed_from_u64(11);
    let input = tensor(&[1, 6, 6, 1], (0..36).map(|_| rng.random_range(-1.0..1.0)).collect());
    let feature_map = seeded(&[1, 3, 3, 2], 3);
    let bias = tensor(&[2], vec![0.1, -0.2]);
    let output = zeros(&[2, 4, 4, 1]);
    // loss = Σ output · weights, so dloss/doutput = weights
    let weights: Vec<f32> = (0..32).map(|_| rng.random_range(-1.0..1.0)).collect();
    let output_grad = tensor(&[2, 4, 4, 1], weights.clone());

    let mut conv = Convolution::<Cpu>::new();
    conv.input.bind(&input);
    conv.feature_map.bind(&feature_map);
    conv.bias.bind(&bias);
    conv.output.bind(&output);
    conv.init().unwrap();

    let loss = |conv: &Convolution<Cpu>| -> f32 {
        conv.evaluate().unwrap();
        output.borrow().as_slice().iter().zip(&weights).map(|(o, w)| o * w).sum()
    };

    let fm_grad = zeros(&[1, 3, 3, 2]);
    let bias_grad = zeros(&[2]);
    let input_grad = zeros(&[1, 6, 6, 1]);
    let mut d = ConvolutionDerivative::<Cpu>::new();
    d.prev_activation.bind(&input);
    d.feature_map.bind(&feature_map);
    d.output_grad.bind(&output_grad);
    d.feature_map_grad.bind(&fm_grad);
    d.bias_grad.bind(&bias_grad);
    d.input_grad.bind(&input_grad);
    d.init().unwrap();
    d.evaluate().unwrap();

    let eps = 1e-2;
    let numeric = |t: &TensorRef<Cpu>, i: usize| -> f32 {
        let v = t.borrow()[i];
        t.borrow_mut()[i] = v + eps;
        let up = loss(&conv);
        t.borrow_mut()[i] = v - eps;
        let down = loss(&conv);
        t.borrow_mut()[i] = v;
        (up - down) / (2.0 * eps)
    };

    for i in 0..18 {
        let analytic = fm_grad.borrow()[i];
        assert!((numeric(&feature_map, i) - analytic).abs() < 1e-2, "feature map {i}");
    }
    for i in 0..2 {
        let analytic = bias_grad.borrow()[i];
        assert!((numeric(&bias, i) - analytic).abs() < 1e-2, "bias {i}");
    }
    for i in 0..36 {
        let analytic = input_grad.borrow()[i];
        assert!((numeric(&input, i) - analytic).abs() < 1e-2, "input {i}");
    }
}

#[test]
fn test_max_pooling_forward_and_backward() {
    let input = tensor(&[1, 4, 4, 1], (0..16).map(|v| v as f32).collect());
    let output = zeros(&[1, 2, 2, 1]);
    let mut pool = MaxPooling::<Cpu>::new();
    pool.input.bind(&input);
    pool.output.bind(&output);
    pool.init().unwrap();
    pool.evaluate().unwrap();
    assert_eq!(output.borrow().to_vec(), vec![5.0, 7.0, 13.0, 15.0]);

    let output_grad = tensor(&[1, 2, 2, 1], vec![1.0, 2.0, 3.0, 4.0]);
    let input_grad = tensor(&[1, 4, 4, 1], vec![9.0; 16]);
    let mut d = MaxPoolingDerivative::<Cpu>::new();
    d.input.bind(&input);
    d.output.bind(&output);
    d.output_grad.bind(&output_grad);
    d.input_grad.bind(&input_grad);
    d.init().unwrap();
    d.evaluate().unwrap();

    let mut expected = vec![0.0; 16];
    expected[5] = 1.0;
    expected[7] = 2.0;
    expected[13] = 3.0;
    expected[15] = 4.0;
    assert_eq!(input_grad.borrow().to_vec(), expected);
}

#[test]
fn test_sigmoid_derivative() {
    let x = tensor(&[3, 1], vec![-1.0, 0.0, 1.5]);
    let o = zeros(&[3, 1]);
    let mut act = Activation::<Cpu>::new(ActivationMode::Sigmoid);
    act.input.bind(&x);
    act.output.bind(&o);
    act.init().unwrap();
    act.evaluate().unwrap();

    let g = tensor(&[3, 1], vec![1.0, 2.0, -1.0]);
    let gi = zeros(&[3, 1]);
    let mut d = ActivationDerivative::<Cpu>::new(ActivationMode::Sigmoid);
    d.output.bind(&o);
    d.output_delta.bind(&g);
    d.input_delta.bind(&gi);
    d.init().unwrap();
    d.evaluate().unwrap();

    let o = o.borrow().to_vec();
    let expected: Vec<f32> = o
        .iter()
        .zip([1.0, 2.0, -1.0])
        .map(|(o, g)| o * (1.0 - o) * g)
        .collect();
    assert_close(&gi.borrow().to_vec(), &expected, 1e-7);
    assert_eq!(gi.borrow()[1], 0.5);
}

#[test]
fn test_softmax_gradient_sums_to_zero() {
    let input = seeded(&[10, 4], 5);
    let label = labels(vec![0, 9, 3, 3]);
    let output = zeros(&[10, 4]);
    let cost = zeros(&[1, 4]);
    let grad = zeros(&[10, 4]);

    let mut loss = SoftmaxLogLoss::<Cpu>::new();
    loss.input.bind(&input);
    loss.label.bind(&label);
    loss.output.bind(&output);
    loss.cost.bind(&cost);
    loss.init().unwrap();
    loss.evaluate().unwrap();

    let mut d = SoftmaxLogLossDerivative::<Cpu>::new();
    d.output.bind(&output);
    d.label.bind(&label);
    d.input_grad.bind(&grad);
    d.init().unwrap();
    d.evaluate().unwrap();

    let output = output.borrow();
    let grad = grad.borrow();
    let cost = cost.borrow();
    for (n, &l) in [0usize, 9, 3, 3].iter().enumerate() {
        let column = &grad.as_slice()[n * 10..(n + 1) * 10];
        assert!(column.iter().sum::<f32>().abs() < 1e-6);
        assert!((column[l] - (output[n * 10 + l] - 1.0)).abs() < 1e-7);
        assert!((cost[n] + output[n * 10 + l].ln()).abs() < 1e-5);
    }
}

#[test]
fn test_update_with_negative_rate() {
    let w = seeded(&[5, 3], 21);
    let g = seeded(&[5, 3], 22);
    let before = w.borrow().to_vec();
    let grad = g.borrow().to_vec();

    let mut step = ElementwiseAdd::update(&w, &g);
    step.set_rate(-0.01);
    step.init().unwrap();
    step.evaluate().unwrap();

    let expected: Vec<f32> = before.iter().zip(&grad).map(|(w, g)| w - 0.01 * g).collect();
    assert_close(&w.borrow().to_vec(), &expected, 1e-7);
    assert_eq!(g.borrow().to_vec(), grad);
}

#[test]
fn test_dense_sigmoid_softmax_end_to_end() {
    let x = tensor(&[3, 2], vec![0.5, -1.0, 2.0, 1.5, 0.25, -0.5]);
    let w = tensor(&[2, 3], vec![0.1, 0.4, -0.2, 0.5, 0.3, -0.6]);
    let b = tensor(&[2], vec![0.05, -0.1]);
    let label = labels(vec![1, 0]);
    let z = zeros(&[2, 2]);
    let s = zeros(&[2, 2]);
    let p = zeros(&[2, 2]);
    let cost = zeros(&[1, 2]);

    let mut dense = DotProductWithBias::<Cpu>::new();
    dense.input.bind(&x);
    dense.weight.bind(&w);
    dense.bias.bind(&b);
    dense.output.bind(&z);
    let mut sigmoid = Activation::<Cpu>::default();
    sigmoid.input.bind(&z);
    sigmoid.output.bind(&s);
    let mut loss = SoftmaxLogLoss::<Cpu>::new();
    loss.input.bind(&s);
    loss.label.bind(&label);
    loss.output.bind(&p);
    loss.cost.bind(&cost);

    let grad_s = zeros(&[2, 2]);
    let grad_z = zeros(&[2, 2]);
    let wg = zeros(&[2, 3]);
    let bg = zeros(&[2]);

    let mut loss_d = SoftmaxLogLossDerivative::<Cpu>::new();
    loss_d.output.bind(&p);
    loss_d.label.bind(&label);
    loss_d.input_grad.bind(&grad_s);
    let mut sigmoid_d = ActivationDerivative::<Cpu>::default();
    sigmoid_d.output.bind(&s);
    sigmoid_d.output_delta.bind(&grad_s);
    sigmoid_d.input_delta.bind(&grad_z);
    let mut dense_d = DotProductWithBiasDerivative::<Cpu>::new();
    dense_d.input_activation.bind(&x);
    dense_d.output_delta.bind(&grad_z);
    dense_d.weight.bind(&w);
    dense_d.weight_grad.bind(&wg);
    dense_d.bias_grad.bind(&bg);

    let pipeline: [&mut dyn Operator; 6] = [
        &mut dense,
        &mut sigmoid,
        &mut loss,
        &mut loss_d,
        &mut sigmoid_d,
        &mut dense_d,
    ];
    for op in pipeline {
        op.init().unwrap();
        op.evaluate().unwrap();
    }

    assert_close(&cost.borrow().to_vec(), &[1.001_038_9, 0.807_001], 1e-5);
    assert_close(
        &wg.borrow().to_vec(),
        &[-0.142_687_4, 0.124_697_7, -0.164_592_3, 0.116_550_7, 0.329_184_7, -0.233_101_3],
        1e-5,
    );
    assert_close(&bg.borrow().to_vec(), &[-0.008_472, 0.024_197_8], 1e-5);
}

#[test]
fn test_configuration_errors_name_operator_and_role() {
    let mut conv = Convolution::<Cpu>::new();
    conv.input.bind(&zeros(&[1, 6, 6, 1]));
    conv.feature_map.bind(&zeros(&[1, 3, 3, 2]));
    conv.output.bind(&zeros(&[2, 4, 4, 1]));
    let err = conv.init().unwrap_err();
    assert!(matches!(err, Error::Unbound { operator: "Convolution", role: "Bias" }));
    assert!(err.to_string().contains("Bias"));

    assert!(matches!(
        conv.evaluate(),
        Err(Error::NotInitialized { operator: "Convolution" })
    ));

    let mut pool = MaxPooling::<Cpu>::new();
    pool.input.bind(&zeros(&[1, 5, 5, 1]));
    pool.output.bind(&zeros(&[1, 2, 2, 1]));
    assert!(matches!(pool.init(), Err(Error::Incompatible { operator: "MaxPooling", .. })));

    let t = zeros(&[2, 2]);
    let mut dense = DotProductWithBias::<Cpu>::new();
    dense.input.bind(&t);
    dense.weight.bind(&zeros(&[2, 2]));
    dense.bias.bind(&zeros(&[2]));
    dense.output.bind(&t);
    assert!(matches!(
        dense.init(),
        Err(Error::Aliased { role: "Output", other: "Input", .. })
    ));
}

#[test]
fn test_invalid_label_is_reported_by_kernel() {
    let label = labels(vec![0, 1, 0, 9]);
    let output = tensor(&[2, 4], vec![-7.0; 8]);
    let cost = tensor(&[1, 4], vec![-7.0; 4]);

    let mut loss = SoftmaxLogLoss::<Cpu>::new();
    loss.input.bind(&seeded(&[2, 4], 12));
    loss.label.bind(&label);
    loss.output.bind(&output);
    loss.cost.bind(&cost);
    loss.init().unwrap();
    let err = loss.evaluate().unwrap_err();
    assert!(matches!(
        err,
        Error::Kernel {
            source: DeviceError::InvalidLabel { column: 3, label: 9, classes: 2 },
            ..
        }
    ));
    // no column is written once any label is out of range
    assert_eq!(output.borrow().to_vec(), vec![-7.0; 8]);
    assert_eq!(cost.borrow().to_vec(), vec![-7.0; 4]);

    let input_grad = tensor(&[2, 4], vec![-7.0; 8]);
    let mut loss_d = SoftmaxLogLossDerivative::<Cpu>::new();
    loss_d.output.bind(&tensor(&[2, 4], vec![0.5; 8]));
    loss_d.label.bind(&label);
    loss_d.input_grad.bind(&input_grad);
    loss_d.init().unwrap();
    let err = loss_d.evaluate().unwrap_err();
    assert!(matches!(
        err,
        Error::Kernel {
            operator: "SoftmaxLogLossDerivative",
            source: DeviceError::InvalidLabel { column: 3, .. },
        }
    ));
    assert_eq!(input_grad.borrow().to_vec(), vec![-7.0; 8]);
}

#[test]
fn test_pooled_tensor_reshaped_between_evaluations() {
    let input = seeded(&[2, 4, 4, 3], 8);
    let pooled = zeros(&[2, 2, 2, 3]);
    let mut pool = MaxPooling::<Cpu>::new();
    pool.input.bind(&input);
    pool.output.bind(&pooled);
    pool.init().unwrap();

    pooled.borrow_mut().reshape([8, 3]).unwrap();
    let out = zeros(&[4, 3]);
    let mut dense = DotProductWithBias::<Cpu>::new();
    dense.input.bind(&pooled);
    dense.weight.bind(&seeded(&[4, 8], 9));
    dense.bias.bind(&zeros(&[4]));
    dense.output.bind(&out);
    dense.init().unwrap();

    pooled.borrow_mut().reshape([2, 2, 2, 3]).unwrap();
    pool.evaluate().unwrap();
    pooled.borrow_mut().reshape([8, 3]).unwrap();
    dense.evaluate().unwrap();
    assert_eq!(out.borrow().shape(), &[4, 3]);
}

#[test]
fn test_training_loop_reduces_cost() {
    // two classes separated along the first feature
    let x = tensor(
        &[4, 6],
        vec![
            1.0, 0.2, -0.1, 0.3, //
            0.9, -0.3, 0.2, 0.0, //
            1.2, 0.1, 0.1, -0.2, //
            -1.0, 0.3, 0.0, 0.1, //
            -0.8, -0.2, 0.2, 0.3, //
            -1.1, 0.0, -0.3, -0.1,
        ],
    );
    let label = labels(vec![0, 0, 0, 1, 1, 1]);
    let w = seeded(&[2, 4], 1);
    let b = zeros(&[2]);
    let z = zeros(&[2, 6]);
    let p = zeros(&[2, 6]);
    let cost = zeros(&[1, 6]);
    let gz = zeros(&[2, 6]);
    let wg = zeros(&[2, 4]);
    let bg = zeros(&[2]);

    let mut dense = DotProductWithBias::<Cpu>::new();
    dense.input.bind(&x);
    dense.weight.bind(&w);
    dense.bias.bind(&b);
    dense.output.bind(&z);
    let mut loss = SoftmaxLogLoss::<Cpu>::new();
    loss.input.bind(&z);
    loss.label.bind(&label);
    loss.output.bind(&p);
    loss.cost.bind(&cost);
    let mut loss_d = SoftmaxLogLossDerivative::<Cpu>::new();
    loss_d.output.bind(&p);
    loss_d.label.bind(&label);
    loss_d.input_grad.bind(&gz);
    let mut dense_d = DotProductWithBiasDerivative::<Cpu>::new();
    dense_d.input_activation.bind(&x);
    dense_d.output_delta.bind(&gz);
    dense_d.weight.bind(&w);
    dense_d.weight_grad.bind(&wg);
    dense_d.bias_grad.bind(&bg);
    let mut update_w = ElementwiseAdd::update(&w, &wg);
    let mut update_b = ElementwiseAdd::update(&b, &bg);
    update_w.set_rate(-0.1);
    update_b.set_rate(-0.1);

    let mut ops: [&mut dyn Operator; 6] = [
        &mut dense,
        &mut loss,
        &mut loss_d,
        &mut dense_d,
        &mut update_w,
        &mut update_b,
    ];
    for op in ops.iter_mut() {
        op.init().unwrap();
    }

    let mut costs = Vec::new();
    for _ in 0..50 {
        for op in ops.iter() {
            op.evaluate().unwrap();
        }
        costs.push(cost.borrow().as_slice().iter().sum::<f32>());
    }
    assert!(costs[49] < costs[0] * 0.5, "costs {:?}", costs);
    assert_eq!(predictions(&*p.borrow()).unwrap(), vec![0, 0, 0, 1, 1, 1]);
}
