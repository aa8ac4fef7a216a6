//! Fully-connected layer and its derivative.
//!
//! Matrix roles are read as `[rows, batch]` views: every dimension but the
//! last is flattened into rows. A pooled `[C, W, H, N]` activation can
//! therefore feed `Input` directly, or be reshaped to `[C*W*H, N]` first;
//! both address the same elements.

use crate::error::{Error, Result};
use crate::nn::{expect_len, expect_shape, forbid_alias, kernel_failed, matrix, Operator, Param};
use crate::ops::dispatch::{DenseGeometry, Device};

fn weight_extents<D: Device>(operator: &'static str, weight: &Param<D>) -> Result<(usize, usize)> {
    match weight.shape(operator)?.as_slice() {
        &[outputs, inputs] => Ok((outputs, inputs)),
        other => Err(Error::Incompatible {
            operator,
            role: weight.role(),
            reason: format!("must be a rank 2 [outputs, inputs] matrix, got {other:?}"),
        }),
    }
}

/// `Output = Weight · Input + Bias`, bias broadcast over the batch.
///
/// Roles: `Input [I, N]`, `Weight [O, I]`, `Bias [O]` → `Output [O, N]`.
pub struct DotProductWithBias<D: Device> {
    pub input: Param<D>,
    pub weight: Param<D>,
    pub bias: Param<D>,
    pub output: Param<D>,
    geometry: Option<DenseGeometry>,
}

impl<D: Device> DotProductWithBias<D> {
    pub const NAME: &'static str = "DotProductWithBias";

    pub fn new() -> Self {
        Self {
            input: Param::required("Input"),
            weight: Param::required("Weight"),
            bias: Param::required("Bias"),
            output: Param::required("Output"),
            geometry: None,
        }
    }

    pub fn geometry(&self) -> Option<&DenseGeometry> {
        self.geometry.as_ref()
    }
}

impl<D: Device> Default for DotProductWithBias<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> Operator for DotProductWithBias<D> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self) -> Result<()> {
        self.geometry = None;
        let input = self.input.shape(Self::NAME)?;
        let (outputs, inputs) = weight_extents(Self::NAME, &self.weight)?;
        let bias = self.bias.shape(Self::NAME)?;
        let output = self.output.shape(Self::NAME)?;

        forbid_alias(
            Self::NAME,
            &self.output,
            &[&self.input, &self.weight, &self.bias],
        )?;

        let (rows, batch) = matrix(&input);
        if rows != inputs {
            return Err(Error::ShapeMismatch {
                operator: Self::NAME,
                role: self.input.role(),
                expected: vec![inputs, batch],
                got: input,
            });
        }
        expect_len(Self::NAME, self.bias.role(), &bias, &[outputs])?;
        expect_shape(Self::NAME, self.output.role(), &output, &[outputs, batch])?;

        let g = DenseGeometry {
            inputs,
            outputs,
            batch,
        };
        log::debug!("{}: initialized {g:?} on {}", Self::NAME, D::KIND);
        self.geometry = Some(g);
        Ok(())
    }

    fn evaluate(&self) -> Result<()> {
        let g = self.geometry.ok_or(Error::NotInitialized {
            operator: Self::NAME,
        })?;
        log::trace!("{}: evaluate", Self::NAME);

        let input = self.input.read(Self::NAME, g.input_len())?;
        let weight = self.weight.read(Self::NAME, g.weight_len())?;
        let bias = self.bias.read(Self::NAME, g.outputs)?;
        let mut output = self.output.write(Self::NAME, g.output_len())?;
        D::dot_bias(
            input.buffer()?,
            weight.buffer()?,
            bias.buffer()?,
            output.buffer_mut()?,
            &g,
        )
        .map_err(kernel_failed(Self::NAME))
    }
}

/// Gradients of [`DotProductWithBias`].
///
/// Roles: `InputActivation [I, N]`, `OutputDelta [O, N]`, `Weight [O, I]` →
/// `WeightGrad [O, I]`, `BiasGrad [O]`, `InputDelta [I, N]` (optional).
///
/// `WeightGrad = OutputDelta · InputActivationᵀ`,
/// `BiasGrad = Σ_batch OutputDelta`, `InputDelta = Weightᵀ · OutputDelta`.
pub struct DotProductWithBiasDerivative<D: Device> {
    pub input_activation: Param<D>,
    pub output_delta: Param<D>,
    pub weight: Param<D>,
    pub weight_grad: Param<D>,
    pub bias_grad: Param<D>,
    pub input_delta: Param<D>,
    geometry: Option<DenseGeometry>,
}

impl<D: Device> DotProductWithBiasDerivative<D> {
    pub const NAME: &'static str = "DotProductWithBiasDerivative";

    pub fn new() -> Self {
        Self {
            input_activation: Param::required("InputActivation"),
            output_delta: Param::required("OutputDelta"),
            weight: Param::required("Weight"),
            weight_grad: Param::required("WeightGrad"),
            bias_grad: Param::required("BiasGrad"),
            input_delta: Param::optional("InputDelta"),
            geometry: None,
        }
    }

    pub fn geometry(&self) -> Option<&DenseGeometry> {
        self.geometry.as_ref()
    }
}

impl<D: Device> Default for DotProductWithBiasDerivative<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> Operator for DotProductWithBiasDerivative<D> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self) -> Result<()> {
        self.geometry = None;
        let input = self.input_activation.shape(Self::NAME)?;
        let output_delta = self.output_delta.shape(Self::NAME)?;
        let (outputs, inputs) = weight_extents(Self::NAME, &self.weight)?;
        let weight_grad = self.weight_grad.shape(Self::NAME)?;
        let bias_grad = self.bias_grad.shape(Self::NAME)?;
        let input_delta = self.input_delta.shape_if_bound(Self::NAME)?;

        let sources = [&self.input_activation, &self.output_delta, &self.weight];
        forbid_alias(Self::NAME, &self.weight_grad, &sources)?;
        forbid_alias(Self::NAME, &self.bias_grad, &sources)?;
        forbid_alias(Self::NAME, &self.bias_grad, &[&self.weight_grad])?;
        if self.input_delta.is_bound() {
            forbid_alias(Self::NAME, &self.input_delta, &sources)?;
            forbid_alias(
                Self::NAME,
                &self.input_delta,
                &[&self.weight_grad, &self.bias_grad],
            )?;
        }

        let (rows, batch) = matrix(&input);
        if rows != inputs {
            return Err(Error::ShapeMismatch {
                operator: Self::NAME,
                role: self.input_activation.role(),
                expected: vec![inputs, batch],
                got: input,
            });
        }
        expect_len(Self::NAME, self.output_delta.role(), &output_delta, &[outputs, batch])?;
        expect_len(Self::NAME, self.weight_grad.role(), &weight_grad, &[outputs, inputs])?;
        expect_len(Self::NAME, self.bias_grad.role(), &bias_grad, &[outputs])?;
        if let Some(shape) = input_delta {
            expect_len(Self::NAME, self.input_delta.role(), &shape, &[inputs, batch])?;
        }

        let g = DenseGeometry {
            inputs,
            outputs,
            batch,
        };
        log::debug!("{}: initialized {g:?} on {}", Self::NAME, D::KIND);
        self.geometry = Some(g);
        Ok(())
    }

    fn evaluate(&self) -> Result<()> {
        let g = self.geometry.ok_or(Error::NotInitialized {
            operator: Self::NAME,
        })?;
        log::trace!("{}: evaluate", Self::NAME);

        let input = self.input_activation.read(Self::NAME, g.input_len())?;
        let output_delta = self.output_delta.read(Self::NAME, g.output_len())?;
        let weight = self.weight.read(Self::NAME, g.weight_len())?;
        let mut weight_grad = self.weight_grad.write(Self::NAME, g.weight_len())?;
        let mut bias_grad = self.bias_grad.write(Self::NAME, g.outputs)?;
        let mut input_delta = self.input_delta.write_if_bound(Self::NAME, g.input_len())?;

        let input_delta = match input_delta.as_deref_mut() {
            Some(t) => Some(t.buffer_mut()?),
            None => None,
        };
        D::dot_bias_backward(
            input.buffer()?,
            output_delta.buffer()?,
            weight.buffer()?,
            weight_grad.buffer_mut()?,
            bias_grad.buffer_mut()?,
            input_delta,
            &g,
        )
        .map_err(kernel_failed(Self::NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Cpu;
    use crate::tensors::{Tensor, TensorRef};

    fn tensor(shape: &[usize], data: Vec<f32>) -> TensorRef<Cpu> {
        Tensor::from_vec(shape, data).unwrap().into_ref()
    }

    fn zeros(shape: &[usize]) -> TensorRef<Cpu> {
        let mut t = Tensor::new(shape);
        t.init().unwrap();
        t.into_ref()
    }

    #[test]
    fn pooled_activation_feeds_input_without_reshape() {
        let mut dense = DotProductWithBias::<Cpu>::new();
        dense.input.bind(&zeros(&[2, 3, 3, 4]));
        dense.weight.bind(&zeros(&[5, 18]));
        dense.bias.bind(&zeros(&[5]));
        dense.output.bind(&zeros(&[5, 4]));
        dense.init().unwrap();
        assert_eq!(
            dense.geometry().copied(),
            Some(DenseGeometry {
                inputs: 18,
                outputs: 5,
                batch: 4
            })
        );
    }

    #[test]
    fn forward_is_weighted_sum_plus_bias() {
        // rows [1, 2, 3] and [4, 5, 6]
        let weight = tensor(&[2, 3], vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let input = tensor(&[3, 2], vec![1.0, 0.0, -1.0, 2.0, 1.0, 0.0]);
        let bias = tensor(&[2], vec![0.5, -0.5]);
        let output = zeros(&[2, 2]);

        let mut dense = DotProductWithBias::<Cpu>::new();
        dense.input.bind(&input);
        dense.weight.bind(&weight);
        dense.bias.bind(&bias);
        dense.output.bind(&output);
        dense.init().unwrap();
        dense.evaluate().unwrap();
        assert_eq!(output.borrow().to_vec(), vec![-1.5, -2.5, 4.5, 12.5]);
    }

    #[test]
    fn init_rejects_inner_dimension_mismatch() {
        let mut dense = DotProductWithBias::<Cpu>::new();
        dense.input.bind(&zeros(&[4, 2]));
        dense.weight.bind(&zeros(&[3, 5]));
        dense.bias.bind(&zeros(&[3]));
        dense.output.bind(&zeros(&[3, 2]));
        assert!(matches!(
            dense.init(),
            Err(Error::ShapeMismatch { role: "Input", .. })
        ));
    }

    #[test]
    fn init_rejects_non_matrix_weight() {
        let mut dense = DotProductWithBias::<Cpu>::new();
        dense.input.bind(&zeros(&[4, 2]));
        dense.weight.bind(&zeros(&[12]));
        dense.bias.bind(&zeros(&[3]));
        dense.output.bind(&zeros(&[3, 2]));
        assert!(matches!(
            dense.init(),
            Err(Error::Incompatible { role: "Weight", .. })
        ));
    }

    #[test]
    fn derivative_input_delta_is_transposed_product() {
        // Weight [2, 3] stored column-major: (r, c) at r + 2c
        let weight = tensor(&[2, 3], vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let input = tensor(&[3, 1], vec![1.0, 1.0, 1.0]);
        let delta = tensor(&[2, 1], vec![1.0, -1.0]);
        let weight_grad = zeros(&[2, 3]);
        let bias_grad = zeros(&[2]);
        let input_delta = zeros(&[3, 1]);

        let mut d = DotProductWithBiasDerivative::<Cpu>::new();
        d.input_activation.bind(&input);
        d.output_delta.bind(&delta);
        d.weight.bind(&weight);
        d.weight_grad.bind(&weight_grad);
        d.bias_grad.bind(&bias_grad);
        d.input_delta.bind(&input_delta);
        d.init().unwrap();
        d.evaluate().unwrap();

        assert_eq!(input_delta.borrow().to_vec(), vec![-3.0, -3.0, -3.0]);
        assert_eq!(weight_grad.borrow().to_vec(), vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0]);
        assert_eq!(bias_grad.borrow().to_vec(), vec![1.0, -1.0]);
    }
}
