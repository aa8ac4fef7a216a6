//! Softmax with negative log-likelihood, per batch column.
//!
//! Scores are `[K, N]`: `K` classes down each column, one column per batch
//! sample. Labels are `u32` class indices, one per column.

use crate::error::{Error, Result};
use crate::nn::{expect_len, expect_shape, forbid_alias, kernel_failed, matrix, Operator, Param};
use crate::ops::dispatch::{ClassGeometry, Device};
use crate::tensors::Tensor;

fn class_geometry(shape: &[usize]) -> ClassGeometry {
    let (classes, batch) = matrix(shape);
    ClassGeometry { classes, batch }
}

/// `Output = softmax(Input)` and `Cost = -log Output[Label]` column by column.
///
/// Roles: `Input [K, N]`, `Label [1, N]` → `Output [K, N]`, `Cost [1, N]`.
/// A label of `K` or more fails the evaluation on the CPU; the GPU writes NaN
/// into that column's cost instead.
pub struct SoftmaxLogLoss<D: Device> {
    pub input: Param<D>,
    pub label: Param<D, u32>,
    pub output: Param<D>,
    pub cost: Param<D>,
    geometry: Option<ClassGeometry>,
}

impl<D: Device> SoftmaxLogLoss<D> {
    pub const NAME: &'static str = "SoftmaxLogLoss";

    pub fn new() -> Self {
        Self {
            input: Param::required("Input"),
            label: Param::required("Label"),
            output: Param::required("Output"),
            cost: Param::required("Cost"),
            geometry: None,
        }
    }

    pub fn geometry(&self) -> Option<&ClassGeometry> {
        self.geometry.as_ref()
    }
}

impl<D: Device> Default for SoftmaxLogLoss<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> Operator for SoftmaxLogLoss<D> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self) -> Result<()> {
        self.geometry = None;
        let input = self.input.shape(Self::NAME)?;
        let label = self.label.shape(Self::NAME)?;
        let output = self.output.shape(Self::NAME)?;
        let cost = self.cost.shape(Self::NAME)?;

        forbid_alias(Self::NAME, &self.output, &[&self.input])?;
        forbid_alias(Self::NAME, &self.cost, &[&self.input, &self.output])?;

        let g = class_geometry(&input);
        expect_len(Self::NAME, self.label.role(), &label, &[1, g.batch])?;
        expect_shape(Self::NAME, self.output.role(), &output, &input)?;
        expect_len(Self::NAME, self.cost.role(), &cost, &[1, g.batch])?;

        log::debug!("{}: initialized {g:?} on {}", Self::NAME, D::KIND);
        self.geometry = Some(g);
        Ok(())
    }

    fn evaluate(&self) -> Result<()> {
        let g = self.geometry.ok_or(Error::NotInitialized {
            operator: Self::NAME,
        })?;
        log::trace!("{}: evaluate", Self::NAME);

        let input = self.input.read(Self::NAME, g.len())?;
        let label = self.label.read(Self::NAME, g.batch)?;
        let mut output = self.output.write(Self::NAME, g.len())?;
        let mut cost = self.cost.write(Self::NAME, g.batch)?;
        D::softmax_log_loss(
            input.buffer()?,
            label.buffer()?,
            output.buffer_mut()?,
            cost.buffer_mut()?,
            &g,
        )
        .map_err(kernel_failed(Self::NAME))
    }
}

/// Gradient of [`SoftmaxLogLoss`] with respect to its scores.
///
/// Roles: `Output [K, N]` (the forward softmax), `Label [1, N]` →
/// `InputGrad [K, N]` holding `Output - one_hot(Label)`.
pub struct SoftmaxLogLossDerivative<D: Device> {
    pub output: Param<D>,
    pub label: Param<D, u32>,
    pub input_grad: Param<D>,
    geometry: Option<ClassGeometry>,
}

impl<D: Device> SoftmaxLogLossDerivative<D> {
    pub const NAME: &'static str = "SoftmaxLogLossDerivative";

    pub fn new() -> Self {
        Self {
            output: Param::required("Output"),
            label: Param::required("Label"),
            input_grad: Param::required("InputGrad"),
            geometry: None,
        }
    }

    pub fn geometry(&self) -> Option<&ClassGeometry> {
        self.geometry.as_ref()
    }
}

impl<D: Device> Default for SoftmaxLogLossDerivative<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> Operator for SoftmaxLogLossDerivative<D> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self) -> Result<()> {
        self.geometry = None;
        let output = self.output.shape(Self::NAME)?;
        let label = self.label.shape(Self::NAME)?;
        let input_grad = self.input_grad.shape(Self::NAME)?;

        forbid_alias(Self::NAME, &self.input_grad, &[&self.output])?;

        let g = class_geometry(&output);
        expect_len(Self::NAME, self.label.role(), &label, &[1, g.batch])?;
        expect_len(Self::NAME, self.input_grad.role(), &input_grad, &output)?;

        log::debug!("{}: initialized {g:?} on {}", Self::NAME, D::KIND);
        self.geometry = Some(g);
        Ok(())
    }

    fn evaluate(&self) -> Result<()> {
        let g = self.geometry.ok_or(Error::NotInitialized {
            operator: Self::NAME,
        })?;
        log::trace!("{}: evaluate", Self::NAME);

        let output = self.output.read(Self::NAME, g.len())?;
        let label = self.label.read(Self::NAME, g.batch)?;
        let mut input_grad = self.input_grad.write(Self::NAME, g.len())?;
        D::softmax_log_loss_backward(
            output.buffer()?,
            label.buffer()?,
            input_grad.buffer_mut()?,
            &g,
        )
        .map_err(kernel_failed(Self::NAME))
    }
}

/// Per-column argmax of a `[K, N]` score or probability matrix.
///
/// Ties go to the lowest class index. Reads the host view, so a GPU tensor
/// must be downloaded first.
pub fn predictions<D: Device>(output: &Tensor<D, f32>) -> Result<Vec<u32>> {
    if !output.is_initialized() {
        return Err(Error::Uninitialized);
    }
    let (classes, _) = matrix(output.shape());
    Ok(output
        .as_slice()
        .chunks(classes)
        .map(|column| {
            let mut best = 0;
            for (k, &v) in column.iter().enumerate() {
                if v > column[best] {
                    best = k;
                }
            }
            best as u32
        })
        .collect())
}
