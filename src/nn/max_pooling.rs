//! Non-overlapping max pooling and its derivative.
//!
//! The derivative keeps no argmax from the forward pass. It re-scans each
//! window for the first position (row by row, then column) whose input value
//! equals the pooled output, routes the gradient there and writes zero
//! everywhere else.

use crate::error::{Error, Result};
use crate::nn::{expect_len, expect_shape, forbid_alias, kernel_failed, rank4, Operator, Param};
use crate::ops::dispatch::{Device, PoolGeometry};

/// Window edge used when none is configured.
pub const DEFAULT_WINDOW: usize = 2;

fn geometry<D: Device>(
    operator: &'static str,
    input: &Param<D>,
    window: usize,
) -> Result<PoolGeometry> {
    let [channels, width, height, batch] = rank4(operator, input.role(), &input.shape(operator)?)?;
    if window == 0 || width % window != 0 || height % window != 0 {
        return Err(Error::Incompatible {
            operator,
            role: input.role(),
            reason: format!("extent {width}x{height} is not divisible by window {window}"),
        });
    }
    Ok(PoolGeometry {
        channels,
        width,
        height,
        batch,
        window,
    })
}

/// `window × window` max pooling per channel and batch image.
///
/// Roles: `Input [C, W, H, N]` → `Output [C, W/s, H/s, N]`.
pub struct MaxPooling<D: Device> {
    pub input: Param<D>,
    pub output: Param<D>,
    window: usize,
    geometry: Option<PoolGeometry>,
}

impl<D: Device> MaxPooling<D> {
    pub const NAME: &'static str = "MaxPooling";

    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            input: Param::required("Input"),
            output: Param::required("Output"),
            window,
            geometry: None,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn geometry(&self) -> Option<&PoolGeometry> {
        self.geometry.as_ref()
    }
}

impl<D: Device> Default for MaxPooling<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> Operator for MaxPooling<D> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self) -> Result<()> {
        self.geometry = None;
        let output = self.output.shape(Self::NAME)?;
        let g = geometry(Self::NAME, &self.input, self.window)?;

        forbid_alias(Self::NAME, &self.output, &[&self.input])?;
        expect_shape(Self::NAME, self.output.role(), &output, &g.output_shape())?;

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
        let mut output = self.output.write(Self::NAME, g.output_len())?;
        D::max_pool(input.buffer()?, output.buffer_mut()?, &g).map_err(kernel_failed(Self::NAME))
    }
}

/// Gradient of [`MaxPooling`].
///
/// Roles: `Input [C, W, H, N]` and `Output` (the forward tensors),
/// `OutputGrad` (same element count as `Output`) → `InputGrad` (same element
/// count as `Input`). `Output` and `OutputGrad` may carry any shape with the
/// pooled element count, e.g. the `[C*W/s*H/s, N]` view a dense layer reads.
pub struct MaxPoolingDerivative<D: Device> {
    pub input: Param<D>,
    pub output: Param<D>,
    pub output_grad: Param<D>,
    pub input_grad: Param<D>,
    window: usize,
    geometry: Option<PoolGeometry>,
}

impl<D: Device> MaxPoolingDerivative<D> {
    pub const NAME: &'static str = "MaxPoolingDerivative";

    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            input: Param::required("Input"),
            output: Param::required("Output"),
            output_grad: Param::required("OutputGrad"),
            input_grad: Param::required("InputGrad"),
            window,
            geometry: None,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn geometry(&self) -> Option<&PoolGeometry> {
        self.geometry.as_ref()
    }
}

impl<D: Device> Default for MaxPoolingDerivative<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> Operator for MaxPoolingDerivative<D> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self) -> Result<()> {
        self.geometry = None;
        let output = self.output.shape(Self::NAME)?;
        let output_grad = self.output_grad.shape(Self::NAME)?;
        let input_grad = self.input_grad.shape(Self::NAME)?;
        let g = geometry(Self::NAME, &self.input, self.window)?;

        forbid_alias(
            Self::NAME,
            &self.input_grad,
            &[&self.input, &self.output, &self.output_grad],
        )?;
        expect_len(Self::NAME, self.output.role(), &output, &g.output_shape())?;
        expect_len(Self::NAME, self.output_grad.role(), &output_grad, &g.output_shape())?;
        expect_len(
            Self::NAME,
            self.input_grad.role(),
            &input_grad,
            &[g.channels, g.width, g.height, g.batch],
        )?;

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
        let output = self.output.read(Self::NAME, g.output_len())?;
        let output_grad = self.output_grad.read(Self::NAME, g.output_len())?;
        let mut input_grad = self.input_grad.write(Self::NAME, g.input_len())?;
        D::max_pool_backward(
            input.buffer()?,
            output.buffer()?,
            output_grad.buffer()?,
            input_grad.buffer_mut()?,
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

    fn zeros(shape: &[usize]) -> TensorRef<Cpu> {
        let mut t = Tensor::new(shape);
        t.init().unwrap();
        t.into_ref()
    }

    #[test]
    fn init_rejects_indivisible_extent() {
        let mut pool = MaxPooling::<Cpu>::new();
        pool.input.bind(&zeros(&[1, 5, 4, 1]));
        pool.output.bind(&zeros(&[1, 2, 2, 1]));
        assert!(matches!(
            pool.init(),
            Err(Error::Incompatible { role: "Input", .. })
        ));
    }

    #[test]
    fn custom_window_sets_output_extent() {
        let input = Tensor::<Cpu>::from_vec([1, 3, 3, 1], (0..9).map(|v| v as f32).collect())
            .unwrap()
            .into_ref();
        let output = zeros(&[1, 1, 1, 1]);
        let mut pool = MaxPooling::<Cpu>::with_window(3);
        pool.input.bind(&input);
        pool.output.bind(&output);
        pool.init().unwrap();
        pool.evaluate().unwrap();
        assert_eq!(output.borrow()[0], 8.0);
    }

    #[test]
    fn derivative_accepts_flattened_output_views() {
        let input = zeros(&[2, 4, 4, 3]);
        let output = zeros(&[2 * 2 * 2, 3]);
        let mut d = MaxPoolingDerivative::<Cpu>::new();
        d.input.bind(&input);
        d.output.bind(&output);
        d.output_grad.bind(&zeros(&[2, 2, 2, 3]));
        d.input_grad.bind(&zeros(&[2, 4, 4, 3]));
        d.init().unwrap();
        assert_eq!(d.geometry().map(|g| g.output_len()), Some(24));
    }

    #[test]
    fn derivative_forbids_writing_into_forward_tensors() {
        let input = zeros(&[1, 2, 2, 1]);
        let mut d = MaxPoolingDerivative::<Cpu>::new();
        d.input.bind(&input);
        d.output.bind(&zeros(&[1, 1, 1, 1]));
        d.output_grad.bind(&zeros(&[1, 1, 1, 1]));
        d.input_grad.bind(&input);
        assert!(matches!(d.init(), Err(Error::Aliased { role: "InputGrad", other: "Input", .. })));
    }
}
