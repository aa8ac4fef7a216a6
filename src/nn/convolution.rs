//! Multi-channel 2D convolution and its derivative.
//!
//! The forward pass is a cross-correlation in valid mode with unit stride:
//!
//! ```text
//! Output[f, x, y, n] = Bias[f] + Σ_{c,kx,ky} Input[c, x+kx, y+ky, n] · FeatureMap[c, kx, ky, f]
//! ```
//!
//! The derivative produces the feature-map gradient (cross-correlation of the
//! input with the output gradient), the bias gradient (output gradient summed
//! over positions and batch) and, when `InputGrad` is bound, the input
//! gradient (full convolution of the output gradient with the flipped
//! feature maps).

use crate::error::{Error, Result};
use crate::nn::{expect_len, expect_shape, forbid_alias, kernel_failed, rank4, Operator, Param};
use crate::ops::dispatch::{ConvGeometry, Device};

fn geometry<D: Device>(
    operator: &'static str,
    input: &Param<D>,
    feature_map: &Param<D>,
) -> Result<ConvGeometry> {
    let [channels, width, height, batch] = rank4(operator, input.role(), &input.shape(operator)?)?;
    let [depth, kernel_width, kernel_height, features] =
        rank4(operator, feature_map.role(), &feature_map.shape(operator)?)?;

    if depth != channels {
        return Err(Error::Incompatible {
            operator,
            role: feature_map.role(),
            reason: format!("has depth {depth} but `{}` has {channels} channels", input.role()),
        });
    }
    if kernel_width > width || kernel_height > height {
        return Err(Error::Incompatible {
            operator,
            role: feature_map.role(),
            reason: format!(
                "kernel {kernel_width}x{kernel_height} is larger than the {width}x{height} input"
            ),
        });
    }

    Ok(ConvGeometry {
        channels,
        width,
        height,
        batch,
        kernel_width,
        kernel_height,
        features,
    })
}

/// Valid-mode, unit-stride convolution with one bias per feature map.
///
/// Roles: `Input [C, W, H, N]`, `FeatureMap [C, KW, KH, F]`, `Bias [F]` →
/// `Output [F, W-KW+1, H-KH+1, N]`.
pub struct Convolution<D: Device> {
    pub input: Param<D>,
    pub feature_map: Param<D>,
    pub bias: Param<D>,
    pub output: Param<D>,
    geometry: Option<ConvGeometry>,
}

impl<D: Device> Convolution<D> {
    pub const NAME: &'static str = "Convolution";

    pub fn new() -> Self {
        Self {
            input: Param::required("Input"),
            feature_map: Param::required("FeatureMap"),
            bias: Param::required("Bias"),
            output: Param::required("Output"),
            geometry: None,
        }
    }

    /// Geometry captured by the last successful `init`.
    pub fn geometry(&self) -> Option<&ConvGeometry> {
        self.geometry.as_ref()
    }
}

impl<D: Device> Default for Convolution<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> Operator for Convolution<D> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self) -> Result<()> {
        self.geometry = None;
        let bias = self.bias.shape(Self::NAME)?;
        let output = self.output.shape(Self::NAME)?;
        let g = geometry(Self::NAME, &self.input, &self.feature_map)?;

        forbid_alias(
            Self::NAME,
            &self.output,
            &[&self.input, &self.feature_map, &self.bias],
        )?;
        expect_len(Self::NAME, self.bias.role(), &bias, &[g.features])?;
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
        let feature_map = self.feature_map.read(Self::NAME, g.feature_map_len())?;
        let bias = self.bias.read(Self::NAME, g.features)?;
        let mut output = self.output.write(Self::NAME, g.output_len())?;

        D::conv2d(
            input.buffer()?,
            feature_map.buffer()?,
            bias.buffer()?,
            output.buffer_mut()?,
            &g,
        )
        .map_err(kernel_failed(Self::NAME))
    }
}

/// Gradients of [`Convolution`].
///
/// Roles: `PrevActivation [C, W, H, N]`, `FeatureMap [C, KW, KH, F]`,
/// `OutputGrad [F, OW, OH, N]` → `FeatureMapGrad [C, KW, KH, F]`,
/// `BiasGrad [F]`, `InputGrad [C, W, H, N]` (optional; leave it unbound for
/// the first layer).
pub struct ConvolutionDerivative<D: Device> {
    pub prev_activation: Param<D>,
    pub feature_map: Param<D>,
    pub output_grad: Param<D>,
    pub feature_map_grad: Param<D>,
    pub bias_grad: Param<D>,
    pub input_grad: Param<D>,
    geometry: Option<ConvGeometry>,
}

impl<D: Device> ConvolutionDerivative<D> {
    pub const NAME: &'static str = "ConvolutionDerivative";

    pub fn new() -> Self {
        Self {
            prev_activation: Param::required("PrevActivation"),
            feature_map: Param::required("FeatureMap"),
            output_grad: Param::required("OutputGrad"),
            feature_map_grad: Param::required("FeatureMapGrad"),
            bias_grad: Param::required("BiasGrad"),
            input_grad: Param::optional("InputGrad"),
            geometry: None,
        }
    }

    pub fn geometry(&self) -> Option<&ConvGeometry> {
        self.geometry.as_ref()
    }
}

impl<D: Device> Default for ConvolutionDerivative<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> Operator for ConvolutionDerivative<D> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self) -> Result<()> {
        self.geometry = None;
        let output_grad = self.output_grad.shape(Self::NAME)?;
        let feature_map_grad = self.feature_map_grad.shape(Self::NAME)?;
        let bias_grad = self.bias_grad.shape(Self::NAME)?;
        let input_grad = self.input_grad.shape_if_bound(Self::NAME)?;
        let g = geometry(Self::NAME, &self.prev_activation, &self.feature_map)?;

        let inputs = [&self.prev_activation, &self.feature_map, &self.output_grad];
        forbid_alias(Self::NAME, &self.feature_map_grad, &inputs)?;
        forbid_alias(Self::NAME, &self.bias_grad, &inputs)?;
        forbid_alias(Self::NAME, &self.bias_grad, &[&self.feature_map_grad])?;
        if self.input_grad.is_bound() {
            forbid_alias(Self::NAME, &self.input_grad, &inputs)?;
            forbid_alias(
                Self::NAME,
                &self.input_grad,
                &[&self.feature_map_grad, &self.bias_grad],
            )?;
        }

        expect_len(Self::NAME, self.output_grad.role(), &output_grad, &g.output_shape())?;
        expect_len(
            Self::NAME,
            self.feature_map_grad.role(),
            &feature_map_grad,
            &[g.channels, g.kernel_width, g.kernel_height, g.features],
        )?;
        expect_len(Self::NAME, self.bias_grad.role(), &bias_grad, &[g.features])?;
        if let Some(shape) = input_grad {
            expect_len(
                Self::NAME,
                self.input_grad.role(),
                &shape,
                &[g.channels, g.width, g.height, g.batch],
            )?;
        }

        log::debug!("{}: initialized {g:?} on {}", Self::NAME, D::KIND);
        self.geometry = Some(g);
        Ok(())
    }

    fn evaluate(&self) -> Result<()> {
        let g = self.geometry.ok_or(Error::NotInitialized {
            operator: Self::NAME,
        })?;
        log::trace!("{}: evaluate", Self::NAME);

        let input = self.prev_activation.read(Self::NAME, g.input_len())?;
        let feature_map = self.feature_map.read(Self::NAME, g.feature_map_len())?;
        let output_grad = self.output_grad.read(Self::NAME, g.output_len())?;
        let mut feature_map_grad = self.feature_map_grad.write(Self::NAME, g.feature_map_len())?;
        let mut bias_grad = self.bias_grad.write(Self::NAME, g.features)?;
        let mut input_grad = self.input_grad.write_if_bound(Self::NAME, g.input_len())?;

        let input_grad = match input_grad.as_deref_mut() {
            Some(t) => Some(t.buffer_mut()?),
            None => None,
        };
        D::conv2d_backward(
            input.buffer()?,
            feature_map.buffer()?,
            output_grad.buffer()?,
            feature_map_grad.buffer_mut()?,
            bias_grad.buffer_mut()?,
            input_grad,
            &g,
        )
        .map_err(kernel_failed(Self::NAME))
    }
}
