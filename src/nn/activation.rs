//! Elementwise nonlinearities.

use crate::error::{Error, Result};
use crate::nn::{expect_len, forbid_alias, kernel_failed, Operator, Param};
use crate::ops::dispatch::{ActivationMode, Device, Src};

/// `Output = mode(Input)` elementwise.
///
/// `Input` and `Output` may be bound to the same tensor, in which case the
/// activation is applied in place.
pub struct Activation<D: Device> {
    pub input: Param<D>,
    pub output: Param<D>,
    mode: ActivationMode,
    len: Option<usize>,
}

impl<D: Device> Activation<D> {
    pub const NAME: &'static str = "Activation";

    pub fn new(mode: ActivationMode) -> Self {
        Self {
            input: Param::required("Input"),
            output: Param::required("Output"),
            mode,
            len: None,
        }
    }

    pub fn mode(&self) -> ActivationMode {
        self.mode
    }
}

impl<D: Device> Default for Activation<D> {
    fn default() -> Self {
        Self::new(ActivationMode::default())
    }
}

impl<D: Device> Operator for Activation<D> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self) -> Result<()> {
        self.len = None;
        let input = self.input.shape(Self::NAME)?;
        let output = self.output.shape(Self::NAME)?;
        expect_len(Self::NAME, self.output.role(), &output, &input)?;

        let len = input.iter().product();
        log::debug!(
            "{}: initialized {:?} over {len} elements on {}",
            Self::NAME,
            self.mode,
            D::KIND
        );
        self.len = Some(len);
        Ok(())
    }

    fn evaluate(&self) -> Result<()> {
        let len = self.len.ok_or(Error::NotInitialized {
            operator: Self::NAME,
        })?;
        log::trace!("{}: evaluate", Self::NAME);

        let mut output = self.output.write(Self::NAME, len)?;
        if self.input.same_as(&self.output) {
            return D::activation(self.mode, Src::Dst, output.buffer_mut()?)
                .map_err(kernel_failed(Self::NAME));
        }
        let input = self.input.read(Self::NAME, len)?;
        D::activation(self.mode, Src::Buf(input.buffer()?), output.buffer_mut()?)
            .map_err(kernel_failed(Self::NAME))
    }
}

/// Gradient of [`Activation`], computed from the forward output.
///
/// Roles: `Output` (forward output), `OutputDelta` → `InputDelta`. The delta
/// may be transformed in place by binding `InputDelta` to the `OutputDelta`
/// tensor.
pub struct ActivationDerivative<D: Device> {
    pub output: Param<D>,
    pub output_delta: Param<D>,
    pub input_delta: Param<D>,
    mode: ActivationMode,
    len: Option<usize>,
}

impl<D: Device> ActivationDerivative<D> {
    pub const NAME: &'static str = "ActivationDerivative";

    pub fn new(mode: ActivationMode) -> Self {
        Self {
            output: Param::required("Output"),
            output_delta: Param::required("OutputDelta"),
            input_delta: Param::required("InputDelta"),
            mode,
            len: None,
        }
    }

    pub fn mode(&self) -> ActivationMode {
        self.mode
    }
}

impl<D: Device> Default for ActivationDerivative<D> {
    fn default() -> Self {
        Self::new(ActivationMode::default())
    }
}

impl<D: Device> Operator for ActivationDerivative<D> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self) -> Result<()> {
        self.len = None;
        let output = self.output.shape(Self::NAME)?;
        let output_delta = self.output_delta.shape(Self::NAME)?;
        let input_delta = self.input_delta.shape(Self::NAME)?;

        forbid_alias(Self::NAME, &self.input_delta, &[&self.output])?;
        expect_len(Self::NAME, self.output_delta.role(), &output_delta, &output)?;
        expect_len(Self::NAME, self.input_delta.role(), &input_delta, &output)?;

        let len = output.iter().product();
        log::debug!(
            "{}: initialized {:?} over {len} elements on {}",
            Self::NAME,
            self.mode,
            D::KIND
        );
        self.len = Some(len);
        Ok(())
    }

    fn evaluate(&self) -> Result<()> {
        let len = self.len.ok_or(Error::NotInitialized {
            operator: Self::NAME,
        })?;
        log::trace!("{}: evaluate", Self::NAME);

        let output = self.output.read(Self::NAME, len)?;
        let mut input_delta = self.input_delta.write(Self::NAME, len)?;
        if self.output_delta.same_as(&self.input_delta) {
            return D::activation_backward(
                self.mode,
                output.buffer()?,
                Src::Dst,
                input_delta.buffer_mut()?,
            )
            .map_err(kernel_failed(Self::NAME));
        }
        let output_delta = self.output_delta.read(Self::NAME, len)?;
        D::activation_backward(
            self.mode,
            output.buffer()?,
            Src::Buf(output_delta.buffer()?),
            input_delta.buffer_mut()?,
        )
        .map_err(kernel_failed(Self::NAME))
    }
}
