//! Hand-paired forward and derivative operators.
//!
//! Every operator follows the same contract:
//!
//! 1. construct it (`Convolution::<Cpu>::new()`),
//! 2. bind tensors into its typed slots (`conv.input.bind(&image)`),
//! 3. call [`Operator::init`] once to validate shapes and aliasing and
//!    capture the kernel geometry,
//! 4. call [`Operator::evaluate`] as often as needed.
//!
//! Operators never allocate or free bound tensors. Forward and derivative
//! operators overwrite their outputs; nothing accumulates across calls.
//! Reshaping a bound tensor between evaluations is fine as long as its
//! element count stays what `init` validated.

use core::cell::{Ref, RefMut};
use core::fmt;
use std::rc::Rc;

use crate::error::{DeviceError, Error, Result};
use crate::ops::dispatch::{Device, Element};
use crate::tensors::{Tensor, TensorRef};

pub mod activation;
pub mod convolution;
pub mod dot_product;
pub mod elementwise;
pub mod max_pooling;
pub mod softmax_log_loss;

pub use activation::{Activation, ActivationDerivative};
pub use convolution::{Convolution, ConvolutionDerivative};
pub use dot_product::{DotProductWithBias, DotProductWithBiasDerivative};
pub use elementwise::{ElementwiseAdd, ElementwiseProduct};
pub use max_pooling::{MaxPooling, MaxPoolingDerivative};
pub use softmax_log_loss::{predictions, SoftmaxLogLoss, SoftmaxLogLossDerivative};

/// A computation unit with validated bindings.
pub trait Operator {
    /// Operator name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Checks bindings, shapes and aliasing, and captures kernel geometry.
    fn init(&mut self) -> Result<()>;

    /// Runs the kernel on the bound tensors.
    fn evaluate(&self) -> Result<()>;
}

/// A typed parameter slot of an operator.
pub struct Param<D: Device, T: Element = f32> {
    role: &'static str,
    required: bool,
    tensor: Option<TensorRef<D, T>>,
}

impl<D: Device, T: Element> Param<D, T> {
    pub(crate) const fn required(role: &'static str) -> Self {
        Self {
            role,
            required: true,
            tensor: None,
        }
    }

    pub(crate) const fn optional(role: &'static str) -> Self {
        Self {
            role,
            required: false,
            tensor: None,
        }
    }

    /// Binds `tensor` to this slot, replacing any previous binding.
    pub fn bind(&mut self, tensor: &TensorRef<D, T>) -> &mut Self {
        self.tensor = Some(Rc::clone(tensor));
        self
    }

    /// Clears the binding, returning the previously bound handle.
    pub fn unbind(&mut self) -> Option<TensorRef<D, T>> {
        self.tensor.take()
    }

    pub fn is_bound(&self) -> bool {
        self.tensor.is_some()
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    pub fn tensor(&self) -> Option<&TensorRef<D, T>> {
        self.tensor.as_ref()
    }

    /// Whether both slots are bound to the same tensor.
    pub(crate) fn same_as(&self, other: &Self) -> bool {
        match (&self.tensor, &other.tensor) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn bound(&self, operator: &'static str) -> Result<&TensorRef<D, T>> {
        self.tensor.as_ref().ok_or(Error::Unbound {
            operator,
            role: self.role,
        })
    }

    /// Current shape of the bound tensor.
    pub(crate) fn shape(&self, operator: &'static str) -> Result<Vec<usize>> {
        let tensor = self.bound(operator)?;
        let tensor = tensor.try_borrow().map_err(|_| Error::Borrowed {
            operator,
            role: self.role,
        })?;
        Ok(tensor.shape().to_vec())
    }

    /// Shape of an optional slot, `None` when unbound.
    pub(crate) fn shape_if_bound(&self, operator: &'static str) -> Result<Option<Vec<usize>>> {
        if self.is_bound() || self.required {
            self.shape(operator).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Borrows the bound tensor for reading and checks its element count.
    pub(crate) fn read(&self, operator: &'static str, len: usize) -> Result<Ref<'_, Tensor<D, T>>> {
        let tensor = self
            .bound(operator)?
            .try_borrow()
            .map_err(|_| Error::Borrowed {
                operator,
                role: self.role,
            })?;
        check_len(operator, self.role, tensor.shape(), len)?;
        Ok(tensor)
    }

    /// Borrows the bound tensor for writing and checks its element count.
    pub(crate) fn write(
        &self,
        operator: &'static str,
        len: usize,
    ) -> Result<RefMut<'_, Tensor<D, T>>> {
        let tensor = self
            .bound(operator)?
            .try_borrow_mut()
            .map_err(|_| Error::Borrowed {
                operator,
                role: self.role,
            })?;
        check_len(operator, self.role, tensor.shape(), len)?;
        Ok(tensor)
    }

    /// [`Param::write`] for an optional slot.
    pub(crate) fn write_if_bound(
        &self,
        operator: &'static str,
        len: usize,
    ) -> Result<Option<RefMut<'_, Tensor<D, T>>>> {
        if self.is_bound() {
            self.write(operator, len).map(Some)
        } else {
            Ok(None)
        }
    }
}

impl<D: Device, T: Element> fmt::Debug for Param<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = self
            .tensor
            .as_ref()
            .and_then(|t| t.try_borrow().ok().map(|t| t.shape().to_vec()));
        f.debug_struct("Param")
            .field("role", &self.role)
            .field("required", &self.required)
            .field("bound", &shape)
            .finish()
    }
}

/// Fails if `output` is bound to the same tensor as any of `others`.
pub(crate) fn forbid_alias<D: Device, T: Element>(
    operator: &'static str,
    output: &Param<D, T>,
    others: &[&Param<D, T>],
) -> Result<()> {
    match others.iter().find(|other| output.same_as(other)) {
        Some(other) => Err(Error::Aliased {
            operator,
            role: output.role,
            other: other.role,
        }),
        None => Ok(()),
    }
}

pub(crate) fn expect_shape(
    operator: &'static str,
    role: &'static str,
    got: &[usize],
    expected: &[usize],
) -> Result<()> {
    if got == expected {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            operator,
            role,
            expected: expected.to_vec(),
            got: got.to_vec(),
        })
    }
}

/// Accepts any shape holding as many elements as `expected`.
pub(crate) fn expect_len(
    operator: &'static str,
    role: &'static str,
    got: &[usize],
    expected: &[usize],
) -> Result<()> {
    if got.iter().product::<usize>() == expected.iter().product::<usize>() {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            operator,
            role,
            expected: expected.to_vec(),
            got: got.to_vec(),
        })
    }
}

fn check_len(operator: &'static str, role: &'static str, got: &[usize], len: usize) -> Result<()> {
    expect_len(operator, role, got, &[len])
}

/// Splits a `[C, W, H, N]` shape, rejecting any other rank.
pub(crate) fn rank4(
    operator: &'static str,
    role: &'static str,
    shape: &[usize],
) -> Result<[usize; 4]> {
    <[usize; 4]>::try_from(shape).map_err(|_| Error::Incompatible {
        operator,
        role,
        reason: format!("must be rank 4 [channels, width, height, batch], got {shape:?}"),
    })
}

/// Views a shape as a matrix: leading dimensions flattened into rows, the
/// last one as columns (the batch).
pub(crate) fn matrix(shape: &[usize]) -> (usize, usize) {
    match shape.split_last() {
        Some((&cols, [])) => (cols, 1),
        Some((&cols, rows)) => (rows.iter().product(), cols),
        None => (0, 0),
    }
}

/// Wraps a kernel failure with the operator name.
pub(crate) fn kernel_failed(operator: &'static str) -> impl FnOnce(DeviceError) -> Error {
    move |source| Error::Kernel { operator, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Cpu;

    #[test]
    fn matrix_view_flattens_leading_dims() {
        assert_eq!(matrix(&[20, 12, 12, 10]), (2880, 10));
        assert_eq!(matrix(&[3, 1]), (3, 1));
        assert_eq!(matrix(&[7]), (7, 1));
    }

    #[test]
    fn unbound_required_slot_names_its_role() {
        let p = Param::<Cpu>::required("Weight");
        assert!(matches!(
            p.shape("Dense"),
            Err(Error::Unbound { operator: "Dense", role: "Weight" })
        ));
        let q = Param::<Cpu>::optional("InputGrad");
        assert!(q.shape_if_bound("Dense").unwrap().is_none());
    }

    #[test]
    fn aliasing_is_pointer_identity() {
        let t = Tensor::<Cpu>::new([2]).into_ref();
        let u = Tensor::<Cpu>::new([2]).into_ref();
        let mut a = Param::<Cpu>::required("A");
        let mut b = Param::<Cpu>::required("B");
        a.bind(&t);
        b.bind(&u);
        assert!(forbid_alias("Op", &a, &[&b]).is_ok());
        b.bind(&t);
        assert!(matches!(
            forbid_alias("Op", &a, &[&b]),
            Err(Error::Aliased { role: "A", other: "B", .. })
        ));
    }

    #[test]
    fn read_reports_borrow_conflicts() {
        let t = Tensor::<Cpu>::from_vec([2], vec![1.0, 2.0]).unwrap().into_ref();
        let mut p = Param::<Cpu>::required("Input");
        p.bind(&t);
        let _guard = t.borrow_mut();
        assert!(matches!(p.read("Op", 2), Err(Error::Borrowed { role: "Input", .. })));
    }
}
