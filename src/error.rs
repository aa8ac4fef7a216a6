//! Crate-wide error types.
//!
//! Every fallible path in the crate reports through [`Error`]. Device-level
//! failures (allocation, transfer, shader dispatch, kernel-side input checks)
//! are described by [`DeviceError`] and wrapped either directly, for tensor
//! storage operations, or inside [`Error::Kernel`] when an operator's kernel
//! fails so the operator name travels with it.

use thiserror::Error;

/// Failures raised by a compute device.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No adapter matching the default request options was found.
    #[error("no compatible GPU adapter: {0}")]
    Adapter(String),
    /// The adapter refused to hand out a logical device.
    #[error("GPU device request failed: {0}")]
    Request(String),
    /// The device could not satisfy an allocation.
    #[error("out of device memory allocating {bytes} bytes")]
    OutOfMemory { bytes: u64 },
    /// The device rejected a dispatch or resource creation.
    #[error("device validation fault in `{kernel}`: {message}")]
    Validation {
        kernel: &'static str,
        message: String,
    },
    /// A staging buffer could not be mapped for readback.
    #[error("failed to map buffer for readback: {0}")]
    Map(String),
    /// Waiting on the device queue failed (e.g. the device was lost).
    #[error("device poll failed: {0}")]
    Poll(String),
    /// A compute shader failed source validation before compilation.
    #[error("shader `{0}` failed source validation")]
    Shader(&'static str),
    /// A class label lies outside `[0, classes)`.
    #[error("label {label} in column {column} is outside [0, {classes})")]
    InvalidLabel {
        column: usize,
        label: u32,
        classes: usize,
    },
    /// The device was requested but could not be brought up earlier.
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// The error type for tensor and operator operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A required role had no tensor bound when `init` ran.
    #[error("{operator}: required parameter `{role}` is not bound")]
    Unbound {
        operator: &'static str,
        role: &'static str,
    },
    /// Two roles are bound to the same tensor where the operator forbids it.
    #[error("{operator}: parameter `{role}` may not alias `{other}`")]
    Aliased {
        operator: &'static str,
        role: &'static str,
        other: &'static str,
    },
    /// `evaluate` was called without a successful `init`.
    #[error("{operator}: evaluate called before a successful init")]
    NotInitialized { operator: &'static str },
    /// A bound tensor does not have the shape the operator requires.
    #[error("{operator}: parameter `{role}` has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        operator: &'static str,
        role: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// A bound tensor is structurally unusable for the operator.
    #[error("{operator}: parameter `{role}` {reason}")]
    Incompatible {
        operator: &'static str,
        role: &'static str,
        reason: String,
    },
    /// `reshape` was asked to change the element count.
    #[error("cannot reshape {from:?} into {to:?}: element counts differ")]
    Reshape { from: Vec<usize>, to: Vec<usize> },
    /// A tensor shape is empty or has a zero extent.
    #[error("invalid tensor shape {shape:?}")]
    InvalidShape { shape: Vec<usize> },
    /// Tensor storage was accessed before `init`.
    #[error("tensor storage has not been initialized")]
    Uninitialized,
    /// A bound tensor is currently borrowed elsewhere.
    #[error("{operator}: parameter `{role}` is already borrowed elsewhere")]
    Borrowed {
        operator: &'static str,
        role: &'static str,
    },
    /// An operator's kernel failed on its device.
    #[error("{operator}: kernel failed")]
    Kernel {
        operator: &'static str,
        #[source]
        source: DeviceError,
    },
    /// A tensor storage operation failed on its device.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Shorthand for results carrying [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
