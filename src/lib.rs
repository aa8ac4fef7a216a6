//! pairgrad: layer-level training primitives for small convolutional networks.
//!
//! Every layer type comes as a pair: a forward operator and a hand-written
//! derivative operator. There is no tape and no graph; a training step is the
//! caller evaluating forward operators in order, derivative operators in
//! reverse, then elementwise update operators over the parameters.
//!
//! # Features
//!
//! - Shape-checked [`Tensor`]s on a compile-time selected device, with explicit
//!   host/device transfers.
//! - Convolution, max pooling, fully-connected, activation, softmax log-loss
//!   and elementwise operators, each validated once by [`Operator::init`].
//! - Multi-threaded CPU kernels and, behind the `wgpu`/`cuda` features, WGSL
//!   compute kernels with identical semantics.
//!
//! # Modules
//!
//! - [`tensors`] — tensor storage, reshaping, initialization and transfers.
//! - [`nn`] — the operator pairs and the [`Operator`] binding contract.
//! - [`ops`] — the [`Device`](ops::Device) trait and its CPU/GPU kernels.
//! - [`backend`] — backend identification and availability.
//! - [`error`] — configuration and device errors.
//!
//! # Example
//!
//! ```rust
//! use pairgrad::nn::{Activation, Operator};
//! use pairgrad::ops::Cpu;
//! use pairgrad::tensors::Tensor;
//!
//! let x = Tensor::<Cpu>::from_vec([2, 1], vec![0.0, 0.0])?.into_ref();
//! let y = Tensor::<Cpu>::from_vec([2, 1], vec![9.0, 9.0])?.into_ref();
//!
//! let mut sigmoid = Activation::default();
//! sigmoid.input.bind(&x);
//! sigmoid.output.bind(&y);
//! sigmoid.init()?;
//! sigmoid.evaluate()?;
//!
//! assert_eq!(y.borrow().to_vec(), vec![0.5, 0.5]);
//! # Ok::<(), pairgrad::Error>(())
//! ```

pub mod backend;
pub mod error;
pub mod nn;
pub mod ops;
pub mod tensors;

pub use error::{DeviceError, Error, Result};
pub use nn::{Operator, Param};
pub use tensors::{Tensor, TensorRef};
