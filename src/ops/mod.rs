//! # Kernel Layer
//!
//! Numeric kernels for every operator, one implementation per device.
//!
//! ## Submodules
//!
//! - [`dispatch`] — the [`Device`] trait every backend implements, kernel
//!   geometry descriptors and the element types tensors may hold
//! - [`cpu`] — multi-threaded host kernels built on `rayon` (always present)
//! - [`wgpu`] *(opt-in)* — WGSL compute pipelines driven through `wgpu`
//!
//! ## Backend Selection
//!
//! Dispatch is static: tensors and operators carry the device as a type
//! parameter, so `Convolution<Cpu>` calls [`Cpu::conv2d`](Device::conv2d)
//! directly and no runtime switch exists.
//!
//! ```rust
//! use pairgrad::ops::{Cpu, Device};
//! use pairgrad::backend::Backend;
//!
//! assert_eq!(Cpu::KIND, Backend::Cpu);
//! ```
//!
//! ## Extending the Backend
//!
//! To add a new kernel:
//!
//! 1. Declare it on [`Device`] with a geometry descriptor if it needs one
//! 2. Implement it in [`cpu`] and, behind the GPU features, in [`wgpu`]
//! 3. Validate shapes in the operator's `init`, never inside the kernel
//!
//! ## Feature Flags
//!
//! - `wgpu` — enables the GPU device
//! - `cuda` — enables the same GPU device; CUDA-class hardware is driven
//!   through wgpu

pub mod cpu;
pub mod dispatch;
#[cfg(any(feature = "wgpu", feature = "cuda"))]
pub mod wgpu;

pub use cpu::Cpu;
pub use dispatch::{
    ActivationMode, ClassGeometry, ConvGeometry, DType, DenseGeometry, Device, Element,
    PoolGeometry, Src,
};
#[cfg(any(feature = "wgpu", feature = "cuda"))]
pub use self::wgpu::{Gpu, GpuBuffer};
