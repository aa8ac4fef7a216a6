//! Device-resident tensors.
//!
//! # Tensors
//!
//! A [`Tensor`] is a shape plus contiguous storage on one [`Device`]. The
//! shape is fixed at construction, storage is allocated by an explicit
//! [`Tensor::init`], and [`Tensor::reshape`] swaps the shape metadata without
//! touching the data.
//!
//! Layout is first-axis-fastest (see [`crate::ops::dispatch`]), so a
//! `[C, W, H, N]` tensor reshaped to `[C * W * H, N]` addresses the same
//! elements.
//!
//! ## Host and device views
//!
//! Element access (`Index`, [`Tensor::as_slice`]) always goes through the
//! host view. On the CPU that view is the storage itself. On the GPU it is a
//! mirror: write it and call [`Tensor::copy_from_host_to_device`], or call
//! [`Tensor::copy_from_device_to_host`] before reading results.
//!
//! ## Sharing
//!
//! Operators hold [`TensorRef`] handles, so one tensor can be the output of
//! one operator and the input of the next.
//!
//! ```rust
//! use pairgrad::ops::Cpu;
//! use pairgrad::tensors::Tensor;
//!
//! let mut t = Tensor::<Cpu>::from_vec([2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
//! t.reshape([3, 2])?;
//! assert_eq!(t.shape(), &[3, 2]);
//! assert_eq!(t[4], 5.0);
//! # Ok::<(), pairgrad::Error>(())
//! ```

use core::cell::RefCell;
use core::fmt;
use core::ops::{Index, IndexMut};
use std::rc::Rc;

use briny::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::ops::dispatch::{DType, Device, Element};

/// Half-width of the uniform range used by [`Tensor::randomize`].
pub const INIT_RANGE: f32 = 0.1;

/// Shared, mutable handle to a tensor, as bound into operator slots.
pub type TensorRef<D, T = f32> = Rc<RefCell<Tensor<D, T>>>;

/// Shape wrapper checked with briny before any storage is allocated.
struct Extents<'a>(&'a [usize]);

impl Validate for Extents<'_> {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.0.is_empty() || self.0.contains(&0) {
            return Err(ValidationError);
        }
        self.0
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .map(|_| ())
            .ok_or(ValidationError)
    }
}

/// An N-dimensional array on device `D` holding elements of type `T`.
pub struct Tensor<D: Device, T: Element = f32> {
    shape: Vec<usize>,
    storage: Option<D::Buffer<T>>,
}

impl<D: Device, T: Element> Tensor<D, T> {
    /// Creates an unallocated tensor. Call [`Tensor::init`] before use.
    pub fn new(shape: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: shape.into(),
            storage: None,
        }
    }

    /// Creates, allocates and fills a tensor from host data, pushing it to
    /// the device.
    pub fn from_vec(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Result<Self> {
        let mut tensor = Self::new(shape);
        if tensor.shape.iter().product::<usize>() != data.len() {
            return Err(Error::Reshape {
                from: vec![data.len()],
                to: tensor.shape,
            });
        }
        tensor.init()?;
        tensor.as_mut_slice().copy_from_slice(&data);
        tensor.copy_from_host_to_device()?;
        Ok(tensor)
    }

    /// Allocates zero-filled storage for the current shape.
    ///
    /// Fails with [`Error::InvalidShape`] for an empty shape or a zero extent
    /// and with [`Error::Device`] if the device cannot allocate. Calling it
    /// again on an allocated tensor is a no-op.
    pub fn init(&mut self) -> Result<()> {
        if self.storage.is_some() {
            return Ok(());
        }
        Extents(&self.shape)
            .validate()
            .map_err(|_| Error::InvalidShape {
                shape: self.shape.clone(),
            })?;
        self.storage = Some(D::alloc(self.len())?);
        Ok(())
    }

    /// Whether storage has been allocated.
    pub fn is_initialized(&self) -> bool {
        self.storage.is_some()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements implied by the shape.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    /// Replaces the shape, keeping the data. Fails and leaves the tensor
    /// unchanged if the element count would differ.
    pub fn reshape(&mut self, shape: impl Into<Vec<usize>>) -> Result<()> {
        let shape = shape.into();
        if shape.is_empty() || shape.iter().product::<usize>() != self.len() {
            return Err(Error::Reshape {
                from: self.shape.clone(),
                to: shape,
            });
        }
        self.shape = shape;
        Ok(())
    }

    /// Zero-fills the host view and device memory.
    pub fn clear(&mut self) -> Result<()> {
        D::zero(self.buffer_mut()?)?;
        Ok(())
    }

    /// Pushes the host view to device memory. A no-op on the CPU.
    pub fn copy_from_host_to_device(&mut self) -> Result<()> {
        D::upload(self.buffer_mut()?)?;
        Ok(())
    }

    /// Waits for all pending device work, then pulls device memory into the
    /// host view. A no-op on the CPU.
    pub fn copy_from_device_to_host(&mut self) -> Result<()> {
        D::download(self.buffer_mut()?)?;
        Ok(())
    }

    /// Host view of the data; empty before [`Tensor::init`].
    pub fn as_slice(&self) -> &[T] {
        match self.storage.as_ref() {
            Some(b) => D::host(b),
            None => &[],
        }
    }

    /// Mutable host view of the data; empty before [`Tensor::init`].
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match self.storage.as_mut() {
            Some(b) => D::host_mut(b),
            None => &mut [],
        }
    }

    /// Copies the host view out.
    pub fn to_vec(&self) -> Vec<T> {
        self.as_slice().to_vec()
    }

    /// Wraps the tensor in a shareable handle for operator binding.
    pub fn into_ref(self) -> TensorRef<D, T> {
        Rc::new(RefCell::new(self))
    }

    pub(crate) fn buffer(&self) -> Result<&D::Buffer<T>> {
        self.storage.as_ref().ok_or(Error::Uninitialized)
    }

    pub(crate) fn buffer_mut(&mut self) -> Result<&mut D::Buffer<T>> {
        self.storage.as_mut().ok_or(Error::Uninitialized)
    }
}

impl<D: Device> Tensor<D, f32> {
    /// Fills with uniform values in `[-0.1, 0.1)` from the thread RNG and
    /// pushes them to the device.
    pub fn randomize(&mut self) -> Result<()> {
        self.randomize_with(&mut rand::rng())
    }

    /// Like [`Tensor::randomize`] but reproducible for a given seed.
    pub fn randomize_with_seed(&mut self, seed: u64) -> Result<()> {
        self.randomize_with(&mut StdRng::seed_from_u64(seed))
    }

    /// Like [`Tensor::randomize`] drawing from `rng`.
    pub fn randomize_with<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        let host = D::host_mut(self.buffer_mut()?);
        for v in host.iter_mut() {
            *v = rng.random_range(-INIT_RANGE..INIT_RANGE);
        }
        self.copy_from_host_to_device()
    }
}

impl<D: Device, T: Element> Index<usize> for Tensor<D, T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<D: Device, T: Element> IndexMut<usize> for Tensor<D, T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}

impl<D: Device, T: Element> fmt::Debug for Tensor<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("device", &D::KIND)
            .field("dtype", &T::DTYPE)
            .field("shape", &self.shape)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
