//! Unified kernel interface.
//!
//! A [`Device`] owns a buffer type and one static kernel per numeric
//! operation. Operators validate shapes once in `init`, capture a geometry
//! descriptor, and hand that descriptor to the kernel on every evaluation;
//! kernels themselves trust the geometry and never re-check shapes.
//!
//! Layout is first-axis-fastest: element `(i0, i1, i2, i3)` of a tensor with
//! shape `[d0, d1, d2, d3]` lives at `i0 + d0 * (i1 + d1 * (i2 + d2 * i3))`.
//! Dimension 0 is the channel/feature index, 1 and 2 are the spatial axes,
//! the last dimension is the batch.

use core::fmt;

use crate::backend::Backend;
use crate::error::DeviceError;

/// Storage element type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    U32,
}

/// Scalar types a tensor may hold.
///
/// `f32` carries activations, weights and gradients; `u32` carries class
/// labels.
pub trait Element:
    bytemuck::Pod + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for u32 {
    const DTYPE: DType = DType::U32;
}

/// Source of an elementwise operand.
///
/// `Dst` means the operand is the destination buffer itself, which is how an
/// operator tells a kernel that two of its roles are bound to the same
/// tensor. Kernels read every operand of an element before writing it.
pub enum Src<'a, B> {
    /// A buffer distinct from the destination.
    Buf(&'a B),
    /// Read the operand from the destination buffer.
    Dst,
}

impl<B> Clone for Src<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for Src<'_, B> {}

impl<B> fmt::Debug for Src<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buf(_) => f.write_str("Buf"),
            Self::Dst => f.write_str("Dst"),
        }
    }
}

/// Nonlinearity applied elementwise by the activation operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationMode {
    #[default]
    Sigmoid,
    Relu,
    Tanh,
}

impl ActivationMode {
    /// Forward value for input `x`.
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Relu => x.max(0.0),
            Self::Tanh => x.tanh(),
        }
    }

    /// Input gradient from the forward output `o` and upstream gradient `g`.
    #[inline]
    pub fn derivative(self, o: f32, g: f32) -> f32 {
        match self {
            Self::Sigmoid => o * (1.0 - o) * g,
            Self::Relu => {
                if o > 0.0 {
                    g
                } else {
                    0.0
                }
            }
            Self::Tanh => (1.0 - o * o) * g,
        }
    }

    /// Mode selector understood by the activation shaders.
    pub const fn code(self) -> u32 {
        match self {
            Self::Sigmoid => 0,
            Self::Relu => 1,
            Self::Tanh => 2,
        }
    }
}

/// Geometry of a valid-mode, unit-stride, multi-channel 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub channels: usize,
    pub width: usize,
    pub height: usize,
    pub batch: usize,
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub features: usize,
}

impl ConvGeometry {
    pub const fn out_width(&self) -> usize {
        self.width - self.kernel_width + 1
    }

    pub const fn out_height(&self) -> usize {
        self.height - self.kernel_height + 1
    }

    /// Elements in one image of the input.
    pub const fn image_len(&self) -> usize {
        self.channels * self.width * self.height
    }

    /// Elements in one feature map (one output feature's kernel).
    pub const fn kernel_len(&self) -> usize {
        self.channels * self.kernel_width * self.kernel_height
    }

    /// Elements in one image of the output.
    pub const fn out_image_len(&self) -> usize {
        self.features * self.out_width() * self.out_height()
    }

    pub const fn input_len(&self) -> usize {
        self.image_len() * self.batch
    }

    pub const fn feature_map_len(&self) -> usize {
        self.kernel_len() * self.features
    }

    pub const fn output_len(&self) -> usize {
        self.out_image_len() * self.batch
    }

    pub fn output_shape(&self) -> Vec<usize> {
        vec![self.features, self.out_width(), self.out_height(), self.batch]
    }
}

/// Geometry of non-overlapping square max pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub channels: usize,
    pub width: usize,
    pub height: usize,
    pub batch: usize,
    pub window: usize,
}

impl PoolGeometry {
    pub const fn out_width(&self) -> usize {
        self.width / self.window
    }

    pub const fn out_height(&self) -> usize {
        self.height / self.window
    }

    pub const fn image_len(&self) -> usize {
        self.channels * self.width * self.height
    }

    pub const fn out_image_len(&self) -> usize {
        self.channels * self.out_width() * self.out_height()
    }

    pub const fn input_len(&self) -> usize {
        self.image_len() * self.batch
    }

    pub const fn output_len(&self) -> usize {
        self.out_image_len() * self.batch
    }

    pub fn output_shape(&self) -> Vec<usize> {
        vec![self.channels, self.out_width(), self.out_height(), self.batch]
    }
}

/// Geometry of `Output[O, N] = Weight[O, I] · Input[I, N] + Bias[O]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenseGeometry {
    pub inputs: usize,
    pub outputs: usize,
    pub batch: usize,
}

impl DenseGeometry {
    pub const fn input_len(&self) -> usize {
        self.inputs * self.batch
    }

    pub const fn output_len(&self) -> usize {
        self.outputs * self.batch
    }

    pub const fn weight_len(&self) -> usize {
        self.outputs * self.inputs
    }
}

/// Geometry of a `[classes, batch]` score matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassGeometry {
    pub classes: usize,
    pub batch: usize,
}

impl ClassGeometry {
    pub const fn len(&self) -> usize {
        self.classes * self.batch
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A compute device: buffer management plus one kernel per operation.
///
/// All methods are associated functions; a device is a type-level tag, not a
/// value. Kernels overwrite their outputs entirely. CPU kernels complete
/// before returning; GPU kernels are enqueued and return immediately, and
/// [`Device::download`] waits for everything submitted before it.
pub trait Device: Sized + 'static {
    /// Which backend this device is.
    const KIND: Backend;

    /// Storage for `len` elements of `T`, with a host-visible mirror.
    type Buffer<T: Element>;

    /// Allocates a zero-filled buffer.
    fn alloc<T: Element>(len: usize) -> Result<Self::Buffer<T>, DeviceError>;

    /// Host view of the buffer.
    fn host<T: Element>(buffer: &Self::Buffer<T>) -> &[T];

    /// Mutable host view of the buffer.
    fn host_mut<T: Element>(buffer: &mut Self::Buffer<T>) -> &mut [T];

    /// Pushes the host view to device memory.
    fn upload<T: Element>(buffer: &mut Self::Buffer<T>) -> Result<(), DeviceError>;

    /// Waits for pending work and pulls device memory into the host view.
    fn download<T: Element>(buffer: &mut Self::Buffer<T>) -> Result<(), DeviceError>;

    /// Zero-fills both the host view and device memory.
    fn zero<T: Element>(buffer: &mut Self::Buffer<T>) -> Result<(), DeviceError>;

    /// `output = input ⋆ feature_map + bias` (cross-correlation, valid mode).
    fn conv2d(
        input: &Self::Buffer<f32>,
        feature_map: &Self::Buffer<f32>,
        bias: &Self::Buffer<f32>,
        output: &mut Self::Buffer<f32>,
        geometry: &ConvGeometry,
    ) -> Result<(), DeviceError>;

    /// Feature-map, bias and (optionally) input gradients of [`Device::conv2d`].
    fn conv2d_backward(
        input: &Self::Buffer<f32>,
        feature_map: &Self::Buffer<f32>,
        output_grad: &Self::Buffer<f32>,
        feature_map_grad: &mut Self::Buffer<f32>,
        bias_grad: &mut Self::Buffer<f32>,
        input_grad: Option<&mut Self::Buffer<f32>>,
        geometry: &ConvGeometry,
    ) -> Result<(), DeviceError>;

    /// Per-channel maximum over each `window × window` block.
    fn max_pool(
        input: &Self::Buffer<f32>,
        output: &mut Self::Buffer<f32>,
        geometry: &PoolGeometry,
    ) -> Result<(), DeviceError>;

    /// Routes each output gradient to the first input position of its block
    /// whose value equals the pooled maximum; all other positions get zero.
    fn max_pool_backward(
        input: &Self::Buffer<f32>,
        output: &Self::Buffer<f32>,
        output_grad: &Self::Buffer<f32>,
        input_grad: &mut Self::Buffer<f32>,
        geometry: &PoolGeometry,
    ) -> Result<(), DeviceError>;

    /// `output = weight · input + bias`, bias broadcast over the batch.
    fn dot_bias(
        input: &Self::Buffer<f32>,
        weight: &Self::Buffer<f32>,
        bias: &Self::Buffer<f32>,
        output: &mut Self::Buffer<f32>,
        geometry: &DenseGeometry,
    ) -> Result<(), DeviceError>;

    /// Weight, bias and (optionally) input gradients of [`Device::dot_bias`].
    fn dot_bias_backward(
        input: &Self::Buffer<f32>,
        output_delta: &Self::Buffer<f32>,
        weight: &Self::Buffer<f32>,
        weight_grad: &mut Self::Buffer<f32>,
        bias_grad: &mut Self::Buffer<f32>,
        input_delta: Option<&mut Self::Buffer<f32>>,
        geometry: &DenseGeometry,
    ) -> Result<(), DeviceError>;

    /// `output = mode(input)` elementwise.
    fn activation(
        mode: ActivationMode,
        input: Src<'_, Self::Buffer<f32>>,
        output: &mut Self::Buffer<f32>,
    ) -> Result<(), DeviceError>;

    /// `input_delta = mode'(output) · output_delta` elementwise.
    fn activation_backward(
        mode: ActivationMode,
        output: &Self::Buffer<f32>,
        output_delta: Src<'_, Self::Buffer<f32>>,
        input_delta: &mut Self::Buffer<f32>,
    ) -> Result<(), DeviceError>;

    /// Column-wise softmax into `output` and `-log softmax[label]` into `cost`.
    fn softmax_log_loss(
        input: &Self::Buffer<f32>,
        label: &Self::Buffer<u32>,
        output: &mut Self::Buffer<f32>,
        cost: &mut Self::Buffer<f32>,
        geometry: &ClassGeometry,
    ) -> Result<(), DeviceError>;

    /// `input_grad = output - one_hot(label)`.
    fn softmax_log_loss_backward(
        output: &Self::Buffer<f32>,
        label: &Self::Buffer<u32>,
        input_grad: &mut Self::Buffer<f32>,
        geometry: &ClassGeometry,
    ) -> Result<(), DeviceError>;

    /// `result = a + rate · b` elementwise.
    fn add(
        a: Src<'_, Self::Buffer<f32>>,
        b: Src<'_, Self::Buffer<f32>>,
        rate: f32,
        result: &mut Self::Buffer<f32>,
    ) -> Result<(), DeviceError>;

    /// `result = a ⊙ b` elementwise.
    fn product(
        a: Src<'_, Self::Buffer<f32>>,
        b: Src<'_, Self::Buffer<f32>>,
        result: &mut Self::Buffer<f32>,
    ) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_geometry_valid_mode_extents() {
        let g = ConvGeometry {
            channels: 1,
            width: 28,
            height: 28,
            batch: 10,
            kernel_width: 5,
            kernel_height: 5,
            features: 20,
        };
        assert_eq!(g.output_shape(), vec![20, 24, 24, 10]);
        assert_eq!(g.kernel_len(), 25);
        assert_eq!(g.output_len(), 20 * 24 * 24 * 10);
    }

    #[test]
    fn pool_geometry_halves_extents() {
        let g = PoolGeometry {
            channels: 20,
            width: 24,
            height: 24,
            batch: 10,
            window: 2,
        };
        assert_eq!(g.output_shape(), vec![20, 12, 12, 10]);
        assert_eq!(g.out_image_len(), 2880);
    }

    #[test]
    fn activation_derivatives_use_forward_output() {
        let o = ActivationMode::Sigmoid.apply(0.3);
        assert!((ActivationMode::Sigmoid.derivative(o, 2.0) - o * (1.0 - o) * 2.0).abs() < 1e-7);
        assert_eq!(ActivationMode::Relu.derivative(0.0, 5.0), 0.0);
        assert_eq!(ActivationMode::Relu.derivative(0.5, 5.0), 5.0);
        let t = ActivationMode::Tanh.apply(-0.4);
        assert!((ActivationMode::Tanh.derivative(t, 1.0) - (1.0 - t * t)).abs() < 1e-7);
    }
}
