//! GPU kernels using WGPU.
//!
//! This module implements [`Device`] for [`Gpu`] with WGSL compute shaders.
//! It owns the process-wide GPU context (adapter, device, queue and one
//! precompiled pipeline per kernel), created lazily on first use through
//! `lazy_static`.
//!
//! Every tensor buffer keeps a host mirror next to its device allocation.
//! Kernels read and write device memory only: they are enqueued and return
//! without waiting. [`Device::upload`] pushes the mirror to the device and
//! [`Device::download`] blocks until all submitted work is done before
//! pulling device memory back into the mirror.
//!
//! Failures never panic. If the context cannot be brought up, every call
//! returns [`DeviceError::Unavailable`]; allocation and dispatch faults are
//! caught with error scopes and returned as [`DeviceError::OutOfMemory`] and
//! [`DeviceError::Validation`]. Allocations larger than the device allows are
//! refused before they reach the driver.
//!
//! Each kernel owns its parameter block. Bind groups are built on the first
//! dispatch over a given set of buffers and reused after that, so repeated
//! evaluations only write parameters and record a dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, mpsc};

use briny::prelude::*;

use crate::backend::Backend;
use crate::error::DeviceError;
use crate::ops::dispatch::{
    ActivationMode, ClassGeometry, ConvGeometry, DenseGeometry, Device, Element, PoolGeometry,
    Src,
};

const WORKGROUP_SIZE: u32 = 64;
const MAX_GROUPS_PER_DIM: u32 = 65_535;
/// Capacity of every kernel's uniform parameter block, in `u32` words.
const PARAM_WORDS: usize = 16;
/// Most storage buffers any kernel binds.
const MAX_BINDINGS: usize = 4;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

fn next_buffer_id() -> u64 {
    NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A storage buffer with the identity bind groups are cached under.
type Binding<'a> = (u64, &'a wgpu::Buffer);

/// Storage buffer identities of one dispatch, padded with `u64::MAX`.
type BindKey = [u64; MAX_BINDINGS];

/// Secure wrapper for WGSL source code compiled into the crate.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;

        if src.len() > 65536 {
            return Err(ValidationError);
        }

        if !src.contains("fn main") {
            return Err(ValidationError);
        }

        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }

        let forbidden = ["asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }

        Ok(())
    }
}

/// A compiled compute pipeline with its bind group layout.
///
/// Binding 0 is always a uniform block of `u32` parameters, whose first word
/// is the invocation count. Bindings `1..=storage` are read-write storage
/// buffers in the order the kernel's caller passes them.
struct Kernel {
    name: &'static str,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    uniform: wgpu::Buffer,
    bind_groups: Mutex<HashMap<BindKey, wgpu::BindGroup>>,
}

impl Kernel {
    fn build(
        device: &wgpu::Device,
        name: &'static str,
        source: &str,
        storage: u32,
    ) -> Result<Self, DeviceError> {
        WgslSource(source)
            .validate()
            .map_err(|_| DeviceError::Shader(name))?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let entries: Vec<_> = core::iter::once(layout_entry(0, wgpu::BufferBindingType::Uniform))
            .chain((1..=storage).map(|binding| {
                layout_entry(binding, wgpu::BufferBindingType::Storage { read_only: false })
            }))
            .collect();
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(name),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(name),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });

        let uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size: (PARAM_WORDS * core::mem::size_of::<u32>()) as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(DeviceError::Validation {
                kernel: name,
                message: err.to_string(),
            });
        }

        Ok(Self {
            name,
            layout,
            pipeline,
            uniform,
            bind_groups: Mutex::new(HashMap::new()),
        })
    }

    /// Number of cached bind groups that bind buffer `id`.
    #[cfg(test)]
    fn cached_with(&self, id: u64) -> usize {
        self.bind_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|key| key.contains(&id))
            .count()
    }
}

fn layout_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

struct Kernels {
    conv2d: Kernel,
    conv2d_filter_grad: Kernel,
    conv2d_input_grad: Kernel,
    row_sum: Kernel,
    max_pool: Kernel,
    max_pool_grad: Kernel,
    dot_bias: Kernel,
    dot_bias_weight_grad: Kernel,
    dot_bias_input_delta: Kernel,
    activation: Kernel,
    activation_grad: Kernel,
    softmax_log_loss: Kernel,
    softmax_log_loss_grad: Kernel,
    elementwise: Kernel,
}

macro_rules! kernel {
    ($device:expr, $name:literal, $storage:expr) => {
        Kernel::build(
            $device,
            $name,
            include_str!(concat!("shaders/", $name, ".wgsl")),
            $storage,
        )?
    };
}

impl Kernels {
    fn build(device: &wgpu::Device) -> Result<Self, DeviceError> {
        Ok(Self {
            conv2d: kernel!(device, "conv2d", 4),
            conv2d_filter_grad: kernel!(device, "conv2d_filter_grad", 3),
            conv2d_input_grad: kernel!(device, "conv2d_input_grad", 3),
            row_sum: kernel!(device, "row_sum", 2),
            max_pool: kernel!(device, "max_pool", 2),
            max_pool_grad: kernel!(device, "max_pool_grad", 4),
            dot_bias: kernel!(device, "dot_bias", 4),
            dot_bias_weight_grad: kernel!(device, "dot_bias_weight_grad", 3),
            dot_bias_input_delta: kernel!(device, "dot_bias_input_delta", 3),
            activation: kernel!(device, "activation", 2),
            activation_grad: kernel!(device, "activation_grad", 3),
            softmax_log_loss: kernel!(device, "softmax_log_loss", 4),
            softmax_log_loss_grad: kernel!(device, "softmax_log_loss_grad", 3),
            elementwise: kernel!(device, "elementwise", 3),
        })
    }

    fn all(&self) -> [&Kernel; 14] {
        [
            &self.conv2d,
            &self.conv2d_filter_grad,
            &self.conv2d_input_grad,
            &self.row_sum,
            &self.max_pool,
            &self.max_pool_grad,
            &self.dot_bias,
            &self.dot_bias_weight_grad,
            &self.dot_bias_input_delta,
            &self.activation,
            &self.activation_grad,
            &self.softmax_log_loss,
            &self.softmax_log_loss_grad,
            &self.elementwise,
        ]
    }

    /// Drops every cached bind group that binds buffer `id`.
    fn forget(&self, id: u64) {
        for kernel in self.all() {
            kernel
                .bind_groups
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|key, _| !key.contains(&id));
        }
    }
}

/// Holds the WGPU device, queue and compiled kernels.
///
/// Initialized once globally and reused for every buffer and dispatch.
struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    kernels: Kernels,
    /// Stand-ins bound to operand slots a kernel reads from its destination
    /// instead. Two, so a kernel never binds the same stand-in twice.
    spare: [(u64, wgpu::Buffer); 2],
}

impl GpuContext {
    /// Selects the default adapter, creates a device and queue, and compiles
    /// every kernel.
    fn new() -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(|e| DeviceError::Adapter(e.to_string()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("pairgrad"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| DeviceError::Request(e.to_string()))?;

        let kernels = Kernels::build(&device)?;
        let spare = ["spare_a", "spare_b"].map(|label| {
            let raw = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: 16,
                usage: wgpu::BufferUsages::STORAGE,
                mapped_at_creation: false,
            });
            (next_buffer_id(), raw)
        });

        log::debug!("gpu context ready on adapter {:?}", adapter.get_info().name);
        Ok(Self {
            device,
            queue,
            kernels,
            spare,
        })
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: Result<GpuContext, DeviceError> = GpuContext::new()
        .inspect_err(|e| log::warn!("GPU backend unavailable: {e}"));
}

fn context() -> Result<&'static GpuContext, DeviceError> {
    GPU_CONTEXT
        .as_ref()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))
}

/// Whether a GPU context could be created in this process.
pub fn is_available() -> bool {
    GPU_CONTEXT.is_ok()
}

/// Runs `f` inside out-of-memory and validation error scopes and reports
/// whichever fired. `bytes` is what an out-of-memory error reports.
fn scoped<R>(
    ctx: &GpuContext,
    what: &'static str,
    bytes: u64,
    f: impl FnOnce() -> R,
) -> Result<R, DeviceError> {
    ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(ctx.device.pop_error_scope());
    let oom = pollster::block_on(ctx.device.pop_error_scope());

    if oom.is_some() {
        return Err(DeviceError::OutOfMemory { bytes });
    }
    match validation {
        Some(err) => Err(DeviceError::Validation {
            kernel: what,
            message: err.to_string(),
        }),
        None => Ok(value),
    }
}

/// Byte size of a `len`-element buffer of `T`, refused when it overflows or
/// exceeds `limit`.
fn buffer_bytes<T: Element>(len: usize, limit: u64) -> Result<u64, DeviceError> {
    let bytes = len
        .checked_mul(core::mem::size_of::<T>())
        .and_then(|bytes| u64::try_from(bytes).ok())
        .ok_or(DeviceError::OutOfMemory { bytes: u64::MAX })?;
    if bytes > limit {
        return Err(DeviceError::OutOfMemory { bytes });
    }
    Ok(bytes)
}

/// Largest buffer a kernel can bind whole on this device.
fn binding_limit(device: &wgpu::Device) -> u64 {
    let limits = device.limits();
    limits
        .max_buffer_size
        .min(u64::from(limits.max_storage_buffer_binding_size))
}

/// Device storage plus its host mirror.
pub struct GpuBuffer<T: Element> {
    id: u64,
    host: Vec<T>,
    raw: wgpu::Buffer,
}

impl<T: Element> GpuBuffer<T> {
    /// The device allocation.
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.raw
    }

    fn byte_len(&self) -> u64 {
        core::mem::size_of_val(self.host.as_slice()) as u64
    }

    fn binding(&self) -> Binding<'_> {
        (self.id, &self.raw)
    }
}

impl<T: Element> Drop for GpuBuffer<T> {
    fn drop(&mut self) {
        if let Ok(ctx) = context() {
            ctx.kernels.forget(self.id);
        }
    }
}

impl<T: Element> AsRef<[T]> for GpuBuffer<T> {
    fn as_ref(&self) -> &[T] {
        &self.host
    }
}

/// Accelerator device driven through wgpu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gpu;

/// Converts extents to shader parameter words.
fn words(kernel: &'static str, values: &[usize]) -> Result<Vec<u32>, DeviceError> {
    values
        .iter()
        .map(|&v| {
            u32::try_from(v).map_err(|_| DeviceError::Validation {
                kernel,
                message: format!("extent {v} does not fit in u32"),
            })
        })
        .collect()
}

/// Binds `params` and `buffers`, dispatches one invocation per `params[0]`
/// and submits without waiting.
///
/// The bind group for `buffers` is built once and cached on the kernel until
/// one of the buffers is dropped.
fn launch(kernel: &Kernel, params: &[u32], buffers: &[Binding<'_>]) -> Result<(), DeviceError> {
    let ctx = context()?;
    let invocations = params.first().copied().unwrap_or(0);
    if invocations == 0 {
        return Ok(());
    }
    if params.len() > PARAM_WORDS || buffers.len() > MAX_BINDINGS {
        return Err(DeviceError::Validation {
            kernel: kernel.name,
            message: format!(
                "{} parameters and {} buffers exceed the kernel block",
                params.len(),
                buffers.len()
            ),
        });
    }

    let mut block = [0u32; PARAM_WORDS];
    block[..params.len()].copy_from_slice(params);
    let mut key = [u64::MAX; MAX_BINDINGS];
    for (slot, (id, _)) in key.iter_mut().zip(buffers) {
        *slot = *id;
    }

    let groups = invocations.div_ceil(WORKGROUP_SIZE);
    let x = groups.min(MAX_GROUPS_PER_DIM);
    let y = groups.div_ceil(x);

    // held through submit so no other dispatch rewrites the parameter block
    let mut bind_groups = kernel
        .bind_groups
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    let dispatched = scoped(ctx, kernel.name, 0, || {
        let bind_group = bind_groups.entry(key).or_insert_with(|| {
            let entries: Vec<_> = core::iter::once(&kernel.uniform)
                .chain(buffers.iter().map(|(_, buffer)| *buffer))
                .enumerate()
                .map(|(binding, buffer)| wgpu::BindGroupEntry {
                    binding: binding as u32,
                    resource: buffer.as_entire_binding(),
                })
                .collect();
            ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(kernel.name),
                layout: &kernel.layout,
                entries: &entries,
            })
        });

        ctx.queue
            .write_buffer(&kernel.uniform, 0, bytemuck::cast_slice(&block));
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.name),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &*bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        ctx.queue.submit(Some(encoder.finish()));
    });
    if dispatched.is_err() {
        bind_groups.remove(&key);
    }
    dispatched
}

/// Device buffer for an operand plus the flag telling the shader whether to
/// read it from the destination instead.
fn operand<'a>(
    src: Src<'a, GpuBuffer<f32>>,
    spare: &'a (u64, wgpu::Buffer),
) -> (Binding<'a>, u32) {
    match src {
        Src::Buf(buffer) => (buffer.binding(), 0),
        Src::Dst => ((spare.0, &spare.1), 1),
    }
}

fn conv_params(
    kernel: &'static str,
    len: usize,
    g: &ConvGeometry,
) -> Result<Vec<u32>, DeviceError> {
    words(
        kernel,
        &[
            len,
            g.channels,
            g.width,
            g.height,
            g.kernel_width,
            g.kernel_height,
            g.features,
            g.out_width(),
            g.out_height(),
            g.batch,
        ],
    )
}

fn pool_params(kernel: &'static str, g: &PoolGeometry) -> Result<Vec<u32>, DeviceError> {
    words(
        kernel,
        &[
            g.output_len(),
            g.channels,
            g.width,
            g.height,
            g.window,
            g.out_width(),
            g.out_height(),
        ],
    )
}

fn dense_params(
    kernel: &'static str,
    len: usize,
    g: &DenseGeometry,
) -> Result<Vec<u32>, DeviceError> {
    words(kernel, &[len, g.inputs, g.outputs, g.batch])
}

impl Device for Gpu {
    const KIND: Backend = Backend::Gpu;

    type Buffer<T: Element> = GpuBuffer<T>;

    fn alloc<T: Element>(len: usize) -> Result<GpuBuffer<T>, DeviceError> {
        let ctx = context()?;
        let bytes = buffer_bytes::<T>(len, binding_limit(&ctx.device))?;

        let raw = scoped(ctx, "alloc", bytes, || {
            ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("tensor"),
                // zero-length bindings are invalid
                size: bytes.max(4),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;

        Ok(GpuBuffer {
            id: next_buffer_id(),
            host: vec![T::zeroed(); len],
            raw,
        })
    }

    fn host<T: Element>(buffer: &GpuBuffer<T>) -> &[T] {
        &buffer.host
    }

    fn host_mut<T: Element>(buffer: &mut GpuBuffer<T>) -> &mut [T] {
        &mut buffer.host
    }

    fn upload<T: Element>(buffer: &mut GpuBuffer<T>) -> Result<(), DeviceError> {
        let ctx = context()?;
        if buffer.host.is_empty() {
            return Ok(());
        }
        scoped(ctx, "upload", buffer.byte_len(), || {
            ctx.queue
                .write_buffer(&buffer.raw, 0, bytemuck::cast_slice(&buffer.host));
        })
    }

    fn download<T: Element>(buffer: &mut GpuBuffer<T>) -> Result<(), DeviceError> {
        let ctx = context()?;
        let size = buffer.byte_len();
        if size == 0 {
            return Ok(());
        }

        let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("download"),
            });
        encoder.copy_buffer_to_buffer(&buffer.raw, 0, &staging, 0, size);
        ctx.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        ctx.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| DeviceError::Poll(e.to_string()))?;
        rx.recv()
            .map_err(|e| DeviceError::Map(e.to_string()))?
            .map_err(|e| DeviceError::Map(e.to_string()))?;

        {
            let view = slice.get_mapped_range();
            let values: &[T] =
                bytemuck::try_cast_slice(&view).map_err(|e| DeviceError::Map(e.to_string()))?;
            buffer.host.copy_from_slice(values);
        }
        staging.unmap();
        Ok(())
    }

    fn zero<T: Element>(buffer: &mut GpuBuffer<T>) -> Result<(), DeviceError> {
        let ctx = context()?;
        buffer.host.fill(T::zeroed());
        scoped(ctx, "zero", buffer.byte_len(), || {
            let mut encoder = ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("zero"),
                });
            encoder.clear_buffer(&buffer.raw, 0, None);
            ctx.queue.submit(Some(encoder.finish()));
        })
    }

    fn conv2d(
        input: &GpuBuffer<f32>,
        feature_map: &GpuBuffer<f32>,
        bias: &GpuBuffer<f32>,
        output: &mut GpuBuffer<f32>,
        g: &ConvGeometry,
    ) -> Result<(), DeviceError> {
        let k = &context()?.kernels.conv2d;
        launch(
            k,
            &conv_params(k.name, g.output_len(), g)?,
            &[input.binding(), feature_map.binding(), bias.binding(), output.binding()],
        )
    }

    fn conv2d_backward(
        input: &GpuBuffer<f32>,
        feature_map: &GpuBuffer<f32>,
        output_grad: &GpuBuffer<f32>,
        feature_map_grad: &mut GpuBuffer<f32>,
        bias_grad: &mut GpuBuffer<f32>,
        input_grad: Option<&mut GpuBuffer<f32>>,
        g: &ConvGeometry,
    ) -> Result<(), DeviceError> {
        let kernels = &context()?.kernels;

        let k = &kernels.conv2d_filter_grad;
        launch(
            k,
            &conv_params(k.name, g.feature_map_len(), g)?,
            &[input.binding(), output_grad.binding(), feature_map_grad.binding()],
        )?;

        let k = &kernels.row_sum;
        launch(
            k,
            &words(k.name, &[g.features, g.out_width() * g.out_height() * g.batch])?,
            &[output_grad.binding(), bias_grad.binding()],
        )?;

        if let Some(input_grad) = input_grad {
            let k = &kernels.conv2d_input_grad;
            launch(
                k,
                &conv_params(k.name, g.input_len(), g)?,
                &[feature_map.binding(), output_grad.binding(), input_grad.binding()],
            )?;
        }
        Ok(())
    }

    fn max_pool(
        input: &GpuBuffer<f32>,
        output: &mut GpuBuffer<f32>,
        g: &PoolGeometry,
    ) -> Result<(), DeviceError> {
        let k = &context()?.kernels.max_pool;
        launch(k, &pool_params(k.name, g)?, &[input.binding(), output.binding()])
    }

    fn max_pool_backward(
        input: &GpuBuffer<f32>,
        output: &GpuBuffer<f32>,
        output_grad: &GpuBuffer<f32>,
        input_grad: &mut GpuBuffer<f32>,
        g: &PoolGeometry,
    ) -> Result<(), DeviceError> {
        let k = &context()?.kernels.max_pool_grad;
        launch(
            k,
            &pool_params(k.name, g)?,
            &[input.binding(), output.binding(), output_grad.binding(), input_grad.binding()],
        )
    }

    fn dot_bias(
        input: &GpuBuffer<f32>,
        weight: &GpuBuffer<f32>,
        bias: &GpuBuffer<f32>,
        output: &mut GpuBuffer<f32>,
        g: &DenseGeometry,
    ) -> Result<(), DeviceError> {
        let k = &context()?.kernels.dot_bias;
        launch(
            k,
            &dense_params(k.name, g.output_len(), g)?,
            &[input.binding(), weight.binding(), bias.binding(), output.binding()],
        )
    }

    fn dot_bias_backward(
        input: &GpuBuffer<f32>,
        output_delta: &GpuBuffer<f32>,
        weight: &GpuBuffer<f32>,
        weight_grad: &mut GpuBuffer<f32>,
        bias_grad: &mut GpuBuffer<f32>,
        input_delta: Option<&mut GpuBuffer<f32>>,
        g: &DenseGeometry,
    ) -> Result<(), DeviceError> {
        let kernels = &context()?.kernels;

        let k = &kernels.dot_bias_weight_grad;
        launch(
            k,
            &dense_params(k.name, g.weight_len(), g)?,
            &[input.binding(), output_delta.binding(), weight_grad.binding()],
        )?;

        let k = &kernels.row_sum;
        launch(
            k,
            &words(k.name, &[g.outputs, g.batch])?,
            &[output_delta.binding(), bias_grad.binding()],
        )?;

        if let Some(input_delta) = input_delta {
            let k = &kernels.dot_bias_input_delta;
            launch(
                k,
                &dense_params(k.name, g.input_len(), g)?,
                &[weight.binding(), output_delta.binding(), input_delta.binding()],
            )?;
        }
        Ok(())
    }

    fn activation(
        mode: ActivationMode,
        input: Src<'_, GpuBuffer<f32>>,
        output: &mut GpuBuffer<f32>,
    ) -> Result<(), DeviceError> {
        let ctx = context()?;
        let k = &ctx.kernels.activation;
        let (input, in_place) = operand(input, &ctx.spare[0]);
        let mut params = words(k.name, &[output.host.len()])?;
        params.extend([mode.code(), in_place]);
        launch(k, &params, &[input, output.binding()])
    }

    fn activation_backward(
        mode: ActivationMode,
        output: &GpuBuffer<f32>,
        output_delta: Src<'_, GpuBuffer<f32>>,
        input_delta: &mut GpuBuffer<f32>,
    ) -> Result<(), DeviceError> {
        let ctx = context()?;
        let k = &ctx.kernels.activation_grad;
        let (delta, in_place) = operand(output_delta, &ctx.spare[0]);
        let mut params = words(k.name, &[input_delta.host.len()])?;
        params.extend([mode.code(), in_place]);
        launch(k, &params, &[output.binding(), delta, input_delta.binding()])
    }

    fn softmax_log_loss(
        input: &GpuBuffer<f32>,
        label: &GpuBuffer<u32>,
        output: &mut GpuBuffer<f32>,
        cost: &mut GpuBuffer<f32>,
        g: &ClassGeometry,
    ) -> Result<(), DeviceError> {
        let k = &context()?.kernels.softmax_log_loss;
        launch(
            k,
            &words(k.name, &[g.batch, g.classes])?,
            &[input.binding(), label.binding(), output.binding(), cost.binding()],
        )
    }

    fn softmax_log_loss_backward(
        output: &GpuBuffer<f32>,
        label: &GpuBuffer<u32>,
        input_grad: &mut GpuBuffer<f32>,
        g: &ClassGeometry,
    ) -> Result<(), DeviceError> {
        let k = &context()?.kernels.softmax_log_loss_grad;
        launch(
            k,
            &words(k.name, &[g.len(), g.classes])?,
            &[output.binding(), label.binding(), input_grad.binding()],
        )
    }

    fn add(
        a: Src<'_, GpuBuffer<f32>>,
        b: Src<'_, GpuBuffer<f32>>,
        rate: f32,
        result: &mut GpuBuffer<f32>,
    ) -> Result<(), DeviceError> {
        elementwise(0, a, b, rate, result)
    }

    fn product(
        a: Src<'_, GpuBuffer<f32>>,
        b: Src<'_, GpuBuffer<f32>>,
        result: &mut GpuBuffer<f32>,
    ) -> Result<(), DeviceError> {
        elementwise(1, a, b, 1.0, result)
    }
}

fn elementwise(
    op: u32,
    a: Src<'_, GpuBuffer<f32>>,
    b: Src<'_, GpuBuffer<f32>>,
    rate: f32,
    result: &mut GpuBuffer<f32>,
) -> Result<(), DeviceError> {
    let ctx = context()?;
    let k = &ctx.kernels.elementwise;
    let (a, a_from_result) = operand(a, &ctx.spare[0]);
    let (b, b_from_result) = operand(b, &ctx.spare[1]);
    let mut params = words(k.name, &[result.host.len()])?;
    params.extend([op, a_from_result, b_from_result, rate.to_bits()]);
    launch(k, &params, &[a, b, result.binding()])
}
