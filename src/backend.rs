//! Backend identification.
//!
//! Kernels are chosen at compile time through the [`Device`](crate::ops::Device)
//! type parameter carried by every tensor and operator. This module names the
//! kinds of device the crate knows about and reports which of them can
//! actually run on this machine.
//!
//! # Supported Backends
//!
//! - `Cpu` — Pure Rust kernels parallelized with `rayon` (always present).
//! - `Gpu` — WGSL compute kernels through `wgpu`, enabled by the `wgpu` or
//!   `cuda` feature. CUDA-class hardware is reached through wgpu.

use core::fmt;

/// The kind of device a tensor lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Backend {
    /// Host memory, CPU kernels (default).
    #[default]
    Cpu = 0,
    /// Accelerator memory, GPU compute kernels.
    Gpu,
}

impl Backend {
    /// Whether a tensor on this backend keeps its authoritative copy in host
    /// memory, making the explicit transfer calls no-ops.
    pub const fn is_host(self) -> bool {
        matches!(self, Self::Cpu)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu => f.write_str("gpu"),
        }
    }
}

/// Lists the backends usable in this process.
///
/// `Cpu` is always first. `Gpu` appears only when the crate was built with a
/// GPU feature and an adapter could be acquired.
///
/// ```
/// use pairgrad::backend::{available, Backend};
/// assert_eq!(available()[0], Backend::Cpu);
/// ```
pub fn available() -> Vec<Backend> {
    let mut kinds = vec![Backend::Cpu];
    #[cfg(any(feature = "wgpu", feature = "cuda"))]
    if crate::ops::wgpu::is_available() {
        kinds.push(Backend::Gpu);
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_is_default_and_host_resident() {
        assert_eq!(Backend::default(), Backend::Cpu);
        assert!(Backend::Cpu.is_host());
        assert!(!Backend::Gpu.is_host());
        assert_eq!(Backend::Gpu.to_string(), "gpu");
    }

    #[test]
    fn cpu_always_available() {
        assert!(available().contains(&Backend::Cpu));
    }
}
