//! GPU execution of the arena kernels through wgpu.
//!
//! # Memory Layout
//!
//! Each arena is bound as one `array<f32>` storage buffer, in
//! [`crate::ArenaKind::slot`] order at bindings 0 to 6. Binding 7 is the
//! uniform `Params` block of the launch. Matrices are addressed by the element
//! offsets carried in `Params`, exactly as on the CPU.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use arena_cnn::{GpuAccelerator, Network, TrainingConfig};
//!
//! let gpu = Arc::new(GpuAccelerator::new()?);
//! let mut network = Network::with_shared_accelerator(gpu, TrainingConfig::default());
//! ```

mod gpu_accelerator;
pub mod shaders;

pub use gpu_accelerator::{GpuAccelerator, GpuBuffer};
pub use shaders::kernel_wgsl;
