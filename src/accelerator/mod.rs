//! The device contract the engine runs on.
//!
//! An accelerator owns device storage for the arenas and executes
//! [`KernelLaunch`]es against it. Launches are executed in the order they are
//! issued and each completes before the next one starts.

mod cpu;

pub use cpu::{CpuAccelerator, CpuBuffer};

use crate::arena::ArenaKind;
use crate::errors::{AllocationError, DeviceResult};
use crate::kernels::KernelLaunch;

/// Mutable access to the device buffers of all arenas for one launch.
pub struct BufferSet<'a, B> {
    buffers: [&'a mut B; 7],
}

impl<'a, B> BufferSet<'a, B> {
    /// `buffers` must be ordered by [`ArenaKind::slot`].
    pub fn new(buffers: [&'a mut B; 7]) -> Self {
        Self { buffers }
    }

    pub fn get(&self, arena: ArenaKind) -> &B {
        &*self.buffers[arena.slot()]
    }

    pub fn get_mut(&mut self, arena: ArenaKind) -> &mut B {
        &mut *self.buffers[arena.slot()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArenaKind, &B)> {
        ArenaKind::ALL
            .into_iter()
            .zip(self.buffers.iter().map(|buffer| &**buffer))
    }
}

/// A device able to hold the arenas and run the kernels.
pub trait Accelerator: Send + Sync {
    type Buffer: Send;

    /// Human-readable description of the device, for logs.
    fn describe(&self) -> String;

    /// Allocates a zero-initialized buffer of `len` elements for `arena`.
    fn allocate(&self, arena: ArenaKind, len: usize) -> Result<Self::Buffer, AllocationError>;

    /// Copies `data` into `buffer` starting at element `offset`.
    fn upload(&self, buffer: &mut Self::Buffer, offset: usize, data: &[f32]) -> DeviceResult<()>;

    /// Copies `out.len()` elements starting at `offset` out of `buffer`.
    fn download(&self, buffer: &Self::Buffer, offset: usize, out: &mut [f32]) -> DeviceResult<()>;

    /// Sets every element of `buffer` to zero.
    fn zero(&self, buffer: &mut Self::Buffer) -> DeviceResult<()>;

    /// Runs one kernel to completion.
    fn launch(
        &self,
        launch: &KernelLaunch,
        buffers: BufferSet<'_, Self::Buffer>,
    ) -> DeviceResult<()>;
}
