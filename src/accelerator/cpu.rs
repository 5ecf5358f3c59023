//! Host-thread accelerator.
//!
//! Device buffers are plain vectors kept apart from the host mirrors, so the
//! mirroring rules behave exactly as on a GPU. Each launch computes all of its
//! units from read-only arenas across scoped worker threads, then writes the
//! results into the target arena.

use std::thread;

use crate::arena::ArenaKind;
use crate::errors::{AllocationError, DeviceError, DeviceResult};
use crate::kernels::{
    ArenaReads, Kernel, KernelLaunch, KernelParams, backward, forward, loss, update,
};
use crate::layer_graph::LossSlots;

use super::{Accelerator, BufferSet};

/// Launches with fewer units than this run on the calling thread.
const MIN_UNITS_PER_WORKER: usize = 512;

type UnitFn = fn(&KernelParams, &ArenaReads<'_>, usize) -> f32;
type PairedUnitFn = fn(&KernelParams, &ArenaReads<'_>, usize) -> (f32, f32);

/// Device storage of one arena on the [`CpuAccelerator`].
#[derive(Debug, Clone)]
pub struct CpuBuffer {
    arena: ArenaKind,
    data: Vec<f32>,
}

impl CpuBuffer {
    fn region_mut(&mut self, offset: usize, len: usize) -> DeviceResult<&mut [f32]> {
        let available = self.data.len();
        self.data
            .get_mut(offset..offset + len)
            .ok_or(DeviceError::RangeOutOfBounds {
                arena: self.arena,
                offset,
                end: offset + len,
                len: available,
            })
    }

    fn region(&self, offset: usize, len: usize) -> DeviceResult<&[f32]> {
        self.data
            .get(offset..offset + len)
            .ok_or(DeviceError::RangeOutOfBounds {
                arena: self.arena,
                offset,
                end: offset + len,
                len: self.data.len(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Write {
    Overwrite,
    Accumulate,
}

/// Runs the kernels on `workers` scoped threads.
#[derive(Debug, Clone)]
pub struct CpuAccelerator {
    workers: usize,
}

impl Default for CpuAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuAccelerator {
    /// One worker per available core.
    pub fn new() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { workers }
    }

    pub fn with_threads(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn single_threaded() -> Self {
        Self::with_threads(1)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Evaluates `unit` for every index in `0..count`, in parallel chunks.
    fn map_units<T, F>(&self, kernel: Kernel, count: usize, unit: F) -> DeviceResult<Vec<T>>
    where
        T: Copy + Default + Send,
        F: Fn(usize) -> T + Sync,
    {
        let mut values = vec![T::default(); count];
        if self.workers == 1 || count < 2 * MIN_UNITS_PER_WORKER {
            for (i, value) in values.iter_mut().enumerate() {
                *value = unit(i);
            }
            return Ok(values);
        }

        let chunk = count.div_ceil(self.workers).max(MIN_UNITS_PER_WORKER);
        let unit = &unit;
        thread::scope(|scope| {
            let handles: Vec<_> = values
                .chunks_mut(chunk)
                .enumerate()
                .map(|(index, slice)| {
                    scope.spawn(move || {
                        let start = index * chunk;
                        for (k, value) in slice.iter_mut().enumerate() {
                            *value = unit(start + k);
                        }
                    })
                })
                .collect();

            for handle in handles {
                if handle.join().is_err() {
                    return Err(DeviceError::WorkerPanicked {
                        kernel: kernel.entry_point(),
                    });
                }
            }
            Ok(())
        })?;
        Ok(values)
    }

    fn run_units(
        &self,
        launch: &KernelLaunch,
        buffers: &mut BufferSet<'_, CpuBuffer>,
        target: ArenaKind,
        offset: u32,
        write: Write,
        unit: UnitFn,
    ) -> DeviceResult<()> {
        let params = &launch.params;
        let values = {
            let reads = arena_reads(buffers);
            self.map_units(launch.kernel, launch.units(), |i| unit(params, &reads, i))?
        };

        let region = buffers.get_mut(target).region_mut(offset as usize, values.len())?;
        match write {
            Write::Overwrite => region.copy_from_slice(&values),
            Write::Accumulate => {
                for (slot, value) in region.iter_mut().zip(values) {
                    *slot += value;
                }
            }
        }
        Ok(())
    }

    /// Like [`Self::run_units`], for kernels that write one element into each of two arenas.
    fn run_paired_units(
        &self,
        launch: &KernelLaunch,
        buffers: &mut BufferSet<'_, CpuBuffer>,
        first: (ArenaKind, u32),
        second: (ArenaKind, u32),
        unit: PairedUnitFn,
    ) -> DeviceResult<()> {
        let params = &launch.params;
        let values = {
            let reads = arena_reads(buffers);
            self.map_units(launch.kernel, launch.units(), |i| unit(params, &reads, i))?
        };

        let region = buffers.get_mut(first.0).region_mut(first.1 as usize, values.len())?;
        for (slot, (value, _)) in region.iter_mut().zip(&values) {
            *slot = *value;
        }
        let region = buffers.get_mut(second.0).region_mut(second.1 as usize, values.len())?;
        for (slot, (_, value)) in region.iter_mut().zip(&values) {
            *slot = *value;
        }
        Ok(())
    }

    fn run_loss(
        &self,
        params: &KernelParams,
        buffers: &mut BufferSet<'_, CpuBuffer>,
    ) -> DeviceResult<()> {
        let outcome = loss::softmax_cross_entropy(params, &arena_reads(buffers));
        let slots = LossSlots::at(params.scratch_offset as usize, params.in_x as usize);

        let scratch = buffers.get_mut(ArenaKind::Scratch);
        scratch
            .region_mut(slots.probabilities, slots.classes)?
            .copy_from_slice(&outcome.probabilities);
        let counters = scratch.region_mut(slots.cost, LossSlots::COUNTERS)?;
        counters[0] = outcome.cost;
        counters[1] += outcome.cost;
        if outcome.correct {
            counters[2] += 1.0;
        }

        if let Some(derivatives) = outcome.derivatives {
            buffers
                .get_mut(ArenaKind::NodeGradients)
                .region_mut(params.out_offset as usize, derivatives.len())?
                .copy_from_slice(&derivatives);
        }
        Ok(())
    }
}

fn arena_reads<'a>(buffers: &'a BufferSet<'_, CpuBuffer>) -> ArenaReads<'a> {
    ArenaReads::new(std::array::from_fn(|slot| {
        buffers.get(ArenaKind::ALL[slot]).data.as_slice()
    }))
}

impl Accelerator for CpuAccelerator {
    type Buffer = CpuBuffer;

    fn describe(&self) -> String {
        format!("CPU ({} worker threads)", self.workers)
    }

    fn allocate(&self, arena: ArenaKind, len: usize) -> Result<CpuBuffer, AllocationError> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| AllocationError::DeviceOutOfMemory {
                arena,
                requested: len,
                message: e.to_string(),
            })?;
        data.resize(len, 0.0);
        Ok(CpuBuffer { arena, data })
    }

    fn upload(&self, buffer: &mut CpuBuffer, offset: usize, data: &[f32]) -> DeviceResult<()> {
        buffer.region_mut(offset, data.len())?.copy_from_slice(data);
        Ok(())
    }

    fn download(&self, buffer: &CpuBuffer, offset: usize, out: &mut [f32]) -> DeviceResult<()> {
        out.copy_from_slice(buffer.region(offset, out.len())?);
        Ok(())
    }

    fn zero(&self, buffer: &mut CpuBuffer) -> DeviceResult<()> {
        buffer.data.fill(0.0);
        Ok(())
    }

    fn launch(
        &self,
        launch: &KernelLaunch,
        mut buffers: BufferSet<'_, CpuBuffer>,
    ) -> DeviceResult<()> {
        use ArenaKind::*;
        use Write::*;

        let p = &launch.params;
        let buffers = &mut buffers;
        match launch.kernel {
            Kernel::LoadInput => self.run_units(
                launch,
                buffers,
                Nodes,
                p.out_offset,
                Overwrite,
                forward::load_input,
            ),
            Kernel::ConvolutionForward => self.run_units(
                launch,
                buffers,
                Nodes,
                p.out_offset,
                Overwrite,
                forward::convolution,
            ),
            Kernel::MaxPoolingForward => self.run_paired_units(
                launch,
                buffers,
                (Nodes, p.out_offset),
                (Scratch, p.scratch_offset),
                forward::max_pooling,
            ),
            Kernel::FullyConnectedForward => self.run_units(
                launch,
                buffers,
                Nodes,
                p.out_offset,
                Overwrite,
                forward::fully_connected,
            ),
            Kernel::DropoutForward => self.run_paired_units(
                launch,
                buffers,
                (Nodes, p.out_offset),
                (Scratch, p.scratch_offset),
                forward::dropout,
            ),
            Kernel::DropoutPassThrough => self.run_units(
                launch,
                buffers,
                Nodes,
                p.out_offset,
                Overwrite,
                forward::dropout_pass_through,
            ),
            Kernel::SoftmaxCrossEntropy => self.run_loss(p, buffers),
            Kernel::ConvolutionBackwardInput => self.run_units(
                launch,
                buffers,
                NodeGradients,
                p.in_offset,
                Overwrite,
                backward::convolution_input,
            ),
            Kernel::ConvolutionBackwardWeights => self.run_units(
                launch,
                buffers,
                WeightGradients,
                p.weight_offset,
                Accumulate,
                backward::convolution_weights,
            ),
            Kernel::ConvolutionBackwardBias => self.run_units(
                launch,
                buffers,
                BiasGradients,
                p.bias_offset,
                Accumulate,
                backward::convolution_bias,
            ),
            Kernel::MaxPoolingBackward => self.run_units(
                launch,
                buffers,
                NodeGradients,
                p.in_offset,
                Overwrite,
                backward::max_pooling,
            ),
            Kernel::FullyConnectedBackwardInput => self.run_units(
                launch,
                buffers,
                NodeGradients,
                p.in_offset,
                Overwrite,
                backward::fully_connected_input,
            ),
            Kernel::FullyConnectedBackwardWeights => self.run_units(
                launch,
                buffers,
                WeightGradients,
                p.weight_offset,
                Accumulate,
                backward::fully_connected_weights,
            ),
            Kernel::FullyConnectedBackwardBias => self.run_units(
                launch,
                buffers,
                BiasGradients,
                p.bias_offset,
                Accumulate,
                backward::fully_connected_bias,
            ),
            Kernel::DropoutBackward => self.run_units(
                launch,
                buffers,
                NodeGradients,
                p.in_offset,
                Overwrite,
                backward::dropout,
            ),
            Kernel::GradientDescentWeights => self.run_units(
                launch,
                buffers,
                Weights,
                0,
                Overwrite,
                update::gradient_descent_weights,
            ),
            Kernel::GradientDescentBiases => self.run_units(
                launch,
                buffers,
                Biases,
                0,
                Overwrite,
                update::gradient_descent_biases,
            ),
        }
    }
}
