//! wgpu implementation of [`Accelerator`].
//!
//! Each arena is one storage buffer. All kernels live in a single shader
//! module; a launch binds the seven arenas plus a fresh uniform block holding
//! its [`KernelParams`] and dispatches one invocation per unit.

use std::collections::HashMap;
use std::sync::mpsc;

use log::{debug, info};
use pollster::FutureExt;
use wgpu::util::DeviceExt;

use crate::accelerator::{Accelerator, BufferSet};
use crate::arena::ArenaKind;
use crate::errors::{AllocationError, DeviceError, DeviceResult};
use crate::kernels::{Kernel, KernelLaunch, KernelParams};

use super::shaders::{WORKGROUP_SIZE, kernel_wgsl};

const F32_SIZE: usize = std::mem::size_of::<f32>();

/// Device storage of one arena on the [`GpuAccelerator`].
#[derive(Debug)]
pub struct GpuBuffer {
    arena: ArenaKind,
    len: usize,
    buffer: wgpu::Buffer,
}

impl GpuBuffer {
    fn check_range(&self, offset: usize, len: usize) -> DeviceResult<()> {
        if offset + len > self.len {
            return Err(DeviceError::RangeOutOfBounds {
                arena: self.arena,
                offset,
                end: offset + len,
                len: self.len,
            });
        }
        Ok(())
    }
}

/// Runs the kernels as wgpu compute pipelines.
#[derive(Debug)]
pub struct GpuAccelerator {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    bind_group_layout: wgpu::BindGroupLayout,
    pipelines: HashMap<Kernel, wgpu::ComputePipeline>,
}

impl GpuAccelerator {
    /// Opens the default adapter, blocking until the device is ready.
    pub fn new() -> DeviceResult<Self> {
        Self::new_async().block_on()
    }

    pub async fn new_async() -> DeviceResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .ok_or_else(|| DeviceError::DeviceNotAvailable {
                message: "no compatible adapter found".to_string(),
            })?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("arena_cnn device"),
                    required_limits: adapter.limits(),
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|e| DeviceError::DeviceNotAvailable {
                message: e.to_string(),
            })?;

        Self::from_device(device, queue, adapter.get_info())
    }

    /// Builds the kernel pipelines on an already opened device.
    pub fn from_device(
        device: wgpu::Device,
        queue: wgpu::Queue,
        adapter: wgpu::AdapterInfo,
    ) -> DeviceResult<Self> {
        info!("Using GPU adapter {} ({:?})", adapter.name, adapter.backend);
        let limits = device.limits();

        let mut entries: Vec<_> = ArenaKind::ALL
            .iter()
            .map(|arena| wgpu::BindGroupLayoutEntry {
                binding: arena.slot() as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: ArenaKind::ALL.len() as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: wgpu::BufferSize::new(KernelParams::SIZE as u64),
            },
            count: None,
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Arena Bind Group Layout"),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Arena Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Arena Kernels"),
            source: wgpu::ShaderSource::Wgsl(kernel_wgsl().into()),
        });

        let pipelines = Kernel::ALL
            .into_iter()
            .map(|kernel| {
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(kernel.entry_point()),
                    layout: Some(&pipeline_layout),
                    module: &shader,
                    entry_point: Some(kernel.entry_point()),
                    compilation_options: Default::default(),
                    cache: None,
                });
                (kernel, pipeline)
            })
            .collect();

        if let Some(error) = device.pop_error_scope().block_on() {
            return Err(DeviceError::ShaderCompilationFailed {
                message: error.to_string(),
            });
        }
        debug!("Compiled {} kernel pipelines", Kernel::ALL.len());

        Ok(Self {
            device,
            queue,
            adapter,
            limits,
            bind_group_layout,
            pipelines,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter
    }

    /// Largest arena, in elements, a single binding can hold.
    pub fn max_arena_elements(&self) -> usize {
        let binding = self.limits.max_storage_buffer_binding_size as u64;
        let bytes = binding.min(self.limits.max_buffer_size);
        bytes as usize / F32_SIZE
    }

    /// Workgroup grid for `units` invocations, spilling into y past the per-dimension limit.
    fn grid(&self, units: usize) -> (u32, u32) {
        let groups = units.div_ceil(WORKGROUP_SIZE as usize);
        let max = self.limits.max_compute_workgroups_per_dimension as usize;
        if groups <= max {
            (groups as u32, 1)
        } else {
            (max as u32, groups.div_ceil(max) as u32)
        }
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(Some(encoder.finish()));
    }
}

impl Accelerator for GpuAccelerator {
    type Buffer = GpuBuffer;

    fn describe(&self) -> String {
        format!("GPU {} ({:?})", self.adapter.name, self.adapter.backend)
    }

    fn allocate(&self, arena: ArenaKind, len: usize) -> Result<GpuBuffer, AllocationError> {
        let limit = self.max_arena_elements();
        if len > limit {
            return Err(AllocationError::ArenaTooLarge {
                arena,
                requested: len,
                limit,
            });
        }

        // Zero-length bindings are invalid.
        let size = (len.max(1) * F32_SIZE) as u64;
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(arena.name()),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(error) = self.device.pop_error_scope().block_on() {
            return Err(AllocationError::DeviceOutOfMemory {
                arena,
                requested: len,
                message: error.to_string(),
            });
        }
        Ok(GpuBuffer { arena, len, buffer })
    }

    fn upload(&self, buffer: &mut GpuBuffer, offset: usize, data: &[f32]) -> DeviceResult<()> {
        buffer.check_range(offset, data.len())?;
        if !data.is_empty() {
            self.queue.write_buffer(
                &buffer.buffer,
                (offset * F32_SIZE) as u64,
                bytemuck::cast_slice(data),
            );
        }
        Ok(())
    }

    fn download(&self, buffer: &GpuBuffer, offset: usize, out: &mut [f32]) -> DeviceResult<()> {
        buffer.check_range(offset, out.len())?;
        if out.is_empty() {
            return Ok(());
        }

        let size = (out.len() * F32_SIZE) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        encoder.copy_buffer_to_buffer(
            &buffer.buffer,
            (offset * F32_SIZE) as u64,
            &staging,
            0,
            size,
        );
        self.submit(encoder);

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(DeviceError::BufferMapFailed {
                    message: e.to_string(),
                });
            }
            Err(e) => {
                return Err(DeviceError::BufferMapFailed {
                    message: e.to_string(),
                });
            }
        }

        let data = slice.get_mapped_range();
        out.copy_from_slice(bytemuck::cast_slice(&data));
        drop(data);
        staging.unmap();
        Ok(())
    }

    fn zero(&self, buffer: &mut GpuBuffer) -> DeviceResult<()> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        encoder.clear_buffer(&buffer.buffer, 0, None);
        self.submit(encoder);
        Ok(())
    }

    fn launch(&self, launch: &KernelLaunch, buffers: BufferSet<'_, GpuBuffer>) -> DeviceResult<()> {
        if launch.units() == 0 {
            return Ok(());
        }
        let pipeline =
            self.pipelines
                .get(&launch.kernel)
                .ok_or_else(|| DeviceError::ShaderCompilationFailed {
                    message: format!("no pipeline for {}", launch.kernel.entry_point()),
                })?;

        let params = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Kernel Params"),
            contents: launch.params.as_bytes(),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mut entries: Vec<_> = buffers
            .iter()
            .map(|(arena, buffer)| wgpu::BindGroupEntry {
                binding: arena.slot() as u32,
                resource: buffer.buffer.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: ArenaKind::ALL.len() as u32,
            resource: params.as_entire_binding(),
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(launch.kernel.entry_point()),
            layout: &self.bind_group_layout,
            entries: &entries,
        });

        let (x, y) = self.grid(launch.units());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor::default());
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        self.submit(encoder);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu() -> Option<GpuAccelerator> {
        match GpuAccelerator::new() {
            Ok(gpu) => Some(gpu),
            Err(e) => {
                eprintln!("Skipping GPU test: {e}");
                None
            }
        }
    }

    #[test]
    fn test_upload_then_download() {
        let Some(gpu) = gpu() else { return };
        let mut buffer = gpu.allocate(ArenaKind::Weights, 8).unwrap();
        gpu.upload(&mut buffer, 2, &[1.0, 2.0, 3.0]).unwrap();
        let mut out = vec![0.0; 5];
        gpu.download(&buffer, 1, &mut out).unwrap();
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0, 0.0]);

        gpu.zero(&mut buffer).unwrap();
        gpu.download(&buffer, 1, &mut out).unwrap();
        assert_eq!(out, vec![0.0; 5]);
    }

    #[test]
    fn test_oversized_arena_is_rejected_before_allocation() {
        let Some(gpu) = gpu() else { return };
        let result = gpu.allocate(ArenaKind::Nodes, gpu.max_arena_elements() + 1);
        assert!(matches!(result, Err(AllocationError::ArenaTooLarge { .. })));
    }

    #[test]
    fn test_grid_spills_into_second_dimension() {
        let Some(gpu) = gpu() else { return };
        let max = gpu.limits.max_compute_workgroups_per_dimension as usize;
        assert_eq!(gpu.grid(1), (1, 1));
        let (x, y) = gpu.grid(max * WORKGROUP_SIZE as usize + 1);
        assert_eq!((x as usize, y), (max, 2));
    }
}
