use std::sync::Arc;

use log::{debug, info};

use crate::accelerator::{Accelerator, BufferSet};
use crate::errors::{AllocationError, DeviceResult, StateError};
use crate::kernels::KernelLaunch;
use crate::layer_graph::NetworkLayout;

use super::{ArenaKind, ArenaView, MirroredBuffer, SyncState};

/// Default cap on the number of elements in a single arena (64 Mi floats).
pub const DEFAULT_MAX_ARENA_ELEMENTS: usize = 64 * 1024 * 1024;

/// Size limits checked before any arena is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaLimits {
    pub max_arena_elements: usize,
}

impl ArenaLimits {
    pub fn new(max_arena_elements: usize) -> Self {
        Self { max_arena_elements }
    }
}

impl Default for ArenaLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ARENA_ELEMENTS)
    }
}

/// Owns the seven mirrored arenas of a generated network and every transfer
/// between their host and device copies.
pub struct MemoryArenaManager<A: Accelerator> {
    accelerator: Arc<A>,
    layout: NetworkLayout,
    arenas: [MirroredBuffer<A::Buffer>; 7],
}

impl<A: Accelerator> MemoryArenaManager<A> {
    /// Allocates host and device storage for every arena of `layout`.
    ///
    /// All limits are checked before the first allocation, so a failure never
    /// leaves a partially allocated set behind.
    pub fn allocate(
        accelerator: Arc<A>,
        layout: &NetworkLayout,
        limits: &ArenaLimits,
    ) -> Result<Self, AllocationError> {
        for arena in ArenaKind::ALL {
            let requested = layout.arena_len(arena);
            if requested > limits.max_arena_elements {
                return Err(AllocationError::ArenaTooLarge {
                    arena,
                    requested,
                    limit: limits.max_arena_elements,
                });
            }
        }

        let allocate = |arena: ArenaKind| {
            MirroredBuffer::allocate(&*accelerator, arena, layout.arena_len(arena))
        };
        let arenas = [
            allocate(ArenaKind::Nodes)?,
            allocate(ArenaKind::Weights)?,
            allocate(ArenaKind::Biases)?,
            allocate(ArenaKind::NodeGradients)?,
            allocate(ArenaKind::WeightGradients)?,
            allocate(ArenaKind::BiasGradients)?,
            allocate(ArenaKind::Scratch)?,
        ];

        info!(
            "Allocated arenas on {}: {} nodes, {} weights, {} biases, {} scratch elements",
            accelerator.describe(),
            layout.arena_len(ArenaKind::Nodes),
            layout.arena_len(ArenaKind::Weights),
            layout.arena_len(ArenaKind::Biases),
            layout.arena_len(ArenaKind::Scratch),
        );

        Ok(Self {
            accelerator,
            layout: layout.clone(),
            arenas,
        })
    }

    pub fn accelerator(&self) -> &A {
        &self.accelerator
    }

    pub fn layout(&self) -> &NetworkLayout {
        &self.layout
    }

    /// Offset, length and segment shape of a layer's data in `arena`.
    pub fn view(&self, layer_index: usize, arena: ArenaKind) -> ArenaView {
        self.layout.view(layer_index, arena)
    }

    pub fn arena(&self, arena: ArenaKind) -> &MirroredBuffer<A::Buffer> {
        &self.arenas[arena.slot()]
    }

    pub fn state(&self, arena: ArenaKind) -> SyncState {
        self.arenas[arena.slot()].state()
    }

    pub fn host(&self, arena: ArenaKind) -> Result<&[f32], StateError> {
        self.arenas[arena.slot()].host()
    }

    pub fn host_mut(&mut self, arena: ArenaKind) -> Result<&mut [f32], StateError> {
        self.arenas[arena.slot()].host_mut()
    }

    /// The host mirror of one layer's region in `arena`.
    pub fn layer_host(&self, layer_index: usize, arena: ArenaKind) -> Result<&[f32], StateError> {
        let range = self.view(layer_index, arena).range();
        Ok(&self.host(arena)?[range])
    }

    /// Clears the node, weight and bias gradients.
    pub fn zero_gradients(&mut self) -> DeviceResult<()> {
        for arena in ArenaKind::GRADIENTS {
            self.zero(arena)?;
        }
        Ok(())
    }

    pub fn zero(&mut self, arena: ArenaKind) -> DeviceResult<()> {
        self.arenas[arena.slot()].zero(&*self.accelerator)
    }

    /// Downloads every arena the device has modified.
    pub fn sync_to_host(&mut self) -> DeviceResult<()> {
        for arena in ArenaKind::ALL {
            self.sync_arena_to_host(arena)?;
        }
        Ok(())
    }

    /// Uploads every arena with pending host edits.
    pub fn sync_to_device(&mut self) -> DeviceResult<()> {
        for arena in ArenaKind::ALL {
            self.sync_arena_to_device(arena)?;
        }
        Ok(())
    }

    pub fn sync_arena_to_host(&mut self, arena: ArenaKind) -> DeviceResult<()> {
        self.arenas[arena.slot()].sync_to_host(&*self.accelerator)
    }

    pub fn sync_arena_to_device(&mut self, arena: ArenaKind) -> DeviceResult<()> {
        self.arenas[arena.slot()].sync_to_device(&*self.accelerator)
    }

    /// Small device write (staged example, counter resets).
    pub fn write_device(
        &mut self,
        arena: ArenaKind,
        offset: usize,
        data: &[f32],
    ) -> DeviceResult<()> {
        self.arenas[arena.slot()].write_device(&*self.accelerator, offset, data)
    }

    /// Small device read (counters, outputs).
    pub fn read_device(
        &self,
        arena: ArenaKind,
        offset: usize,
        len: usize,
    ) -> DeviceResult<Vec<f32>> {
        self.arenas[arena.slot()].read_device(&*self.accelerator, offset, len)
    }

    /// Runs one kernel. Pending host edits are uploaded first; the arenas the
    /// kernel writes become device-dirty.
    pub fn launch(&mut self, launch: &KernelLaunch) -> DeviceResult<()> {
        for arena in ArenaKind::ALL {
            if self.state(arena) == SyncState::HostDirty {
                debug!(
                    "Uploading pending host edits to the {arena} arena before {:?}",
                    launch.kernel
                );
                self.sync_arena_to_device(arena)?;
            }
        }

        let buffers = BufferSet::new(self.arenas.each_mut().map(MirroredBuffer::device_mut));
        self.accelerator.launch(launch, buffers)?;
        for &arena in launch.kernel.writes() {
            self.arenas[arena.slot()].mark_device_dirty();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::CpuAccelerator;
    use crate::layer::LayerDescriptor;
    use crate::layer_graph::LayerGraph;

    fn small_layout() -> NetworkLayout {
        let mut graph = LayerGraph::new();
        graph.append(LayerDescriptor::input(4, 4)).unwrap();
        graph.append(LayerDescriptor::fully_connected(3)).unwrap();
        graph.plan().unwrap()
    }

    #[test]
    fn test_gradient_arenas_match_value_arenas() {
        let layout = small_layout();
        let manager = MemoryArenaManager::allocate(
            Arc::new(CpuAccelerator::single_threaded()),
            &layout,
            &ArenaLimits::default(),
        )
        .unwrap();
        assert_eq!(manager.arena(ArenaKind::Weights).len(), 48);
        assert_eq!(manager.arena(ArenaKind::WeightGradients).len(), 48);
        assert_eq!(manager.arena(ArenaKind::NodeGradients).len(), 19);
    }

    #[test]
    fn test_limit_is_checked_per_arena() {
        let layout = small_layout();
        let result = MemoryArenaManager::allocate(
            Arc::new(CpuAccelerator::single_threaded()),
            &layout,
            &ArenaLimits::new(40),
        );
        assert!(matches!(
            result,
            Err(AllocationError::ArenaTooLarge {
                arena: ArenaKind::Weights,
                requested: 48,
                limit: 40
            })
        ));
    }

    #[test]
    fn test_launch_marks_written_arenas_dirty() {
        let layout = small_layout();
        let mut manager = MemoryArenaManager::allocate(
            Arc::new(CpuAccelerator::single_threaded()),
            &layout,
            &ArenaLimits::default(),
        )
        .unwrap();
        let launch = crate::kernels::dispatch::load_input(&layout, crate::PixelOrder::ColumnMajor);
        manager.launch(&launch).unwrap();
        assert_eq!(manager.state(ArenaKind::Nodes), SyncState::DeviceDirty);
        assert_eq!(manager.state(ArenaKind::Weights), SyncState::Clean);
        assert!(manager.host(ArenaKind::Nodes).is_err());
    }
}
