use crate::accelerator::Accelerator;
use crate::errors::{AllocationError, DeviceError, DeviceResult, StateError};

use super::ArenaKind;

/// Which copy of a mirrored arena holds the latest data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Host and device agree.
    Clean,
    /// The host mirror was modified and the device has not seen it yet.
    HostDirty,
    /// A kernel or device write changed the device copy; the host mirror is stale.
    DeviceDirty,
}

/// One arena: a host `Vec<f32>` mirror and its device buffer.
#[derive(Debug)]
pub struct MirroredBuffer<B> {
    arena: ArenaKind,
    host: Vec<f32>,
    device: B,
    state: SyncState,
}

impl<B> MirroredBuffer<B> {
    /// Allocates `len` zeroed elements on both sides.
    pub fn allocate<A>(
        accelerator: &A,
        arena: ArenaKind,
        len: usize,
    ) -> Result<Self, AllocationError>
    where
        A: Accelerator<Buffer = B>,
    {
        let mut host = Vec::new();
        host.try_reserve_exact(len)
            .map_err(|_| AllocationError::HostOutOfMemory {
                arena,
                requested: len,
            })?;
        host.resize(len, 0.0);
        let device = accelerator.allocate(arena, len)?;
        Ok(Self {
            arena,
            host,
            device,
            state: SyncState::Clean,
        })
    }

    pub fn arena(&self) -> ArenaKind {
        self.arena
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// The host mirror. Fails while the device holds newer data.
    pub fn host(&self) -> Result<&[f32], StateError> {
        match self.state {
            SyncState::DeviceDirty => Err(StateError::StaleHostMirror { arena: self.arena }),
            _ => Ok(&self.host),
        }
    }

    /// Mutable host mirror; marks it as ahead of the device.
    pub fn host_mut(&mut self) -> Result<&mut [f32], StateError> {
        if self.state == SyncState::DeviceDirty {
            return Err(StateError::StaleHostMirror { arena: self.arena });
        }
        self.state = SyncState::HostDirty;
        Ok(&mut self.host)
    }

    pub(crate) fn device_mut(&mut self) -> &mut B {
        &mut self.device
    }

    pub(crate) fn mark_device_dirty(&mut self) {
        self.state = SyncState::DeviceDirty;
    }

    /// Uploads host edits, if any.
    pub fn sync_to_device<A>(&mut self, accelerator: &A) -> DeviceResult<()>
    where
        A: Accelerator<Buffer = B>,
    {
        if self.state == SyncState::HostDirty {
            accelerator.upload(&mut self.device, 0, &self.host)?;
            self.state = SyncState::Clean;
        }
        Ok(())
    }

    /// Downloads kernel results, if any.
    pub fn sync_to_host<A>(&mut self, accelerator: &A) -> DeviceResult<()>
    where
        A: Accelerator<Buffer = B>,
    {
        if self.state == SyncState::DeviceDirty {
            accelerator.download(&self.device, 0, &mut self.host)?;
            self.state = SyncState::Clean;
        }
        Ok(())
    }

    /// Writes `data` to the device at `offset`, leaving the host mirror stale.
    pub fn write_device<A>(
        &mut self,
        accelerator: &A,
        offset: usize,
        data: &[f32],
    ) -> DeviceResult<()>
    where
        A: Accelerator<Buffer = B>,
    {
        self.check_range(offset, data.len())?;
        self.sync_to_device(accelerator)?;
        accelerator.upload(&mut self.device, offset, data)?;
        self.state = SyncState::DeviceDirty;
        Ok(())
    }

    /// Reads `len` elements from the device at `offset` without touching the mirror.
    pub fn read_device<A>(
        &self,
        accelerator: &A,
        offset: usize,
        len: usize,
    ) -> DeviceResult<Vec<f32>>
    where
        A: Accelerator<Buffer = B>,
    {
        self.check_range(offset, len)?;
        let mut out = vec![0.0; len];
        accelerator.download(&self.device, offset, &mut out)?;
        Ok(out)
    }

    /// Zeroes both copies, discarding pending edits on either side.
    pub fn zero<A>(&mut self, accelerator: &A) -> DeviceResult<()>
    where
        A: Accelerator<Buffer = B>,
    {
        accelerator.zero(&mut self.device)?;
        self.host.fill(0.0);
        self.state = SyncState::Clean;
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> DeviceResult<()> {
        if offset + len > self.host.len() {
            return Err(DeviceError::RangeOutOfBounds {
                arena: self.arena,
                offset,
                end: offset + len,
                len: self.host.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::CpuAccelerator;

    #[test]
    fn test_stale_mirror_is_rejected_until_synced() {
        let cpu = CpuAccelerator::single_threaded();
        let mut buffer = MirroredBuffer::allocate(&cpu, ArenaKind::Nodes, 4).unwrap();
        buffer.write_device(&cpu, 1, &[2.0, 3.0]).unwrap();

        assert_eq!(buffer.state(), SyncState::DeviceDirty);
        assert_eq!(
            buffer.host(),
            Err(StateError::StaleHostMirror {
                arena: ArenaKind::Nodes
            })
        );
        assert!(buffer.host_mut().is_err());

        buffer.sync_to_host(&cpu).unwrap();
        assert_eq!(buffer.host().unwrap(), &[0.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_host_edits_reach_the_device() {
        let cpu = CpuAccelerator::single_threaded();
        let mut buffer = MirroredBuffer::allocate(&cpu, ArenaKind::Weights, 3).unwrap();
        buffer.host_mut().unwrap().copy_from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(buffer.state(), SyncState::HostDirty);

        buffer.sync_to_device(&cpu).unwrap();
        assert_eq!(buffer.state(), SyncState::Clean);
        assert_eq!(buffer.read_device(&cpu, 1, 2).unwrap(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_zero_leaves_both_sides_clean() {
        let cpu = CpuAccelerator::single_threaded();
        let mut buffer = MirroredBuffer::allocate(&cpu, ArenaKind::BiasGradients, 2).unwrap();
        buffer.write_device(&cpu, 0, &[5.0, 5.0]).unwrap();
        buffer.zero(&cpu).unwrap();
        assert_eq!(buffer.host().unwrap(), &[0.0, 0.0]);
        assert_eq!(buffer.read_device(&cpu, 0, 2).unwrap(), vec![0.0, 0.0]);
    }
}
