//! Memory and accelerator errors.

use thiserror::Error;

use crate::arena::ArenaKind;

/// Arena storage could not be allocated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocationError {
    #[error("The {arena} arena needs {requested} elements, exceeding the limit of {limit}")]
    ArenaTooLarge {
        arena: ArenaKind,
        requested: usize,
        limit: usize,
    },

    #[error("Host memory exhausted while allocating {requested} elements for the {arena} arena")]
    HostOutOfMemory { arena: ArenaKind, requested: usize },

    #[error("Device memory exhausted while allocating {requested} elements for the {arena} arena: {message}")]
    DeviceOutOfMemory {
        arena: ArenaKind,
        requested: usize,
        message: String,
    },
}

/// Errors specific to talking to the accelerator device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("GPU device not available: {message}")]
    DeviceNotAvailable { message: String },

    #[error("Shader compilation failed: {message}")]
    ShaderCompilationFailed { message: String },

    #[error("Buffer mapping failed: {message}")]
    BufferMapFailed { message: String },

    #[error("A worker thread panicked while running the {kernel} kernel")]
    WorkerPanicked { kernel: &'static str },

    #[error("Device range {offset}..{end} is outside the {len} element {arena} buffer")]
    RangeOutOfBounds {
        arena: ArenaKind,
        offset: usize,
        end: usize,
        len: usize,
    },
}
