use thiserror::Error;

use super::{
    AllocationError, ConfigError, ContractViolation, DeviceError, StateError, TopologyError,
};

/// Any failure surfaced by a [`crate::Network`] operation.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Contract(#[from] ContractViolation),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
