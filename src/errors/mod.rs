//! Error types for the network engine.
//!
//! Each concern gets its own error enum, avoiding generic error wrappers like
//! `anyhow` or `Box<dyn Error>`. [`NetworkError`] gathers them for the
//! top-level operations of [`crate::Network`].

mod allocation_error;
mod config_error;
mod network_error;
mod state_error;
mod topology_error;

pub use allocation_error::{AllocationError, DeviceError};
pub use config_error::ConfigError;
pub use network_error::NetworkError;
pub use state_error::{ContractViolation, StateError};
pub use topology_error::TopologyError;

/// Result type alias for the top-level network operations.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Result type alias for layer graph finalization.
pub type TopologyResult<T> = std::result::Result<T, TopologyError>;

/// Result type alias for accelerator operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;
