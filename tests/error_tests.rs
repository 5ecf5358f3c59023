//! Tests for the error types of the network engine.
//!
//! Covers the errors the engine actually raises and their messages.

use std::error::Error;

use arena_cnn::errors::{
    AllocationError, ConfigError, ContractViolation, DeviceError, NetworkError, StateError,
    TopologyError,
};
use arena_cnn::{ArenaKind, CpuAccelerator, LayerDescriptor, Network, TrainingConfig};

#[cfg(test)]
mod network_error_tests {
    use super::*;

    #[test]
    fn test_arena_limit_is_reported_per_arena() {
        let mut network = Network::with_config(
            CpuAccelerator::single_threaded(),
            TrainingConfig::default().with_max_arena_elements(1000),
        );
        network.add_layer(LayerDescriptor::input(10, 10)).unwrap();
        network.add_layer(LayerDescriptor::fully_connected(20)).unwrap();

        let result = network.generate_network();
        assert!(matches!(
            result,
            Err(NetworkError::Allocation(AllocationError::ArenaTooLarge {
                arena: ArenaKind::Weights,
                requested: 2000,
                limit: 1000
            }))
        ));
    }

    #[test]
    fn test_invalid_config_blocks_generation() {
        let mut network = Network::with_config(
            CpuAccelerator::single_threaded(),
            TrainingConfig::default().with_learning_rate(0.0),
        );
        network.add_layer(LayerDescriptor::input(2, 2)).unwrap();
        network.add_layer(LayerDescriptor::fully_connected(2)).unwrap();
        assert!(matches!(
            network.generate_network(),
            Err(NetworkError::Config(ConfigError::Invalid {
                field: "learning_rate",
                ..
            }))
        ));
        assert!(!network.is_generated());
    }

    #[test]
    fn test_pooling_map_count_must_match() {
        let mut network = Network::new(CpuAccelerator::single_threaded());
        network.add_layer(LayerDescriptor::input(8, 8)).unwrap();
        network.add_layer(LayerDescriptor::convolution(3, 3, 4)).unwrap();
        network.add_layer(LayerDescriptor::max_pooling(2, 2, 3)).unwrap();
        assert!(matches!(
            network.generate_network(),
            Err(NetworkError::Topology(TopologyError::FeatureMapMismatch {
                index: 2,
                declared: 3,
                actual: 4
            }))
        ));
    }

    #[test]
    fn test_output_before_generation() {
        let network = Network::new(CpuAccelerator::single_threaded());
        assert!(matches!(
            network.output(),
            Err(NetworkError::State(StateError::NotGenerated))
        ));
    }
}

#[cfg(test)]
mod error_display_tests {
    use super::*;

    #[test]
    fn test_basic_error_displays() {
        assert_eq!(
            TopologyError::EmptyNetwork.to_string(),
            "At least one layer is required"
        );
        assert_eq!(
            StateError::NotGenerated.to_string(),
            "The network has not been generated yet"
        );
        assert_eq!(
            StateError::InvalidBatchSize.to_string(),
            "The batch size must be greater than 0"
        );
        assert_eq!(
            StateError::Poisoned.to_string(),
            "The network was poisoned by an earlier contract violation"
        );
    }

    #[test]
    fn test_complex_error_displays() {
        let error = AllocationError::ArenaTooLarge {
            arena: ArenaKind::NodeGradients,
            requested: 20,
            limit: 10,
        };
        assert_eq!(
            error.to_string(),
            "The node gradients arena needs 20 elements, exceeding the limit of 10"
        );

        let error = StateError::StaleHostMirror {
            arena: ArenaKind::Scratch,
        };
        assert_eq!(
            error.to_string(),
            "The host mirror of the scratch arena is stale, sync it from the device first"
        );

        let error = TopologyError::UnevenStride {
            index: 1,
            kind: "convolution",
            x_step: 2,
            y_step: 2,
            x_receptive: 3,
            y_receptive: 3,
            x_size: 6,
            y_size: 6,
        };
        assert_eq!(
            error.to_string(),
            "Layer 1 (convolution): step 2x2 does not tile the 6x6 input with a 3x3 field"
        );

        let error = DeviceError::RangeOutOfBounds {
            arena: ArenaKind::Biases,
            offset: 3,
            end: 5,
            len: 4,
        };
        assert_eq!(
            error.to_string(),
            "Device range 3..5 is outside the 4 element biases buffer"
        );
    }

    #[test]
    fn test_network_error_is_transparent() {
        let error: NetworkError = ContractViolation::MissingDropoutMask { layer: 4 }.into();
        assert_eq!(
            error.to_string(),
            "Dropout layer 4 has no mask recorded by a training forward pass"
        );

        let error: NetworkError = StateError::MissingPictures { role: "test" }.into();
        assert_eq!(error.to_string(), "No test pictures are attached to the network");
    }

    #[test]
    fn test_config_errors_keep_their_source() {
        let source = serde_json::from_str::<TrainingConfig>("{").unwrap_err();
        let error = ConfigError::Parse {
            path: "training.json".to_string(),
            source,
        };
        assert!(
            error
                .to_string()
                .starts_with("Failed to parse configuration file 'training.json'")
        );
        assert!(error.source().is_some());
    }
}
