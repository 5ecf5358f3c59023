//! Errors raised while finalizing a layer graph.

use thiserror::Error;

/// The layer sequence cannot be turned into a network layout.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("At least one layer is required")]
    EmptyNetwork,

    #[error("The first layer must be an input layer, found {found}")]
    MissingInputLayer { found: &'static str },

    #[error("The input layer is only allowed at position 0, found one at index {index}")]
    MisplacedInputLayer { index: usize },

    #[error("Layer {index} ({kind}): {field} must be greater than 0")]
    ZeroDimension {
        index: usize,
        kind: &'static str,
        field: &'static str,
    },

    #[error(
        "Layer {index} ({kind}): receptive field {x_receptive}x{y_receptive} does not fit the {x_size}x{y_size} input"
    )]
    ReceptiveFieldTooLarge {
        index: usize,
        kind: &'static str,
        x_receptive: usize,
        y_receptive: usize,
        x_size: usize,
        y_size: usize,
    },

    #[error(
        "Layer {index} ({kind}): step {x_step}x{y_step} does not tile the {x_size}x{y_size} input with a {x_receptive}x{y_receptive} field"
    )]
    UnevenStride {
        index: usize,
        kind: &'static str,
        x_step: usize,
        y_step: usize,
        x_receptive: usize,
        y_receptive: usize,
        x_size: usize,
        y_size: usize,
    },

    #[error(
        "Layer {index} (max pooling) declares {declared} feature maps but its predecessor produces {actual}"
    )]
    FeatureMapMismatch {
        index: usize,
        declared: usize,
        actual: usize,
    },

    #[error("Layer {index} (dropout): drop probability {probability} must lie in [0, 1)")]
    InvalidDropProbability { index: usize, probability: f32 },

    #[error(
        "Layer {index} ({kind}) expects {expected} input nodes but its predecessor produces {actual}"
    )]
    InputSizeMismatch {
        index: usize,
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
}
