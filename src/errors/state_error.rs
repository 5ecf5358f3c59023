//! Errors for operations invoked out of order and for broken kernel contracts.

use thiserror::Error;

use crate::arena::ArenaKind;

/// An operation was invoked in a state that does not allow it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("The layer graph is finalized, no more layers can be appended")]
    GraphFinalized,

    #[error("The network has not been generated yet")]
    NotGenerated,

    #[error("The network has already been generated")]
    AlreadyGenerated,

    #[error("No {role} pictures are attached to the network")]
    MissingPictures { role: &'static str },

    #[error(
        "The {role} pictures provide {rows}x{cols} images with {classes} classes, the network expects {expected_rows}x{expected_cols} with {expected_classes}"
    )]
    PictureShapeMismatch {
        role: &'static str,
        rows: usize,
        cols: usize,
        classes: usize,
        expected_rows: usize,
        expected_cols: usize,
        expected_classes: usize,
    },

    #[error("The batch size must be greater than 0")]
    InvalidBatchSize,

    #[error("Pictures need at least one class")]
    NoClasses,

    #[error("Picture or label buffer has {actual} values, expected {expected}")]
    ExampleSizeMismatch { expected: usize, actual: usize },

    #[error("The host mirror of the {arena} arena is stale, sync it from the device first")]
    StaleHostMirror { arena: ArenaKind },

    #[error("No forward pass has been run for the current example")]
    NoForwardPass,

    #[error("The network was poisoned by an earlier contract violation")]
    Poisoned,
}

/// A kernel was asked to run without the forward-pass state it depends on.
///
/// Continuing after one of these would silently corrupt the gradients, so the
/// network refuses every further operation once one is raised.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractViolation {
    #[error("Backward pass requested for layer {layer} without a matching forward pass")]
    MissingForwardPass { layer: usize },

    #[error("Dropout layer {layer} has no mask recorded by a training forward pass")]
    MissingDropoutMask { layer: usize },

    #[error("Max pooling layer {layer} has no arg-max record from a forward pass")]
    MissingPoolingRecord { layer: usize },
}
