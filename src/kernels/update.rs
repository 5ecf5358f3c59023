//! Plain gradient descent: `param -= scalar * gradient`, one unit per parameter.
//!
//! `scalar` is `learning_rate / batch_size`; `count` covers the whole arena.

use super::{ArenaReads, KernelParams};

pub fn gradient_descent_weights(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    arenas.weights()[unit] - p.scalar * arenas.weight_gradients()[unit]
}

pub fn gradient_descent_biases(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    arenas.biases()[unit] - p.scalar * arenas.bias_gradients()[unit]
}
