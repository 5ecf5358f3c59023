//! Forward kernels, one unit per output node.
//!
//! Node segments are column-major: element `(x, y)` of map `m` in a layer
//! with `x_size x y_size` maps sits at `m * x_size * y_size + y * x_size + x`
//! past the layer's node offset.

use crate::activation::sigmoid;

use super::{ArenaReads, FLAG_TRANSPOSE_INPUT, KernelParams};

/// Copies the staged picture from scratch into the input layer's nodes.
///
/// Uses `in_offset` (scratch), `out_offset`, `in_x` (rows), `in_y` (cols) and
/// [`FLAG_TRANSPOSE_INPUT`] for row-major pictures.
pub fn load_input(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    let rows = p.in_x as usize;
    let cols = p.in_y as usize;
    let source = if p.has_flag(FLAG_TRANSPOSE_INPUT) {
        let (x, y) = (unit % rows, unit / rows);
        x * cols + y
    } else {
        unit
    };
    arenas.scratch()[p.in_offset as usize + source]
}

/// Valid, strided correlation summed over all input maps, plus bias, then sigmoid.
///
/// Kernel `(m, c)` of a layer with `in_maps` inputs is the segment
/// `m * in_maps + c` of the layer's weights, each `x_receptive x y_receptive`.
pub fn convolution(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    let nodes = arenas.nodes();
    let weights = arenas.weights();
    let (in_x, in_y, in_maps) = (p.in_x as usize, p.in_y as usize, p.in_maps as usize);
    let (out_x, out_y) = (p.out_x as usize, p.out_y as usize);
    let (rx, ry) = (p.x_receptive as usize, p.y_receptive as usize);
    let (sx, sy) = (p.x_step as usize, p.y_step as usize);

    let map = unit / (out_x * out_y);
    let local = unit % (out_x * out_y);
    let (x, y) = (local % out_x, local / out_x);

    let mut sum = arenas.biases()[p.bias_offset as usize + map];
    for c in 0..in_maps {
        let input = p.in_offset as usize + c * in_x * in_y;
        let kernel = p.weight_offset as usize + (map * in_maps + c) * rx * ry;
        for v in 0..ry {
            let row = input + (y * sy + v) * in_x + x * sx;
            for u in 0..rx {
                sum += weights[kernel + v * rx + u] * nodes[row + u];
            }
        }
    }
    sigmoid(sum)
}

/// Window maximum and the input-local index (`y * in_x + x`) it came from.
///
/// Ties keep the first maximum in column-major scan order.
pub fn max_pooling(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> (f32, f32) {
    let nodes = arenas.nodes();
    let (in_x, in_y) = (p.in_x as usize, p.in_y as usize);
    let (out_x, out_y) = (p.out_x as usize, p.out_y as usize);
    let (rx, ry) = (p.x_receptive as usize, p.y_receptive as usize);
    let (sx, sy) = (p.x_step as usize, p.y_step as usize);

    let map = unit / (out_x * out_y);
    let local = unit % (out_x * out_y);
    let (x, y) = (local % out_x, local / out_x);
    let input = p.in_offset as usize + map * in_x * in_y;

    // Seeded with the window's first element so the record never leaves the window.
    let mut best_index = y * sy * in_x + x * sx;
    let mut best = nodes[input + best_index];
    for v in 0..ry {
        for u in 0..rx {
            let index = (y * sy + v) * in_x + x * sx + u;
            let value = nodes[input + index];
            if value > best {
                best = value;
                best_index = index;
            }
        }
    }
    (best, best_index as f32)
}

/// `sigmoid(W x + b)` for output node `unit`, with `W` stored `[size x inputs]` column-major.
///
/// Uses `in_x` as the input count and `out_x` as the layer size.
pub fn fully_connected(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    let nodes = arenas.nodes();
    let weights = arenas.weights();
    let inputs = p.in_x as usize;
    let size = p.out_x as usize;

    let mut sum = arenas.biases()[p.bias_offset as usize + unit];
    let input = p.in_offset as usize;
    let column = p.weight_offset as usize + unit;
    for i in 0..inputs {
        sum += weights[column + i * size] * nodes[input + i];
    }
    sigmoid(sum)
}

/// Inverted dropout: the output value and the mask (`0` or `1 / (1 - p)`).
pub fn dropout(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> (f32, f32) {
    let mask = dropout_mask(p.seed, unit as u32, p.scalar);
    (arenas.nodes()[p.in_offset as usize + unit] * mask, mask)
}

/// Inference-mode dropout is the identity.
pub fn dropout_pass_through(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    arenas.nodes()[p.in_offset as usize + unit]
}

/// PCG-RXS-M-XS output permutation, shared bit-for-bit with `common.wgsl`.
pub fn pcg_hash(input: u32) -> u32 {
    let state = input.wrapping_mul(747796405).wrapping_add(2891336453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277803737);
    (word >> 22) ^ word
}

/// Uniform draw in `[0, 1)` for unit `index` under `seed`.
pub fn uniform(seed: u32, index: u32) -> f32 {
    let hash = pcg_hash(index ^ pcg_hash(seed));
    (hash >> 8) as f32 / 16_777_216.0
}

/// Mask value of unit `index`: kept units are scaled so the expected output is unchanged.
pub fn dropout_mask(seed: u32, index: u32, drop_probability: f32) -> f32 {
    if uniform(seed, index) >= drop_probability {
        1.0 / (1.0 - drop_probability)
    } else {
        0.0
    }
}
