//! Backward kernels.
//!
//! Each layer reads the node gradient `g` of its own output and the
//! activations `a` stored by the forward pass. Input gradients are written
//! (overwriting whatever the previous example left); parameter gradients are
//! returned as contributions the accelerator adds to the accumulated value.
//!
//! Node gradients share the node arena's layout, so `in_offset`/`out_offset`
//! address both the activations and their gradients.

use crate::activation::sigmoid_derivative_from_output;

use super::{ArenaReads, KernelParams};

/// `g * a * (1 - a)` for node `index` of the node and gradient arenas.
fn sigmoid_delta(arenas: &ArenaReads<'_>, index: usize) -> f32 {
    let a = arenas.nodes()[index];
    arenas.node_gradients()[index] * sigmoid_derivative_from_output(a)
}

/// Gradient of input node `unit`: `sum_j W(j, unit) * delta_j`.
pub fn fully_connected_input(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    let weights = arenas.weights();
    let size = p.out_x as usize;
    let row = p.weight_offset as usize + unit * size;
    let out = p.out_offset as usize;
    (0..size)
        .map(|j| weights[row + j] * sigmoid_delta(arenas, out + j))
        .sum()
}

/// Contribution to weight element `unit` (`W(j, i)` at `i * size + j`): `delta_j * x_i`.
pub fn fully_connected_weights(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    let size = p.out_x as usize;
    let (i, j) = (unit / size, unit % size);
    sigmoid_delta(arenas, p.out_offset as usize + j) * arenas.nodes()[p.in_offset as usize + i]
}

pub fn fully_connected_bias(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    sigmoid_delta(arenas, p.out_offset as usize + unit)
}

/// Gradient of input element `unit` (map `c`, position `(ix, iy)`).
///
/// Full correlation of the deltas with the flipped kernels: every output
/// `(x, y)` whose window covers the position contributes `delta * w(u, v)`
/// with `u = ix - x * x_step`, `v = iy - y * y_step`.
pub fn convolution_input(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    let weights = arenas.weights();
    let (in_x, in_y, in_maps) = (p.in_x as usize, p.in_y as usize, p.in_maps as usize);
    let (out_x, out_y, out_maps) = (p.out_x as usize, p.out_y as usize, p.out_maps as usize);
    let (rx, ry) = (p.x_receptive as usize, p.y_receptive as usize);
    let (sx, sy) = (p.x_step as usize, p.y_step as usize);

    let c = unit / (in_x * in_y);
    let local = unit % (in_x * in_y);
    let (ix, iy) = (local % in_x, local / in_x);

    let mut sum = 0.0;
    for m in 0..out_maps {
        let kernel = p.weight_offset as usize + (m * in_maps + c) * rx * ry;
        let deltas = p.out_offset as usize + m * out_x * out_y;
        for v in 0..ry.min(iy + 1) {
            let dy = iy - v;
            if dy % sy != 0 || dy / sy >= out_y {
                continue;
            }
            for u in 0..rx.min(ix + 1) {
                let dx = ix - u;
                if dx % sx != 0 || dx / sx >= out_x {
                    continue;
                }
                let output = deltas + (dy / sy) * out_x + dx / sx;
                sum += weights[kernel + v * rx + u] * sigmoid_delta(arenas, output);
            }
        }
    }
    sum
}

/// Contribution to kernel element `unit`: correlation of the map's deltas with its input map.
pub fn convolution_weights(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    let nodes = arenas.nodes();
    let (in_x, in_y, in_maps) = (p.in_x as usize, p.in_y as usize, p.in_maps as usize);
    let (out_x, out_y) = (p.out_x as usize, p.out_y as usize);
    let (rx, ry) = (p.x_receptive as usize, p.y_receptive as usize);
    let (sx, sy) = (p.x_step as usize, p.y_step as usize);

    let kernel = unit / (rx * ry);
    let (m, c) = (kernel / in_maps, kernel % in_maps);
    let local = unit % (rx * ry);
    let (u, v) = (local % rx, local / rx);

    let input = p.in_offset as usize + c * in_x * in_y;
    let deltas = p.out_offset as usize + m * out_x * out_y;
    let mut sum = 0.0;
    for y in 0..out_y {
        for x in 0..out_x {
            let source = input + (y * sy + v) * in_x + x * sx + u;
            sum += sigmoid_delta(arenas, deltas + y * out_x + x) * nodes[source];
        }
    }
    sum
}

/// Contribution to the bias of map `unit`: the sum of its deltas.
pub fn convolution_bias(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    let map_len = (p.out_x * p.out_y) as usize;
    let deltas = p.out_offset as usize + unit * map_len;
    (0..map_len).map(|k| sigmoid_delta(arenas, deltas + k)).sum()
}

/// Gradient of input element `unit`: the gradients of every window whose
/// recorded arg-max is this element. Overlapping windows add up.
pub fn max_pooling(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    let gradients = arenas.node_gradients();
    let records = arenas.scratch();
    let (in_x, in_y) = (p.in_x as usize, p.in_y as usize);
    let (out_x, out_y) = (p.out_x as usize, p.out_y as usize);
    let (rx, ry) = (p.x_receptive as usize, p.y_receptive as usize);
    let (sx, sy) = (p.x_step as usize, p.y_step as usize);

    let map = unit / (in_x * in_y);
    let local = unit % (in_x * in_y);
    let (ix, iy) = (local % in_x, local / in_x);

    let first_x = (ix + 1).saturating_sub(rx).div_ceil(sx);
    let first_y = (iy + 1).saturating_sub(ry).div_ceil(sy);
    let last_x = (ix / sx).min(out_x - 1);
    let last_y = (iy / sy).min(out_y - 1);

    let outputs = map * out_x * out_y;
    let mut sum = 0.0;
    for y in first_y..=last_y {
        for x in first_x..=last_x {
            let output = outputs + y * out_x + x;
            if records[p.scratch_offset as usize + output] as usize == local {
                sum += gradients[p.out_offset as usize + output];
            }
        }
    }
    sum
}

/// `g_in = g_out * mask` with the mask stored by the training forward pass.
pub fn dropout(p: &KernelParams, arenas: &ArenaReads<'_>, unit: usize) -> f32 {
    arenas.node_gradients()[p.out_offset as usize + unit]
        * arenas.scratch()[p.scratch_offset as usize + unit]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_pooling_routes_only_to_recorded_position() {
        // 4x4 input, 2x2 windows, one map. Output gradients 1..4, records pick
        // a different corner in each window.
        let gradients = [0.0; 16]
            .into_iter()
            .chain([1.0, 2.0, 3.0, 4.0])
            .collect::<Vec<f32>>();
        let records = [0.0, 7.0, 12.0, 15.0];
        let params = KernelParams {
            count: 16,
            in_offset: 0,
            out_offset: 16,
            in_x: 4,
            in_y: 4,
            out_x: 2,
            out_y: 2,
            x_receptive: 2,
            y_receptive: 2,
            x_step: 2,
            y_step: 2,
            ..Default::default()
        };
        let arenas = ArenaReads::new([&[], &[], &[], &gradients, &[], &[], &records]);
        let routed: Vec<f32> = (0..16).map(|i| max_pooling(&params, &arenas, i)).collect();

        let mut expected = vec![0.0; 16];
        expected[0] = 1.0;
        expected[7] = 2.0;
        expected[12] = 3.0;
        expected[15] = 4.0;
        assert_eq!(routed, expected);
    }

    #[test]
    fn test_overlapping_windows_sum_into_shared_maximum() {
        // 3x1 input, 2x1 windows at step 1: both windows pick the middle element.
        let gradients = [0.0, 0.0, 0.0, 0.25, 0.5];
        let records = [1.0, 1.0];
        let params = KernelParams {
            count: 3,
            out_offset: 3,
            in_x: 3,
            in_y: 1,
            out_x: 2,
            out_y: 1,
            x_receptive: 2,
            y_receptive: 1,
            x_step: 1,
            y_step: 1,
            ..Default::default()
        };
        let arenas = ArenaReads::new([&[], &[], &[], &gradients, &[], &[], &records]);
        let routed: Vec<f32> = (0..3).map(|i| max_pooling(&params, &arenas, i)).collect();
        assert_eq!(routed, vec![0.0, 0.75, 0.0]);
    }

    #[test]
    fn test_fully_connected_input_is_transposed_product() {
        // 2 inputs, 2 outputs, activations 0.5 so the sigmoid derivative is 0.25.
        let nodes = [0.0, 0.0, 0.5, 0.5];
        let gradients = [0.0, 0.0, 1.0, 2.0];
        // W(j, i) at i * 2 + j: W = [[1, 2], [3, 4]]
        let weights = [1.0, 3.0, 2.0, 4.0];
        let params = KernelParams {
            count: 2,
            out_offset: 2,
            in_x: 2,
            out_x: 2,
            ..Default::default()
        };
        let arenas = ArenaReads::new([&nodes, &weights, &[], &gradients, &[], &[], &[]]);
        let delta = [0.25, 0.5];
        assert_eq!(fully_connected_input(&params, &arenas, 0), 1.0 * delta[0] + 3.0 * delta[1]);
        assert_eq!(fully_connected_input(&params, &arenas, 1), 2.0 * delta[0] + 4.0 * delta[1]);
    }
}
