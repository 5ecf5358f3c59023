//! Analytic gradients against central differences of the cost.

use arena_cnn::{ArenaKind, CpuAccelerator, LayerDescriptor, Network, TrainingConfig};

const EPSILON: f32 = 5e-3;
const TOLERANCE: f32 = 1e-3;

fn build(layers: Vec<LayerDescriptor>, seed: u64) -> Network<CpuAccelerator> {
    let mut network = Network::with_config(
        CpuAccelerator::single_threaded(),
        TrainingConfig::default().with_seed(seed),
    );
    for layer in layers {
        network.add_layer(layer).unwrap();
    }
    network.generate_network().unwrap();
    network
}

fn small_convnet(seed: u64) -> Network<CpuAccelerator> {
    build(
        vec![
            LayerDescriptor::input(4, 4),
            LayerDescriptor::convolution(3, 3, 2),
            LayerDescriptor::fully_connected(2),
        ],
        seed,
    )
}

fn picture(pixels: usize) -> Vec<f32> {
    (0..pixels).map(|i| ((i * 7) % 11) as f32 / 10.0).collect()
}

/// Central difference of the cost with respect to element `index` of `arena`.
fn numeric_gradient(
    network: &mut Network<CpuAccelerator>,
    arena: ArenaKind,
    index: usize,
    picture: &[f32],
    label: &[f32],
) -> f32 {
    let original = network.arenas().unwrap().host(arena).unwrap()[index];

    network.arenas_mut().unwrap().host_mut(arena).unwrap()[index] = original + EPSILON;
    let plus = network.evaluate_cost(picture, label).unwrap();
    network.arenas_mut().unwrap().host_mut(arena).unwrap()[index] = original - EPSILON;
    let minus = network.evaluate_cost(picture, label).unwrap();
    network.arenas_mut().unwrap().host_mut(arena).unwrap()[index] = original;

    (plus - minus) / (2.0 * EPSILON)
}

/// Compares every weight and bias gradient of one example with central differences.
fn check_gradients(network: &mut Network<CpuAccelerator>, picture: &[f32], label: &[f32]) {
    network.accumulate_gradients(picture, label).unwrap();
    network.sync_to_host().unwrap();
    let arenas = network.arenas().unwrap();
    let weight_gradients = arenas.host(ArenaKind::WeightGradients).unwrap().to_vec();
    let bias_gradients = arenas.host(ArenaKind::BiasGradients).unwrap().to_vec();

    for (arena, analytic) in [
        (ArenaKind::Weights, &weight_gradients),
        (ArenaKind::Biases, &bias_gradients),
    ] {
        for (index, &expected) in analytic.iter().enumerate() {
            let numeric = numeric_gradient(network, arena, index, picture, label);
            assert!(
                (numeric - expected).abs() < TOLERANCE,
                "{arena}[{index}]: analytic {expected}, numeric {numeric}"
            );
        }
    }
}

#[test]
fn test_conv_fc_gradients_match_central_differences() {
    let mut network = small_convnet(11);
    check_gradients(&mut network, &picture(16), &[1.0, 0.0]);

    // 2 kernels of 3x3 and a 2 x 8 matrix; 2 + 2 biases.
    let arenas = network.arenas().unwrap();
    assert_eq!(arenas.host(ArenaKind::WeightGradients).unwrap().len(), 18 + 16);
    assert_eq!(arenas.host(ArenaKind::BiasGradients).unwrap().len(), 4);
}

#[test]
fn test_gradients_hold_for_other_label_and_seed() {
    let mut network = small_convnet(42);
    check_gradients(&mut network, &picture(16), &[0.0, 1.0]);
}

#[test]
fn test_gradients_through_pooling_and_strided_convolution() {
    // 9x9 -> 8x8x2 -> 4x4x2 -> 2x2x3 -> 2. The second convolution has two
    // input maps and routes its input gradient back through the pooling layer.
    let mut network = build(
        vec![
            LayerDescriptor::input(9, 9),
            LayerDescriptor::convolution(2, 2, 2),
            LayerDescriptor::max_pooling(2, 2, 2),
            LayerDescriptor::convolution_strided(2, 2, 3, 2),
            LayerDescriptor::fully_connected(2),
        ],
        17,
    );
    check_gradients(&mut network, &picture(81), &[0.0, 1.0]);
}

#[test]
fn test_gradients_through_overlapping_pooling() {
    // 6x6 -> 4x4x2 -> 3x3 windows at step 1 -> 2x2x2 -> 2.
    let mut network = build(
        vec![
            LayerDescriptor::input(6, 6),
            LayerDescriptor::convolution(3, 3, 2),
            LayerDescriptor::max_pooling_strided(3, 3, 2, 1),
            LayerDescriptor::fully_connected(2),
        ],
        23,
    );
    check_gradients(&mut network, &picture(36), &[1.0, 0.0]);
}

#[test]
fn test_gradients_through_non_square_convolutions() {
    let mut network = build(
        vec![
            LayerDescriptor::input(6, 5),
            LayerDescriptor::convolution(3, 2, 2),
            LayerDescriptor::convolution(2, 3, 2),
            LayerDescriptor::fully_connected(3),
        ],
        29,
    );
    check_gradients(&mut network, &picture(30), &[0.0, 0.0, 1.0]);
}

#[test]
fn test_gradients_through_dropout_that_keeps_everything() {
    let mut network = build(
        vec![
            LayerDescriptor::input(4, 4),
            LayerDescriptor::fully_connected(6),
            LayerDescriptor::dropout(0.0),
            LayerDescriptor::fully_connected(2),
        ],
        31,
    );
    check_gradients(&mut network, &picture(16), &[1.0, 0.0]);
}

#[test]
fn test_gradients_accumulate_across_examples() {
    let mut network = small_convnet(5);
    let picture = picture(16);
    let label = [1.0, 0.0];

    network.accumulate_gradients(&picture, &label).unwrap();
    network.sync_to_host().unwrap();
    let once = network
        .arenas()
        .unwrap()
        .host(ArenaKind::WeightGradients)
        .unwrap()
        .to_vec();

    network.accumulate_gradients(&picture, &label).unwrap();
    network.sync_to_host().unwrap();
    let twice = network.arenas().unwrap().host(ArenaKind::WeightGradients).unwrap();
    for (a, b) in once.iter().zip(twice) {
        assert!((2.0 * a - b).abs() < 1e-6);
    }

    network.apply_gradients(2).unwrap();
    network.sync_to_host().unwrap();
    let arenas = network.arenas().unwrap();
    assert!(arenas.host(ArenaKind::WeightGradients).unwrap().iter().all(|&g| g == 0.0));
}
