//! GPU kernels compared with the CPU reference kernels.
//!
//! Every test returns early when no wgpu adapter is available.

use arena_cnn::{
    Accelerator, ArenaKind, CpuAccelerator, GpuAccelerator, LayerDescriptor, Network, PassMode,
    TrainingConfig,
};

const TOLERANCE: f32 = 1e-4;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn gpu() -> Option<GpuAccelerator> {
    match GpuAccelerator::new() {
        Ok(gpu) => Some(gpu),
        Err(e) => {
            eprintln!("Skipping GPU test: {e}");
            None
        }
    }
}

fn layers() -> Vec<LayerDescriptor> {
    vec![
        LayerDescriptor::input(12, 12),
        LayerDescriptor::convolution(3, 3, 4),
        LayerDescriptor::max_pooling(2, 2, 4),
        LayerDescriptor::convolution_strided(3, 3, 3, 2),
        LayerDescriptor::fully_connected(8),
        LayerDescriptor::dropout(0.3),
        LayerDescriptor::fully_connected(3),
    ]
}

fn build<A: Accelerator>(accelerator: A) -> Network<A> {
    let mut network = Network::with_config(accelerator, TrainingConfig::default().with_seed(21));
    for layer in layers() {
        network.add_layer(layer).unwrap();
    }
    network.generate_network().unwrap();
    network
}

fn picture() -> Vec<f32> {
    (0..144).map(|i| ((i * 13) % 29) as f32 / 29.0).collect()
}

fn compare(cpu: &[f32], gpu: &[f32], what: &str) {
    assert_eq!(cpu.len(), gpu.len(), "{what}: sizes differ");
    for (i, (c, g)) in cpu.iter().zip(gpu).enumerate() {
        assert!(
            (c - g).abs() < TOLERANCE,
            "{what}: mismatch at {i}: CPU={c}, GPU={g}"
        );
    }
}

#[test]
fn test_inference_matches_cpu() {
    init_logger();
    let Some(gpu) = gpu() else { return };
    let mut on_gpu = build(gpu);
    let mut on_cpu = build(CpuAccelerator::new());

    let label = [0.0, 1.0, 0.0];
    on_cpu.forward(&picture(), &label, PassMode::Inference).unwrap();
    on_gpu.forward(&picture(), &label, PassMode::Inference).unwrap();
    compare(&on_cpu.output().unwrap(), &on_gpu.output().unwrap(), "output");

    let cpu_cost = on_cpu.evaluate_cost(&picture(), &label).unwrap();
    let gpu_cost = on_gpu.evaluate_cost(&picture(), &label).unwrap();
    assert!((cpu_cost - gpu_cost).abs() < TOLERANCE);
}

#[test]
fn test_training_step_matches_cpu() {
    init_logger();
    let Some(gpu) = gpu() else { return };
    let mut on_gpu = build(gpu);
    let mut on_cpu = build(CpuAccelerator::new());

    // Both draw the same dropout seeds from identically seeded generators.
    let label = [1.0, 0.0, 0.0];
    on_cpu.accumulate_gradients(&picture(), &label).unwrap();
    on_gpu.accumulate_gradients(&picture(), &label).unwrap();

    for arena in [
        ArenaKind::NodeGradients,
        ArenaKind::WeightGradients,
        ArenaKind::BiasGradients,
        ArenaKind::Nodes,
        ArenaKind::Scratch,
    ] {
        compare(
            &host_arena(&mut on_cpu, arena),
            &host_arena(&mut on_gpu, arena),
            arena.name(),
        );
    }

    on_cpu.apply_gradients(1).unwrap();
    on_gpu.apply_gradients(1).unwrap();
    for arena in [ArenaKind::Weights, ArenaKind::Biases] {
        compare(
            &host_arena(&mut on_cpu, arena),
            &host_arena(&mut on_gpu, arena),
            arena.name(),
        );
    }
}

fn host_arena<A: Accelerator>(network: &mut Network<A>, arena: ArenaKind) -> Vec<f32> {
    network.sync_to_host().unwrap();
    network.arenas().unwrap().host(arena).unwrap().to_vec()
}
