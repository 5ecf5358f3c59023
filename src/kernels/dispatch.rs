//! Builds the kernel launches for each layer kind from a finalized layout.
//!
//! This is the only place that knows which kernels a layer kind needs; the
//! driver walks the layers and hands the launches to the arena manager.

use crate::arena::ArenaKind;
use crate::layer::LayerKind;
use crate::layer_graph::{LayerLayout, NetworkLayout};
use crate::network::PassMode;
use crate::picture_source::PixelOrder;

use super::{
    FLAG_TRANSPOSE_INPUT, FLAG_WRITE_DERIVATIVES, Kernel, KernelLaunch, KernelParams, to_u32,
};

/// Offsets and shapes shared by the forward and backward launches of `layer`.
fn layer_params(previous: &LayerLayout, layer: &LayerLayout) -> KernelParams {
    let mut params = KernelParams {
        in_offset: to_u32(previous.nodes.offset),
        out_offset: to_u32(layer.nodes.offset),
        weight_offset: to_u32(layer.weights.offset),
        bias_offset: to_u32(layer.biases.offset),
        scratch_offset: to_u32(layer.scratch.offset),
        in_x: to_u32(layer.input.x),
        in_y: to_u32(layer.input.y),
        in_maps: to_u32(layer.input.maps),
        out_x: to_u32(layer.output.x),
        out_y: to_u32(layer.output.y),
        out_maps: to_u32(layer.output.maps),
        ..Default::default()
    };
    match layer.kind {
        LayerKind::Convolution(g) | LayerKind::MaxPooling(g) => {
            params.x_receptive = to_u32(g.x_receptive);
            params.y_receptive = to_u32(g.y_receptive);
            params.x_step = to_u32(g.x_step);
            params.y_step = to_u32(g.y_step);
        }
        LayerKind::FullyConnected { .. } => {
            // Dense layers see their input as one flat vector.
            params.in_x = to_u32(layer.input.len());
            params.in_y = 1;
            params.in_maps = 1;
        }
        LayerKind::Dropout { drop_probability } => params.scalar = drop_probability,
        LayerKind::Input { .. } => {}
    }
    params
}

fn launch(kernel: Kernel, params: KernelParams, count: usize) -> KernelLaunch {
    KernelLaunch::new(
        kernel,
        KernelParams {
            count: to_u32(count),
            ..params
        },
    )
}

/// Copies the staged picture into the input layer.
pub fn load_input(layout: &NetworkLayout, order: PixelOrder) -> KernelLaunch {
    let input = layout.layer(0);
    let flags = match order {
        PixelOrder::RowMajor => FLAG_TRANSPOSE_INPUT,
        PixelOrder::ColumnMajor => 0,
    };
    let params = KernelParams {
        in_offset: to_u32(layout.scratch().picture.offset),
        out_offset: to_u32(input.nodes.offset),
        in_x: to_u32(input.output.x),
        in_y: to_u32(input.output.y),
        flags,
        ..Default::default()
    };
    launch(Kernel::LoadInput, params, input.node_count())
}

/// Forward launch of layer `index` (> 0). `seed` only matters for training dropout.
pub fn forward(layout: &NetworkLayout, index: usize, mode: PassMode, seed: u32) -> KernelLaunch {
    let layer = layout.layer(index);
    let params = layer_params(layout.layer(index - 1), layer);
    let count = layer.node_count();
    match layer.kind {
        LayerKind::Convolution(_) => launch(Kernel::ConvolutionForward, params, count),
        LayerKind::MaxPooling(_) => launch(Kernel::MaxPoolingForward, params, count),
        LayerKind::FullyConnected { .. } => launch(Kernel::FullyConnectedForward, params, count),
        LayerKind::Dropout { .. } => match mode {
            PassMode::Training => launch(
                Kernel::DropoutForward,
                KernelParams { seed, ..params },
                count,
            ),
            PassMode::Inference => launch(Kernel::DropoutPassThrough, params, count),
        },
        LayerKind::Input { .. } => unreachable!("only layer 0 is an input layer"),
    }
}

/// Softmax + cross-entropy on the output layer.
pub fn loss(layout: &NetworkLayout, write_derivatives: bool) -> KernelLaunch {
    let output = layout.output_layer();
    let params = KernelParams {
        in_offset: to_u32(output.nodes.offset),
        out_offset: to_u32(output.nodes.offset),
        scratch_offset: to_u32(layout.scratch().loss.labels),
        in_x: to_u32(layout.classes()),
        flags: if write_derivatives { FLAG_WRITE_DERIVATIVES } else { 0 },
        ..Default::default()
    };
    launch(Kernel::SoftmaxCrossEntropy, params, 1)
}

/// Backward launches of layer `index`, input gradient first.
///
/// The input gradient is skipped when the predecessor is the input layer,
/// where propagation ends anyway.
pub fn backward(layout: &NetworkLayout, index: usize) -> Vec<KernelLaunch> {
    let layer = layout.layer(index);
    if index == 0 {
        return Vec::new();
    }
    let previous = layout.layer(index - 1);
    let params = layer_params(previous, layer);
    let propagate = !matches!(previous.kind, LayerKind::Input { .. });
    let inputs = layer.input.len();

    let mut launches = Vec::with_capacity(3);
    match layer.kind {
        LayerKind::Convolution(_) => {
            if propagate {
                launches.push(launch(Kernel::ConvolutionBackwardInput, params, inputs));
            }
            launches.push(launch(Kernel::ConvolutionBackwardWeights, params, layer.weights.len));
            launches.push(launch(Kernel::ConvolutionBackwardBias, params, layer.biases.len));
        }
        LayerKind::FullyConnected { .. } => {
            if propagate {
                launches.push(launch(Kernel::FullyConnectedBackwardInput, params, inputs));
            }
            launches.push(launch(Kernel::FullyConnectedBackwardWeights, params, layer.weights.len));
            launches.push(launch(Kernel::FullyConnectedBackwardBias, params, layer.biases.len));
        }
        LayerKind::MaxPooling(_) if propagate => {
            launches.push(launch(Kernel::MaxPoolingBackward, params, inputs));
        }
        LayerKind::Dropout { .. } if propagate => {
            launches.push(launch(Kernel::DropoutBackward, params, inputs));
        }
        LayerKind::MaxPooling(_) | LayerKind::Dropout { .. } | LayerKind::Input { .. } => {}
    }
    launches
}

/// Gradient descent over both parameter arenas with step `learning_rate / batch_size`.
pub fn update(layout: &NetworkLayout, step: f32) -> Vec<KernelLaunch> {
    [
        (Kernel::GradientDescentWeights, layout.arena_len(ArenaKind::Weights)),
        (Kernel::GradientDescentBiases, layout.arena_len(ArenaKind::Biases)),
    ]
    .into_iter()
    .filter(|&(_, count)| count > 0)
    .map(|(kernel, count)| {
        launch(
            kernel,
            KernelParams {
                scalar: step,
                ..Default::default()
            },
            count,
        )
    })
    .collect()
}
