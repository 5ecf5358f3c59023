//! Kernel launch encoding and the reference per-unit kernel math.
//!
//! A launch is a [`Kernel`] plus a [`KernelParams`] block. Each launch runs
//! `params.count` independent units; unit `i` owns exactly one output element
//! (or one element per written arena) and only gathers from elements it does
//! not write. This keeps every launch free of write races without atomics.
//!
//! The functions in the submodules compute the value of one unit from
//! read-only arenas. The CPU accelerator drives them directly; the WGSL in
//! `gpu/shaders` mirrors them one entry point per [`Kernel`].

pub mod backward;
pub mod dispatch;
pub mod forward;
pub mod loss;
pub mod update;

use bytemuck::{Pod, Zeroable};

use crate::arena::ArenaKind;

/// The load kernel transposes a row-major picture into column-major nodes.
pub const FLAG_TRANSPOSE_INPUT: u32 = 1;
/// The loss kernel writes `p - y` into the output layer's node gradients.
pub const FLAG_WRITE_DERIVATIVES: u32 = 1 << 1;

/// Every kernel the engine can launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    LoadInput,
    ConvolutionForward,
    MaxPoolingForward,
    FullyConnectedForward,
    DropoutForward,
    DropoutPassThrough,
    SoftmaxCrossEntropy,
    ConvolutionBackwardInput,
    ConvolutionBackwardWeights,
    ConvolutionBackwardBias,
    MaxPoolingBackward,
    FullyConnectedBackwardInput,
    FullyConnectedBackwardWeights,
    FullyConnectedBackwardBias,
    DropoutBackward,
    GradientDescentWeights,
    GradientDescentBiases,
}

impl Kernel {
    pub const ALL: [Kernel; 17] = [
        Kernel::LoadInput,
        Kernel::ConvolutionForward,
        Kernel::MaxPoolingForward,
        Kernel::FullyConnectedForward,
        Kernel::DropoutForward,
        Kernel::DropoutPassThrough,
        Kernel::SoftmaxCrossEntropy,
        Kernel::ConvolutionBackwardInput,
        Kernel::ConvolutionBackwardWeights,
        Kernel::ConvolutionBackwardBias,
        Kernel::MaxPoolingBackward,
        Kernel::FullyConnectedBackwardInput,
        Kernel::FullyConnectedBackwardWeights,
        Kernel::FullyConnectedBackwardBias,
        Kernel::DropoutBackward,
        Kernel::GradientDescentWeights,
        Kernel::GradientDescentBiases,
    ];

    /// Name of the WGSL entry point implementing this kernel.
    pub fn entry_point(self) -> &'static str {
        match self {
            Kernel::LoadInput => "load_input",
            Kernel::ConvolutionForward => "convolution_forward",
            Kernel::MaxPoolingForward => "max_pooling_forward",
            Kernel::FullyConnectedForward => "fully_connected_forward",
            Kernel::DropoutForward => "dropout_forward",
            Kernel::DropoutPassThrough => "dropout_pass_through",
            Kernel::SoftmaxCrossEntropy => "softmax_cross_entropy",
            Kernel::ConvolutionBackwardInput => "convolution_backward_input",
            Kernel::ConvolutionBackwardWeights => "convolution_backward_weights",
            Kernel::ConvolutionBackwardBias => "convolution_backward_bias",
            Kernel::MaxPoolingBackward => "max_pooling_backward",
            Kernel::FullyConnectedBackwardInput => "fully_connected_backward_input",
            Kernel::FullyConnectedBackwardWeights => "fully_connected_backward_weights",
            Kernel::FullyConnectedBackwardBias => "fully_connected_backward_bias",
            Kernel::DropoutBackward => "dropout_backward",
            Kernel::GradientDescentWeights => "gradient_descent_weights",
            Kernel::GradientDescentBiases => "gradient_descent_biases",
        }
    }

    /// Arenas whose device contents the kernel modifies.
    pub fn writes(self) -> &'static [ArenaKind] {
        match self {
            Kernel::LoadInput
            | Kernel::ConvolutionForward
            | Kernel::FullyConnectedForward
            | Kernel::DropoutPassThrough => &[ArenaKind::Nodes],
            Kernel::MaxPoolingForward | Kernel::DropoutForward => {
                &[ArenaKind::Nodes, ArenaKind::Scratch]
            }
            Kernel::SoftmaxCrossEntropy => &[ArenaKind::Scratch, ArenaKind::NodeGradients],
            Kernel::ConvolutionBackwardInput
            | Kernel::MaxPoolingBackward
            | Kernel::FullyConnectedBackwardInput
            | Kernel::DropoutBackward => &[ArenaKind::NodeGradients],
            Kernel::ConvolutionBackwardWeights | Kernel::FullyConnectedBackwardWeights => {
                &[ArenaKind::WeightGradients]
            }
            Kernel::ConvolutionBackwardBias | Kernel::FullyConnectedBackwardBias => {
                &[ArenaKind::BiasGradients]
            }
            Kernel::GradientDescentWeights => &[ArenaKind::Weights],
            Kernel::GradientDescentBiases => &[ArenaKind::Biases],
        }
    }
}

/// Uniform block handed to every kernel. Mirrored field-for-field by
/// `struct Params` in `common.wgsl`.
///
/// Offsets are element offsets into the arena the kernel reads or writes
/// through them. Which fields a kernel uses is documented on its reference
/// function; unused fields are zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct KernelParams {
    /// Number of parallel units.
    pub count: u32,
    pub in_offset: u32,
    pub out_offset: u32,
    pub weight_offset: u32,
    pub bias_offset: u32,
    pub scratch_offset: u32,
    pub in_x: u32,
    pub in_y: u32,
    pub in_maps: u32,
    pub out_x: u32,
    pub out_y: u32,
    pub out_maps: u32,
    pub x_receptive: u32,
    pub y_receptive: u32,
    pub x_step: u32,
    pub flags: u32,
    pub seed: u32,
    /// Drop probability for dropout, `learning_rate / batch_size` for the update.
    pub scalar: f32,
    pub y_step: u32,
    pub reserved: u32,
}

impl KernelParams {
    /// Size in bytes, also the size of the WGSL uniform struct.
    pub const SIZE: usize = std::mem::size_of::<KernelParams>();

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// One kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelLaunch {
    pub kernel: Kernel,
    pub params: KernelParams,
}

impl KernelLaunch {
    pub fn new(kernel: Kernel, params: KernelParams) -> Self {
        Self { kernel, params }
    }

    pub fn units(&self) -> usize {
        self.params.count as usize
    }
}

/// Read-only views of all arenas, indexed by [`ArenaKind::slot`].
#[derive(Debug, Clone, Copy)]
pub struct ArenaReads<'a> {
    slots: [&'a [f32]; 7],
}

impl<'a> ArenaReads<'a> {
    pub fn new(slots: [&'a [f32]; 7]) -> Self {
        Self { slots }
    }

    pub fn get(&self, arena: ArenaKind) -> &'a [f32] {
        self.slots[arena.slot()]
    }

    pub fn nodes(&self) -> &'a [f32] {
        self.get(ArenaKind::Nodes)
    }

    pub fn weights(&self) -> &'a [f32] {
        self.get(ArenaKind::Weights)
    }

    pub fn biases(&self) -> &'a [f32] {
        self.get(ArenaKind::Biases)
    }

    pub fn node_gradients(&self) -> &'a [f32] {
        self.get(ArenaKind::NodeGradients)
    }

    pub fn weight_gradients(&self) -> &'a [f32] {
        self.get(ArenaKind::WeightGradients)
    }

    pub fn bias_gradients(&self) -> &'a [f32] {
        self.get(ArenaKind::BiasGradients)
    }

    pub fn scratch(&self) -> &'a [f32] {
        self.get(ArenaKind::Scratch)
    }
}

/// Converts a host size or offset into the `u32` carried by [`KernelParams`].
///
/// Arenas are bounded by the device's binding size, which is far below `u32::MAX`
/// elements, so layouts that reach this point always fit.
pub(crate) fn to_u32(value: usize) -> u32 {
    debug_assert!(value <= u32::MAX as usize, "arena offset {value} exceeds u32");
    value as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_block_is_uniform_compatible() {
        assert_eq!(KernelParams::SIZE, 80);
        assert_eq!(KernelParams::SIZE % 16, 0);
    }

    #[test]
    fn test_entry_points_are_unique() {
        let mut names: Vec<_> = Kernel::ALL.iter().map(|k| k.entry_point()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Kernel::ALL.len());
    }

    #[test]
    fn test_every_kernel_writes_something() {
        for kernel in Kernel::ALL {
            assert!(!kernel.writes().is_empty(), "{kernel:?}");
        }
    }
}
