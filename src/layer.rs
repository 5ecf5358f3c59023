//! Layer descriptors: the kind and geometry of one layer.
//!
//! A descriptor carries no behaviour beyond shape bookkeeping. Its arena
//! indices stay empty until the owning [`crate::LayerGraph`] is finalized.

use std::fmt;

/// Spatial geometry of a convolution or max-pooling layer.
///
/// `x_size`/`y_size` describe the input feature maps and are filled in during
/// finalization from the predecessor's output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldGeometry {
    pub x_size: usize,
    pub y_size: usize,
    pub x_receptive: usize,
    pub y_receptive: usize,
    pub feature_map_count: usize,
    pub x_step: usize,
    pub y_step: usize,
}

impl FieldGeometry {
    /// Geometry that moves by `step_size` along both axes.
    pub fn new(
        x_receptive: usize,
        y_receptive: usize,
        feature_map_count: usize,
        step_size: usize,
    ) -> Self {
        Self::with_steps(x_receptive, y_receptive, feature_map_count, step_size, step_size)
    }

    pub fn with_steps(
        x_receptive: usize,
        y_receptive: usize,
        feature_map_count: usize,
        x_step: usize,
        y_step: usize,
    ) -> Self {
        Self {
            x_size: 0,
            y_size: 0,
            x_receptive,
            y_receptive,
            feature_map_count,
            x_step,
            y_step,
        }
    }

    /// Output size along x for the current input size.
    pub fn output_x(&self) -> usize {
        (self.x_size - self.x_receptive) / self.x_step + 1
    }

    /// Output size along y for the current input size.
    pub fn output_y(&self) -> usize {
        (self.y_size - self.y_receptive) / self.y_step + 1
    }

    pub fn receptive_len(&self) -> usize {
        self.x_receptive * self.y_receptive
    }
}

/// The closed set of layer kinds the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerKind {
    Input { rows: usize, cols: usize },
    Convolution(FieldGeometry),
    MaxPooling(FieldGeometry),
    FullyConnected { size: usize },
    Dropout { drop_probability: f32 },
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Input { .. } => "input",
            LayerKind::Convolution(_) => "convolution",
            LayerKind::MaxPooling(_) => "max pooling",
            LayerKind::FullyConnected { .. } => "fully connected",
            LayerKind::Dropout { .. } => "dropout",
        }
    }

    /// Whether the kind owns weights and biases.
    pub fn has_parameters(&self) -> bool {
        matches!(self, LayerKind::Convolution(_) | LayerKind::FullyConnected { .. })
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Input { rows, cols } => write!(f, "input {}x{}", rows, cols),
            LayerKind::Convolution(g) => write!(
                f,
                "convolution {}x{} x{} step {}x{}",
                g.x_receptive, g.y_receptive, g.feature_map_count, g.x_step, g.y_step
            ),
            LayerKind::MaxPooling(g) => write!(
                f,
                "max pooling {}x{} x{} step {}x{}",
                g.x_receptive, g.y_receptive, g.feature_map_count, g.x_step, g.y_step
            ),
            LayerKind::FullyConnected { size } => write!(f, "fully connected {}", size),
            LayerKind::Dropout { drop_probability } => write!(f, "dropout p={}", drop_probability),
        }
    }
}

/// Element offsets of a layer's regions in the node, weight and bias arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaIndices {
    pub node_arena_index: usize,
    pub weight_arena_index: usize,
    pub bias_arena_index: usize,
}

/// One layer of the network.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDescriptor {
    kind: LayerKind,
    node_count: usize,
    expected_inputs: Option<usize>,
    indices: Option<ArenaIndices>,
}

impl LayerDescriptor {
    fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            node_count: 0,
            expected_inputs: None,
            indices: None,
        }
    }

    /// Input layer holding a `rows x cols` picture.
    pub fn input(rows: usize, cols: usize) -> Self {
        Self::new(LayerKind::Input { rows, cols })
    }

    /// Convolution with `feature_maps` kernels of `x_receptive x y_receptive`, stride 1.
    pub fn convolution(x_receptive: usize, y_receptive: usize, feature_maps: usize) -> Self {
        Self::convolution_strided(x_receptive, y_receptive, feature_maps, 1)
    }

    pub fn convolution_strided(
        x_receptive: usize,
        y_receptive: usize,
        feature_maps: usize,
        step_size: usize,
    ) -> Self {
        Self::new(LayerKind::Convolution(FieldGeometry::new(
            x_receptive,
            y_receptive,
            feature_maps,
            step_size,
        )))
    }

    /// Non-overlapping max pooling over `feature_maps` input maps.
    ///
    /// Each window moves by its own extent along each axis.
    pub fn max_pooling(x_receptive: usize, y_receptive: usize, feature_maps: usize) -> Self {
        Self::new(LayerKind::MaxPooling(FieldGeometry::with_steps(
            x_receptive,
            y_receptive,
            feature_maps,
            x_receptive,
            y_receptive,
        )))
    }

    pub fn max_pooling_strided(
        x_receptive: usize,
        y_receptive: usize,
        feature_maps: usize,
        step_size: usize,
    ) -> Self {
        Self::new(LayerKind::MaxPooling(FieldGeometry::new(
            x_receptive,
            y_receptive,
            feature_maps,
            step_size,
        )))
    }

    pub fn fully_connected(size: usize) -> Self {
        Self::new(LayerKind::FullyConnected { size })
    }

    pub fn dropout(drop_probability: f32) -> Self {
        Self::new(LayerKind::Dropout { drop_probability })
    }

    /// Declares how many input nodes this layer expects from its predecessor.
    pub fn with_expected_inputs(mut self, expected_inputs: usize) -> Self {
        self.expected_inputs = Some(expected_inputs);
        self
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    /// Number of output nodes; zero until the graph is finalized.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn expected_inputs(&self) -> Option<usize> {
        self.expected_inputs
    }

    /// Arena offsets, available once the graph is finalized.
    pub fn indices(&self) -> Option<ArenaIndices> {
        self.indices
    }

    pub fn node_arena_index(&self) -> Option<usize> {
        self.indices.map(|i| i.node_arena_index)
    }

    pub fn weight_arena_index(&self) -> Option<usize> {
        self.indices.map(|i| i.weight_arena_index)
    }

    pub fn bias_arena_index(&self) -> Option<usize> {
        self.indices.map(|i| i.bias_arena_index)
    }

    /// Records the finalized geometry and offsets. Called exactly once per layer.
    pub(crate) fn assign(&mut self, kind: LayerKind, node_count: usize, indices: ArenaIndices) {
        debug_assert!(self.indices.is_none(), "arena indices are assigned once");
        self.kind = kind;
        self.node_count = node_count;
        self.indices = Some(indices);
    }
}
