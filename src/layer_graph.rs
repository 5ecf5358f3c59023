//! The ordered layer sequence and its one-time finalization into arena layouts.
//!
//! Finalization is the only place shapes are computed. Everything downstream
//! (arena allocation, kernel launches) trusts the resulting [`NetworkLayout`].

use crate::arena::{ArenaKind, ArenaView, Placement, SegmentTable};
use crate::errors::{StateError, TopologyError, TopologyResult};
use crate::layer::{ArenaIndices, FieldGeometry, LayerDescriptor, LayerKind};

/// Output shape of a layer: `maps` feature maps of `x` rows by `y` columns.
///
/// Fully-connected outputs are `size x 1 x 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureShape {
    pub x: usize,
    pub y: usize,
    pub maps: usize,
}

impl FeatureShape {
    pub fn new(x: usize, y: usize, maps: usize) -> Self {
        Self { x, y, maps }
    }

    pub fn map_len(&self) -> usize {
        self.x * self.y
    }

    pub fn len(&self) -> usize {
        self.x * self.y * self.maps
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Placement and resolved geometry of one finalized layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerLayout {
    /// Kind with `x_size`/`y_size` filled in.
    pub kind: LayerKind,
    /// Shape consumed from the predecessor; equal to `output` for the input layer.
    pub input: FeatureShape,
    pub output: FeatureShape,
    pub nodes: Placement,
    pub weights: Placement,
    pub biases: Placement,
    /// Arg-max records (max pooling) or masks (dropout).
    pub scratch: Placement,
}

impl LayerLayout {
    /// Placement of this layer in `arena`; gradient arenas mirror their value arenas.
    pub fn placement(&self, arena: ArenaKind) -> Placement {
        match arena.layout_source() {
            ArenaKind::Nodes => self.nodes,
            ArenaKind::Weights => self.weights,
            ArenaKind::Biases => self.biases,
            _ => self.scratch,
        }
    }

    pub fn node_count(&self) -> usize {
        self.output.len()
    }
}

/// Scratch offsets used by the loss kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossSlots {
    pub classes: usize,
    /// Start of the staged one-hot label.
    pub labels: usize,
    /// Start of the softmax probabilities.
    pub probabilities: usize,
    /// Cost of the last example.
    pub cost: usize,
    /// Cost accumulated since the last reset.
    pub cost_sum: usize,
    /// Correct classifications accumulated since the last reset.
    pub correct_count: usize,
}

impl LossSlots {
    /// The counter block `[cost, cost_sum, correct_count]`.
    pub const COUNTERS: usize = 3;

    /// Slots of a loss region starting at `labels`: labels, probabilities, counters.
    pub fn at(labels: usize, classes: usize) -> Self {
        let counters = labels + 2 * classes;
        Self {
            classes,
            labels,
            probabilities: labels + classes,
            cost: counters,
            cost_sum: counters + 1,
            correct_count: counters + 2,
        }
    }

    /// Total length of the region.
    pub fn region_len(&self) -> usize {
        2 * self.classes + Self::COUNTERS
    }
}

/// Layout of the scratch arena.
#[derive(Debug, Clone, PartialEq)]
pub struct ScratchLayout {
    pub table: SegmentTable,
    /// Staging area for the raw input picture.
    pub picture: Placement,
    pub loss: LossSlots,
}

/// Finalized layout of every arena.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkLayout {
    layers: Vec<LayerLayout>,
    nodes: SegmentTable,
    weights: SegmentTable,
    biases: SegmentTable,
    scratch: ScratchLayout,
}

impl NetworkLayout {
    pub fn layers(&self) -> &[LayerLayout] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> &LayerLayout {
        &self.layers[index]
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn output_layer(&self) -> &LayerLayout {
        &self.layers[self.layers.len() - 1]
    }

    /// Picture size `(rows, cols)` accepted by the input layer.
    pub fn input_shape(&self) -> (usize, usize) {
        let input = &self.layers[0].output;
        (input.x, input.y)
    }

    /// Number of output classes (nodes of the last layer).
    pub fn classes(&self) -> usize {
        self.output_layer().node_count()
    }

    pub fn scratch(&self) -> &ScratchLayout {
        &self.scratch
    }

    pub fn table(&self, arena: ArenaKind) -> &SegmentTable {
        match arena.layout_source() {
            ArenaKind::Nodes => &self.nodes,
            ArenaKind::Weights => &self.weights,
            ArenaKind::Biases => &self.biases,
            _ => &self.scratch.table,
        }
    }

    pub fn arena_len(&self, arena: ArenaKind) -> usize {
        self.table(arena).total_len()
    }

    /// The `(offset, length, x_shape, y_shape)` view of a layer's segment in `arena`.
    pub fn view(&self, layer_index: usize, arena: ArenaKind) -> ArenaView {
        let placement = self.layers[layer_index].placement(arena);
        ArenaView::new(arena, &placement, self.table(arena))
    }

    pub fn parameter_count(&self) -> usize {
        self.weights.total_len() + self.biases.total_len()
    }
}

/// Ordered, append-only sequence of layers.
#[derive(Debug, Clone, Default)]
pub struct LayerGraph {
    layers: Vec<LayerDescriptor>,
    layout: Option<NetworkLayout>,
}

impl LayerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a layer to the end of the sequence.
    pub fn append(&mut self, descriptor: LayerDescriptor) -> Result<(), StateError> {
        if self.layout.is_some() {
            return Err(StateError::GraphFinalized);
        }
        self.layers.push(descriptor);
        Ok(())
    }

    pub fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.layout.is_some()
    }

    pub fn layout(&self) -> Option<&NetworkLayout> {
        self.layout.as_ref()
    }

    /// Computes sizes and arena indices and freezes the topology.
    ///
    /// Finalizing an already finalized graph returns the existing layout.
    pub fn finalize(&mut self) -> TopologyResult<&NetworkLayout> {
        match self.layout {
            Some(ref layout) => Ok(layout),
            None => {
                let layout = self.plan()?;
                Ok(self.commit(layout))
            }
        }
    }

    /// Freezes the graph with a layout previously produced by [`LayerGraph::plan`].
    pub(crate) fn commit(&mut self, layout: NetworkLayout) -> &NetworkLayout {
        for (descriptor, layer) in self.layers.iter_mut().zip(layout.layers()) {
            descriptor.assign(
                layer.kind,
                layer.node_count(),
                ArenaIndices {
                    node_arena_index: layer.nodes.offset,
                    weight_arena_index: layer.weights.offset,
                    bias_arena_index: layer.biases.offset,
                },
            );
        }
        self.layout.insert(layout)
    }

    /// Computes the layout without freezing the graph.
    pub fn plan(&self) -> TopologyResult<NetworkLayout> {
        let first = self.layers.first().ok_or(TopologyError::EmptyNetwork)?;
        if !matches!(first.kind(), LayerKind::Input { .. }) {
            return Err(TopologyError::MissingInputLayer {
                found: first.kind().name(),
            });
        }

        let mut nodes = SegmentTable::new();
        let mut weights = SegmentTable::new();
        let mut biases = SegmentTable::new();
        let mut scratch = SegmentTable::new();
        let mut layers: Vec<LayerLayout> = Vec::with_capacity(self.layers.len());

        for (index, descriptor) in self.layers.iter().enumerate() {
            let previous = layers.last();
            let input = previous.map(|l| l.output);

            if let (Some(expected), Some(input)) = (descriptor.expected_inputs(), input) {
                if expected != input.len() {
                    return Err(TopologyError::InputSizeMismatch {
                        index,
                        kind: descriptor.kind().name(),
                        expected,
                        actual: input.len(),
                    });
                }
            }

            let layer = match (*descriptor.kind(), input) {
                (LayerKind::Input { rows, cols }, None) => {
                    require_positive(index, "input", "rows", rows)?;
                    require_positive(index, "input", "cols", cols)?;
                    let output = FeatureShape::new(rows, cols, 1);
                    LayerLayout {
                        kind: *descriptor.kind(),
                        input: output,
                        output,
                        nodes: Placement::push_segments(&mut nodes, 1, rows, cols),
                        weights: Placement::empty_at(&weights),
                        biases: Placement::empty_at(&biases),
                        scratch: Placement::empty_at(&scratch),
                    }
                }
                (LayerKind::Input { .. }, Some(_)) => {
                    return Err(TopologyError::MisplacedInputLayer { index });
                }
                (LayerKind::Convolution(geometry), Some(input)) => {
                    let geometry = resolve_field(index, "convolution", geometry, &input)?;
                    let maps = geometry.feature_map_count;
                    let output = FeatureShape::new(geometry.output_x(), geometry.output_y(), maps);
                    LayerLayout {
                        kind: LayerKind::Convolution(geometry),
                        input,
                        output,
                        nodes: Placement::push_segments(&mut nodes, maps, output.x, output.y),
                        weights: Placement::push_segments(
                            &mut weights,
                            maps * input.maps,
                            geometry.x_receptive,
                            geometry.y_receptive,
                        ),
                        biases: Placement::push_segments(&mut biases, 1, maps, 1),
                        scratch: Placement::empty_at(&scratch),
                    }
                }
                (LayerKind::MaxPooling(geometry), Some(input)) => {
                    let geometry = resolve_field(index, "max pooling", geometry, &input)?;
                    if geometry.feature_map_count != input.maps {
                        return Err(TopologyError::FeatureMapMismatch {
                            index,
                            declared: geometry.feature_map_count,
                            actual: input.maps,
                        });
                    }
                    let output =
                        FeatureShape::new(geometry.output_x(), geometry.output_y(), input.maps);
                    LayerLayout {
                        kind: LayerKind::MaxPooling(geometry),
                        input,
                        output,
                        nodes: Placement::push_segments(&mut nodes, input.maps, output.x, output.y),
                        weights: Placement::empty_at(&weights),
                        biases: Placement::empty_at(&biases),
                        scratch: Placement::push_segments(
                            &mut scratch,
                            input.maps,
                            output.x,
                            output.y,
                        ),
                    }
                }
                (LayerKind::FullyConnected { size }, Some(input)) => {
                    require_positive(index, "fully connected", "size", size)?;
                    LayerLayout {
                        kind: *descriptor.kind(),
                        input,
                        output: FeatureShape::new(size, 1, 1),
                        nodes: Placement::push_segments(&mut nodes, 1, size, 1),
                        weights: Placement::push_segments(&mut weights, 1, size, input.len()),
                        biases: Placement::push_segments(&mut biases, 1, size, 1),
                        scratch: Placement::empty_at(&scratch),
                    }
                }
                (LayerKind::Dropout { drop_probability }, Some(input)) => {
                    if !(0.0..1.0).contains(&drop_probability) {
                        return Err(TopologyError::InvalidDropProbability {
                            index,
                            probability: drop_probability,
                        });
                    }
                    LayerLayout {
                        kind: *descriptor.kind(),
                        input,
                        output: input,
                        nodes: Placement::push_segments(&mut nodes, input.maps, input.x, input.y),
                        weights: Placement::empty_at(&weights),
                        biases: Placement::empty_at(&biases),
                        scratch: Placement::push_segments(
                            &mut scratch,
                            input.maps,
                            input.x,
                            input.y,
                        ),
                    }
                }
                // Only the first layer lacks a predecessor, and it was checked to be an input.
                (_, None) => unreachable!("first layer is an input layer"),
            };
            layers.push(layer);
        }

        let (rows, cols) = (layers[0].output.x, layers[0].output.y);
        let classes = layers[layers.len() - 1].node_count();
        let picture = Placement::push_segments(&mut scratch, 1, rows, cols);
        let labels_segment = scratch.push(classes, 1);
        let labels = scratch.segment_range(labels_segment).start;
        scratch.push(classes, 1);
        scratch.push(LossSlots::COUNTERS, 1);

        Ok(NetworkLayout {
            layers,
            nodes,
            weights,
            biases,
            scratch: ScratchLayout {
                table: scratch,
                picture,
                loss: LossSlots::at(labels, classes),
            },
        })
    }
}

fn require_positive(
    index: usize,
    kind: &'static str,
    field: &'static str,
    value: usize,
) -> TopologyResult<()> {
    if value == 0 {
        return Err(TopologyError::ZeroDimension { index, kind, field });
    }
    Ok(())
}

/// Fills in the input size of a convolution/pooling field and checks it tiles the input.
fn resolve_field(
    index: usize,
    kind: &'static str,
    mut geometry: FieldGeometry,
    input: &FeatureShape,
) -> TopologyResult<FieldGeometry> {
    require_positive(index, kind, "x_receptive", geometry.x_receptive)?;
    require_positive(index, kind, "y_receptive", geometry.y_receptive)?;
    require_positive(index, kind, "feature_map_count", geometry.feature_map_count)?;
    require_positive(index, kind, "x_step", geometry.x_step)?;
    require_positive(index, kind, "y_step", geometry.y_step)?;

    geometry.x_size = input.x;
    geometry.y_size = input.y;

    if geometry.x_receptive > input.x || geometry.y_receptive > input.y {
        return Err(TopologyError::ReceptiveFieldTooLarge {
            index,
            kind,
            x_receptive: geometry.x_receptive,
            y_receptive: geometry.y_receptive,
            x_size: input.x,
            y_size: input.y,
        });
    }

    if (input.x - geometry.x_receptive) % geometry.x_step != 0
        || (input.y - geometry.y_receptive) % geometry.y_step != 0
    {
        return Err(TopologyError::UnevenStride {
            index,
            kind,
            x_step: geometry.x_step,
            y_step: geometry.y_step,
            x_receptive: geometry.x_receptive,
            y_receptive: geometry.y_receptive,
            x_size: input.x,
            y_size: input.y,
        });
    }

    Ok(geometry)
}
