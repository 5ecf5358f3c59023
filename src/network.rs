//! The training and inference driver.
//!
//! A [`Network`] owns the layer graph, the arenas once generated, and the
//! attached picture sources. It issues kernels in order on its accelerator and
//! only transfers data at well-defined checkpoints: the per-example feed, the
//! per-batch counter read and explicit syncs.

use std::sync::Arc;

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::accelerator::Accelerator;
use crate::arena::{ArenaKind, MemoryArenaManager};
use crate::errors::{ContractViolation, NetworkError, NetworkResult, StateError};
use crate::kernels::dispatch;
use crate::layer::{LayerDescriptor, LayerKind};
use crate::layer_graph::{LayerGraph, LossSlots, NetworkLayout};
use crate::picture_source::{PictureSource, PixelOrder};
use crate::training_config::TrainingConfig;

/// Pictures evaluated per host-side batch during [`Network::test`].
const TEST_CHUNK: usize = 1000;

/// Whether a forward pass is part of training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    /// Dropout samples and records masks.
    Training,
    /// Dropout is the identity.
    Inference,
}

/// Mean cost of every iteration of a [`Network::train`] run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrainingReport {
    pub batch_size: usize,
    pub batch_costs: Vec<f32>,
}

impl TrainingReport {
    pub fn iterations(&self) -> usize {
        self.batch_costs.len()
    }

    pub fn first_cost(&self) -> Option<f32> {
        self.batch_costs.first().copied()
    }

    pub fn final_cost(&self) -> Option<f32> {
        self.batch_costs.last().copied()
    }
}

/// Forward state of the example currently in the arenas.
#[derive(Debug, Clone, Default)]
struct PassRecord {
    /// Mode of the last forward pass through each layer; `None` if it has not run.
    layers: Vec<Option<PassMode>>,
}

impl PassRecord {
    fn reset(&mut self, layers: usize) {
        self.layers.clear();
        self.layers.resize(layers, None);
    }

    fn record(&mut self, layer: usize, mode: PassMode) {
        self.layers[layer] = Some(mode);
    }

    fn has_forward(&self) -> bool {
        !self.layers.is_empty() && self.layers.iter().all(Option::is_some)
    }

    /// The first broken dependency of a backward pass, walking from the output.
    fn check_backward(&self, layout: &NetworkLayout) -> Option<ContractViolation> {
        let layers = layout.layers().iter().zip(&self.layers).enumerate().rev();
        for (index, (layer, record)) in layers {
            match (layer.kind, *record) {
                (LayerKind::MaxPooling(_), None) => {
                    return Some(ContractViolation::MissingPoolingRecord { layer: index });
                }
                (_, None) => return Some(ContractViolation::MissingForwardPass { layer: index }),
                (LayerKind::Dropout { .. }, Some(PassMode::Inference)) => {
                    return Some(ContractViolation::MissingDropoutMask { layer: index });
                }
                _ => {}
            }
        }
        None
    }
}

/// A convolutional network bound to one accelerator.
pub struct Network<A: Accelerator> {
    accelerator: Arc<A>,
    graph: LayerGraph,
    config: TrainingConfig,
    arenas: Option<MemoryArenaManager<A>>,
    rng: StdRng,
    training_pictures: Option<Box<dyn PictureSource>>,
    test_pictures: Option<Box<dyn PictureSource>>,
    input_order: PixelOrder,
    pass: PassRecord,
    poisoned: bool,
}

impl<A: Accelerator> Network<A> {
    pub fn new(accelerator: A) -> Self {
        Self::with_config(accelerator, TrainingConfig::default())
    }

    pub fn with_config(accelerator: A, config: TrainingConfig) -> Self {
        Self::with_shared_accelerator(Arc::new(accelerator), config)
    }

    /// Builds a network on an accelerator shared with other networks.
    pub fn with_shared_accelerator(accelerator: Arc<A>, config: TrainingConfig) -> Self {
        Self {
            accelerator,
            graph: LayerGraph::new(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            arenas: None,
            training_pictures: None,
            test_pictures: None,
            input_order: PixelOrder::RowMajor,
            pass: PassRecord::default(),
            poisoned: false,
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn accelerator(&self) -> &A {
        &self.accelerator
    }

    pub fn layers(&self) -> &[LayerDescriptor] {
        self.graph.layers()
    }

    pub fn layout(&self) -> Option<&NetworkLayout> {
        self.graph.layout()
    }

    pub fn is_generated(&self) -> bool {
        self.arenas.is_some()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Pixel order of pictures passed to [`Network::forward`] and friends.
    pub fn set_input_order(&mut self, order: PixelOrder) {
        self.input_order = order;
    }

    pub fn set_training_pictures(&mut self, pictures: impl PictureSource + 'static) {
        self.training_pictures = Some(Box::new(pictures));
    }

    pub fn set_test_pictures(&mut self, pictures: impl PictureSource + 'static) {
        self.test_pictures = Some(Box::new(pictures));
    }

    /// Appends a layer. Fails once the network is generated.
    pub fn add_layer(&mut self, descriptor: LayerDescriptor) -> NetworkResult<()> {
        self.check_poisoned()?;
        self.graph.append(descriptor)?;
        Ok(())
    }

    /// Finalizes the topology, allocates the arenas and initializes the parameters.
    ///
    /// On failure the graph stays unfinalized and no arenas exist.
    pub fn generate_network(&mut self) -> NetworkResult<()> {
        self.check_poisoned()?;
        if self.arenas.is_some() {
            return Err(StateError::AlreadyGenerated.into());
        }
        self.config.validate()?;

        let layout = self.graph.plan()?;
        let mut arenas = MemoryArenaManager::allocate(
            self.accelerator.clone(),
            &layout,
            &self.config.arena_limits(),
        )?;
        self.initialize_parameters(&mut arenas, &layout)?;
        arenas.sync_to_device()?;

        for (index, layer) in layout.layers().iter().enumerate() {
            debug!("Layer {index}: {} -> {} nodes", layer.kind, layer.node_count());
        }
        info!(
            "Generated network with {} layers and {} parameters",
            layout.len(),
            layout.parameter_count()
        );

        self.pass.reset(layout.len());
        self.graph.commit(layout);
        self.arenas = Some(arenas);
        Ok(())
    }

    /// Uniform `±scale / sqrt(fan_in)` weights and zero biases.
    fn initialize_parameters(
        &mut self,
        arenas: &mut MemoryArenaManager<A>,
        layout: &NetworkLayout,
    ) -> NetworkResult<()> {
        let scale = self.config.weight_init_scale;
        let weights = arenas.host_mut(ArenaKind::Weights)?;
        for layer in layout.layers() {
            let fan_in = match layer.kind {
                LayerKind::Convolution(g) => layer.input.maps * g.receptive_len(),
                LayerKind::FullyConnected { .. } => layer.input.len(),
                _ => continue,
            };
            let bound = scale / (fan_in as f32).sqrt();
            for weight in &mut weights[layer.weights.range()] {
                *weight = self.rng.gen_range(-bound..bound);
            }
        }
        arenas.host_mut(ArenaKind::Biases)?.fill(0.0);
        Ok(())
    }

    pub fn arenas(&self) -> NetworkResult<&MemoryArenaManager<A>> {
        self.check_poisoned()?;
        self.arenas.as_ref().ok_or(StateError::NotGenerated.into())
    }

    pub fn arenas_mut(&mut self) -> NetworkResult<&mut MemoryArenaManager<A>> {
        self.check_poisoned()?;
        self.arenas.as_mut().ok_or(StateError::NotGenerated.into())
    }

    /// Downloads every arena the device has modified.
    pub fn sync_to_host(&mut self) -> NetworkResult<()> {
        self.arenas_mut()?.sync_to_host()?;
        Ok(())
    }

    /// Runs a forward pass for one example in the network's input order.
    pub fn forward(&mut self, picture: &[f32], label: &[f32], mode: PassMode) -> NetworkResult<()> {
        self.forward_ordered(picture, label, mode, self.input_order)
    }

    fn forward_ordered(
        &mut self,
        picture: &[f32],
        label: &[f32],
        mode: PassMode,
        order: PixelOrder,
    ) -> NetworkResult<()> {
        self.check_poisoned()?;
        let arenas = self.arenas.as_mut().ok_or(StateError::NotGenerated)?;
        let layout = arenas.layout().clone();
        let scratch = layout.scratch();
        check_len(scratch.picture.len, picture.len())?;
        check_len(layout.classes(), label.len())?;

        self.pass.reset(layout.len());
        arenas.write_device(ArenaKind::Scratch, scratch.picture.offset, picture)?;
        arenas.write_device(ArenaKind::Scratch, scratch.loss.labels, label)?;

        arenas.launch(&dispatch::load_input(&layout, order))?;
        self.pass.record(0, mode);
        for index in 1..layout.len() {
            let seed = match (layout.layer(index).kind, mode) {
                (LayerKind::Dropout { .. }, PassMode::Training) => self.rng.next_u32(),
                _ => 0,
            };
            arenas.launch(&dispatch::forward(&layout, index, mode, seed))?;
            self.pass.record(index, mode);
        }
        Ok(())
    }

    /// Output gradient, then every layer's gradients in reverse order.
    ///
    /// Needs the forward pass of the current example. A missing forward
    /// state is a contract violation and poisons the network.
    pub fn backward(&mut self) -> NetworkResult<()> {
        self.check_poisoned()?;
        let arenas = self.arenas.as_mut().ok_or(StateError::NotGenerated)?;
        let layout = arenas.layout().clone();

        if let Some(violation) = self.pass.check_backward(&layout) {
            error!("Contract violation, poisoning the network: {violation}");
            self.poisoned = true;
            return Err(violation.into());
        }

        arenas.launch(&dispatch::loss(&layout, true))?;
        for index in (1..layout.len()).rev() {
            for launch in dispatch::backward(&layout, index) {
                arenas.launch(&launch)?;
            }
        }
        self.pass.reset(layout.len());
        Ok(())
    }

    /// Training forward pass plus backward pass for one example.
    pub fn accumulate_gradients(&mut self, picture: &[f32], label: &[f32]) -> NetworkResult<()> {
        self.forward(picture, label, PassMode::Training)?;
        self.backward()
    }

    /// Gradient descent with step `learning_rate / batch_size`, then clears the gradients.
    pub fn apply_gradients(&mut self, batch_size: usize) -> NetworkResult<()> {
        self.check_poisoned()?;
        if batch_size == 0 {
            return Err(StateError::InvalidBatchSize.into());
        }
        let step = self.config.learning_rate / batch_size as f32;
        let arenas = self.arenas.as_mut().ok_or(StateError::NotGenerated)?;
        for launch in dispatch::update(arenas.layout(), step) {
            arenas.launch(&launch)?;
        }
        arenas.zero_gradients()?;
        Ok(())
    }

    /// Cross-entropy cost of one example under an inference pass.
    pub fn evaluate_cost(&mut self, picture: &[f32], label: &[f32]) -> NetworkResult<f32> {
        self.forward(picture, label, PassMode::Inference)?;
        let arenas = self.arenas.as_mut().ok_or(StateError::NotGenerated)?;
        let layout = arenas.layout().clone();
        arenas.launch(&dispatch::loss(&layout, false))?;
        let cost = arenas.read_device(ArenaKind::Scratch, layout.scratch().loss.cost, 1)?;
        Ok(cost[0])
    }

    /// Activations of the output layer after the last forward pass.
    pub fn output(&self) -> NetworkResult<Vec<f32>> {
        let arenas = self.arenas()?;
        if !self.pass.has_forward() {
            return Err(StateError::NoForwardPass.into());
        }
        let view = arenas.view(arenas.layout().len() - 1, ArenaKind::Nodes);
        Ok(arenas.read_device(ArenaKind::Nodes, view.offset, view.len)?)
    }

    /// Trains for `iterations` mini-batches of `batch_size` examples from the
    /// training pictures and reports the mean cost of each batch.
    pub fn train(&mut self, batch_size: usize, iterations: usize) -> NetworkResult<TrainingReport> {
        self.check_poisoned()?;
        if self.arenas.is_none() {
            return Err(StateError::NotGenerated.into());
        }
        if batch_size == 0 {
            return Err(StateError::InvalidBatchSize.into());
        }
        let mut pictures = self
            .training_pictures
            .take()
            .ok_or(StateError::MissingPictures { role: "training" })?;
        let result = self.train_on(pictures.as_mut(), batch_size, iterations);
        self.training_pictures = Some(pictures);
        result
    }

    fn train_on(
        &mut self,
        pictures: &mut dyn PictureSource,
        batch_size: usize,
        iterations: usize,
    ) -> NetworkResult<TrainingReport> {
        let order = self.check_picture_shape(&*pictures, "training")?;
        if pictures.is_empty() {
            return Err(StateError::MissingPictures { role: "training" }.into());
        }
        info!("Training {iterations} iterations with batch size {batch_size}");

        let mut report = TrainingReport {
            batch_size,
            batch_costs: Vec::with_capacity(iterations),
        };
        for iteration in 0..iterations {
            let batch = pictures.next_batch(batch_size);
            if batch.count == 0 {
                return Err(StateError::MissingPictures { role: "training" }.into());
            }
            if batch.count != batch_size {
                debug!("Iteration {iteration}: got {} of {batch_size} pictures", batch.count);
            }
            self.reset_counters()?;
            self.arenas_mut()?.zero_gradients()?;

            for (picture, label) in batch.iter() {
                self.forward_ordered(picture, label, PassMode::Training, order)?;
                self.backward()?;
            }
            self.apply_gradients(batch.count)?;

            let slots = self.loss_slots()?;
            let cost_sum = self.arenas()?.read_device(ArenaKind::Scratch, slots.cost_sum, 1)?[0];
            let cost = cost_sum / batch.count as f32;
            debug!("Iteration {iteration}: mean cost {cost:.6}");
            report.batch_costs.push(cost);
        }

        let arenas = self.arenas_mut()?;
        arenas.sync_arena_to_host(ArenaKind::Weights)?;
        arenas.sync_arena_to_host(ArenaKind::Biases)?;
        if let Some(cost) = report.final_cost() {
            info!("Training finished, last mean cost {cost:.6}");
        }
        Ok(report)
    }

    /// Fraction of the test pictures classified correctly.
    pub fn test(&mut self) -> NetworkResult<f32> {
        self.check_poisoned()?;
        if self.arenas.is_none() {
            return Err(StateError::NotGenerated.into());
        }
        let pictures = self
            .test_pictures
            .take()
            .ok_or(StateError::MissingPictures { role: "test" })?;
        let result = self.test_on(pictures.as_ref());
        self.test_pictures = Some(pictures);
        result
    }

    fn test_on(&mut self, pictures: &dyn PictureSource) -> NetworkResult<f32> {
        let order = self.check_picture_shape(pictures, "test")?;
        if pictures.is_empty() {
            warn!("Test pictures are empty, nothing to evaluate");
            return Err(StateError::MissingPictures { role: "test" }.into());
        }
        self.reset_counters()?;

        let mut start = 0;
        while start < pictures.len() {
            let batch = pictures.batch(start, TEST_CHUNK);
            if batch.count == 0 {
                break;
            }
            for (picture, label) in batch.iter() {
                self.forward_ordered(picture, label, PassMode::Inference, order)?;
                let arenas = self.arenas_mut()?;
                let launch = dispatch::loss(arenas.layout(), false);
                arenas.launch(&launch)?;
            }
            start += batch.count;
        }
        if start == 0 {
            return Err(StateError::MissingPictures { role: "test" }.into());
        }

        let slots = self.loss_slots()?;
        let correct = self.arenas()?.read_device(ArenaKind::Scratch, slots.correct_count, 1)?[0];
        let accuracy = correct / start as f32;
        info!("Test accuracy {:.2}% over {start} pictures", accuracy * 100.0);
        Ok(accuracy)
    }

    fn loss_slots(&self) -> NetworkResult<LossSlots> {
        Ok(self.arenas()?.layout().scratch().loss)
    }

    /// Zeroes the batch cost sum and the correct-classification count.
    fn reset_counters(&mut self) -> NetworkResult<()> {
        let slots = self.loss_slots()?;
        self.arenas_mut()?
            .write_device(ArenaKind::Scratch, slots.cost_sum, &[0.0, 0.0])?;
        Ok(())
    }

    fn check_picture_shape(
        &self,
        pictures: &dyn PictureSource,
        role: &'static str,
    ) -> NetworkResult<PixelOrder> {
        let layout = self.arenas()?.layout();
        let (rows, cols) = layout.input_shape();
        let shape = pictures.shape();
        if (shape.rows, shape.cols, shape.classes) != (rows, cols, layout.classes()) {
            return Err(StateError::PictureShapeMismatch {
                role,
                rows: shape.rows,
                cols: shape.cols,
                classes: shape.classes,
                expected_rows: rows,
                expected_cols: cols,
                expected_classes: layout.classes(),
            }
            .into());
        }
        Ok(shape.order)
    }

    fn check_poisoned(&self) -> Result<(), StateError> {
        if self.poisoned {
            return Err(StateError::Poisoned);
        }
        Ok(())
    }
}

fn check_len(expected: usize, actual: usize) -> Result<(), NetworkError> {
    if expected != actual {
        return Err(StateError::ExampleSizeMismatch { expected, actual }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::CpuAccelerator;

    fn tiny_network() -> Network<CpuAccelerator> {
        let mut network = Network::new(CpuAccelerator::single_threaded());
        network.add_layer(LayerDescriptor::input(3, 3)).unwrap();
        network.add_layer(LayerDescriptor::fully_connected(4)).unwrap();
        network.add_layer(LayerDescriptor::dropout(0.5)).unwrap();
        network.add_layer(LayerDescriptor::fully_connected(2)).unwrap();
        network
    }

    #[test]
    fn test_weights_are_bounded_by_fan_in() {
        let mut network = tiny_network();
        network.generate_network().unwrap();
        let weights = network.arenas().unwrap().layer_host(1, ArenaKind::Weights).unwrap();
        let bound = 1.0 / 3.0;
        assert!(weights.iter().all(|w| w.abs() <= bound));
        assert!(weights.iter().any(|&w| w != 0.0));
        let biases = network.arenas().unwrap().host(ArenaKind::Biases).unwrap();
        assert!(biases.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_generate_twice_fails() {
        let mut network = tiny_network();
        network.generate_network().unwrap();
        assert!(matches!(
            network.generate_network(),
            Err(NetworkError::State(StateError::AlreadyGenerated))
        ));
    }

    #[test]
    fn test_output_requires_forward_pass() {
        let mut network = tiny_network();
        network.generate_network().unwrap();
        assert!(matches!(
            network.output(),
            Err(NetworkError::State(StateError::NoForwardPass))
        ));
        network.forward(&[0.5; 9], &[1.0, 0.0], PassMode::Inference).unwrap();
        assert_eq!(network.output().unwrap().len(), 2);
    }

    #[test]
    fn test_example_size_is_checked() {
        let mut network = tiny_network();
        network.generate_network().unwrap();
        assert!(matches!(
            network.forward(&[0.5; 8], &[1.0, 0.0], PassMode::Inference),
            Err(NetworkError::State(StateError::ExampleSizeMismatch {
                expected: 9,
                actual: 8
            }))
        ));
    }
}
