//! Convolutional network trainer built on flat memory arenas.
//!
//! Every layer's nodes, weights, biases and their gradients live in a few
//! large `f32` buffers. Layers address their data through offsets computed
//! once when the network is generated, and all forward, backward and update
//! math runs as data-parallel kernels on an [`Accelerator`]: host threads
//! ([`CpuAccelerator`]) or a wgpu device ([`GpuAccelerator`]).
//!
//! ```no_run
//! use arena_cnn::{
//!     CpuAccelerator, InMemoryPictures, LayerDescriptor, Network, PictureShape, PixelOrder,
//! };
//!
//! # fn main() -> Result<(), arena_cnn::errors::NetworkError> {
//! let mut network = Network::new(CpuAccelerator::new());
//! network.add_layer(LayerDescriptor::input(28, 28))?;
//! network.add_layer(LayerDescriptor::convolution(5, 5, 6))?;
//! network.add_layer(LayerDescriptor::max_pooling(2, 2, 6))?;
//! network.add_layer(LayerDescriptor::fully_connected(10))?;
//! network.generate_network()?;
//!
//! let shape = PictureShape { rows: 28, cols: 28, classes: 10, order: PixelOrder::RowMajor };
//! network.set_training_pictures(InMemoryPictures::synthetic(shape, 1000, 1)?);
//! let report = network.train(10, 100)?;
//! println!("final cost {:?}", report.final_cost());
//! # Ok(())
//! # }
//! ```

pub mod accelerator;
pub mod activation;
pub mod arena;
pub mod errors;
pub mod gpu;
pub mod kernels;
pub mod layer;
pub mod layer_graph;
pub mod network;
pub mod picture_source;
pub mod training_config;

pub use accelerator::{Accelerator, CpuAccelerator};
pub use activation::Activation;
pub use arena::{ArenaKind, ArenaLimits, MemoryArenaManager, SyncState};
pub use gpu::GpuAccelerator;
pub use layer::{FieldGeometry, LayerDescriptor, LayerKind};
pub use layer_graph::{LayerGraph, NetworkLayout};
pub use network::{Network, PassMode, TrainingReport};
pub use picture_source::{InMemoryPictures, PictureBatch, PictureShape, PictureSource, PixelOrder};
pub use training_config::TrainingConfig;
