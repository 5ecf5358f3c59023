//! Where training and test examples come from.
//!
//! The engine never reads files itself; it pulls flat pixel and one-hot label
//! buffers from a [`PictureSource`].

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::errors::StateError;

/// Memory order of each picture's pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelOrder {
    /// Consecutive pixels run along a row (the usual image file order).
    #[default]
    RowMajor,
    /// Consecutive pixels run down a column, matching the node arena.
    ColumnMajor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureShape {
    pub rows: usize,
    pub cols: usize,
    pub classes: usize,
    pub order: PixelOrder,
}

impl PictureShape {
    pub fn pixels(&self) -> usize {
        self.rows * self.cols
    }
}

/// `count` examples: `count * rows * cols` pixels and `count * classes` label values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PictureBatch {
    pub pixels: Vec<f32>,
    pub labels: Vec<f32>,
    pub count: usize,
}

impl PictureBatch {
    /// Pixels and label of example `index`.
    pub fn example(&self, index: usize) -> (&[f32], &[f32]) {
        let pixels = self.pixels.len() / self.count;
        let classes = self.labels.len() / self.count;
        (
            &self.pixels[index * pixels..(index + 1) * pixels],
            &self.labels[index * classes..(index + 1) * classes],
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[f32], &[f32])> {
        (0..self.count).map(|i| self.example(i))
    }
}

/// A set of labelled pictures.
pub trait PictureSource: Send {
    fn shape(&self) -> PictureShape;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The next `batch_size` examples, wrapping around at the end of the set.
    fn next_batch(&mut self, batch_size: usize) -> PictureBatch;

    /// `count` examples starting at `start`, clamped to the end of the set.
    fn batch(&self, start: usize, count: usize) -> PictureBatch;
}

/// Pictures held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryPictures {
    shape: PictureShape,
    pixels: Vec<f32>,
    labels: Vec<f32>,
    len: usize,
    cursor: usize,
}

impl InMemoryPictures {
    /// Wraps flat buffers holding `pixels.len() / (rows * cols)` examples.
    pub fn new(
        shape: PictureShape,
        pixels: Vec<f32>,
        labels: Vec<f32>,
    ) -> Result<Self, StateError> {
        let len = if shape.pixels() == 0 { 0 } else { pixels.len() / shape.pixels() };
        if pixels.len() != len * shape.pixels() {
            return Err(StateError::ExampleSizeMismatch {
                expected: len * shape.pixels(),
                actual: pixels.len(),
            });
        }
        if labels.len() != len * shape.classes {
            return Err(StateError::ExampleSizeMismatch {
                expected: len * shape.classes,
                actual: labels.len(),
            });
        }
        Ok(Self {
            shape,
            pixels,
            labels,
            len,
            cursor: 0,
        })
    }

    /// Builds pictures from class indices instead of one-hot labels.
    pub fn from_class_indices(
        shape: PictureShape,
        pixels: Vec<f32>,
        classes: &[usize],
    ) -> Result<Self, StateError> {
        let mut labels = vec![0.0; classes.len() * shape.classes];
        for (i, &class) in classes.iter().enumerate() {
            if class >= shape.classes {
                return Err(StateError::ExampleSizeMismatch {
                    expected: shape.classes,
                    actual: class + 1,
                });
            }
            labels[i * shape.classes + class] = 1.0;
        }
        Self::new(shape, pixels, labels)
    }

    /// `len` random pictures where class `c` lights up the `c`-th horizontal band.
    ///
    /// Easy to separate, which makes it handy for smoke-testing training.
    pub fn synthetic(shape: PictureShape, len: usize, seed: u64) -> Result<Self, StateError> {
        if shape.classes == 0 {
            return Err(StateError::NoClasses);
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let band = (shape.rows / shape.classes).max(1);
        let mut pixels = Vec::with_capacity(len * shape.pixels());
        let mut labels = vec![0.0; len * shape.classes];

        for i in 0..len {
            let class = rng.gen_range(0..shape.classes);
            labels[i * shape.classes + class] = 1.0;
            for r in 0..shape.rows {
                for _ in 0..shape.cols {
                    let noise: f32 = rng.gen_range(0.0..0.1);
                    pixels.push(if r / band == class { 0.9 - noise } else { noise });
                }
            }
        }
        let mut pictures = Self {
            shape,
            pixels,
            labels,
            len,
            cursor: 0,
        };
        if shape.order == PixelOrder::ColumnMajor {
            pictures.transpose_pixels();
        }
        Ok(pictures)
    }

    /// Converts every picture from row-major to column-major storage.
    fn transpose_pixels(&mut self) {
        let (rows, cols) = (self.shape.rows, self.shape.cols);
        for picture in self.pixels.chunks_mut(rows * cols) {
            let row_major = picture.to_vec();
            for r in 0..rows {
                for c in 0..cols {
                    picture[c * rows + r] = row_major[r * cols + c];
                }
            }
        }
    }
}

impl PictureSource for InMemoryPictures {
    fn shape(&self) -> PictureShape {
        self.shape
    }

    fn len(&self) -> usize {
        self.len
    }

    fn next_batch(&mut self, batch_size: usize) -> PictureBatch {
        if self.len == 0 {
            return PictureBatch::default();
        }
        let (pixels, classes) = (self.shape.pixels(), self.shape.classes);
        let mut batch = PictureBatch {
            pixels: Vec::with_capacity(batch_size * pixels),
            labels: Vec::with_capacity(batch_size * classes),
            count: batch_size,
        };
        for _ in 0..batch_size {
            let i = self.cursor;
            batch.pixels.extend_from_slice(&self.pixels[i * pixels..(i + 1) * pixels]);
            batch.labels.extend_from_slice(&self.labels[i * classes..(i + 1) * classes]);
            self.cursor = (self.cursor + 1) % self.len;
        }
        batch
    }

    fn batch(&self, start: usize, count: usize) -> PictureBatch {
        let start = start.min(self.len);
        let end = (start + count).min(self.len);
        let (pixels, classes) = (self.shape.pixels(), self.shape.classes);
        PictureBatch {
            pixels: self.pixels[start * pixels..end * pixels].to_vec(),
            labels: self.labels[start * classes..end * classes].to_vec(),
            count: end - start,
        }
    }
}
