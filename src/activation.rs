//! Activation and loss math shared by the CPU kernels.
//!
//! The WGSL kernels in `gpu/shaders` carry their own copies of these formulas;
//! both sides must agree to within float rounding.

/// Activation functions used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Element-wise [`sigmoid`], applied by the convolution and fully-connected kernels.
    Sigmoid,
    /// Softmax activation function:
    ///
    /// Applies the numerically stable Softmax function across a vector to produce
    /// a probability distribution:
    /// ```text
    /// Softmax(x_i) = exp(x_i - max(x)) / sum_j exp(x_j - max(x))
    /// ```
    ///
    /// Only used on the output layer to turn activations into class probabilities.
    Softmax,
}

/// f(x) = 1 / (1 + exp(-x)).
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Sigmoid derivative expressed through its own output `a`: `a * (1 - a)`.
///
/// Lets the backward kernels work from the stored activations without keeping
/// pre-activations.
pub fn sigmoid_derivative_from_output(a: f32) -> f32 {
    a * (1.0 - a)
}

impl Activation {
    /// Apply the activation function to a slice of values in place.
    pub fn apply_in_place(self, values: &mut [f32]) {
        match self {
            Activation::Softmax => {
                let max_val = values.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                let mut sum = 0.0f32;

                for val in values.iter_mut() {
                    *val = (*val - max_val).exp();
                    sum += *val;
                }

                for val in values.iter_mut() {
                    *val /= sum;
                }
            }
            Activation::Sigmoid => {
                for val in values.iter_mut() {
                    *val = sigmoid(*val);
                }
            }
        }
    }
}

/// Smallest probability fed to the logarithm of the cross-entropy.
pub const PROBABILITY_FLOOR: f32 = 1e-12;

/// Cross-entropy of `probabilities` against a (one-hot) `expected` vector.
pub fn cross_entropy(probabilities: &[f32], expected: &[f32]) -> f32 {
    probabilities
        .iter()
        .zip(expected)
        .filter(|&(_, &y)| y > 0.0)
        .map(|(&p, &y)| -y * p.max(PROBABILITY_FLOOR).ln())
        .sum()
}

/// Index of the first maximum of `values`.
pub fn arg_max(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &value) in values.iter().enumerate().skip(1) {
        if value > values[best] {
            best = i;
        }
    }
    best
}
