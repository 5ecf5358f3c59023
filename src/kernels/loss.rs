//! Softmax + cross-entropy over the output layer.
//!
//! Runs as a single unit. Uses `in_offset` (output nodes, and their gradients),
//! `in_x` (classes), `scratch_offset` (start of the loss slots) and
//! [`FLAG_WRITE_DERIVATIVES`].

use crate::activation::{self, Activation};
use crate::layer_graph::LossSlots;

use super::{ArenaReads, FLAG_WRITE_DERIVATIVES, KernelParams};

/// Everything the loss kernel writes for one example.
#[derive(Debug, Clone, PartialEq)]
pub struct LossOutcome {
    pub probabilities: Vec<f32>,
    pub cost: f32,
    pub correct: bool,
    /// `p - y`, present when the launch asked for derivatives.
    pub derivatives: Option<Vec<f32>>,
}

pub fn softmax_cross_entropy(p: &KernelParams, arenas: &ArenaReads<'_>) -> LossOutcome {
    let classes = p.in_x as usize;
    let slots = LossSlots::at(p.scratch_offset as usize, classes);
    let output = p.in_offset as usize;

    let mut probabilities = arenas.nodes()[output..output + classes].to_vec();
    Activation::Softmax.apply_in_place(&mut probabilities);
    let labels = &arenas.scratch()[slots.labels..slots.labels + classes];

    let cost = activation::cross_entropy(&probabilities, labels);
    let correct = activation::arg_max(&probabilities) == activation::arg_max(labels);
    let derivatives = p.has_flag(FLAG_WRITE_DERIVATIVES).then(|| {
        probabilities
            .iter()
            .zip(labels)
            .map(|(&p, &y)| p - y)
            .collect()
    });

    LossOutcome {
        probabilities,
        cost,
        correct,
        derivatives,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_output_costs_ln_classes() {
        let nodes = [0.3, 0.3, 0.3, 0.3];
        let mut scratch = vec![0.0; LossSlots::at(0, 4).region_len()];
        scratch[2] = 1.0;
        let params = KernelParams {
            count: 1,
            in_x: 4,
            flags: FLAG_WRITE_DERIVATIVES,
            ..Default::default()
        };
        let arenas = ArenaReads::new([&nodes, &[], &[], &[], &[], &[], &scratch]);
        let outcome = softmax_cross_entropy(&params, &arenas);

        assert!((outcome.cost - 4.0_f32.ln()).abs() < 1e-5);
        // All probabilities tie, so the arg-max is class 0.
        assert!(!outcome.correct);
        let derivatives = outcome.derivatives.unwrap();
        assert!((derivatives[2] + 0.75).abs() < 1e-6);
        assert!((derivatives.iter().sum::<f32>()).abs() < 1e-6);
    }

    #[test]
    fn test_inference_skips_derivatives() {
        let nodes = [0.9, 0.1];
        let scratch = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let params = KernelParams {
            count: 1,
            in_x: 2,
            ..Default::default()
        };
        let arenas = ArenaReads::new([&nodes, &[], &[], &[], &[], &[], &scratch]);
        let outcome = softmax_cross_entropy(&params, &arenas);
        assert!(outcome.correct);
        assert_eq!(outcome.derivatives, None);
    }
}
