//! Computation graph for automatic differentiation.
//!
//! This module implements the tape-based recording of operations
//! and the backward pass algorithm.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::grad_fn::GradFn;
use super::no_grad;
use super::tensor::{Tensor, TensorId};

/// One output slot of a recorded operation.
#[derive(Debug, Clone)]
pub(crate) struct TapeOutput {
    pub id: TensorId,
    pub shape: Vec<usize>,
}

/// Entry in the computation tape.
#[derive(Clone)]
pub(crate) struct TapeEntry {
    /// Outputs produced by the operation, in order
    pub outputs: Vec<TapeOutput>,

    /// Function to compute gradients
    pub grad_fn: Arc<dyn GradFn>,

    /// IDs of input tensors
    pub input_ids: Vec<TensorId>,
}

/// Computation graph that records operations for backward pass.
///
/// The graph uses a tape-based approach where operations are recorded
/// in order during the forward pass, then gradients are computed in
/// reverse order during the backward pass. An operation may produce
/// several outputs; the backward rule then receives one gradient per
/// output, with zeros standing in for outputs nothing depended on.
///
/// # Thread Safety
///
/// Each thread has its own computation graph (via `thread_local` storage
/// in the parent module).
#[allow(missing_debug_implementations)]
pub struct ComputationGraph {
    tape: Vec<TapeEntry>,

    /// Map from tensor ID to tensor (for tensors that may need gradients)
    tensors: HashMap<TensorId, Tensor>,

    requires_grad: HashSet<TensorId>,
}

impl ComputationGraph {
    /// Create a new empty computation graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tape: Vec::new(),
            tensors: HashMap::new(),
            requires_grad: HashSet::new(),
        }
    }

    /// Clear all recorded operations.
    pub fn clear(&mut self) {
        self.tape.clear();
        self.tensors.clear();
        self.requires_grad.clear();
    }

    /// Register a tensor that may receive gradients.
    ///
    /// Registering the same ID twice keeps the first copy so gradients
    /// already accumulated on it survive.
    pub fn register_tensor(&mut self, tensor: Tensor) {
        if tensor.requires_grad_enabled() {
            self.requires_grad.insert(tensor.id());
        }
        self.tensors.entry(tensor.id()).or_insert(tensor);
    }

    /// Record a single-output operation to the tape.
    pub fn record(&mut self, output: &Tensor, grad_fn: Arc<dyn GradFn>, input_ids: Vec<TensorId>) {
        self.record_many(std::slice::from_ref(output), grad_fn, input_ids);
    }

    /// Record an operation producing several outputs.
    pub fn record_many(
        &mut self,
        outputs: &[Tensor],
        grad_fn: Arc<dyn GradFn>,
        input_ids: Vec<TensorId>,
    ) {
        let outputs = outputs
            .iter()
            .map(|t| TapeOutput {
                id: t.id(),
                shape: t.shape().to_vec(),
            })
            .collect();
        self.tape.push(TapeEntry {
            outputs,
            grad_fn,
            input_ids,
        });
    }

    /// Get a tensor by ID.
    #[must_use]
    pub fn get_tensor(&self, id: TensorId) -> Option<&Tensor> {
        self.tensors.get(&id)
    }

    /// Compute gradients via backpropagation.
    ///
    /// 1. Start with `grad_output` for the output tensor
    /// 2. Iterate through operations in reverse order
    /// 3. For each operation, compute gradients w.r.t. inputs
    /// 4. Accumulate gradients for tensors used multiple times
    ///
    /// Backward rules run with gradient recording disabled, so a rule may
    /// call ordinary tensor operations without touching this graph.
    ///
    /// # Panics
    ///
    /// Panics if a backward rule returns a different number of gradients
    /// than the operation had inputs.
    pub fn backward(&mut self, output_id: TensorId, grad_output: Tensor) {
        let mut grads: HashMap<TensorId, Tensor> = HashMap::new();
        grads.insert(output_id, grad_output);

        for entry in self.tape.iter().rev() {
            if !entry.outputs.iter().any(|o| grads.contains_key(&o.id)) {
                continue;
            }

            let grad_outs: Vec<Tensor> = entry
                .outputs
                .iter()
                .map(|o| {
                    grads
                        .get(&o.id)
                        .cloned()
                        .unwrap_or_else(|| Tensor::zeros(&o.shape))
                })
                .collect();

            let input_grads = no_grad(|| entry.grad_fn.backward(&grad_outs));
            assert_eq!(
                input_grads.len(),
                entry.input_ids.len(),
                "{} returned {} gradients for {} inputs",
                entry.grad_fn.name(),
                input_grads.len(),
                entry.input_ids.len()
            );

            for (input_id, input_grad) in entry.input_ids.iter().zip(input_grads) {
                grads
                    .entry(*input_id)
                    .and_modify(|existing| {
                        let new_data: Vec<f32> = existing
                            .data()
                            .iter()
                            .zip(input_grad.data().iter())
                            .map(|(a, b)| a + b)
                            .collect();
                        *existing = Tensor::from_vec(new_data, existing.shape());
                    })
                    .or_insert(input_grad);
            }
        }

        // Store gradients in leaf tensors
        for (id, grad) in grads {
            if let Some(tensor) = self.tensors.get_mut(&id) {
                if tensor.requires_grad_enabled() && tensor.is_leaf() {
                    tensor.accumulate_grad(grad);
                }
            }
        }
    }

    /// Get the number of recorded operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tape.len()
    }

    /// Check if the tape is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tape.is_empty()
    }

    /// Get gradient for a tensor by ID (after backward).
    #[must_use]
    pub fn get_grad(&self, id: TensorId) -> Option<Tensor> {
        self.tensors.get(&id).and_then(|t| t.grad().cloned())
    }

    /// Clear gradient for a specific tensor.
    pub fn clear_grad(&mut self, id: TensorId) {
        if let Some(tensor) = self.tensors.get_mut(&id) {
            tensor.clear_grad();
        }
    }
}

impl Default for ComputationGraph {
    fn default() -> Self {
        Self::new()
    }
}
