//! Gradient function trait and element-wise implementations.
//!
//! Each differentiable operation implements `GradFn` to define
//! how gradients flow backward through the operation. Rank-4 spatial
//! and normalisation rules live next to their forward passes in
//! [`super::nhwc`] and [`super::norm`].

use super::tensor::Tensor;

/// Trait for functions that compute gradients during backward pass.
///
/// Each differentiable operation creates a `GradFn` implementation
/// that captures the necessary context for gradient computation.
///
/// # Example Implementation
///
/// For element-wise addition z = x + y:
/// - ∂z/∂x = 1
/// - ∂z/∂y = 1
///
/// So `backward(&[grad_output])` returns [`grad_output`, `grad_output`].
pub trait GradFn: Send + Sync {
    /// Compute gradients with respect to inputs.
    ///
    /// # Arguments
    ///
    /// * `grad_outputs` - One gradient per output of the operation, in the
    ///   order the outputs were recorded. Single-output operations receive
    ///   a one-element slice.
    ///
    /// # Returns
    ///
    /// Vector of gradients, one for each input tensor.
    /// The order must match the input order used during forward pass.
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor>;

    /// Human-readable name for debugging.
    fn name(&self) -> &'static str;
}

/// Map `grad` element-wise with `f(g, saved)`.
fn zip_map(grad: &Tensor, saved: &Tensor, f: impl Fn(f32, f32) -> f32) -> Tensor {
    let data: Vec<f32> = grad
        .data()
        .iter()
        .zip(saved.data().iter())
        .map(|(&g, &s)| f(g, s))
        .collect();
    Tensor::from_vec(data, grad.shape())
}

// ============================================================================
// Element-wise Operations
// ============================================================================

/// Gradient function for addition: z = x + y
pub(crate) struct AddBackward;

impl GradFn for AddBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        // ∂(x+y)/∂x = 1, ∂(x+y)/∂y = 1
        vec![grad_outputs[0].clone(), grad_outputs[0].clone()]
    }

    fn name(&self) -> &'static str {
        "AddBackward"
    }
}

/// Gradient function for subtraction: z = x - y
pub(crate) struct SubBackward;

impl GradFn for SubBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        let g = &grad_outputs[0];
        let neg: Vec<f32> = g.data().iter().map(|&v| -v).collect();
        vec![g.clone(), Tensor::from_vec(neg, g.shape())]
    }

    fn name(&self) -> &'static str {
        "SubBackward"
    }
}

/// Gradient function for multiplication: z = x * y
pub(crate) struct MulBackward {
    pub(crate) x: Tensor,
    pub(crate) y: Tensor,
}

impl GradFn for MulBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        // ∂(x*y)/∂x = y, ∂(x*y)/∂y = x
        let g = &grad_outputs[0];
        vec![
            zip_map(g, &self.y, |g, y| g * y),
            zip_map(g, &self.x, |g, x| g * x),
        ]
    }

    fn name(&self) -> &'static str {
        "MulBackward"
    }
}

/// Gradient function for scaling by a constant: z = x * c
pub(crate) struct ScaleBackward {
    pub(crate) scale: f32,
}

impl GradFn for ScaleBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        let g = &grad_outputs[0];
        let data: Vec<f32> = g.data().iter().map(|&v| v * self.scale).collect();
        vec![Tensor::from_vec(data, g.shape())]
    }

    fn name(&self) -> &'static str {
        "ScaleBackward"
    }
}

/// Gradient function for shifting by a constant: z = x + c
pub(crate) struct ShiftBackward;

impl GradFn for ShiftBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        vec![grad_outputs[0].clone()]
    }

    fn name(&self) -> &'static str {
        "ShiftBackward"
    }
}

/// Gradient function for negation: z = -x
pub(crate) struct NegBackward;

impl GradFn for NegBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        let g = &grad_outputs[0];
        let data: Vec<f32> = g.data().iter().map(|&v| -v).collect();
        vec![Tensor::from_vec(data, g.shape())]
    }

    fn name(&self) -> &'static str {
        "NegBackward"
    }
}

/// Gradient function for pow: z = x^n
pub(crate) struct PowBackward {
    pub(crate) x: Tensor,
    pub(crate) n: f32,
}

impl GradFn for PowBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        // ∂(x^n)/∂x = n * x^(n-1)
        let n = self.n;
        vec![zip_map(&grad_outputs[0], &self.x, |g, x| {
            g * n * x.powf(n - 1.0)
        })]
    }

    fn name(&self) -> &'static str {
        "PowBackward"
    }
}

/// Gradient function for abs: z = |x|
pub(crate) struct AbsBackward {
    pub(crate) x: Tensor,
}

impl GradFn for AbsBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        vec![zip_map(&grad_outputs[0], &self.x, |g, x| {
            if x > 0.0 {
                g
            } else if x < 0.0 {
                -g
            } else {
                0.0
            }
        })]
    }

    fn name(&self) -> &'static str {
        "AbsBackward"
    }
}

/// Gradient function for adding a vector along the last axis: z = x + b
pub(crate) struct BroadcastAddBackward {
    pub(crate) bias_len: usize,
}

impl GradFn for BroadcastAddBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        let g = &grad_outputs[0];
        let mut grad_bias = vec![0.0; self.bias_len];
        for row in g.data().chunks(self.bias_len) {
            for (acc, &v) in grad_bias.iter_mut().zip(row) {
                *acc += v;
            }
        }
        vec![g.clone(), Tensor::from_vec(grad_bias, &[self.bias_len])]
    }

    fn name(&self) -> &'static str {
        "BroadcastAddBackward"
    }
}

// ============================================================================
// Reduction Operations
// ============================================================================

/// Gradient function for sum: z = sum(x)
pub(crate) struct SumBackward {
    pub(crate) input_shape: Vec<usize>,
}

impl GradFn for SumBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        // ∂sum(x)/∂x_i = 1 for all i
        vec![Tensor::full(&self.input_shape, grad_outputs[0].item())]
    }

    fn name(&self) -> &'static str {
        "SumBackward"
    }
}

/// Gradient function for mean: z = mean(x)
pub(crate) struct MeanBackward {
    pub(crate) input_shape: Vec<usize>,
}

impl GradFn for MeanBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        let numel: usize = self.input_shape.iter().product();
        let grad_val = grad_outputs[0].item() / numel as f32;
        vec![Tensor::full(&self.input_shape, grad_val)]
    }

    fn name(&self) -> &'static str {
        "MeanBackward"
    }
}

// ============================================================================
// Activation Functions
// ============================================================================

/// Gradient function for `ReLU`: z = max(0, x)
pub(crate) struct ReluBackward {
    pub(crate) x: Tensor,
}

impl GradFn for ReluBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        vec![zip_map(&grad_outputs[0], &self.x, |g, x| {
            if x > 0.0 {
                g
            } else {
                0.0
            }
        })]
    }

    fn name(&self) -> &'static str {
        "ReluBackward"
    }
}

/// Gradient function for sigmoid: z = σ(x)
pub(crate) struct SigmoidBackward {
    pub(crate) output: Tensor,
}

impl GradFn for SigmoidBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        // ∂σ(x)/∂x = σ(x) * (1 - σ(x))
        vec![zip_map(&grad_outputs[0], &self.output, |g, s| {
            g * s * (1.0 - s)
        })]
    }

    fn name(&self) -> &'static str {
        "SigmoidBackward"
    }
}

/// Gradient function for tanh: z = tanh(x)
pub(crate) struct TanhBackward {
    pub(crate) output: Tensor,
}

impl GradFn for TanhBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        // ∂tanh(x)/∂x = 1 - tanh²(x)
        vec![zip_map(&grad_outputs[0], &self.output, |g, t| {
            g * (1.0 - t * t)
        })]
    }

    fn name(&self) -> &'static str {
        "TanhBackward"
    }
}

/// Gradient function for clamp: z = min(max(x, lo), hi)
///
/// Gradient passes only where `lo < x < hi`; saturated elements get zero.
pub(crate) struct ClampBackward {
    pub(crate) x: Tensor,
    pub(crate) min: f32,
    pub(crate) max: f32,
}

impl GradFn for ClampBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        let (lo, hi) = (self.min, self.max);
        vec![zip_map(&grad_outputs[0], &self.x, |g, x| {
            if x > lo && x < hi {
                g
            } else {
                0.0
            }
        })]
    }

    fn name(&self) -> &'static str {
        "ClampBackward"
    }
}
