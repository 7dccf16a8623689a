//! Differentiable element-wise operations for tensors.
//!
//! Each operation:
//! 1. Computes the forward result
//! 2. Records a `GradFn` to the computation graph (if gradient tracking is enabled)

use std::sync::Arc;

use super::grad_fn::{
    AbsBackward, AddBackward, BroadcastAddBackward, ClampBackward, GradFn, MeanBackward,
    MulBackward, NegBackward, PowBackward, ReluBackward, ScaleBackward, ShiftBackward,
    SigmoidBackward, SubBackward, SumBackward, TanhBackward,
};
use super::tensor::Tensor;
use super::{is_grad_enabled, with_graph};

/// Attach a backward rule to `result` and record it on the tape when any
/// input tracks gradients.
///
/// `make` receives the forward result so rules that reuse the output
/// (sigmoid, tanh) can capture it.
pub(crate) fn track<G, F>(mut result: Tensor, inputs: &[&Tensor], make: F) -> Tensor
where
    G: GradFn + 'static,
    F: FnOnce(&Tensor) -> G,
{
    if is_grad_enabled() && inputs.iter().any(|t| t.requires_grad_enabled()) {
        let grad_fn: Arc<dyn GradFn> = Arc::new(make(&result));
        result.requires_grad_(true);
        result.set_grad_fn(Arc::clone(&grad_fn));

        with_graph(|graph| {
            for input in inputs {
                graph.register_tensor((*input).clone());
            }
            graph.record(&result, grad_fn, inputs.iter().map(|t| t.id()).collect());
        });
    }
    result
}

fn map(x: &Tensor, f: impl Fn(f32) -> f32) -> Tensor {
    Tensor::from_vec(x.data().iter().map(|&v| f(v)).collect(), x.shape())
}

fn zip_with(x: &Tensor, y: &Tensor, op: &str, f: impl Fn(f32, f32) -> f32) -> Tensor {
    assert_eq!(
        x.shape(),
        y.shape(),
        "{op}: shape mismatch {:?} vs {:?}",
        x.shape(),
        y.shape()
    );
    let data = x
        .data()
        .iter()
        .zip(y.data().iter())
        .map(|(&a, &b)| f(a, b))
        .collect();
    Tensor::from_vec(data, x.shape())
}

// ============================================================================
// Element-wise Operations
// ============================================================================

impl Tensor {
    /// Element-wise addition: z = self + other
    ///
    /// # Panics
    ///
    /// Panics if the shapes differ.
    #[must_use]
    pub fn add(&self, other: &Tensor) -> Tensor {
        let result = zip_with(self, other, "add", |a, b| a + b);
        track(result, &[self, other], |_| AddBackward)
    }

    /// Element-wise subtraction: z = self - other
    ///
    /// # Panics
    ///
    /// Panics if the shapes differ.
    #[must_use]
    pub fn sub(&self, other: &Tensor) -> Tensor {
        let result = zip_with(self, other, "sub", |a, b| a - b);
        track(result, &[self, other], |_| SubBackward)
    }

    /// Element-wise multiplication: z = self * other
    ///
    /// # Panics
    ///
    /// Panics if the shapes differ.
    #[must_use]
    pub fn mul(&self, other: &Tensor) -> Tensor {
        let result = zip_with(self, other, "mul", |a, b| a * b);
        track(result, &[self, other], |_| MulBackward {
            x: self.clone(),
            y: other.clone(),
        })
    }

    /// Element-wise negation: z = -self
    #[must_use]
    pub fn neg(&self) -> Tensor {
        track(map(self, |a| -a), &[self], |_| NegBackward)
    }

    /// Scalar multiplication: z = self * scalar
    #[must_use]
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        track(map(self, |a| a * scalar), &[self], |_| ScaleBackward {
            scale: scalar,
        })
    }

    /// Scalar addition: z = self + scalar
    #[must_use]
    pub fn add_scalar(&self, scalar: f32) -> Tensor {
        track(map(self, |a| a + scalar), &[self], |_| ShiftBackward)
    }

    /// Complement: z = 1 - self
    #[must_use]
    pub fn one_minus(&self) -> Tensor {
        self.neg().add_scalar(1.0)
    }

    /// Element-wise power: z = self^n
    #[must_use]
    pub fn pow(&self, n: f32) -> Tensor {
        track(map(self, |a| a.powf(n)), &[self], |_| PowBackward {
            x: self.clone(),
            n,
        })
    }

    /// Element-wise absolute value: z = |self|
    #[must_use]
    pub fn abs(&self) -> Tensor {
        track(map(self, f32::abs), &[self], |_| AbsBackward { x: self.clone() })
    }

    /// Add a vector along the last axis: z[..., c] = self[..., c] + bias[c]
    ///
    /// # Panics
    ///
    /// Panics if `bias` is not 1-D or its length differs from the last
    /// dimension of `self`.
    #[must_use]
    pub fn broadcast_add(&self, bias: &Tensor) -> Tensor {
        assert_eq!(bias.ndim(), 1, "broadcast_add requires 1D bias");
        let channels = self.last_dim();
        assert_eq!(
            channels,
            bias.numel(),
            "Last dimension {} must match bias length {}",
            channels,
            bias.numel()
        );

        let mut data = self.data().to_vec();
        for row in data.chunks_mut(channels) {
            for (v, &b) in row.iter_mut().zip(bias.data()) {
                *v += b;
            }
        }

        let result = Tensor::from_vec(data, self.shape());
        track(result, &[self, bias], |_| BroadcastAddBackward {
            bias_len: channels,
        })
    }
}

// ============================================================================
// Reduction Operations
// ============================================================================

impl Tensor {
    /// Sum all elements: z = sum(self)
    #[must_use]
    pub fn sum(&self) -> Tensor {
        let sum: f32 = self.data().iter().sum();
        track(Tensor::new(&[sum], &[1]), &[self], |_| SumBackward {
            input_shape: self.shape().to_vec(),
        })
    }

    /// Mean of all elements: z = mean(self)
    #[must_use]
    pub fn mean(&self) -> Tensor {
        let sum: f32 = self.data().iter().sum();
        let mean = sum / self.numel() as f32;
        track(Tensor::new(&[mean], &[1]), &[self], |_| MeanBackward {
            input_shape: self.shape().to_vec(),
        })
    }
}

// ============================================================================
// Activation Functions
// ============================================================================

impl Tensor {
    /// `ReLU` activation: z = max(0, self)
    #[must_use]
    pub fn relu(&self) -> Tensor {
        track(map(self, |a| a.max(0.0)), &[self], |_| ReluBackward {
            x: self.clone(),
        })
    }

    /// Sigmoid activation: z = 1 / (1 + exp(-self))
    #[must_use]
    pub fn sigmoid(&self) -> Tensor {
        let result = map(self, |a| 1.0 / (1.0 + (-a).exp()));
        track(result, &[self], |out| SigmoidBackward {
            output: out.clone(),
        })
    }

    /// Hyperbolic tangent activation.
    #[must_use]
    pub fn tanh(&self) -> Tensor {
        track(map(self, f32::tanh), &[self], |out| TanhBackward {
            output: out.clone(),
        })
    }

    /// Clamp every element to `[min, max]`.
    ///
    /// Gradients flow only through elements strictly inside the range.
    ///
    /// # Panics
    ///
    /// Panics if `min > max`.
    #[must_use]
    pub fn clamp(&self, min: f32, max: f32) -> Tensor {
        assert!(min <= max, "clamp: min {min} exceeds max {max}");
        track(map(self, |a| a.max(min).min(max)), &[self], |_| {
            ClampBackward {
                x: self.clone(),
                min,
                max,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{clear_graph, get_grad, no_grad};

    /// Numerical gradient check using central differences.
    fn numerical_gradient<F>(f: F, x: &Tensor, eps: f32) -> Tensor
    where
        F: Fn(&Tensor) -> Tensor,
    {
        let mut grad_data = vec![0.0; x.numel()];

        for i in 0..x.numel() {
            let mut x_plus = x.data().to_vec();
            let mut x_minus = x.data().to_vec();
            x_plus[i] += eps;
            x_minus[i] -= eps;

            let y_plus = no_grad(|| f(&Tensor::new(&x_plus, x.shape())).item());
            let y_minus = no_grad(|| f(&Tensor::new(&x_minus, x.shape())).item());

            grad_data[i] = (y_plus - y_minus) / (2.0 * eps);
        }

        Tensor::new(&grad_data, x.shape())
    }

    fn check_gradient<F>(f: F, x: &Tensor, eps: f32, tol: f32) -> bool
    where
        F: Fn(&Tensor) -> Tensor,
    {
        clear_graph();

        let x_grad = x.clone().requires_grad();
        let x_id = x_grad.id();
        let y = f(&x_grad);
        y.backward();

        let analytical = get_grad(x_id).expect("No gradient computed");
        let numerical = numerical_gradient(&f, x, eps);

        let max_diff: f32 = analytical
            .data()
            .iter()
            .zip(numerical.data().iter())
            .map(|(a, n)| (a - n).abs())
            .fold(0.0, f32::max);

        max_diff < tol
    }

    #[test]
    fn test_simple_sum_gradient() {
        clear_graph();

        let x = Tensor::from_slice(&[1.0, 2.0, 3.0]).requires_grad();
        let x_id = x.id();

        x.sum().backward();

        let grad = get_grad(x_id).expect("Gradient should exist");
        assert_eq!(grad.data(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_mul_gradient() {
        // d/dx sum(x * y) = y
        clear_graph();
        let x = Tensor::from_slice(&[1.0, 2.0, 3.0]).requires_grad();
        let y = Tensor::from_slice(&[4.0, 5.0, 6.0]);
        let x_id = x.id();

        x.mul(&y).sum().backward();

        let grad = get_grad(x_id).expect("Should have gradient");
        assert_eq!(grad.data(), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_reused_input_accumulates() {
        // d/dx sum(x * x) = 2x
        clear_graph();
        let x = Tensor::from_slice(&[1.0, -2.0]).requires_grad();
        let x_id = x.id();

        x.mul(&x).sum().backward();

        let grad = get_grad(x_id).expect("Should have gradient");
        assert_eq!(grad.data(), &[2.0, -4.0]);
    }

    #[test]
    fn test_one_minus_gradient() {
        clear_graph();
        let x = Tensor::from_slice(&[0.25, 0.75]).requires_grad();
        let x_id = x.id();

        let y = x.one_minus();
        assert_eq!(y.data(), &[0.75, 0.25]);
        y.sum().backward();

        let grad = get_grad(x_id).expect("Should have gradient");
        assert_eq!(grad.data(), &[-1.0, -1.0]);
    }

    #[test]
    fn test_sigmoid_gradient() {
        let x = Tensor::from_slice(&[-1.5, 0.0, 2.0]);
        assert!(check_gradient(|t| t.sigmoid().sum(), &x, 1e-3, 1e-2));
    }

    #[test]
    fn test_tanh_gradient() {
        let x = Tensor::from_slice(&[-0.7, 0.1, 1.3]);
        assert!(check_gradient(|t| t.tanh().sum(), &x, 1e-3, 1e-2));
    }

    #[test]
    fn test_pow_gradient() {
        let x = Tensor::from_slice(&[0.5, 1.5, -2.0]);
        assert!(check_gradient(|t| t.pow(2.0).sum(), &x, 1e-3, 1e-2));
    }

    #[test]
    fn test_clamp_forward_and_gradient() {
        clear_graph();
        let x = Tensor::from_slice(&[-1.0, 0.5, 2.0]).requires_grad();
        let x_id = x.id();

        let y = x.clamp(0.0, 1.0);
        assert_eq!(y.data(), &[0.0, 0.5, 1.0]);
        y.sum().backward();

        let grad = get_grad(x_id).expect("Should have gradient");
        assert_eq!(grad.data(), &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_broadcast_add_forward_and_gradient() {
        clear_graph();
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 2, 1, 2]).requires_grad();
        let b = Tensor::from_slice(&[10.0, 20.0]).requires_grad();
        let (x_id, b_id) = (x.id(), b.id());

        let y = x.broadcast_add(&b);
        assert_eq!(y.data(), &[11.0, 22.0, 13.0, 24.0]);
        y.sum().backward();

        assert_eq!(get_grad(x_id).expect("x grad").data(), &[1.0; 4]);
        assert_eq!(get_grad(b_id).expect("b grad").data(), &[2.0, 2.0]);
    }

    #[test]
    fn test_no_grad_skips_recording() {
        clear_graph();
        let x = Tensor::from_slice(&[1.0, 2.0]).requires_grad();
        let y = no_grad(|| x.mul_scalar(3.0));
        assert!(!y.requires_grad_enabled());
        assert!(y.is_leaf());
        assert!(crate::autograd::with_graph(|g| g.is_empty()));
    }

    #[test]
    #[should_panic(expected = "add: shape mismatch")]
    fn test_add_shape_mismatch_panics() {
        let _ = Tensor::zeros(&[2]).add(&Tensor::zeros(&[3]));
    }
}
