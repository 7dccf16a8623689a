//! Activation functions applied at the end of a layer.

use serde::{Deserialize, Serialize};

use crate::autograd::Tensor;

/// Saturating sigmoid: `clamp(1.2 * sigmoid(x) - 0.1, 0, 1)`.
///
/// Reaches exactly 0 below `x ≈ -2.4` and exactly 1 above `x ≈ 2.4`, which
/// lets gates close or open completely. Gradient is zero in the saturated
/// regions.
///
/// # Example
///
/// ```
/// use convgate::autograd::Tensor;
/// use convgate::nn::saturating_sigmoid;
///
/// let y = saturating_sigmoid(&Tensor::from_slice(&[-10.0, 0.0, 10.0]));
/// assert_eq!(y.data()[0], 0.0);
/// assert!((y.data()[1] - 0.5).abs() < 1e-6);
/// assert_eq!(y.data()[2], 1.0);
/// ```
#[must_use]
pub fn saturating_sigmoid(x: &Tensor) -> Tensor {
    x.sigmoid().mul_scalar(1.2).add_scalar(-0.1).clamp(0.0, 1.0)
}

/// Activation selected by a layer configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Identity
    #[default]
    Linear,
    /// max(0, x)
    Relu,
    /// 1 / (1 + e^-x)
    Sigmoid,
    /// Hyperbolic tangent
    Tanh,
    /// See [`saturating_sigmoid`]
    SaturatingSigmoid,
}

impl Activation {
    /// Apply the activation.
    #[must_use]
    pub fn apply(self, x: &Tensor) -> Tensor {
        match self {
            Self::Linear => x.clone(),
            Self::Relu => x.relu(),
            Self::Sigmoid => x.sigmoid(),
            Self::Tanh => x.tanh(),
            Self::SaturatingSigmoid => saturating_sigmoid(x),
        }
    }
}
