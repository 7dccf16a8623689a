//! Weight initialization.
//!
//! Proper initialization is critical for training deep networks.
//! This module provides initialization schemes from the literature:
//!
//! - Xavier/Glorot (Glorot & Bengio, 2010) - for tanh/sigmoid activations
//! - Kaiming/He (He et al., 2015) - for `ReLU` activations
//!
//! Layers pick an [`Initializer`] from their configuration; fan-in and
//! fan-out are derived from the variable shape (see [`fans`]).
//!
//! # References
//!
//! - Glorot, X., & Bengio, Y. (2010). Understanding the difficulty of training
//!   deep feedforward neural networks. AISTATS.
//! - He, K., et al. (2015). Delving deep into rectifiers: Surpassing human-level
//!   performance on `ImageNet` classification. ICCV.

use crate::autograd::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// How a variable is filled when it is first created.
///
/// # Example
///
/// ```
/// use convgate::nn::Initializer;
///
/// let bias = Initializer::Constant { value: 1.0 }.build(&[4]);
/// assert_eq!(bias.data(), &[1.0; 4]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    /// All zeros
    Zeros,
    /// All ones
    Ones,
    /// Every element set to `value`
    Constant {
        /// Fill value
        value: f32,
    },
    /// U(low, high)
    Uniform {
        /// Lower bound
        low: f32,
        /// Upper bound
        high: f32,
        /// Optional random seed
        #[serde(default)]
        seed: Option<u64>,
    },
    /// N(mean, std)
    Normal {
        /// Mean
        mean: f32,
        /// Standard deviation
        std: f32,
        /// Optional random seed
        #[serde(default)]
        seed: Option<u64>,
    },
    /// Glorot uniform
    XavierUniform {
        /// Optional random seed
        #[serde(default)]
        seed: Option<u64>,
    },
    /// Glorot normal
    XavierNormal {
        /// Optional random seed
        #[serde(default)]
        seed: Option<u64>,
    },
    /// He uniform
    KaimingUniform {
        /// Optional random seed
        #[serde(default)]
        seed: Option<u64>,
    },
    /// He normal
    KaimingNormal {
        /// Optional random seed
        #[serde(default)]
        seed: Option<u64>,
    },
}

impl Default for Initializer {
    fn default() -> Self {
        Self::KaimingNormal { seed: None }
    }
}

impl Initializer {
    /// Constant initializer.
    #[must_use]
    pub fn constant(value: f32) -> Self {
        Self::Constant { value }
    }

    /// Same initializer with a fixed seed; deterministic kinds are unchanged.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        match self {
            Self::Uniform { low, high, .. } => Self::Uniform {
                low,
                high,
                seed: Some(seed),
            },
            Self::Normal { mean, std, .. } => Self::Normal {
                mean,
                std,
                seed: Some(seed),
            },
            Self::XavierUniform { .. } => Self::XavierUniform { seed: Some(seed) },
            Self::XavierNormal { .. } => Self::XavierNormal { seed: Some(seed) },
            Self::KaimingUniform { .. } => Self::KaimingUniform { seed: Some(seed) },
            Self::KaimingNormal { .. } => Self::KaimingNormal { seed: Some(seed) },
            other => other,
        }
    }

    /// Create a tensor of `shape` filled by this scheme.
    #[must_use]
    pub fn build(&self, shape: &[usize]) -> Tensor {
        let (fan_in, fan_out) = fans(shape);
        match *self {
            Self::Zeros => constant(shape, 0.0),
            Self::Ones => constant(shape, 1.0),
            Self::Constant { value } => constant(shape, value),
            Self::Uniform { low, high, seed } => uniform(shape, low, high, seed),
            Self::Normal { mean, std, seed } => normal(shape, mean, std, seed),
            Self::XavierUniform { seed } => xavier_uniform(shape, fan_in, fan_out, seed),
            Self::XavierNormal { seed } => xavier_normal(shape, fan_in, fan_out, seed),
            Self::KaimingUniform { seed } => kaiming_uniform(shape, fan_in, seed),
            Self::KaimingNormal { seed } => kaiming_normal(shape, fan_in, seed),
        }
    }
}

/// Fan-in and fan-out of a variable shape.
///
/// Convolution kernels `[fh, fw, in, out]` have fan-in `fh * fw * in` and
/// fan-out `fh * fw * out`; vectors use their length for both.
#[must_use]
pub fn fans(shape: &[usize]) -> (usize, usize) {
    match shape.len() {
        0 => (1, 1),
        1 => (shape[0].max(1), shape[0].max(1)),
        n => {
            let receptive: usize = shape[..n - 2].iter().product();
            (
                (receptive * shape[n - 2]).max(1),
                (receptive * shape[n - 1]).max(1),
            )
        }
    }
}

/// Xavier uniform initialization (Glorot & Bengio, 2010).
///
/// Samples from U(-a, a) where a = sqrt(6 / (`fan_in` + `fan_out`)).
/// Suitable for tanh and sigmoid activations.
///
/// # Arguments
///
/// * `shape` - Shape of the tensor to initialize
/// * `fan_in` - Number of input features
/// * `fan_out` - Number of output features
/// * `seed` - Optional random seed for reproducibility
#[must_use]
pub fn xavier_uniform(shape: &[usize], fan_in: usize, fan_out: usize, seed: Option<u64>) -> Tensor {
    let a = (6.0 / (fan_in + fan_out) as f32).sqrt();
    uniform(shape, -a, a, seed)
}

/// Xavier normal initialization (Glorot & Bengio, 2010).
///
/// Samples from N(0, std) where std = sqrt(2 / (`fan_in` + `fan_out`)).
#[must_use]
pub fn xavier_normal(shape: &[usize], fan_in: usize, fan_out: usize, seed: Option<u64>) -> Tensor {
    let std = (2.0 / (fan_in + fan_out) as f32).sqrt();
    normal(shape, 0.0, std, seed)
}

/// Kaiming uniform initialization (He et al., 2015).
///
/// Samples from U(-bound, bound) where bound = sqrt(6 / `fan_in`).
#[must_use]
pub fn kaiming_uniform(shape: &[usize], fan_in: usize, seed: Option<u64>) -> Tensor {
    let bound = (6.0 / fan_in as f32).sqrt();
    uniform(shape, -bound, bound, seed)
}

/// Kaiming normal initialization (He et al., 2015).
///
/// Samples from N(0, std) where std = sqrt(2 / `fan_in`).
#[must_use]
pub fn kaiming_normal(shape: &[usize], fan_in: usize, seed: Option<u64>) -> Tensor {
    let std = (2.0 / fan_in as f32).sqrt();
    normal(shape, 0.0, std, seed)
}

fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// Samples from U(low, high).
pub(crate) fn uniform(shape: &[usize], low: f32, high: f32, seed: Option<u64>) -> Tensor {
    let numel: usize = shape.iter().product();
    if low >= high {
        return constant(shape, low);
    }
    let mut rng = rng_for(seed);
    let data: Vec<f32> = (0..numel).map(|_| rng.gen_range(low..high)).collect();
    Tensor::from_vec(data, shape)
}

/// Samples from N(mean, std).
pub(crate) fn normal(shape: &[usize], mean: f32, std: f32, seed: Option<u64>) -> Tensor {
    let numel: usize = shape.iter().product();
    let mut rng = rng_for(seed);

    // Box-Muller transform for normal distribution
    let data: Vec<f32> = (0..numel)
        .map(|_| {
            let u1: f32 = rng.gen_range(0.0001_f32..1.0_f32);
            let u2: f32 = rng.gen_range(0.0_f32..1.0_f32);
            let z = (-2.0_f32 * u1.ln()).sqrt() * (2.0_f32 * std::f32::consts::PI * u2).cos();
            mean + std * z
        })
        .collect();

    Tensor::from_vec(data, shape)
}

pub(crate) fn constant(shape: &[usize], value: f32) -> Tensor {
    Tensor::full(shape, value)
}
