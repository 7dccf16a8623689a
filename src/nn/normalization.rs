//! Normalization layers.
//!
//! Both layers create their affine parameters in a child scope of the
//! caller, so a convolution named `conv` that normalises its output owns
//! `conv/LayerNorm/scale` and `conv/LayerNorm/bias` (or the `BatchNorm`
//! equivalents).
//!
//! # References
//!
//! - Ba, J. L., et al. (2016). Layer normalization. arXiv:1607.06450.
//! - Ioffe, S., & Szegedy, C. (2015). Batch normalization. ICML.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::init::Initializer;
use super::scope::{Scope, VariableConfig};
use crate::autograd::{BatchStats, Tensor};
use crate::error::{ConvGateError, Result};

/// Epsilon used by [`layer_norm`].
pub const LAYER_NORM_EPSILON: f32 = 1e-6;

fn expect_channels(inputs: &Tensor, n_channels: usize, context: &str) -> Result<()> {
    let actual = inputs.shape().last().copied().unwrap_or(0);
    if inputs.ndim() == 0 || actual != n_channels {
        return Err(ConvGateError::channel_mismatch(context, n_channels, actual));
    }
    Ok(())
}

/// Layer normalization over the channel axis.
///
/// Creates `LayerNorm/scale` (ones) and `LayerNorm/bias` (zeros) of shape
/// `[n_channels]` under `scope`.
///
/// # Errors
///
/// Returns `ChannelMismatch` if the last dimension is not `n_channels`,
/// or a variable error from the scope.
pub fn layer_norm(scope: &Scope, inputs: &Tensor, n_channels: usize) -> Result<Tensor> {
    expect_channels(inputs, n_channels, "layer_norm")?;
    let scope = scope.sub("LayerNorm");

    let scale = scope.get_variable("scale", &[n_channels], &VariableConfig::new(Initializer::Ones))?;
    let bias = scope.get_variable("bias", &[n_channels], &VariableConfig::new(Initializer::Zeros))?;

    Ok(inputs.layer_norm(&scale, &bias, LAYER_NORM_EPSILON))
}

/// Batch normalization settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchNormConfig {
    /// Moving average decay
    pub decay: f32,
    /// Added to the variance before the square root
    pub epsilon: f32,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            decay: 0.999,
            epsilon: 1e-3,
        }
    }
}

impl BatchNormConfig {
    #[must_use]
    pub fn with_decay(mut self, decay: f32) -> Self {
        self.decay = decay;
        self
    }

    #[must_use]
    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.decay) {
            return Err(ConvGateError::invalid_config("decay", self.decay, "in [0, 1]"));
        }
        if self.epsilon.is_nan() || self.epsilon < 0.0 {
            return Err(ConvGateError::invalid_config("epsilon", self.epsilon, ">= 0"));
        }
        Ok(())
    }
}

/// Batch normalization with per-channel statistics.
///
/// Creates trainable `BatchNorm/beta` and `BatchNorm/gamma` plus
/// non-trainable `BatchNorm/moving_mean` and `BatchNorm/moving_variance`.
/// In training mode the batch statistics normalise the inputs and are
/// folded into the moving averages (`m = decay * m + (1 - decay) * batch`);
/// otherwise the moving statistics are used.
///
/// # Errors
///
/// Returns `InvalidConfig` for a decay outside `[0, 1]` or a negative
/// epsilon, or a variable error from the scope.
pub fn batch_norm(
    scope: &Scope,
    inputs: &Tensor,
    is_training: bool,
    config: &BatchNormConfig,
) -> Result<Tensor> {
    config.validate()?;
    let channels = inputs.shape().last().copied().unwrap_or(0);
    let scope = scope.sub("BatchNorm");

    let fixed = |init| VariableConfig::new(init).with_trainable(false);
    let beta = scope.get_variable("beta", &[channels], &VariableConfig::new(Initializer::Zeros))?;
    let gamma = scope.get_variable("gamma", &[channels], &VariableConfig::new(Initializer::Ones))?;
    let moving_mean = scope.get_variable("moving_mean", &[channels], &fixed(Initializer::Zeros))?;
    let moving_var = scope.get_variable("moving_variance", &[channels], &fixed(Initializer::Ones))?;

    if !is_training {
        let stats = BatchStats {
            mean: moving_mean.data().to_vec(),
            variance: moving_var.data().to_vec(),
        };
        return Ok(inputs.batch_norm_eval(&stats, &gamma, &beta, config.epsilon));
    }

    let (out, batch) = inputs.batch_norm_train(&gamma, &beta, config.epsilon);
    let decay = config.decay;
    let fold = |moving: &Tensor, batch: &[f32]| -> Tensor {
        let data = moving
            .data()
            .iter()
            .zip(batch)
            .map(|(&m, &b)| decay * m + (1.0 - decay) * b)
            .collect();
        Tensor::from_vec(data, &[channels])
    };
    scope.assign("moving_mean", &fold(&moving_mean, &batch.mean))?;
    scope.assign("moving_variance", &fold(&moving_var, &batch.variance))?;
    debug!(scope = %scope.path(), decay, "updated batch norm moving statistics");

    Ok(out)
}
