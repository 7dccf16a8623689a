//! Convolutional recurrent cells.
//!
//! Both cells replace the dense projections of their classic counterparts
//! with [`conv2d_v2`] so that the recurrence runs over feature maps.
//!
//! # References
//!
//! - Kaiser, Ł., & Sutskever, I. (2016). Neural GPUs learn algorithms. ICLR.
//! - Shi, X., et al. (2015). Convolutional LSTM network: A machine learning
//!   approach for precipitation nowcasting. `NeurIPS`.

use tracing::{debug, instrument};

use super::activation::saturating_sigmoid;
use super::conv::{conv2d_v2, nhwc_dims, Conv2dConfig, Padding};
use super::init::Initializer;
use super::normalization::layer_norm;
use super::scope::Scope;
use crate::autograd::Tensor;
use crate::error::{ConvGateError, Result};

impl Conv2dConfig {
    /// Defaults of [`conv2d_gru`]: scope `conv2d_gru`, 3x3 filter, `Same`.
    #[must_use]
    pub fn conv2d_gru() -> Self {
        Self::default().with_name("conv2d_gru").with_filter_size(3)
    }

    /// Defaults of [`conv2d_lstm`]: scope `conv2d_lstm`, 3x3 filter, `Same`.
    #[must_use]
    pub fn conv2d_lstm() -> Self {
        Self::default().with_name("conv2d_lstm").with_filter_size(3)
    }
}

/// `config` with the default filter size filled in, so `Left` padding
/// works without an explicit filter.
fn with_resolved_filter(config: &Conv2dConfig) -> Conv2dConfig {
    Conv2dConfig {
        filter_size: Some(config.resolved_filter_size()),
        ..config.clone()
    }
}

/// Reject padding modes under which a convolution changes the spatial size.
fn ensure_shape_preserving(config: &Conv2dConfig, context: &str) -> Result<()> {
    let filter = config.resolved_filter_size();
    if config.padding == Padding::Valid && (filter.height > 1 || filter.width > 1) {
        return Err(ConvGateError::invalid_config(
            "padding",
            config.padding,
            &format!("SAME or LEFT for {context} with a {filter} filter"),
        ));
    }
    Ok(())
}

/// Convolutional GRU cell.
///
/// ```text
/// reset     = saturating_sigmoid(conv_reset(x))
/// gate      = saturating_sigmoid(conv_gate(x))
/// candidate = tanh(conv_candidate(reset * x))
/// out       = gate * x + (1 - gate) * candidate
/// ```
///
/// The three convolutions live in `<name>/reset`, `<name>/gate` and
/// `<name>/candidate`; the first two start with biases of 1.0, the
/// candidate with 0.0. Every other setting of `config` (filter size,
/// dilation, padding, initializers, normaliser) is shared by all three.
///
/// # Errors
///
/// - `InvalidRank` if `inputs` is not rank 4
/// - `ChannelMismatch` unless the input has `n_output_channels` channels
/// - `InvalidConfig` for `Valid` padding with a filter larger than 1x1
/// - anything [`conv2d_v2`] reports
#[instrument(level = "debug", skip(scope, inputs, config), fields(scope = %scope.path(), name = %config.name))]
pub fn conv2d_gru(
    scope: &Scope,
    inputs: &Tensor,
    n_output_channels: usize,
    is_training: bool,
    reuse: bool,
    config: &Conv2dConfig,
) -> Result<Tensor> {
    let [_, _, _, channels] = nhwc_dims(inputs, "conv2d_gru")?;
    if channels != n_output_channels {
        return Err(ConvGateError::channel_mismatch("conv2d_gru", n_output_channels, channels));
    }
    let config = &with_resolved_filter(config);
    ensure_shape_preserving(config, "conv2d_gru")?;

    let scope = scope.sub(&config.name).reuse(reuse);
    let conv = |x: &Tensor, name: &str, bias_start: f32| {
        let cfg = config
            .clone()
            .with_name(name)
            .with_b_init(Some(Initializer::constant(bias_start)));
        conv2d_v2(&scope, x, n_output_channels, is_training, reuse, &cfg)
    };

    let reset = saturating_sigmoid(&conv(inputs, "reset", 1.0)?);
    let gate = saturating_sigmoid(&conv(inputs, "gate", 1.0)?);
    let candidate = conv(&reset.mul(inputs), "candidate", 0.0)?.tanh();

    debug!("conv2d_gru built");
    Ok(gate.mul(inputs).add(&gate.one_minus().mul(&candidate)))
}

/// Hidden and cell state carried between [`conv2d_lstm`] steps.
#[derive(Debug, Clone)]
pub struct ConvLstmState {
    /// Output of the previous step, `[batch, height, width, channels]`
    pub hidden: Tensor,
    /// Cell memory, same shape as `hidden`
    pub cell: Tensor,
}

impl ConvLstmState {
    /// All-zero state.
    #[must_use]
    pub fn zeros(batch: usize, height: usize, width: usize, channels: usize) -> Self {
        let shape = [batch, height, width, channels];
        Self {
            hidden: Tensor::zeros(&shape),
            cell: Tensor::zeros(&shape),
        }
    }

    fn check(&self, expected: &[usize]) -> Result<()> {
        for (part, t) in [("hidden", &self.hidden), ("cell", &self.cell)] {
            if t.shape() != expected {
                return Err(ConvGateError::ShapeMismatch {
                    context: format!("conv2d_lstm {part} state"),
                    expected: expected.to_vec(),
                    actual: t.shape().to_vec(),
                });
            }
        }
        Ok(())
    }
}

/// Convolutional LSTM cell.
///
/// One convolution `<name>/gates` over `concat(x, h_prev)` produces
/// `4 * n_output_channels` pre-activations, which are layer-normalised
/// (`<name>/LayerNorm`) and split into forget, input, output and
/// candidate parts:
///
/// ```text
/// c = sigmoid(f) * c_prev + sigmoid(i) * tanh(g)
/// h = sigmoid(o) * tanh(c)
/// ```
///
/// A missing `state` starts from zeros. Returns `h` together with the new
/// state.
///
/// # Errors
///
/// - `InvalidRank` if `inputs` is not rank 4
/// - `ShapeMismatch` if the state does not match
///   `[batch, height, width, n_output_channels]`
/// - `InvalidConfig` for `Valid` padding with a filter larger than 1x1
/// - anything [`conv2d_v2`] or [`layer_norm`] reports
#[instrument(level = "debug", skip(scope, inputs, state, config), fields(scope = %scope.path(), name = %config.name))]
pub fn conv2d_lstm(
    scope: &Scope,
    inputs: &Tensor,
    state: Option<&ConvLstmState>,
    n_output_channels: usize,
    is_training: bool,
    reuse: bool,
    config: &Conv2dConfig,
) -> Result<(Tensor, ConvLstmState)> {
    let [batch, height, width, _] = nhwc_dims(inputs, "conv2d_lstm")?;
    let config = &with_resolved_filter(config);
    ensure_shape_preserving(config, "conv2d_lstm")?;

    let zeros;
    let state = match state {
        Some(s) => {
            s.check(&[batch, height, width, n_output_channels])?;
            s
        }
        None => {
            zeros = ConvLstmState::zeros(batch, height, width, n_output_channels);
            &zeros
        }
    };

    let scope = scope.sub(&config.name).reuse(reuse);
    let stacked = Tensor::concat_channels(&[inputs, &state.hidden]);
    let gates_cfg = config.clone().with_name("gates");
    let gates = conv2d_v2(&scope, &stacked, 4 * n_output_channels, is_training, reuse, &gates_cfg)?;
    let gates = layer_norm(&scope, &gates, 4 * n_output_channels)?;

    let parts = gates.split_channels(4);
    let (forget, input, output, candidate) = (&parts[0], &parts[1], &parts[2], &parts[3]);

    let cell = forget
        .sigmoid()
        .mul(&state.cell)
        .add(&input.sigmoid().mul(&candidate.tanh()));
    let hidden = output.sigmoid().mul(&cell.tanh());

    debug!(shape = ?hidden.shape(), "conv2d_lstm step");
    Ok((hidden.clone(), ConvLstmState { hidden, cell }))
}
