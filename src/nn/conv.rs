//! Dilated 2-D convolution layers for NHWC inputs.
//!
//! [`dilated_conv2d`] creates `weights` (and `biases` or a normaliser) in a
//! scope named after the layer and convolves with stride 1. [`conv2d_v2`]
//! adds a causal `Left` padding mode on top: the input is zero-padded only
//! above and to the left (see [`format_input_left_padding`]) so that every
//! output position depends on inputs at or before it.
//!
//! # References
//!
//! - Yu, F., & Koltun, V. (2016). Multi-scale context aggregation by dilated
//!   convolutions. ICLR.
//! - van den Oord, A., et al. (2016). `WaveNet`: A generative model for raw
//!   audio. arXiv:1609.03499.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::activation::Activation;
use super::init::Initializer;
use super::normalization::{batch_norm, layer_norm, BatchNormConfig};
use super::scope::{Regularizer, Scope, VariableConfig};
use crate::autograd::{SpatialPadding, Tensor};
use crate::error::{ConvGateError, Result};

/// Filter size used when a configuration leaves it unset.
pub const DEFAULT_FILTER_SIZE: FilterSize = FilterSize {
    height: 3,
    width: 3,
};

/// Spatial extent of a convolution filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSize {
    /// Rows
    pub height: usize,
    /// Columns
    pub width: usize,
}

impl FilterSize {
    /// Whether both dimensions are odd.
    #[must_use]
    pub fn is_odd(&self) -> bool {
        self.height % 2 == 1 && self.width % 2 == 1
    }
}

impl From<usize> for FilterSize {
    fn from(size: usize) -> Self {
        Self {
            height: size,
            width: size,
        }
    }
}

impl From<(usize, usize)> for FilterSize {
    fn from((height, width): (usize, usize)) -> Self {
        Self { height, width }
    }
}

impl fmt::Display for FilterSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// Dilation rate along the height and width axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dilation {
    /// Row step between filter taps
    pub height: usize,
    /// Column step between filter taps
    pub width: usize,
}

impl Default for Dilation {
    fn default() -> Self {
        Self::from(1)
    }
}

impl From<usize> for Dilation {
    fn from(rate: usize) -> Self {
        Self {
            height: rate,
            width: rate,
        }
    }
}

impl From<(usize, usize)> for Dilation {
    fn from((height, width): (usize, usize)) -> Self {
        Self { height, width }
    }
}

/// How the input is padded before convolving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Output keeps the input size; odd padding goes after
    #[default]
    Same,
    /// No padding
    Valid,
    /// Causal padding above and to the left, then `Valid`
    Left,
}

impl fmt::Display for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Same => "SAME",
            Self::Valid => "VALID",
            Self::Left => "LEFT",
        };
        f.write_str(name)
    }
}

/// Normalisation applied to the convolution output instead of a bias.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalizer {
    /// Layer norm over channels
    LayerNorm,
    /// Batch norm with moving statistics
    BatchNorm(BatchNormConfig),
}

/// Configuration of a convolution layer.
///
/// # Example
///
/// ```
/// use convgate::nn::{Activation, Conv2dConfig, Padding};
///
/// let cfg = Conv2dConfig::default()
///     .with_name("causal")
///     .with_filter_size((3, 1))
///     .with_dilation(2)
///     .with_padding(Padding::Left)
///     .with_activation(Activation::Relu);
/// assert_eq!(cfg.dilation.height, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conv2dConfig {
    /// Filter size; [`DEFAULT_FILTER_SIZE`] when unset, except that
    /// `Left` padding requires it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_size: Option<FilterSize>,
    pub dilation: Dilation,
    pub padding: Padding,
    pub activation: Activation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalizer: Option<Normalizer>,
    pub w_init: Initializer,
    /// Bias initializer; `None` disables the bias
    pub b_init: Option<Initializer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w_regularizer: Option<Regularizer>,
    pub trainable: bool,
    pub use_bias: bool,
    /// Scope name of the layer
    pub name: String,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            filter_size: None,
            dilation: Dilation::default(),
            padding: Padding::Same,
            activation: Activation::Linear,
            normalizer: None,
            w_init: Initializer::default(),
            b_init: Some(Initializer::constant(0.0)),
            w_regularizer: None,
            trainable: true,
            use_bias: true,
            name: "conv2d".to_string(),
        }
    }
}

impl Conv2dConfig {
    #[must_use]
    pub fn with_filter_size(mut self, size: impl Into<FilterSize>) -> Self {
        self.filter_size = Some(size.into());
        self
    }

    #[must_use]
    pub fn with_dilation(mut self, dilation: impl Into<Dilation>) -> Self {
        self.dilation = dilation.into();
        self
    }

    #[must_use]
    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    #[must_use]
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    #[must_use]
    pub fn with_normalizer(mut self, normalizer: Option<Normalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    #[must_use]
    pub fn with_w_init(mut self, init: Initializer) -> Self {
        self.w_init = init;
        self
    }

    #[must_use]
    pub fn with_b_init(mut self, init: Option<Initializer>) -> Self {
        self.b_init = init;
        self
    }

    #[must_use]
    pub fn with_w_regularizer(mut self, regularizer: Option<Regularizer>) -> Self {
        self.w_regularizer = regularizer;
        self
    }

    #[must_use]
    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    #[must_use]
    pub fn with_use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Filter size, falling back to [`DEFAULT_FILTER_SIZE`].
    #[must_use]
    pub fn resolved_filter_size(&self) -> FilterSize {
        self.filter_size.unwrap_or(DEFAULT_FILTER_SIZE)
    }

    fn validate(&self) -> Result<()> {
        let filter = self.resolved_filter_size();
        if filter.height == 0 || filter.width == 0 {
            return Err(ConvGateError::invalid_config("filter_size", filter, ">= 1 in both dimensions"));
        }
        if self.dilation.height == 0 || self.dilation.width == 0 {
            return Err(ConvGateError::invalid_config(
                "dilation",
                format!("{}x{}", self.dilation.height, self.dilation.width),
                ">= 1 in both dimensions",
            ));
        }
        Ok(())
    }
}

/// Shape of a rank-4 tensor, or an `InvalidRank` error naming `context`.
pub(crate) fn nhwc_dims(inputs: &Tensor, context: &str) -> Result<[usize; 4]> {
    match *inputs.shape() {
        [n, h, w, c] => Ok([n, h, w, c]),
        _ => Err(ConvGateError::not_rank4(context, inputs.shape())),
    }
}

/// Causal zero padding for a convolution that must not look ahead.
///
/// Pads `(fh / 2) * 2 * dh` rows above the input and `(fw / 2) * 2 * dw`
/// columns to its left (no columns when the width is exactly 1). Combined
/// with the returned configuration, whose padding is `Valid`, the
/// convolution output has the same spatial size as `inputs`.
///
/// # Errors
///
/// - `InvalidRank` if `inputs` is not rank 4
/// - `MissingFilterSize` if the configuration has no filter size
/// - `EvenFilterSize` if either filter dimension is even
pub fn format_input_left_padding(
    inputs: &Tensor,
    config: &Conv2dConfig,
) -> Result<(Tensor, Conv2dConfig)> {
    let [_, _, width, _] = nhwc_dims(inputs, "format_input_left_padding")?;
    let filter = config
        .filter_size
        .ok_or_else(|| ConvGateError::MissingFilterSize {
            context: "format_input_left_padding".to_string(),
        })?;
    if !filter.is_odd() {
        return Err(ConvGateError::EvenFilterSize {
            height: filter.height,
            width: filter.width,
        });
    }

    let Dilation {
        height: dh,
        width: dw,
    } = config.dilation;
    let height_pad = 2 * (filter.height / 2) * dh;
    let width_pad = if width == 1 {
        0
    } else {
        2 * (filter.width / 2) * dw
    };
    debug!(%filter, height_pad, width_pad, "left padding conv input");

    let padded = inputs.pad_spatial(SpatialPadding {
        top: height_pad,
        bottom: 0,
        left: width_pad,
        right: 0,
    });
    Ok((padded, config.clone().with_padding(Padding::Valid)))
}

/// Stride-1 dilated convolution layer.
///
/// Creates `<name>/weights` of shape `[fh, fw, in_channels, n_output_channels]`
/// in `scope`, convolves with `Same` or `Valid` padding, then either
/// normalises (if a normaliser is configured) or adds `<name>/biases`
/// (if `use_bias` and a bias initializer are set), then applies the
/// activation. `is_training` only affects batch norm.
///
/// # Errors
///
/// - `InvalidRank` if `inputs` is not rank 4
/// - `InvalidConfig` for a zero filter size, dilation or channel count,
///   for `Left` padding (route it through [`conv2d_v2`]), or when the
///   dilated filter does not fit the padded input
/// - variable errors from `scope` (for example building twice without
///   `reuse`)
pub fn dilated_conv2d(
    scope: &Scope,
    inputs: &Tensor,
    n_output_channels: usize,
    is_training: bool,
    reuse: bool,
    config: &Conv2dConfig,
) -> Result<Tensor> {
    let [_, height, width, in_channels] = nhwc_dims(inputs, "dilated_conv2d")?;
    config.validate()?;
    if n_output_channels == 0 {
        return Err(ConvGateError::invalid_config("n_output_channels", 0, ">= 1"));
    }

    let filter = config.resolved_filter_size();
    let Dilation {
        height: dh,
        width: dw,
    } = config.dilation;
    let span_h = (filter.height - 1) * dh + 1;
    let span_w = (filter.width - 1) * dw + 1;

    let padding = match config.padding {
        Padding::Same => SpatialPadding::same(span_h, span_w),
        Padding::Valid => SpatialPadding::NONE,
        Padding::Left => {
            return Err(ConvGateError::invalid_config(
                "padding",
                Padding::Left,
                "SAME or VALID; LEFT padding goes through conv2d_v2",
            ))
        }
    };
    if span_h > height + padding.top + padding.bottom || span_w > width + padding.left + padding.right {
        return Err(ConvGateError::invalid_config(
            "filter_size",
            format!("{filter} dilated to {span_h}x{span_w}"),
            &format!("no larger than the {} input {height}x{width}", config.padding),
        ));
    }

    let scope = scope.sub(&config.name).reuse(reuse);
    debug!(
        scope = %scope.path(),
        shape = ?inputs.shape(),
        n_output_channels,
        padding = %config.padding,
        "building conv2d"
    );

    let w_config = VariableConfig::new(config.w_init)
        .with_trainable(config.trainable)
        .with_regularizer(config.w_regularizer);
    let weights = scope.get_variable(
        "weights",
        &[filter.height, filter.width, in_channels, n_output_channels],
        &w_config,
    )?;

    let mut output = inputs.conv2d(&weights, (dh, dw), padding);

    match config.normalizer {
        Some(Normalizer::LayerNorm) => output = layer_norm(&scope, &output, n_output_channels)?,
        Some(Normalizer::BatchNorm(bn)) => output = batch_norm(&scope, &output, is_training, &bn)?,
        None => {
            if let (true, Some(b_init)) = (config.use_bias, config.b_init) {
                let b_config = VariableConfig::new(b_init).with_trainable(config.trainable);
                let biases = scope.get_variable("biases", &[n_output_channels], &b_config)?;
                output = output.broadcast_add(&biases);
            }
        }
    }

    Ok(config.activation.apply(&output))
}

/// Convolution layer with `Same`, `Valid` or causal `Left` padding.
///
/// `Left` padding first runs [`format_input_left_padding`] and then
/// convolves with `Valid`; the other modes go straight to
/// [`dilated_conv2d`].
///
/// # Errors
///
/// Everything [`format_input_left_padding`] and [`dilated_conv2d`] report.
pub fn conv2d_v2(
    scope: &Scope,
    inputs: &Tensor,
    n_output_channels: usize,
    is_training: bool,
    reuse: bool,
    config: &Conv2dConfig,
) -> Result<Tensor> {
    if config.padding == Padding::Left {
        let (padded, config) = format_input_left_padding(inputs, config)?;
        return dilated_conv2d(scope, &padded, n_output_channels, is_training, reuse, &config);
    }
    dilated_conv2d(scope, inputs, n_output_channels, is_training, reuse, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::VarStore;

    fn left_cfg(filter: impl Into<FilterSize>, dilation: impl Into<Dilation>) -> Conv2dConfig {
        Conv2dConfig::default()
            .with_filter_size(filter)
            .with_dilation(dilation)
            .with_padding(Padding::Left)
    }

    #[test]
    fn test_left_padding_amounts() {
        let x = Tensor::ones(&[1, 5, 6, 2]);
        let (padded, cfg) = format_input_left_padding(&x, &left_cfg((3, 5), (2, 1))).expect("pad");
        // height: 2 * 1 * 2, width: 2 * 2 * 1
        assert_eq!(padded.shape(), &[1, 9, 10, 2]);
        assert_eq!(cfg.padding, Padding::Valid);
    }

    #[test]
    fn test_left_padding_is_before_only() {
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 2, 2, 1]);
        let (padded, _) = format_input_left_padding(&x, &left_cfg(3, 1)).expect("pad");
        assert_eq!(padded.shape(), &[1, 4, 4, 1]);
        let d = padded.data();
        // Original block sits in the bottom-right corner
        assert_eq!(&d[10..12], &[1.0, 2.0]);
        assert_eq!(&d[14..16], &[3.0, 4.0]);
        assert_eq!(d[..10].iter().sum::<f32>(), 0.0);
    }

    #[test]
    fn test_left_padding_width_one() {
        let x = Tensor::ones(&[2, 4, 1, 3]);
        let (padded, _) = format_input_left_padding(&x, &left_cfg(3, 2)).expect("pad");
        assert_eq!(padded.shape(), &[2, 8, 1, 3]);
    }

    #[test]
    fn test_left_padding_errors() {
        let cfg = left_cfg(3, 1);
        assert!(matches!(
            format_input_left_padding(&Tensor::ones(&[4, 4, 1]), &cfg),
            Err(ConvGateError::InvalidRank { .. })
        ));
        assert!(matches!(
            format_input_left_padding(&Tensor::ones(&[1, 4, 4, 1]), &Conv2dConfig::default()),
            Err(ConvGateError::MissingFilterSize { .. })
        ));
        assert_eq!(
            format_input_left_padding(&Tensor::ones(&[1, 4, 4, 1]), &left_cfg((3, 2), 1)).unwrap_err(),
            ConvGateError::EvenFilterSize {
                height: 3,
                width: 2
            }
        );
    }

    #[test]
    fn test_conv2d_v2_left_keeps_spatial_size() {
        let store = VarStore::new();
        let x = Tensor::ones(&[2, 6, 5, 3]);
        let y = conv2d_v2(&store.root(), &x, 4, true, false, &left_cfg(3, (2, 1))).expect("conv");
        assert_eq!(y.shape(), &[2, 6, 5, 4]);
    }

    #[test]
    fn test_left_padding_is_causal() {
        // Changing the last row must not affect earlier output rows
        let store = VarStore::new();
        let root = store.root();
        let cfg = left_cfg((3, 1), 1).with_w_init(Initializer::Ones);
        let a = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 4, 1, 1]);
        let b = Tensor::new(&[1.0, 2.0, 3.0, 40.0], &[1, 4, 1, 1]);

        let ya = conv2d_v2(&root, &a, 1, false, false, &cfg).expect("a");
        let yb = conv2d_v2(&root, &b, 1, false, true, &cfg).expect("b");
        assert_eq!(&ya.data()[..3], &yb.data()[..3]);
        assert_eq!(ya.data(), &[1.0, 3.0, 6.0, 9.0]);
    }

    #[test]
    fn test_dilated_conv2d_variables_and_reuse() {
        let store = VarStore::new();
        let root = store.root();
        let x = Tensor::ones(&[1, 4, 4, 2]);
        let cfg = Conv2dConfig::default().with_name("c");

        let y = dilated_conv2d(&root, &x, 3, true, false, &cfg).expect("build");
        assert_eq!(y.shape(), &[1, 4, 4, 3]);
        assert_eq!(
            store.get("c/weights").expect("weights").shape(),
            &[3, 3, 2, 3]
        );
        assert_eq!(store.get("c/biases").expect("biases").shape(), &[3]);

        assert!(matches!(
            dilated_conv2d(&root, &x, 3, true, false, &cfg),
            Err(ConvGateError::VariableExists { .. })
        ));
        let again = dilated_conv2d(&root, &x, 3, true, true, &cfg).expect("reuse");
        assert_eq!(again.data(), y.data());
    }

    #[test]
    fn test_dilated_conv2d_valid_shrinks() {
        let store = VarStore::new();
        let x = Tensor::ones(&[1, 7, 7, 1]);
        let cfg = Conv2dConfig::default()
            .with_padding(Padding::Valid)
            .with_dilation(2);
        let y = dilated_conv2d(&store.root(), &x, 2, true, false, &cfg).expect("conv");
        assert_eq!(y.shape(), &[1, 3, 3, 2]);
    }

    #[test]
    fn test_dilated_conv2d_normalizer_replaces_bias() {
        let store = VarStore::new();
        let x = Tensor::ones(&[1, 3, 3, 2]);
        let cfg = Conv2dConfig::default().with_normalizer(Some(Normalizer::LayerNorm));
        dilated_conv2d(&store.root(), &x, 4, true, false, &cfg).expect("conv");
        assert!(store.get("conv2d/biases").is_none());
        assert!(store.get("conv2d/LayerNorm/scale").is_some());
    }

    #[test]
    fn test_dilated_conv2d_no_bias() {
        let store = VarStore::new();
        let x = Tensor::ones(&[1, 3, 3, 1]);
        let cfg = Conv2dConfig::default().with_b_init(None);
        dilated_conv2d(&store.root(), &x, 1, true, false, &cfg).expect("conv");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_dilated_conv2d_rejects_bad_geometry() {
        let store = VarStore::new();
        let root = store.root();
        let x = Tensor::ones(&[1, 2, 2, 1]);

        let too_big = Conv2dConfig::default().with_padding(Padding::Valid);
        assert!(matches!(
            dilated_conv2d(&root, &x, 1, true, false, &too_big),
            Err(ConvGateError::InvalidConfig { .. })
        ));
        let zero_dilation = Conv2dConfig::default().with_dilation(0);
        assert!(matches!(
            dilated_conv2d(&root, &x, 1, true, false, &zero_dilation),
            Err(ConvGateError::InvalidConfig { .. })
        ));
        let left = Conv2dConfig::default().with_padding(Padding::Left);
        assert!(matches!(
            dilated_conv2d(&root, &x, 1, true, false, &left),
            Err(ConvGateError::InvalidConfig { .. })
        ));
        assert!(store.is_empty());
    }
}
