//! Neural network layers for NHWC feature maps.
//!
//! Layers are plain functions in the define-by-run style: each call builds
//! its part of the computation graph and fetches its parameters from a
//! [`Scope`], creating them on first use.
//!
//! - **Variables**: [`VarStore`], [`Scope`], [`VariableConfig`], [`Regularizer`]
//! - **Initialization**: [`Initializer`]
//! - **Convolution**: [`dilated_conv2d`], [`conv2d_v2`], [`format_input_left_padding`]
//! - **Normalization**: [`layer_norm`], [`batch_norm`]
//! - **Activations**: [`Activation`], [`saturating_sigmoid`]
//! - **Recurrent cells**: [`conv2d_gru`], [`conv2d_lstm`]
//!
//! # Example
//!
//! ```
//! use convgate::autograd::Tensor;
//! use convgate::nn::{conv2d_gru, Conv2dConfig, VarStore};
//!
//! let store = VarStore::new();
//! let x = Tensor::full(&[1, 8, 8, 4], 0.1);
//! let y = conv2d_gru(&store.root(), &x, 4, true, false, &Conv2dConfig::conv2d_gru()).unwrap();
//! assert_eq!(y.shape(), &[1, 8, 8, 4]);
//! ```
//!
//! # References
//!
//! - Glorot, X., & Bengio, Y. (2010). Understanding the difficulty of training
//!   deep feedforward neural networks. AISTATS.
//! - He, K., et al. (2015). Delving deep into rectifiers. ICCV.

mod activation;
mod conv;
pub mod init;
mod normalization;
mod rnn;
mod scope;

pub use activation::{saturating_sigmoid, Activation};
pub use conv::{
    conv2d_v2, dilated_conv2d, format_input_left_padding, Conv2dConfig, Dilation, FilterSize,
    Normalizer, Padding, DEFAULT_FILTER_SIZE,
};
pub use init::Initializer;
pub use normalization::{batch_norm, layer_norm, BatchNormConfig, LAYER_NORM_EPSILON};
pub use rnn::{conv2d_gru, conv2d_lstm, ConvLstmState};
pub use scope::{Regularizer, Scope, VarStore, Variable, VariableConfig};
