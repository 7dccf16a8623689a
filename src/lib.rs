//! Convgate: gated convolutional layers with a small define-by-run autograd.
//!
//! Convgate provides dilated 2-D convolutions with a causal left-padding
//! mode, saturating-sigmoid gates, convolutional GRU and LSTM cells, and a
//! way to replace the gradient of any sub-computation with a hand-written
//! backward rule.
//!
//! # Quick Start
//!
//! ```
//! use convgate::prelude::*;
//!
//! clear_graph();
//! let store = VarStore::new();
//! let x = Tensor::full(&[2, 6, 6, 3], 0.5).requires_grad();
//!
//! // Causal 3x3 convolution with dilation 2
//! let cfg = Conv2dConfig::default()
//!     .with_name("causal")
//!     .with_filter_size(3)
//!     .with_dilation(2)
//!     .with_padding(Padding::Left);
//! let h = conv2d_v2(&store.root(), &x, 3, true, false, &cfg).unwrap();
//! assert_eq!(h.shape(), &[2, 6, 6, 3]);
//!
//! // Gated recurrent update over the feature map
//! let y = conv2d_gru(&store.root(), &h, 3, true, false, &Conv2dConfig::conv2d_gru()).unwrap();
//! y.mean().backward();
//! assert!(get_grad(x.id()).is_some());
//! ```
//!
//! # Modules
//!
//! - [`autograd`]: Tensors and tape-based reverse-mode differentiation
//! - [`nn`]: Variable scopes, convolution, normalization and recurrent layers
//! - [`custom_grad`]: Functions with a user-defined backward rule
//! - [`error`]: Error type shared by all layer functions

pub mod autograd;
pub mod custom_grad;
pub mod error;
pub mod nn;
pub mod prelude;

pub use error::{ConvGateError, Result};
