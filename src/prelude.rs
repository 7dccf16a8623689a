//! Convenience re-exports for common usage.
//!
//! # Usage
//!
//! ```
//! use convgate::prelude::*;
//! ```

pub use crate::autograd::{clear_graph, get_grad, no_grad, Tensor};
pub use crate::custom_grad::{
    BackwardContext, CustomGradConfig, CustomGradient, CustomGrads, FnWithCustomGrad, Outputs,
};
pub use crate::error::{ConvGateError, Result};
pub use crate::nn::{
    conv2d_gru, conv2d_lstm, conv2d_v2, dilated_conv2d, format_input_left_padding,
    saturating_sigmoid, Activation, Conv2dConfig, ConvLstmState, Initializer, Padding, Scope,
    VarStore,
};
