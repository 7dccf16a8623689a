//! Error types for layer construction.
//!
//! Every error here is raised synchronously while a layer is being built
//! (wrong rank, bad filter geometry, variable scope misuse). There is no
//! recovery path: callers are expected to fix the arguments and rebuild.

use thiserror::Error;

/// Main error type for layer construction.
///
/// # Examples
///
/// ```
/// use convgate::error::ConvGateError;
///
/// let err = ConvGateError::InvalidRank {
///     context: "conv2d".to_string(),
///     expected: 4,
///     shape: vec![2, 3],
/// };
/// assert!(err.to_string().contains("rank 4"));
/// ```
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConvGateError {
    /// Input tensor does not have the rank the layer needs.
    #[error("{context}: inputs must have statically known rank {expected}, got shape {shape:?}")]
    InvalidRank {
        /// Operation that rejected the input
        context: String,
        /// Required rank
        expected: usize,
        /// Shape that was supplied
        shape: Vec<usize>,
    },

    /// Left padding was requested without an explicit filter size.
    #[error("{context}: filter_size is required for LEFT padding")]
    MissingFilterSize {
        /// Operation that needed the filter size
        context: String,
    },

    /// Left padding needs odd filter dimensions.
    #[error("filter size must be odd in both dimensions, got {height}x{width}")]
    EvenFilterSize {
        /// Filter height
        height: usize,
        /// Filter width
        width: usize,
    },

    /// Channel count of a tensor does not match what the layer expects.
    #[error("{context}: expected {expected} channels, got {actual}")]
    ChannelMismatch {
        /// Operation that rejected the input
        context: String,
        /// Expected channel count
        expected: usize,
        /// Actual channel count
        actual: usize,
    },

    /// Shapes of two related tensors disagree.
    #[error("{context}: shape mismatch, expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Operation that compared the shapes
        context: String,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// A variable was created twice without enabling reuse.
    #[error("variable {name} already exists, set reuse to share it")]
    VariableExists {
        /// Full variable name
        name: String,
    },

    /// Reuse was requested for a variable that was never created.
    #[error("variable {name} does not exist, disable reuse to create it")]
    VariableNotFound {
        /// Full variable name
        name: String,
    },

    /// A configuration value is out of its valid range.
    #[error("invalid configuration: {param} = {value}, expected {constraint}")]
    InvalidConfig {
        /// Parameter name
        param: String,
        /// Provided value
        value: String,
        /// Constraint description
        constraint: String,
    },
}

impl ConvGateError {
    /// Rank error for an operation that needs `[batch, height, width, channels]`.
    #[must_use]
    pub fn not_rank4(context: &str, shape: &[usize]) -> Self {
        Self::InvalidRank {
            context: context.to_string(),
            expected: 4,
            shape: shape.to_vec(),
        }
    }

    /// Channel mismatch with descriptive context.
    #[must_use]
    pub fn channel_mismatch(context: &str, expected: usize, actual: usize) -> Self {
        Self::ChannelMismatch {
            context: context.to_string(),
            expected,
            actual,
        }
    }

    /// Invalid configuration value.
    #[must_use]
    pub fn invalid_config(param: &str, value: impl ToString, constraint: &str) -> Self {
        Self::InvalidConfig {
            param: param.to_string(),
            value: value.to_string(),
            constraint: constraint.to_string(),
        }
    }
}

/// Convenience type alias for Results.
pub type Result<T> = std::result::Result<T, ConvGateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_rank_display() {
        let err = ConvGateError::not_rank4("conv2d_v2", &[1, 8, 8]);
        let msg = err.to_string();
        assert!(msg.contains("conv2d_v2"));
        assert!(msg.contains("rank 4"));
        assert!(msg.contains("[1, 8, 8]"));
    }

    #[test]
    fn test_even_filter_display() {
        let err = ConvGateError::EvenFilterSize {
            height: 4,
            width: 3,
        };
        assert_eq!(
            err.to_string(),
            "filter size must be odd in both dimensions, got 4x3"
        );
    }

    #[test]
    fn test_channel_mismatch_helper() {
        let err = ConvGateError::channel_mismatch("conv2d_gru", 8, 3);
        assert_eq!(
            err,
            ConvGateError::ChannelMismatch {
                context: "conv2d_gru".to_string(),
                expected: 8,
                actual: 3,
            }
        );
        assert!(err.to_string().contains("expected 8 channels, got 3"));
    }

    #[test]
    fn test_variable_errors_display() {
        let exists = ConvGateError::VariableExists {
            name: "gru/reset/weights".to_string(),
        };
        assert!(exists.to_string().contains("gru/reset/weights"));

        let missing = ConvGateError::VariableNotFound {
            name: "gru/gate/biases".to_string(),
        };
        assert!(missing.to_string().contains("does not exist"));
    }

    #[test]
    fn test_invalid_config_helper() {
        let err = ConvGateError::invalid_config("dilation", 0, ">= 1");
        assert_eq!(
            err.to_string(),
            "invalid configuration: dilation = 0, expected >= 1"
        );
    }
}
