//! Error types for configuration, shape checking and prior sampling.

use thiserror::Error;

/// Errors raised while building or evaluating a posterior network.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// An input array does not have the shape the network was built for.
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Which argument or stage boundary failed
        what: &'static str,
        /// Expected shape, rendered for display
        expected: String,
        /// Actual shape, rendered for display
        got: String,
    },

    /// The construction mapping is missing a key or holds an unusable value.
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),

    /// The construction mapping could not be parsed.
    #[error("failed to parse network configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// A distribution head produced parameters the sampler cannot use.
    #[error("distribution error: {0}")]
    Distribution(String),
}

/// Errors raised by the prior samplers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PriorError {
    /// A hyperparameter was rejected by the underlying distribution.
    #[error("invalid {distribution} hyperparameter: {reason}")]
    InvalidHyperparameter {
        /// Distribution family name
        distribution: &'static str,
        /// Reason reported by the distribution constructor
        reason: String,
    },
}

pub type Result<T, E = NetworkError> = std::result::Result<T, E>;

pub(crate) fn shape_mismatch(
    what: &'static str,
    expected: &[usize],
    got: &[usize],
) -> NetworkError {
    NetworkError::ShapeMismatch {
        what,
        expected: format!("{:?}", expected),
        got: format!("{:?}", got),
    }
}
