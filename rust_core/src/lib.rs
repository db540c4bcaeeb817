pub mod config;
pub mod counters;
pub mod distributions;
pub mod error;
pub mod layers;
pub mod network;
pub mod priors;

pub use config::{DenseArgs, NetworkConfig, Variant};
pub use distributions::{IndependentNormalParams, MultivariateNormalTriLParams, Posterior};
pub use error::{NetworkError, PriorError};
pub use network::{PosteriorDraws, PosteriorNetwork, DEFAULT_N_SAMPLES};
