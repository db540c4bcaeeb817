//! Parameter priors for the diffusion decision model.
//!
//! Every entry point without an explicit generator seeds a fresh one from OS
//! entropy, so successive calls are independent and not reproducible. The
//! `*_with_rng` variants take the generator from the caller.
//!
//! Column layout of the diffusion priors is drift (one column per condition),
//! then boundary, then non-decision time.

use ndarray::{s, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution, Gamma, Normal, Uniform};

use crate::error::PriorError;

pub const DEFAULT_N_COND: usize = 4;
pub const DEFAULT_RW_ALPHA: f64 = 1.0;
pub const DEFAULT_RW_BETA: f64 = 25.0;
pub const DEFAULT_LENGTH_SCALE_LOWER: f64 = 0.1;
pub const DEFAULT_LENGTH_SCALE_UPPER: f64 = 20.0;

// Gamma hyperparameters are (shape, scale).
const DRIFT_GAMMA: (f64, f64) = (2.5, 1.0 / 2.0);
const BOUNDARY_GAMMA: (f64, f64) = (4.0, 1.0 / 3.0);
const NDT_GAMMA: (f64, f64) = (1.5, 1.0 / 5.0);
// Normal hyperparameters are (mean, sd).
const BOUNDARY_NORMAL: (f64, f64) = (1.5, 0.3);
const NDT_NORMAL: (f64, f64) = (0.5, 0.1);

fn fresh_rng() -> ChaCha8Rng {
    ChaCha8Rng::from_entropy()
}

fn gamma(shape: f64, scale: f64) -> Result<Gamma<f64>, PriorError> {
    Gamma::new(shape, scale).map_err(|e| PriorError::InvalidHyperparameter {
        distribution: "gamma",
        reason: e.to_string(),
    })
}

fn normal(mean: f64, sd: f64) -> Result<Normal<f64>, PriorError> {
    Normal::new(mean, sd).map_err(|e| PriorError::InvalidHyperparameter {
        distribution: "normal",
        reason: e.to_string(),
    })
}

/// Fill a (batch_size, n_cond + 2) block: drift first (row-major), then the
/// boundary column, then the non-decision-time column.
fn sample_diffusion<R, B, N>(
    rng: &mut R,
    batch_size: usize,
    n_cond: usize,
    boundary: &B,
    ndt: &N,
) -> Result<Array2<f64>, PriorError>
where
    R: Rng + ?Sized,
    B: Distribution<f64>,
    N: Distribution<f64>,
{
    let drift = gamma(DRIFT_GAMMA.0, DRIFT_GAMMA.1)?;
    let mut out = Array2::<f64>::zeros((batch_size, n_cond + 2));

    out.slice_mut(s![.., ..n_cond])
        .map_inplace(|v| *v = drift.sample(rng));
    out.column_mut(n_cond)
        .map_inplace(|v| *v = boundary.sample(rng));
    out.column_mut(n_cond + 1)
        .map_inplace(|v| *v = ndt.sample(rng));

    Ok(out)
}

/// Gamma-distributed drift, boundary and non-decision time.
pub fn diffusion_prior(batch_size: usize, n_cond: usize) -> Result<Array2<f64>, PriorError> {
    diffusion_prior_with_rng(&mut fresh_rng(), batch_size, n_cond)
}

pub fn diffusion_prior_with_rng<R: Rng + ?Sized>(
    rng: &mut R,
    batch_size: usize,
    n_cond: usize,
) -> Result<Array2<f64>, PriorError> {
    tracing::trace!(batch_size, n_cond, "diffusion_prior");
    let boundary = gamma(BOUNDARY_GAMMA.0, BOUNDARY_GAMMA.1)?;
    let ndt = gamma(NDT_GAMMA.0, NDT_GAMMA.1)?;
    sample_diffusion(rng, batch_size, n_cond, &boundary, &ndt)
}

/// Same drift prior as [`diffusion_prior`], but boundary and non-decision
/// time are normal, so those two columns are not bounded below by zero.
pub fn diffusion_prior_gp(batch_size: usize, n_cond: usize) -> Result<Array2<f64>, PriorError> {
    diffusion_prior_gp_with_rng(&mut fresh_rng(), batch_size, n_cond)
}

pub fn diffusion_prior_gp_with_rng<R: Rng + ?Sized>(
    rng: &mut R,
    batch_size: usize,
    n_cond: usize,
) -> Result<Array2<f64>, PriorError> {
    tracing::trace!(batch_size, n_cond, "diffusion_prior_gp");
    let boundary = normal(BOUNDARY_NORMAL.0, BOUNDARY_NORMAL.1)?;
    let ndt = normal(NDT_NORMAL.0, NDT_NORMAL.1)?;
    sample_diffusion(rng, batch_size, n_cond, &boundary, &ndt)
}

/// Beta-distributed random-walk step sizes, support (0, 1).
pub fn random_walk_prior(
    batch_size: usize,
    n_params: usize,
    alpha: f64,
    beta: f64,
) -> Result<Array2<f64>, PriorError> {
    random_walk_prior_with_rng(&mut fresh_rng(), batch_size, n_params, alpha, beta)
}

pub fn random_walk_prior_with_rng<R: Rng + ?Sized>(
    rng: &mut R,
    batch_size: usize,
    n_params: usize,
    alpha: f64,
    beta: f64,
) -> Result<Array2<f64>, PriorError> {
    tracing::trace!(batch_size, n_params, alpha, beta, "random_walk_prior");
    let dist = Beta::new(alpha, beta).map_err(|e| PriorError::InvalidHyperparameter {
        distribution: "beta",
        reason: e.to_string(),
    })?;
    Ok(Array2::from_shape_simple_fn((batch_size, n_params), || {
        dist.sample(rng)
    }))
}

/// Uniform length scales on `[lower, upper)`.
///
/// Unlike the other priors this returns single precision. The bounds are
/// rounded to f32 before the range check, so distinct f64 bounds that round
/// to the same f32 value (e.g. 1.0 and 1.00000001) are rejected as empty.
pub fn length_scale_prior(
    batch_size: usize,
    n_params: usize,
    lower: f64,
    upper: f64,
) -> Result<Array2<f32>, PriorError> {
    length_scale_prior_with_rng(&mut fresh_rng(), batch_size, n_params, lower, upper)
}

pub fn length_scale_prior_with_rng<R: Rng + ?Sized>(
    rng: &mut R,
    batch_size: usize,
    n_params: usize,
    lower: f64,
    upper: f64,
) -> Result<Array2<f32>, PriorError> {
    tracing::trace!(batch_size, n_params, lower, upper, "length_scale_prior");
    let (lo, hi) = (lower as f32, upper as f32);
    // Uniform::new panics on an empty, non-finite or overflowing range.
    if !(lo.is_finite() && hi.is_finite() && lo < hi && (hi - lo).is_finite()) {
        return Err(PriorError::InvalidHyperparameter {
            distribution: "uniform",
            reason: format!("require finite lower < upper, got [{}, {})", lower, upper),
        });
    }
    let dist = Uniform::new(lo, hi);
    Ok(Array2::from_shape_simple_fn((batch_size, n_params), || {
        dist.sample(rng)
    }))
}
