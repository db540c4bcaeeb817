//! Posterior heads as explicit two-stage distributions.
//!
//! A head's final dense layer emits raw numbers. `parameterize` turns those
//! into explicit distribution parameters (location plus either a positive
//! scale vector or a lower-triangular scale factor); sampling and density
//! evaluation then work only on those parameters.

use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, Axis};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{shape_mismatch, NetworkError, Result};

const LN_2PI: f64 = 1.837_877_066_409_345_5;
/// Added to the softplus of every Cholesky diagonal entry.
pub const TRIL_DIAG_SHIFT: f64 = 1e-5;

/// Numerically stable `ln(1 + e^x)`.
pub fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Common surface of the parameterized posteriors.
pub trait Posterior {
    /// One draw, shaped like the location.
    type Value;
    /// One log-density per distribution in the batch.
    type Density;

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Self::Value;
    fn log_prob(&self, x: &Self::Value) -> Result<Self::Density>;
    fn mean(&self) -> Self::Value;
}

// ── IndependentNormal (diagonal, macro head) ────────────────────────

pub struct IndependentNormal;

impl IndependentNormal {
    /// Raw head width for an event of `event_size` independent normals.
    pub fn params_size(event_size: usize) -> usize {
        2 * event_size
    }

    /// `raw` is (B, 2P): the first P columns are locations, the rest pass
    /// through softplus to become scales.
    pub fn parameterize(
        raw: ArrayView2<f64>,
        event_size: usize,
    ) -> Result<IndependentNormalParams> {
        let width = Self::params_size(event_size);
        if raw.ncols() != width {
            return Err(shape_mismatch(
                "independent normal head output",
                &[raw.nrows(), width],
                raw.shape(),
            ));
        }
        let loc = raw.slice(s![.., ..event_size]).to_owned();
        let scale = raw.slice(s![.., event_size..]).mapv(softplus);
        Ok(IndependentNormalParams { loc, scale })
    }
}

/// Batch of diagonal normals over the macro parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct IndependentNormalParams {
    /// (B, P)
    pub loc: Array2<f64>,
    /// (B, P), strictly positive
    pub scale: Array2<f64>,
}

impl IndependentNormalParams {
    pub fn batch_size(&self) -> usize {
        self.loc.nrows()
    }

    pub fn event_size(&self) -> usize {
        self.loc.ncols()
    }

    pub fn stddev(&self) -> Array2<f64> {
        self.scale.clone()
    }
}

impl Posterior for IndependentNormalParams {
    type Value = Array2<f64>;
    type Density = Array1<f64>;

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Array2<f64> {
        let mut out = self.loc.clone();
        out.zip_mut_with(&self.scale, |x, &s| {
            let z: f64 = StandardNormal.sample(rng);
            *x += s * z;
        });
        out
    }

    fn log_prob(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        if x.dim() != self.loc.dim() {
            return Err(shape_mismatch("macro parameters", self.loc.shape(), x.shape()));
        }
        let mut out = Array1::zeros(self.batch_size());
        for (b, lp) in out.iter_mut().enumerate() {
            *lp = x
                .row(b)
                .iter()
                .zip(self.loc.row(b))
                .zip(self.scale.row(b))
                .map(|((&xi, &mu), &sigma)| {
                    let z = (xi - mu) / sigma;
                    -0.5 * z * z - sigma.ln() - 0.5 * LN_2PI
                })
                .sum();
        }
        Ok(out)
    }

    fn mean(&self) -> Array2<f64> {
        self.loc.clone()
    }
}

// ── MultivariateNormalTriL (full covariance, micro head) ────────────

pub struct MultivariateNormalTriL;

impl MultivariateNormalTriL {
    /// Raw head width: P locations plus P(P+1)/2 triangular entries.
    pub fn params_size(event_size: usize) -> usize {
        event_size + event_size * (event_size + 1) / 2
    }

    /// `raw` is (B, T, P + P(P+1)/2). The trailing block is packed into a
    /// lower-triangular factor whose diagonal is made strictly positive.
    pub fn parameterize(
        raw: ArrayView3<f64>,
        event_size: usize,
    ) -> Result<MultivariateNormalTriLParams> {
        let (batch, steps, width) = raw.dim();
        if width != Self::params_size(event_size) {
            return Err(shape_mismatch(
                "multivariate normal head output",
                &[batch, steps, Self::params_size(event_size)],
                raw.shape(),
            ));
        }

        let loc = raw.slice(s![.., .., ..event_size]).to_owned();
        let mut scale_tril = Array4::zeros((batch, steps, event_size, event_size));
        for b in 0..batch {
            for t in 0..steps {
                let packed = raw.slice(s![b, t, event_size..]);
                let mut tril = fill_triangular(packed, event_size)?;
                for i in 0..event_size {
                    tril[[i, i]] = softplus(tril[[i, i]]) + TRIL_DIAG_SHIFT;
                }
                scale_tril.slice_mut(s![b, t, .., ..]).assign(&tril);
            }
        }
        Ok(MultivariateNormalTriLParams { loc, scale_tril })
    }
}

/// Pack `n(n+1)/2` values into an n×n lower-triangular matrix.
///
/// Ordering: the tail `v[n..]` followed by all of `v` reversed, laid out
/// row-major, upper triangle dropped. For n = 3 and v = 1..=6 this gives
/// `[[4,0,0],[6,5,0],[3,2,1]]`.
pub fn fill_triangular(v: ArrayView1<f64>, n: usize) -> Result<Array2<f64>> {
    if v.len() != n * (n + 1) / 2 {
        return Err(NetworkError::Distribution(format!(
            "cannot fill a {}x{} triangle from {} values",
            n,
            n,
            v.len()
        )));
    }
    let flat: Vec<f64> = v
        .slice(s![n..])
        .iter()
        .chain(v.iter().rev())
        .copied()
        .collect();
    let mut out = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            out[[i, j]] = flat[i * n + j];
        }
    }
    Ok(out)
}

/// Per-time-step full-covariance normals over the micro parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateNormalTriLParams {
    /// (B, T, P)
    pub loc: Array3<f64>,
    /// (B, T, P, P), lower triangular with positive diagonal
    pub scale_tril: Array4<f64>,
}

impl MultivariateNormalTriLParams {
    pub fn batch_size(&self) -> usize {
        self.loc.len_of(Axis(0))
    }

    pub fn num_steps(&self) -> usize {
        self.loc.len_of(Axis(1))
    }

    pub fn event_size(&self) -> usize {
        self.loc.len_of(Axis(2))
    }

    /// Σ = L Lᵀ for every (batch, time) cell.
    pub fn covariance(&self) -> Array4<f64> {
        let mut cov = Array4::zeros(self.scale_tril.raw_dim());
        for b in 0..self.batch_size() {
            for t in 0..self.num_steps() {
                let l = self.scale_tril.slice(s![b, t, .., ..]);
                cov.slice_mut(s![b, t, .., ..]).assign(&l.dot(&l.t()));
            }
        }
        cov
    }
}

impl Posterior for MultivariateNormalTriLParams {
    type Value = Array3<f64>;
    type Density = Array2<f64>;

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Array3<f64> {
        let p = self.event_size();
        let mut out = self.loc.clone();
        for b in 0..self.batch_size() {
            for t in 0..self.num_steps() {
                let z: Array1<f64> = (0..p)
                    .map(|_| -> f64 { StandardNormal.sample(rng) })
                    .collect();
                let l = self.scale_tril.slice(s![b, t, .., ..]);
                let mut cell = out.slice_mut(s![b, t, ..]);
                cell += &l.dot(&z);
            }
        }
        out
    }

    fn log_prob(&self, x: &Array3<f64>) -> Result<Array2<f64>> {
        if x.dim() != self.loc.dim() {
            return Err(shape_mismatch("micro parameters", self.loc.shape(), x.shape()));
        }
        let p = self.event_size();
        let mut out = Array2::zeros((self.batch_size(), self.num_steps()));
        for ((b, t), lp) in out.indexed_iter_mut() {
            let l = self.scale_tril.slice(s![b, t, .., ..]);
            let diff = &x.slice(s![b, t, ..]) - &self.loc.slice(s![b, t, ..]);
            // Forward substitution: L y = x - mu
            let mut y = vec![0.0; p];
            for i in 0..p {
                let partial: f64 = (0..i).map(|j| l[[i, j]] * y[j]).sum();
                y[i] = (diff[i] - partial) / l[[i, i]];
            }
            let maha: f64 = y.iter().map(|v| v * v).sum();
            let log_det: f64 = (0..p).map(|i| l[[i, i]].ln()).sum();
            *lp = -0.5 * maha - log_det - 0.5 * p as f64 * LN_2PI;
        }
        Ok(out)
    }

    fn mean(&self) -> Array3<f64> {
        self.loc.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_softplus_stable_at_extremes() {
        assert!((softplus(0.0) - 2f64.ln()).abs() < 1e-12);
        assert_eq!(softplus(1000.0), 1000.0);
        assert!(softplus(-1000.0) >= 0.0);
        assert!(softplus(-1000.0) < 1e-300);
    }

    #[test]
    fn test_params_size() {
        assert_eq!(IndependentNormal::params_size(3), 6);
        assert_eq!(MultivariateNormalTriL::params_size(4), 14);
        assert_eq!(MultivariateNormalTriL::params_size(1), 2);
    }

    #[test]
    fn test_fill_triangular_ordering() {
        let v = array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let tril = fill_triangular(v.view(), 3).unwrap();
        assert_eq!(
            tril,
            array![[4.0, 0.0, 0.0], [6.0, 5.0, 0.0], [3.0, 2.0, 1.0]]
        );
    }

    #[test]
    fn test_fill_triangular_rejects_wrong_length() {
        let v = array![1.0, 2.0, 3.0, 4.0];
        assert!(fill_triangular(v.view(), 3).is_err());
    }

    #[test]
    fn test_independent_normal_parameterize() {
        let raw = array![[1.0, -2.0, 0.0, 0.0]];
        let d = IndependentNormal::parameterize(raw.view(), 2).unwrap();
        assert_eq!(d.loc, array![[1.0, -2.0]]);
        assert!(d.scale.iter().all(|&s| (s - 2f64.ln()).abs() < 1e-12));
        assert!(IndependentNormal::parameterize(raw.view(), 3).is_err());
    }

    #[test]
    fn test_independent_normal_log_prob_matches_closed_form() {
        let d = IndependentNormalParams {
            loc: array![[0.0, 1.0]],
            scale: array![[1.0, 2.0]],
        };
        let lp = d.log_prob(&array![[0.0, 1.0]]).unwrap();
        let expected = -LN_2PI - 2f64.ln();
        assert!((lp[0] - expected).abs() < 1e-12);
        assert!(d.log_prob(&array![[0.0]]).is_err());
    }

    #[test]
    fn test_independent_normal_sample_moments() {
        let d = IndependentNormalParams {
            loc: Array::from_elem((1, 1), 3.0),
            scale: Array::from_elem((1, 1), 0.5),
        };
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let draws: Vec<f64> = (0..20_000).map(|_| d.sample(&mut rng)[[0, 0]]).collect();
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / draws.len() as f64;
        assert!((mean - 3.0).abs() < 0.02);
        assert!((var.sqrt() - 0.5).abs() < 0.02);
    }

    #[test]
    fn test_tril_diagonal_is_positive() {
        let raw = Array3::from_elem((2, 3, MultivariateNormalTriL::params_size(4)), -50.0);
        let d = MultivariateNormalTriL::parameterize(raw.view(), 4).unwrap();
        assert_eq!(d.scale_tril.dim(), (2, 3, 4, 4));
        for b in 0..2 {
            for t in 0..3 {
                for i in 0..4 {
                    assert!(d.scale_tril[[b, t, i, i]] >= TRIL_DIAG_SHIFT);
                    for j in (i + 1)..4 {
                        assert_eq!(d.scale_tril[[b, t, i, j]], 0.0);
                    }
                }
            }
        }
    }

    #[test]
    fn test_mvn_log_prob_identity_covariance() {
        let d = MultivariateNormalTriLParams {
            loc: Array3::zeros((1, 1, 2)),
            scale_tril: {
                let mut l = Array4::zeros((1, 1, 2, 2));
                l[[0, 0, 0, 0]] = 1.0;
                l[[0, 0, 1, 1]] = 1.0;
                l
            },
        };
        let x = Array3::from_shape_vec((1, 1, 2), vec![1.0, -1.0]).unwrap();
        let lp = d.log_prob(&x).unwrap();
        assert!((lp[[0, 0]] - (-1.0 - LN_2PI)).abs() < 1e-12);
    }

    #[test]
    fn test_mvn_sample_covariance() {
        let mut l = Array4::zeros((1, 1, 2, 2));
        l[[0, 0, 0, 0]] = 1.0;
        l[[0, 0, 1, 0]] = 0.8;
        l[[0, 0, 1, 1]] = 0.6;
        let d = MultivariateNormalTriLParams {
            loc: Array3::zeros((1, 1, 2)),
            scale_tril: l,
        };
        let cov = d.covariance();
        assert!((cov[[0, 0, 0, 1]] - 0.8).abs() < 1e-12);
        assert!((cov[[0, 0, 1, 1]] - 1.0).abs() < 1e-12);

        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let n = 20_000;
        let mut cross = 0.0;
        for _ in 0..n {
            let x = d.sample(&mut rng);
            cross += x[[0, 0, 0]] * x[[0, 0, 1]];
        }
        assert!((cross / n as f64 - 0.8).abs() < 0.03);
    }
}
