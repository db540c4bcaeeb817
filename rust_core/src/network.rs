//! Posterior network over macro (time-invariant) and micro (per-step)
//! diffusion-model parameters.
//!
//! Three sub-networks:
//!   - encoder: raw observations (B, T, D) to a per-step representation
//!   - macro head: summarizes the representation with its own LSTM and
//!     parameterizes independent normals over the macro parameters
//!   - micro head: per step, reads the representation concatenated with the
//!     macro parameters (the same vector at every step) and parameterizes a
//!     full-covariance normal over the micro parameters
//!
//! Multi-draw sampling evaluates the encoder and macro head once and reuses
//! them for every draw; only the micro head is re-run per draw.

use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::config::{NetworkConfig, Variant};
use crate::counters::{PassCounters, PassCounts};
use crate::distributions::{
    IndependentNormal, IndependentNormalParams, MultivariateNormalTriL,
    MultivariateNormalTriLParams, Posterior,
};
use crate::error::{shape_mismatch, NetworkError, Result};
use crate::layers::{Activation, Activations, Dense, Gru, Layer, Lstm, Pipeline, Stage};

pub const DEFAULT_N_SAMPLES: usize = 50;

/// Encoder output plus the macro posterior derived from it.
struct Encoded {
    rep: Array3<f64>,
    macro_posterior: IndependentNormalParams,
}

#[derive(Debug, Clone)]
pub struct PosteriorNetwork {
    config: NetworkConfig,
    variant: Variant,
    data_dim: usize,
    encoder: Pipeline,
    macro_head: Pipeline,
    micro_head: Pipeline,
    counters: PassCounters,
}

impl PosteriorNetwork {
    /// Build all three sub-networks for observations with `data_dim`
    /// features per step, drawing initial weights from `rng`.
    pub fn new<R: Rng + ?Sized>(
        config: NetworkConfig,
        variant: Variant,
        data_dim: usize,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate(variant)?;
        if data_dim == 0 {
            return Err(NetworkError::InvalidConfig(
                "data_dim must be positive".to_string(),
            ));
        }

        let lstm_units = config.embedding_lstm_units;
        let mut encoder_stages = vec![Stage::new(
            "embedding_lstm",
            Layer::Lstm(Lstm::new(data_dim, lstm_units, true, rng)),
        )];
        let mut width = lstm_units;
        if variant == Variant::Legacy {
            // validate() guarantees the GRU width for the legacy layout.
            let gru_units = config.embedding_gru_units.unwrap_or(lstm_units);
            encoder_stages.push(Stage::new(
                "embedding_gru",
                Layer::Gru(Gru::new(width, gru_units, true, rng)),
            ));
            width = gru_units;
        }
        let pre = &config.dense_pre_args;
        encoder_stages.push(Stage::new(
            "dense_pre",
            Layer::Dense(Dense::new(width, pre.units, pre.activation(), pre.use_bias, rng)),
        ));
        let rep_dim = pre.units;
        let encoder = Pipeline::new(encoder_stages, true)?;

        let n_macro = config.n_macro_params;
        let macro_head = Pipeline::new(
            vec![
                Stage::new(
                    "macro_lstm",
                    Layer::Lstm(Lstm::new(rep_dim, config.macro_lstm_units, false, rng)),
                ),
                Stage::new(
                    "macro_params",
                    Layer::Dense(Dense::new(
                        config.macro_lstm_units,
                        IndependentNormal::params_size(n_macro),
                        Activation::Linear,
                        true,
                        rng,
                    )),
                ),
            ],
            true,
        )?;

        let micro = &config.dense_micro_args;
        let micro_head = Pipeline::new(
            vec![
                Stage::new(
                    "dense_micro",
                    Layer::Dense(Dense::new(
                        rep_dim + n_macro,
                        micro.units,
                        micro.activation(),
                        micro.use_bias,
                        rng,
                    )),
                ),
                Stage::new(
                    "micro_params",
                    Layer::Dense(Dense::new(
                        micro.units,
                        MultivariateNormalTriL::params_size(config.n_micro_params),
                        Activation::Linear,
                        true,
                        rng,
                    )),
                ),
            ],
            true,
        )?;

        let network = Self {
            config,
            variant,
            data_dim,
            encoder,
            macro_head,
            micro_head,
            counters: PassCounters::new(),
        };
        tracing::debug!(
            ?variant,
            data_dim,
            parameters = network.num_parameters(),
            "built posterior network"
        );
        Ok(network)
    }

    /// Same as [`PosteriorNetwork::new`] with weights drawn from a seeded stream.
    pub fn with_seed(
        config: NetworkConfig,
        variant: Variant,
        data_dim: usize,
        seed: u64,
    ) -> Result<Self> {
        Self::new(config, variant, data_dim, &mut ChaCha8Rng::seed_from_u64(seed))
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn data_dim(&self) -> usize {
        self.data_dim
    }

    pub fn encoder(&self) -> &Pipeline {
        &self.encoder
    }

    pub fn macro_head(&self) -> &Pipeline {
        &self.macro_head
    }

    pub fn micro_head(&self) -> &Pipeline {
        &self.micro_head
    }

    pub fn num_parameters(&self) -> usize {
        self.encoder.num_parameters()
            + self.macro_head.num_parameters()
            + self.micro_head.num_parameters()
    }

    /// How many times each sub-network has been evaluated.
    pub fn pass_counts(&self) -> PassCounts {
        self.counters.snapshot()
    }

    pub fn reset_pass_counts(&self) {
        self.counters.reset();
    }

    fn encode(&self, data: ArrayView3<f64>) -> Result<Encoded> {
        let (batch, steps, dim) = data.dim();
        if dim != self.data_dim {
            return Err(shape_mismatch(
                "data",
                &[batch, steps, self.data_dim],
                data.shape(),
            ));
        }

        let rep = self
            .encoder
            .forward(&Activations::Sequence(data.to_owned()))?
            .into_sequence("encoder output")?;
        self.counters.record_encoder();

        let raw = self
            .macro_head
            .forward(&Activations::Sequence(rep.clone()))?
            .into_summary("macro head output")?;
        self.counters.record_macro_head();
        let macro_posterior =
            IndependentNormal::parameterize(raw.view(), self.config.n_macro_params)?;

        Ok(Encoded {
            rep,
            macro_posterior,
        })
    }

    fn micro_posterior(
        &self,
        rep: &Array3<f64>,
        macro_params: ArrayView2<f64>,
    ) -> Result<MultivariateNormalTriLParams> {
        let batch = rep.len_of(Axis(0));
        let expected = [batch, self.config.n_macro_params];
        if macro_params.shape() != &expected[..] {
            return Err(shape_mismatch("macro_params", &expected, macro_params.shape()));
        }

        let joint = broadcast_concat(rep, macro_params);
        let raw = self
            .micro_head
            .forward(&Activations::Sequence(joint))?
            .into_sequence("micro head output")?;
        self.counters.record_micro_head();
        MultivariateNormalTriL::parameterize(raw.view(), self.config.n_micro_params)
    }

    /// Training-mode pass: posteriors over both parameter groups, with the
    /// micro head conditioned on the caller's `macro_params`.
    ///
    /// Deterministic for fixed weights; nothing is sampled.
    pub fn forward(
        &self,
        data: ArrayView3<f64>,
        macro_params: ArrayView2<f64>,
    ) -> Result<(IndependentNormalParams, MultivariateNormalTriLParams)> {
        let encoded = self.encode(data)?;
        let micro = self.micro_posterior(&encoded.rep, macro_params)?;
        Ok((encoded.macro_posterior, micro))
    }

    /// One joint draw: macro parameters (B, P_macro) from the macro
    /// posterior, then micro parameters (B, T, P_micro) conditioned on them.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        data: ArrayView3<f64>,
        rng: &mut R,
    ) -> Result<(Array2<f64>, Array3<f64>)> {
        let encoded = self.encode(data)?;
        let macro_draw = encoded.macro_posterior.sample(rng);
        let micro_draw = self
            .micro_posterior(&encoded.rep, macro_draw.view())?
            .sample(rng);
        Ok((macro_draw, micro_draw))
    }

    /// `n_samples` independent joint draws stacked on a leading axis.
    pub fn sample_n<R: Rng + ?Sized>(
        &self,
        data: ArrayView3<f64>,
        n_samples: usize,
        rng: &mut R,
    ) -> Result<PosteriorDraws> {
        self.draw_many(data, n_samples, rng, keep_macro_draw)
    }

    /// Like [`PosteriorNetwork::sample_n`], but every macro draw is replaced
    /// by zeros before conditioning the micro head. The returned macro
    /// samples are those zeros, not the discarded draws.
    pub fn sample_n_fixed_eta<R: Rng + ?Sized>(
        &self,
        data: ArrayView3<f64>,
        n_samples: usize,
        rng: &mut R,
    ) -> Result<PosteriorDraws> {
        self.draw_many(data, n_samples, rng, neutral_macro)
    }

    /// Each draw runs on its own stream seeded from `base_seed + index`, so
    /// results do not depend on how rayon schedules the draws.
    fn draw_many<R: Rng + ?Sized>(
        &self,
        data: ArrayView3<f64>,
        n_samples: usize,
        rng: &mut R,
        condition: fn(Array2<f64>) -> Array2<f64>,
    ) -> Result<PosteriorDraws> {
        let encoded = self.encode(data)?;
        let (batch, steps, _) = data.dim();
        tracing::debug!(batch, steps, n_samples, "drawing posterior samples");

        let base_seed: u64 = rng.gen();
        let draws: Vec<(Array2<f64>, Array3<f64>)> = (0..n_samples)
            .into_par_iter()
            .map(|idx| -> Result<(Array2<f64>, Array3<f64>)> {
                let mut draw_rng =
                    ChaCha8Rng::seed_from_u64(base_seed.wrapping_add(idx as u64));
                let macro_draw = condition(encoded.macro_posterior.sample(&mut draw_rng));
                let micro_draw = self
                    .micro_posterior(&encoded.rep, macro_draw.view())?
                    .sample(&mut draw_rng);
                Ok((macro_draw, micro_draw))
            })
            .collect::<Result<_>>()?;

        let n_macro = self.config.n_macro_params;
        let n_micro = self.config.n_micro_params;
        let mut macro_samples = Array3::zeros((n_samples, batch, n_macro));
        let mut micro_samples = Array4::zeros((n_samples, batch, steps, n_micro));
        for (idx, (macro_draw, micro_draw)) in draws.into_iter().enumerate() {
            macro_samples.index_axis_mut(Axis(0), idx).assign(&macro_draw);
            micro_samples.index_axis_mut(Axis(0), idx).assign(&micro_draw);
        }

        Ok(PosteriorDraws {
            macro_samples,
            micro_samples,
        })
    }
}

fn keep_macro_draw(draw: Array2<f64>) -> Array2<f64> {
    draw
}

/// A fresh all-zero array shaped like the draw; the draw itself is dropped.
fn neutral_macro(draw: Array2<f64>) -> Array2<f64> {
    Array2::zeros(draw.raw_dim())
}

/// (B, T, H) and (B, P) -> (B, T, H + P), with row b of `macro_params`
/// repeated at every step of batch element b.
fn broadcast_concat(rep: &Array3<f64>, macro_params: ArrayView2<f64>) -> Array3<f64> {
    let (batch, steps, width) = rep.dim();
    let n_macro = macro_params.ncols();
    let mut joint = Array3::zeros((batch, steps, width + n_macro));
    joint.slice_mut(s![.., .., ..width]).assign(rep);
    joint
        .slice_mut(s![.., .., width..])
        .assign(&macro_params.insert_axis(Axis(1)));
    joint
}

/// Monte-Carlo draws from the joint posterior.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorDraws {
    /// (N, B, P_macro)
    pub macro_samples: Array3<f64>,
    /// (N, B, T, P_micro)
    pub micro_samples: Array4<f64>,
}

impl PosteriorDraws {
    pub fn len(&self) -> usize {
        self.macro_samples.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Posterior mean of the macro parameters, (B, P_macro).
    pub fn macro_mean(&self) -> Option<Array2<f64>> {
        self.macro_samples.mean_axis(Axis(0))
    }

    pub fn macro_std(&self) -> Option<Array2<f64>> {
        (!self.is_empty()).then(|| self.macro_samples.std_axis(Axis(0), 0.0))
    }

    /// Posterior mean of the micro parameters, (B, T, P_micro).
    pub fn micro_mean(&self) -> Option<Array3<f64>> {
        self.micro_samples.mean_axis(Axis(0))
    }

    pub fn micro_std(&self) -> Option<Array3<f64>> {
        (!self.is_empty()).then(|| self.micro_samples.std_axis(Axis(0), 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DenseArgs;

    fn small_config(n_macro: usize, n_micro: usize) -> NetworkConfig {
        NetworkConfig {
            embedding_lstm_units: 8,
            embedding_gru_units: Some(6),
            dense_pre_args: DenseArgs::new(7, Activation::Relu),
            dense_micro_args: DenseArgs::new(9, Activation::Tanh),
            macro_lstm_units: 5,
            n_micro_params: n_micro,
            n_macro_params: n_macro,
        }
    }

    fn batch(b: usize, t: usize, d: usize) -> Array3<f64> {
        Array3::from_shape_fn((b, t, d), |(i, j, k)| {
            ((i * 31 + j * 7 + k) as f64 * 0.37).sin()
        })
    }

    fn network(variant: Variant) -> PosteriorNetwork {
        PosteriorNetwork::with_seed(small_config(3, 4), variant, 5, 42).unwrap()
    }

    #[test]
    fn test_end_to_end_shapes() {
        for variant in [Variant::Current, Variant::Legacy] {
            let net = network(variant);
            let data = batch(2, 10, 5);
            let macro_params = Array2::from_elem((2, 3), 0.5);

            let (macro_post, micro_post) = net.forward(data.view(), macro_params.view()).unwrap();
            assert_eq!(macro_post.loc.dim(), (2, 3));
            assert_eq!(macro_post.scale.dim(), (2, 3));
            assert_eq!(micro_post.loc.dim(), (2, 10, 4));
            assert_eq!(micro_post.scale_tril.dim(), (2, 10, 4, 4));

            let mut rng = ChaCha8Rng::seed_from_u64(1);
            let (macro_draw, micro_draw) = net.sample(data.view(), &mut rng).unwrap();
            assert_eq!(macro_draw.dim(), (2, 3));
            assert_eq!(micro_draw.dim(), (2, 10, 4));
            assert!(micro_draw.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_legacy_encoder_inserts_gru() {
        let names = |net: &PosteriorNetwork| -> Vec<String> {
            net.encoder().stages().iter().map(|s| s.name.clone()).collect()
        };
        assert_eq!(names(&network(Variant::Current)), ["embedding_lstm", "dense_pre"]);
        assert_eq!(
            names(&network(Variant::Legacy)),
            ["embedding_lstm", "embedding_gru", "dense_pre"]
        );
        assert!(
            network(Variant::Legacy).num_parameters() > network(Variant::Current).num_parameters()
        );
    }

    #[test]
    fn test_forward_is_deterministic() {
        let net = network(Variant::Current);
        let data = batch(2, 6, 5);
        let macro_params = Array2::from_elem((2, 3), -0.2);
        let first = net.forward(data.view(), macro_params.view()).unwrap();
        let second = net.forward(data.view(), macro_params.view()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_forward_log_prob_is_finite() {
        let net = network(Variant::Current);
        let data = batch(2, 6, 5);
        let macro_params = Array2::from_elem((2, 3), 0.1);
        let micro_truth = Array3::from_elem((2, 6, 4), 0.3);
        let (macro_post, micro_post) = net.forward(data.view(), macro_params.view()).unwrap();
        let macro_lp = macro_post.log_prob(&macro_params).unwrap();
        let micro_lp = micro_post.log_prob(&micro_truth).unwrap();
        assert_eq!(macro_lp.len(), 2);
        assert_eq!(micro_lp.dim(), (2, 6));
        assert!(macro_lp.iter().chain(micro_lp.iter()).all(|v| v.is_finite()));
    }

    #[test]
    fn test_micro_head_sees_macro_params() {
        let net = network(Variant::Current);
        let data = batch(1, 4, 5);
        let (_, low) = net
            .forward(data.view(), Array2::from_elem((1, 3), -1.0).view())
            .unwrap();
        let (_, high) = net
            .forward(data.view(), Array2::from_elem((1, 3), 1.0).view())
            .unwrap();
        assert_ne!(low.loc, high.loc);
    }

    #[test]
    fn test_broadcast_concat_repeats_macro_per_step() {
        let rep = Array3::from_shape_fn((2, 3, 2), |(b, t, h)| (b * 100 + t * 10 + h) as f64);
        let macro_params = ndarray::array![[7.0, 8.0], [9.0, 10.0]];
        let joint = broadcast_concat(&rep, macro_params.view());
        assert_eq!(joint.dim(), (2, 3, 4));
        for b in 0..2 {
            for t in 0..3 {
                assert_eq!(joint.slice(s![b, t, ..2]), rep.slice(s![b, t, ..]));
                assert_eq!(joint.slice(s![b, t, 2..]), macro_params.row(b));
            }
        }
    }

    #[test]
    fn test_sample_n_encodes_once() {
        let net = network(Variant::Legacy);
        let data = batch(2, 5, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let draws = net.sample_n(data.view(), 7, &mut rng).unwrap();
        assert_eq!(draws.len(), 7);
        assert_eq!(draws.macro_samples.dim(), (7, 2, 3));
        assert_eq!(draws.micro_samples.dim(), (7, 2, 5, 4));
        assert_eq!(
            net.pass_counts(),
            PassCounts {
                encoder: 1,
                macro_head: 1,
                micro_head: 7
            }
        );

        net.reset_pass_counts();
        assert_eq!(net.pass_counts(), PassCounts::default());
        net.sample_n_fixed_eta(data.view(), 3, &mut rng).unwrap();
        assert_eq!(
            net.pass_counts(),
            PassCounts {
                encoder: 1,
                macro_head: 1,
                micro_head: 3
            }
        );
    }

    #[test]
    fn test_sample_n_draws_differ_and_reproduce() {
        let net = network(Variant::Current);
        let data = batch(2, 5, 5);
        let a = net
            .sample_n(data.view(), 4, &mut ChaCha8Rng::seed_from_u64(8))
            .unwrap();
        let b = net
            .sample_n(data.view(), 4, &mut ChaCha8Rng::seed_from_u64(8))
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(
            a.macro_samples.index_axis(Axis(0), 0),
            a.macro_samples.index_axis(Axis(0), 1)
        );
    }

    #[test]
    fn test_fixed_eta_returns_zero_macro_samples() {
        let net = network(Variant::Current);
        let data = batch(2, 5, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let draws = net
            .sample_n_fixed_eta(data.view(), DEFAULT_N_SAMPLES, &mut rng)
            .unwrap();
        assert_eq!(draws.macro_samples.dim(), (DEFAULT_N_SAMPLES, 2, 3));
        assert!(draws.macro_samples.iter().all(|&v| v == 0.0));
        assert_eq!(draws.micro_samples.dim(), (DEFAULT_N_SAMPLES, 2, 5, 4));
        assert_eq!(net.pass_counts().encoder, 1);
        assert_eq!(net.pass_counts().micro_head, DEFAULT_N_SAMPLES);
    }

    #[test]
    fn test_fixed_eta_conditions_micro_head_on_zeros() {
        let net = network(Variant::Current);
        let data = batch(1, 3, 5);
        let (_, zero_post) = net
            .forward(data.view(), Array2::zeros((1, 3)).view())
            .unwrap();
        let draws = net
            .sample_n_fixed_eta(data.view(), 4000, &mut ChaCha8Rng::seed_from_u64(6))
            .unwrap();
        let mean = draws.micro_mean().unwrap();
        let cov = zero_post.covariance();
        for t in 0..3 {
            for p in 0..4 {
                let sd = cov[[0, t, p, p]].sqrt();
                let err = (mean[[0, t, p]] - zero_post.loc[[0, t, p]]).abs();
                assert!(err < 5.0 * sd / (4000f64).sqrt() + 1e-9, "t={} p={}", t, p);
            }
        }
    }

    #[test]
    fn test_zero_draws() {
        let net = network(Variant::Current);
        let draws = net
            .sample_n(batch(2, 3, 5).view(), 0, &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap();
        assert!(draws.is_empty());
        assert_eq!(draws.micro_samples.dim(), (0, 2, 3, 4));
        assert!(draws.macro_std().is_none());
        assert!(draws.macro_mean().is_none());
    }

    #[test]
    fn test_draw_summaries() {
        let net = network(Variant::Current);
        let draws = net
            .sample_n(batch(2, 3, 5).view(), 20, &mut ChaCha8Rng::seed_from_u64(2))
            .unwrap();
        assert_eq!(draws.macro_mean().unwrap().dim(), (2, 3));
        assert_eq!(draws.micro_std().unwrap().dim(), (2, 3, 4));
        assert!(draws.macro_std().unwrap().iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_shape_errors() {
        let net = network(Variant::Current);
        let err = net
            .forward(batch(2, 4, 6).view(), Array2::zeros((2, 3)).view())
            .unwrap_err();
        assert!(matches!(err, NetworkError::ShapeMismatch { what: "data", .. }));

        let err = net
            .forward(batch(2, 4, 5).view(), Array2::zeros((3, 3)).view())
            .unwrap_err();
        assert!(matches!(err, NetworkError::ShapeMismatch { what: "macro_params", .. }));
    }

    #[test]
    fn test_rejects_bad_construction() {
        let cfg = NetworkConfig {
            embedding_gru_units: None,
            ..small_config(2, 1)
        };
        assert!(PosteriorNetwork::with_seed(cfg.clone(), Variant::Legacy, 3, 0).is_err());
        assert!(PosteriorNetwork::with_seed(cfg.clone(), Variant::Current, 3, 0).is_ok());
        assert!(PosteriorNetwork::with_seed(cfg, Variant::Current, 0, 0).is_err());
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = network(Variant::Legacy);
        let b = network(Variant::Legacy);
        let data = batch(1, 4, 5);
        let m = Array2::zeros((1, 3));
        assert_eq!(
            a.forward(data.view(), m.view()).unwrap(),
            b.forward(data.view(), m.view()).unwrap()
        );
    }
}
