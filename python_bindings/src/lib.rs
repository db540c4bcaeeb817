use ddmnet_core::config::{DenseArgs, NetworkConfig, Variant};
use ddmnet_core::layers::Activation;
use ddmnet_core::network::{PosteriorDraws, PosteriorNetwork, DEFAULT_N_SAMPLES};
use ddmnet_core::priors;
use numpy::{IntoPyArray, PyArray2, PyArray3, PyArray4, PyReadonlyArray2, PyReadonlyArray3};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn value_error<E: std::fmt::Display>(err: E) -> PyErr {
    PyValueError::new_err(err.to_string())
}

fn make_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    }
}

fn required<'py, T: FromPyObject<'py>>(dict: &Bound<'py, PyDict>, key: &str) -> PyResult<T> {
    dict.get_item(key)?
        .ok_or_else(|| PyValueError::new_err(format!("missing key: {}", key)))?
        .extract()
}

fn optional<'py, T: FromPyObject<'py>>(
    dict: &Bound<'py, PyDict>,
    key: &str,
) -> PyResult<Option<T>> {
    match dict.get_item(key)? {
        Some(v) if !v.is_none() => Ok(Some(v.extract()?)),
        _ => Ok(None),
    }
}

fn dense_args(meta: &Bound<'_, PyDict>, key: &str) -> PyResult<DenseArgs> {
    let args: Bound<'_, PyDict> = required(meta, key)?;
    let activation = optional::<String>(&args, "activation")?
        .map(|name| name.parse::<Activation>())
        .transpose()
        .map_err(value_error)?;
    Ok(DenseArgs {
        units: required(&args, "units")?,
        activation,
        use_bias: optional(&args, "use_bias")?.unwrap_or(true),
    })
}

/// Read the construction mapping. Keys the network does not use are ignored.
fn config_from_dict(meta: &Bound<'_, PyDict>) -> PyResult<NetworkConfig> {
    Ok(NetworkConfig {
        embedding_lstm_units: required(meta, "embedding_lstm_units")?,
        embedding_gru_units: optional(meta, "embedding_gru_units")?,
        dense_pre_args: dense_args(meta, "dense_pre_args")?,
        dense_micro_args: dense_args(meta, "dense_micro_args")?,
        macro_lstm_units: required(meta, "macro_lstm_units")?,
        n_micro_params: required(meta, "n_micro_params")?,
        n_macro_params: required(meta, "n_macro_params")?,
    })
}

#[pyfunction]
#[pyo3(signature = (batch_size, n_cond=priors::DEFAULT_N_COND))]
fn diffusion_prior(
    py: Python<'_>,
    batch_size: usize,
    n_cond: usize,
) -> PyResult<Bound<'_, PyArray2<f64>>> {
    let draws = priors::diffusion_prior(batch_size, n_cond).map_err(value_error)?;
    Ok(draws.into_pyarray(py))
}

#[pyfunction]
#[pyo3(signature = (batch_size, n_cond=priors::DEFAULT_N_COND))]
fn diffusion_prior_gp(
    py: Python<'_>,
    batch_size: usize,
    n_cond: usize,
) -> PyResult<Bound<'_, PyArray2<f64>>> {
    let draws = priors::diffusion_prior_gp(batch_size, n_cond).map_err(value_error)?;
    Ok(draws.into_pyarray(py))
}

#[pyfunction]
#[pyo3(signature = (
    batch_size,
    n_params,
    alpha=priors::DEFAULT_RW_ALPHA,
    beta=priors::DEFAULT_RW_BETA
))]
fn random_walk_prior(
    py: Python<'_>,
    batch_size: usize,
    n_params: usize,
    alpha: f64,
    beta: f64,
) -> PyResult<Bound<'_, PyArray2<f64>>> {
    let draws =
        priors::random_walk_prior(batch_size, n_params, alpha, beta).map_err(value_error)?;
    Ok(draws.into_pyarray(py))
}

/// Returns float32, unlike the other priors.
#[pyfunction]
#[pyo3(signature = (
    batch_size,
    n_params,
    lower=priors::DEFAULT_LENGTH_SCALE_LOWER,
    upper=priors::DEFAULT_LENGTH_SCALE_UPPER
))]
fn length_scale_prior(
    py: Python<'_>,
    batch_size: usize,
    n_params: usize,
    lower: f64,
    upper: f64,
) -> PyResult<Bound<'_, PyArray2<f32>>> {
    let draws =
        priors::length_scale_prior(batch_size, n_params, lower, upper).map_err(value_error)?;
    Ok(draws.into_pyarray(py))
}

type DrawArrays<'py> = (Bound<'py, PyArray3<f64>>, Bound<'py, PyArray4<f64>>);

fn draws_to_py(py: Python<'_>, draws: PosteriorDraws) -> DrawArrays<'_> {
    (
        draws.macro_samples.into_pyarray(py),
        draws.micro_samples.into_pyarray(py),
    )
}

#[pyclass(name = "PosteriorNetwork")]
struct PyPosteriorNetwork {
    inner: PosteriorNetwork,
}

#[pymethods]
impl PyPosteriorNetwork {
    #[new]
    #[pyo3(signature = (meta, data_dim, legacy=false, seed=None))]
    fn new(
        meta: &Bound<'_, PyDict>,
        data_dim: usize,
        legacy: bool,
        seed: Option<u64>,
    ) -> PyResult<Self> {
        let config = config_from_dict(meta)?;
        let variant = if legacy { Variant::Legacy } else { Variant::Current };
        let inner = PosteriorNetwork::new(config, variant, data_dim, &mut make_rng(seed))
            .map_err(value_error)?;
        Ok(Self { inner })
    }

    /// Returns `({"loc", "scale"}, {"loc", "scale_tril"})`.
    fn forward<'py>(
        &self,
        py: Python<'py>,
        data: PyReadonlyArray3<'py, f64>,
        macro_params: PyReadonlyArray2<'py, f64>,
    ) -> PyResult<(Bound<'py, PyDict>, Bound<'py, PyDict>)> {
        let data = data.as_array().to_owned();
        let macro_params = macro_params.as_array().to_owned();
        let (macro_post, micro_post) = py
            .allow_threads(|| self.inner.forward(data.view(), macro_params.view()))
            .map_err(value_error)?;

        let macro_dict = PyDict::new(py);
        macro_dict.set_item("loc", macro_post.loc.into_pyarray(py))?;
        macro_dict.set_item("scale", macro_post.scale.into_pyarray(py))?;
        let micro_dict = PyDict::new(py);
        micro_dict.set_item("loc", micro_post.loc.into_pyarray(py))?;
        micro_dict.set_item("scale_tril", micro_post.scale_tril.into_pyarray(py))?;
        Ok((macro_dict, micro_dict))
    }

    #[pyo3(signature = (data, seed=None))]
    fn sample<'py>(
        &self,
        py: Python<'py>,
        data: PyReadonlyArray3<'py, f64>,
        seed: Option<u64>,
    ) -> PyResult<(Bound<'py, PyArray2<f64>>, Bound<'py, PyArray3<f64>>)> {
        let data = data.as_array().to_owned();
        let (macro_draw, micro_draw) = py
            .allow_threads(|| self.inner.sample(data.view(), &mut make_rng(seed)))
            .map_err(value_error)?;
        Ok((macro_draw.into_pyarray(py), micro_draw.into_pyarray(py)))
    }

    #[pyo3(signature = (data, n_samples=DEFAULT_N_SAMPLES, seed=None))]
    fn sample_n<'py>(
        &self,
        py: Python<'py>,
        data: PyReadonlyArray3<'py, f64>,
        n_samples: usize,
        seed: Option<u64>,
    ) -> PyResult<DrawArrays<'py>> {
        let data = data.as_array().to_owned();
        let draws = py
            .allow_threads(|| self.inner.sample_n(data.view(), n_samples, &mut make_rng(seed)))
            .map_err(value_error)?;
        Ok(draws_to_py(py, draws))
    }

    #[pyo3(signature = (data, n_samples=DEFAULT_N_SAMPLES, seed=None))]
    fn sample_n_fixed_eta<'py>(
        &self,
        py: Python<'py>,
        data: PyReadonlyArray3<'py, f64>,
        n_samples: usize,
        seed: Option<u64>,
    ) -> PyResult<DrawArrays<'py>> {
        let data = data.as_array().to_owned();
        let draws = py
            .allow_threads(|| {
                self.inner
                    .sample_n_fixed_eta(data.view(), n_samples, &mut make_rng(seed))
            })
            .map_err(value_error)?;
        Ok(draws_to_py(py, draws))
    }

    fn num_parameters(&self) -> usize {
        self.inner.num_parameters()
    }

    fn __repr__(&self) -> String {
        let cfg = self.inner.config();
        format!(
            "ddmnet PosteriorNetwork ({:?}, data_dim={}, macro={}, micro={}, {} weights)",
            self.inner.variant(),
            self.inner.data_dim(),
            cfg.n_macro_params,
            cfg.n_micro_params,
            self.inner.num_parameters()
        )
    }
}

#[pymodule]
fn ddmnet(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyPosteriorNetwork>()?;
    m.add_function(wrap_pyfunction!(diffusion_prior, m)?)?;
    m.add_function(wrap_pyfunction!(diffusion_prior_gp, m)?)?;
    m.add_function(wrap_pyfunction!(random_walk_prior, m)?)?;
    m.add_function(wrap_pyfunction!(length_scale_prior, m)?)?;
    m.add("DEFAULT_N_SAMPLES", DEFAULT_N_SAMPLES)?;
    Ok(())
}
