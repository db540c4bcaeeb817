//! Dense and recurrent layers, and the ordered stage pipeline that composes
//! them.
//!
//! Activations flow between stages as either a sequence (B, T, F) or a
//! summary (B, F). Recurrent layers consume sequences; dense layers apply
//! per row or per time step, so they accept both.

use std::str::FromStr;

use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use serde::{Deserialize, Serialize};

use crate::distributions::softplus;
use crate::error::{NetworkError, Result};

const SELU_ALPHA: f64 = 1.673_263_242_354_377_2;
const SELU_SCALE: f64 = 1.050_700_987_355_480_5;

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Element-wise activation, named the way layer configs spell them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Tanh,
    Sigmoid,
    Elu,
    Selu,
    Softplus,
    #[serde(alias = "silu")]
    Swish,
    Exponential,
}

impl FromStr for Activation {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| NetworkError::InvalidConfig(format!("unknown activation '{}'", s)))
    }
}

impl Activation {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Linear => x,
            Activation::Relu => x.max(0.0),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => sigmoid(x),
            Activation::Elu => {
                if x > 0.0 {
                    x
                } else {
                    x.exp_m1()
                }
            }
            Activation::Selu => {
                if x > 0.0 {
                    SELU_SCALE * x
                } else {
                    SELU_SCALE * SELU_ALPHA * x.exp_m1()
                }
            }
            Activation::Softplus => softplus(x),
            Activation::Swish => x * sigmoid(x),
            Activation::Exponential => x.exp(),
        }
    }
}

// ── Initializers ────────────────────────────────────────────────────

/// Glorot/Xavier uniform: U(-l, l) with l = sqrt(6 / (fan_in + fan_out)).
fn glorot_uniform<R: Rng + ?Sized>(fan_in: usize, fan_out: usize, rng: &mut R) -> Array2<f64> {
    let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
    let dist = Uniform::new_inclusive(-limit, limit);
    Array2::from_shape_simple_fn((fan_in, fan_out), || dist.sample(rng))
}

/// Random matrix with orthonormal rows or columns (whichever is shorter),
/// from Gram-Schmidt on a standard normal draw.
fn orthogonal<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f64> {
    let (tall, short) = (rows.max(cols), rows.min(cols));
    let mut q: Array2<f64> =
        Array2::from_shape_simple_fn((tall, short), || StandardNormal.sample(rng));

    for j in 0..short {
        for k in 0..j {
            let proj = q.column(j).dot(&q.column(k));
            let basis = q.column(k).to_owned();
            q.column_mut(j).scaled_add(-proj, &basis);
        }
        let norm = q.column(j).dot(&q.column(j)).sqrt();
        if norm > f64::EPSILON {
            q.column_mut(j).mapv_inplace(|v| v / norm);
        }
    }

    if rows < cols {
        q.reversed_axes()
    } else {
        q
    }
}

// ── Dense ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Dense {
    /// (input_dim, units)
    pub kernel: Array2<f64>,
    pub bias: Option<Array1<f64>>,
    pub activation: Activation,
}

impl Dense {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        units: usize,
        activation: Activation,
        use_bias: bool,
        rng: &mut R,
    ) -> Self {
        Self {
            kernel: glorot_uniform(input_dim, units, rng),
            bias: use_bias.then(|| Array1::zeros(units)),
            activation,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn units(&self) -> usize {
        self.kernel.ncols()
    }

    pub fn num_parameters(&self) -> usize {
        self.kernel.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }

    /// (N, input_dim) -> (N, units)
    pub fn forward_rows(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut out = x.dot(&self.kernel);
        if let Some(bias) = &self.bias {
            out += bias;
        }
        let act = self.activation;
        out.mapv_inplace(|v| act.apply(v));
        out
    }

    /// (B, T, input_dim) -> (B, T, units), the same weights at every step.
    pub fn forward_sequence(&self, x: ArrayView3<f64>) -> Array3<f64> {
        let (batch, steps, _) = x.dim();
        let mut out = Array3::zeros((batch, steps, self.units()));
        for t in 0..steps {
            out.index_axis_mut(Axis(1), t)
                .assign(&self.forward_rows(x.index_axis(Axis(1), t)));
        }
        out
    }
}

// ── LSTM ────────────────────────────────────────────────────────────

/// Long short-term memory layer with gates ordered input, forget, cell,
/// output. Starts from a zero state.
#[derive(Debug, Clone)]
pub struct Lstm {
    /// (input_dim, 4 * units)
    pub kernel: Array2<f64>,
    /// (units, 4 * units)
    pub recurrent_kernel: Array2<f64>,
    /// (4 * units)
    pub bias: Array1<f64>,
    pub return_sequences: bool,
}

impl Lstm {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        units: usize,
        return_sequences: bool,
        rng: &mut R,
    ) -> Self {
        let mut bias = Array1::zeros(4 * units);
        bias.slice_mut(s![units..2 * units]).fill(1.0);
        Self {
            kernel: glorot_uniform(input_dim, 4 * units, rng),
            recurrent_kernel: orthogonal(units, 4 * units, rng),
            bias,
            return_sequences,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn units(&self) -> usize {
        self.recurrent_kernel.nrows()
    }

    pub fn num_parameters(&self) -> usize {
        self.kernel.len() + self.recurrent_kernel.len() + self.bias.len()
    }

    pub fn forward(&self, x: ArrayView3<f64>) -> Activations {
        let (batch, steps, _) = x.dim();
        let u = self.units();
        let mut h = Array2::<f64>::zeros((batch, u));
        let mut c = Array2::<f64>::zeros((batch, u));
        let mut seq = self
            .return_sequences
            .then(|| Array3::<f64>::zeros((batch, steps, u)));

        for t in 0..steps {
            let z = x.index_axis(Axis(1), t).dot(&self.kernel)
                + h.dot(&self.recurrent_kernel)
                + &self.bias;
            let i = z.slice(s![.., ..u]).mapv(sigmoid);
            let f = z.slice(s![.., u..2 * u]).mapv(sigmoid);
            let g = z.slice(s![.., 2 * u..3 * u]).mapv(f64::tanh);
            let o = z.slice(s![.., 3 * u..]).mapv(sigmoid);

            c = &f * &c + &i * &g;
            h = &o * &c.mapv(f64::tanh);

            if let Some(seq) = seq.as_mut() {
                seq.index_axis_mut(Axis(1), t).assign(&h);
            }
        }

        match seq {
            Some(seq) => Activations::Sequence(seq),
            None => Activations::Summary(h),
        }
    }
}

// ── GRU ─────────────────────────────────────────────────────────────

/// Gated recurrent unit with gates ordered update, reset, candidate. The
/// reset gate is applied after the recurrent matmul, so input and recurrent
/// biases are kept separately.
#[derive(Debug, Clone)]
pub struct Gru {
    /// (input_dim, 3 * units)
    pub kernel: Array2<f64>,
    /// (units, 3 * units)
    pub recurrent_kernel: Array2<f64>,
    /// (3 * units)
    pub input_bias: Array1<f64>,
    /// (3 * units)
    pub recurrent_bias: Array1<f64>,
    pub return_sequences: bool,
}

impl Gru {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        units: usize,
        return_sequences: bool,
        rng: &mut R,
    ) -> Self {
        Self {
            kernel: glorot_uniform(input_dim, 3 * units, rng),
            recurrent_kernel: orthogonal(units, 3 * units, rng),
            input_bias: Array1::zeros(3 * units),
            recurrent_bias: Array1::zeros(3 * units),
            return_sequences,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn units(&self) -> usize {
        self.recurrent_kernel.nrows()
    }

    pub fn num_parameters(&self) -> usize {
        self.kernel.len()
            + self.recurrent_kernel.len()
            + self.input_bias.len()
            + self.recurrent_bias.len()
    }

    pub fn forward(&self, x: ArrayView3<f64>) -> Activations {
        let (batch, steps, _) = x.dim();
        let u = self.units();
        let mut h = Array2::<f64>::zeros((batch, u));
        let mut seq = self
            .return_sequences
            .then(|| Array3::<f64>::zeros((batch, steps, u)));

        for t in 0..steps {
            let xz = x.index_axis(Axis(1), t).dot(&self.kernel) + &self.input_bias;
            let hz = h.dot(&self.recurrent_kernel) + &self.recurrent_bias;

            let z = (&xz.slice(s![.., ..u]) + &hz.slice(s![.., ..u])).mapv(sigmoid);
            let r = (&xz.slice(s![.., u..2 * u]) + &hz.slice(s![.., u..2 * u])).mapv(sigmoid);
            let cand = (&xz.slice(s![.., 2 * u..]) + &(&r * &hz.slice(s![.., 2 * u..])))
                .mapv(f64::tanh);

            h = &z * &h + &z.mapv(|v| 1.0 - v) * &cand;

            if let Some(seq) = seq.as_mut() {
                seq.index_axis_mut(Axis(1), t).assign(&h);
            }
        }

        match seq {
            Some(seq) => Activations::Sequence(seq),
            None => Activations::Summary(h),
        }
    }
}

// ── Pipeline ────────────────────────────────────────────────────────

/// Values passed across a stage boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Activations {
    /// (B, T, F)
    Sequence(Array3<f64>),
    /// (B, F)
    Summary(Array2<f64>),
}

impl Activations {
    pub fn width(&self) -> usize {
        match self {
            Activations::Sequence(a) => a.len_of(Axis(2)),
            Activations::Summary(a) => a.ncols(),
        }
    }

    pub fn into_sequence(self, what: &'static str) -> Result<Array3<f64>> {
        match self {
            Activations::Sequence(a) => Ok(a),
            Activations::Summary(a) => Err(NetworkError::ShapeMismatch {
                what,
                expected: "(batch, time, features)".to_string(),
                got: format!("{:?}", a.shape()),
            }),
        }
    }

    pub fn into_summary(self, what: &'static str) -> Result<Array2<f64>> {
        match self {
            Activations::Summary(a) => Ok(a),
            Activations::Sequence(a) => Err(NetworkError::ShapeMismatch {
                what,
                expected: "(batch, features)".to_string(),
                got: format!("{:?}", a.shape()),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Layer {
    Dense(Dense),
    Lstm(Lstm),
    Gru(Gru),
}

impl Layer {
    pub fn input_dim(&self) -> usize {
        match self {
            Layer::Dense(l) => l.input_dim(),
            Layer::Lstm(l) => l.input_dim(),
            Layer::Gru(l) => l.input_dim(),
        }
    }

    pub fn output_dim(&self) -> usize {
        match self {
            Layer::Dense(l) => l.units(),
            Layer::Lstm(l) => l.units(),
            Layer::Gru(l) => l.units(),
        }
    }

    pub fn num_parameters(&self) -> usize {
        match self {
            Layer::Dense(l) => l.num_parameters(),
            Layer::Lstm(l) => l.num_parameters(),
            Layer::Gru(l) => l.num_parameters(),
        }
    }

    fn needs_sequence(&self) -> bool {
        !matches!(self, Layer::Dense(_))
    }

    /// Whether the output keeps the time axis, given whether the input did.
    fn keeps_sequence(&self, input_is_sequence: bool) -> bool {
        match self {
            Layer::Dense(_) => input_is_sequence,
            Layer::Lstm(l) => l.return_sequences,
            Layer::Gru(l) => l.return_sequences,
        }
    }

    fn forward(&self, input: &Activations) -> Result<Activations> {
        match (self, input) {
            (Layer::Dense(l), Activations::Sequence(x)) => {
                Ok(Activations::Sequence(l.forward_sequence(x.view())))
            }
            (Layer::Dense(l), Activations::Summary(x)) => {
                Ok(Activations::Summary(l.forward_rows(x.view())))
            }
            (Layer::Lstm(l), Activations::Sequence(x)) => Ok(l.forward(x.view())),
            (Layer::Gru(l), Activations::Sequence(x)) => Ok(l.forward(x.view())),
            (_, Activations::Summary(x)) => Err(NetworkError::ShapeMismatch {
                what: "recurrent layer input",
                expected: "(batch, time, features)".to_string(),
                got: format!("{:?}", x.shape()),
            }),
        }
    }
}

/// A named layer within a pipeline.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub layer: Layer,
}

impl Stage {
    pub fn new(name: &str, layer: Layer) -> Self {
        Self {
            name: name.to_string(),
            layer,
        }
    }
}

/// Ordered stages applied one after another.
///
/// Construction checks every boundary: widths must match, and a recurrent
/// stage cannot follow a stage that dropped the time axis.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    sequence_input: bool,
}

impl Pipeline {
    /// `sequence_input` says whether the first stage receives (B, T, F).
    pub fn new(stages: Vec<Stage>, sequence_input: bool) -> Result<Self> {
        if stages.is_empty() {
            return Err(NetworkError::InvalidConfig(
                "pipeline needs at least one stage".to_string(),
            ));
        }
        let mut is_sequence = sequence_input;
        for (idx, stage) in stages.iter().enumerate() {
            if stage.layer.needs_sequence() && !is_sequence {
                return Err(NetworkError::InvalidConfig(format!(
                    "stage '{}' needs a time axis that an earlier stage removed",
                    stage.name
                )));
            }
            if let Some(next) = stages.get(idx + 1) {
                if stage.layer.output_dim() != next.layer.input_dim() {
                    return Err(NetworkError::InvalidConfig(format!(
                        "stage '{}' emits width {} but '{}' expects {}",
                        stage.name,
                        stage.layer.output_dim(),
                        next.name,
                        next.layer.input_dim()
                    )));
                }
            }
            is_sequence = stage.layer.keeps_sequence(is_sequence);
        }
        Ok(Self {
            stages,
            sequence_input,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn input_dim(&self) -> usize {
        self.stages[0].layer.input_dim()
    }

    pub fn output_dim(&self) -> usize {
        self.stages[self.stages.len() - 1].layer.output_dim()
    }

    pub fn num_parameters(&self) -> usize {
        self.stages.iter().map(|s| s.layer.num_parameters()).sum()
    }

    pub fn forward(&self, input: &Activations) -> Result<Activations> {
        let is_sequence = matches!(input, Activations::Sequence(_));
        if is_sequence != self.sequence_input || input.width() != self.input_dim() {
            let got = match input {
                Activations::Sequence(a) => a.shape().to_vec(),
                Activations::Summary(a) => a.shape().to_vec(),
            };
            let expected = if self.sequence_input {
                format!("(batch, time, {})", self.input_dim())
            } else {
                format!("(batch, {})", self.input_dim())
            };
            return Err(NetworkError::ShapeMismatch {
                what: "pipeline input",
                expected,
                got: format!("{:?}", got),
            });
        }

        let mut current: Option<Activations> = None;
        for stage in &self.stages {
            current = Some(stage.layer.forward(current.as_ref().unwrap_or(input))?);
        }
        current.ok_or_else(|| NetworkError::InvalidConfig("empty pipeline".to_string()))
    }
}
