//! Layer kernels for the convolutional forecaster.
//!
//! Every activation is an `Array2<f64>`: sequences are `[length, channels]`
//! and flattened vectors are `[1, features]`, so dense layers work on row
//! vectors and no separate tensor type is needed.

use ndarray::{s, Array, Array1, Array2, Axis, Zip};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::topology::Activation;

// ---------------------------------------------------------------------------
// Activations
// ---------------------------------------------------------------------------

pub fn activate(activation: Activation, z: &Array2<f64>) -> Array2<f64> {
    match activation {
        Activation::Elu => z.mapv(|v| if v > 0.0 { v } else { v.exp_m1() }),
        Activation::Relu => z.mapv(|v| v.max(0.0)),
        Activation::Tanh => z.mapv(f64::tanh),
        Activation::Sigmoid => z.mapv(|v| 1.0 / (1.0 + (-v).exp())),
        Activation::Linear => z.clone(),
    }
}

/// Derivative of the activation, given pre-activation `z` and output `a`.
pub fn activation_grad(activation: Activation, z: &Array2<f64>, a: &Array2<f64>) -> Array2<f64> {
    Zip::from(z).and(a).map_collect(|&z, &a| match activation {
        Activation::Elu => {
            if z > 0.0 {
                1.0
            } else {
                a + 1.0
            }
        }
        Activation::Relu => {
            if z > 0.0 {
                1.0
            } else {
                0.0
            }
        }
        Activation::Tanh => 1.0 - a * a,
        Activation::Sigmoid => a * (1.0 - a),
        Activation::Linear => 1.0,
    })
}

/// Glorot/Xavier uniform initialisation.
fn glorot<R: Rng>(
    shape: (usize, usize),
    fan_in: usize,
    fan_out: usize,
    rng: &mut R,
) -> Array2<f64> {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    let dist = Uniform::new_inclusive(-limit, limit);
    Array2::from_shape_fn(shape, |_| dist.sample(&mut *rng))
}

// ---------------------------------------------------------------------------
// Parameter gradients
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ParamGrad {
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

impl ParamGrad {
    pub fn add_assign(&mut self, other: &ParamGrad) {
        self.weight += &other.weight;
        self.bias += &other.bias;
    }

    pub fn scale(&mut self, factor: f64) {
        self.weight *= factor;
        self.bias *= factor;
    }

    pub fn squared_norm(&self) -> f64 {
        let weight: f64 = self.weight.iter().map(|v| v * v).sum();
        let bias: f64 = self.bias.iter().map(|v| v * v).sum();
        weight + bias
    }
}

// ---------------------------------------------------------------------------
// Conv1d
// ---------------------------------------------------------------------------

/// 1-D convolution with valid padding and stride 1.
///
/// Implemented as im2col followed by a matrix product: each output step sees
/// a `[kernel_size * in_channels]` row of the input.
#[derive(Debug, Clone)]
pub struct Conv1d {
    /// `[kernel_size * in_channels, filters]`
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
    pub kernel_size: usize,
    pub in_channels: usize,
    pub activation: Activation,
}

#[derive(Debug, Clone)]
pub struct ConvTrace {
    input_len: usize,
    cols: Array2<f64>,
    z: Array2<f64>,
    a: Array2<f64>,
}

impl Conv1d {
    pub fn new<R: Rng>(
        in_channels: usize,
        filters: usize,
        kernel_size: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let fan = kernel_size * in_channels;
        Self {
            weight: glorot((fan, filters), fan, kernel_size * filters, rng),
            bias: Array1::zeros(filters),
            kernel_size,
            in_channels,
            activation,
        }
    }

    pub fn output_len(&self, input_len: usize) -> Option<usize> {
        input_len.checked_sub(self.kernel_size).map(|d| d + 1)
    }

    fn im2col(&self, x: &Array2<f64>) -> Array2<f64> {
        let out_len = x.nrows() + 1 - self.kernel_size;
        let width = self.kernel_size * self.in_channels;
        Array2::from_shape_fn((out_len, width), |(t, j)| {
            x[[t + j / self.in_channels, j % self.in_channels]]
        })
    }

    pub fn forward(&self, x: &Array2<f64>) -> (Array2<f64>, ConvTrace) {
        let cols = self.im2col(x);
        let z = cols.dot(&self.weight) + &self.bias;
        let a = activate(self.activation, &z);
        let trace = ConvTrace {
            input_len: x.nrows(),
            cols,
            z,
            a: a.clone(),
        };
        (a, trace)
    }

    pub fn backward(&self, trace: &ConvTrace, grad: &Array2<f64>) -> (Array2<f64>, ParamGrad) {
        let dz = grad * &activation_grad(self.activation, &trace.z, &trace.a);
        let param = ParamGrad {
            weight: trace.cols.t().dot(&dz),
            bias: dz.sum_axis(Axis(0)),
        };

        let dcols = dz.dot(&self.weight.t());
        let mut dx: Array2<f64> = Array2::zeros((trace.input_len, self.in_channels));
        for (t, row) in dcols.axis_iter(Axis(0)).enumerate() {
            for k in 0..self.kernel_size {
                let start = k * self.in_channels;
                let mut target = dx.row_mut(t + k);
                target += &row.slice(s![start..start + self.in_channels]);
            }
        }
        (dx, param)
    }
}

// ---------------------------------------------------------------------------
// MaxPool1d
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MaxPool1d {
    pub pool_size: usize,
    pub stride: usize,
}

#[derive(Debug, Clone)]
pub struct PoolTrace {
    input_len: usize,
    /// Input row chosen for each `[output step, channel]`.
    argmax: Array2<usize>,
}

impl MaxPool1d {
    pub fn output_len(&self, input_len: usize) -> Option<usize> {
        input_len
            .checked_sub(self.pool_size)
            .map(|d| d / self.stride + 1)
    }

    pub fn forward(&self, x: &Array2<f64>) -> (Array2<f64>, PoolTrace) {
        let out_len = (x.nrows() - self.pool_size) / self.stride + 1;
        let channels = x.ncols();
        let mut out: Array2<f64> = Array2::zeros((out_len, channels));
        let mut argmax: Array2<usize> = Array2::zeros((out_len, channels));

        for t in 0..out_len {
            let start = t * self.stride;
            for c in 0..channels {
                let mut best = start;
                for r in start + 1..start + self.pool_size {
                    if x[[r, c]] > x[[best, c]] {
                        best = r;
                    }
                }
                out[[t, c]] = x[[best, c]];
                argmax[[t, c]] = best;
            }
        }

        let trace = PoolTrace {
            input_len: x.nrows(),
            argmax,
        };
        (out, trace)
    }

    pub fn backward(&self, trace: &PoolTrace, grad: &Array2<f64>) -> Array2<f64> {
        let mut dx: Array2<f64> = Array2::zeros((trace.input_len, grad.ncols()));
        for ((t, c), &g) in grad.indexed_iter() {
            dx[[trace.argmax[[t, c]], c]] += g;
        }
        dx
    }
}

// ---------------------------------------------------------------------------
// Flatten
// ---------------------------------------------------------------------------

/// `[length, channels]` → `[1, length * channels]`, row-major.
#[derive(Debug, Clone)]
pub struct Flatten {
    pub rows: usize,
    pub cols: usize,
}

impl Flatten {
    pub fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        Array::from_iter(x.iter().copied()).insert_axis(Axis(0))
    }

    pub fn backward(&self, grad: &Array2<f64>) -> Array2<f64> {
        let cols = self.cols;
        Array2::from_shape_fn((self.rows, cols), |(i, j)| grad[[0, i * cols + j]])
    }
}

// ---------------------------------------------------------------------------
// Dense
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Dense {
    /// `[inputs, units]`
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
    pub activation: Activation,
}

#[derive(Debug, Clone)]
pub struct DenseTrace {
    x: Array2<f64>,
    z: Array2<f64>,
    a: Array2<f64>,
}

impl Dense {
    pub fn new<R: Rng>(inputs: usize, units: usize, activation: Activation, rng: &mut R) -> Self {
        Self {
            weight: glorot((inputs, units), inputs, units, rng),
            bias: Array1::zeros(units),
            activation,
        }
    }

    pub fn forward(&self, x: &Array2<f64>) -> (Array2<f64>, DenseTrace) {
        let z = x.dot(&self.weight) + &self.bias;
        let a = activate(self.activation, &z);
        let trace = DenseTrace {
            x: x.clone(),
            z,
            a: a.clone(),
        };
        (a, trace)
    }

    pub fn backward(&self, trace: &DenseTrace, grad: &Array2<f64>) -> (Array2<f64>, ParamGrad) {
        let dz = grad * &activation_grad(self.activation, &trace.z, &trace.a);
        let param = ParamGrad {
            weight: trace.x.t().dot(&dz),
            bias: dz.sum_axis(Axis(0)),
        };
        (dz.dot(&self.weight.t()), param)
    }
}

// ---------------------------------------------------------------------------
// Layer dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Layer {
    Conv1d(Conv1d),
    MaxPool1d(MaxPool1d),
    Flatten(Flatten),
    Dense(Dense),
}

/// What a layer remembers from its forward pass for backpropagation.
#[derive(Debug, Clone)]
pub enum Trace {
    Conv(ConvTrace),
    Pool(PoolTrace),
    Flatten,
    Dense(DenseTrace),
}

impl Layer {
    pub fn forward(&self, x: &Array2<f64>) -> (Array2<f64>, Trace) {
        match self {
            Layer::Conv1d(l) => {
                let (y, t) = l.forward(x);
                (y, Trace::Conv(t))
            }
            Layer::MaxPool1d(l) => {
                let (y, t) = l.forward(x);
                (y, Trace::Pool(t))
            }
            Layer::Flatten(l) => (l.forward(x), Trace::Flatten),
            Layer::Dense(l) => {
                let (y, t) = l.forward(x);
                (y, Trace::Dense(t))
            }
        }
    }

    /// Forward pass without keeping a trace.
    pub fn infer(&self, x: &Array2<f64>) -> Array2<f64> {
        self.forward(x).0
    }

    /// Gradient with respect to the input, plus parameter gradients for
    /// layers that have parameters.
    pub fn backward(&self, trace: &Trace, grad: &Array2<f64>) -> (Array2<f64>, Option<ParamGrad>) {
        match (self, trace) {
            (Layer::Conv1d(l), Trace::Conv(t)) => {
                let (dx, p) = l.backward(t, grad);
                (dx, Some(p))
            }
            (Layer::MaxPool1d(l), Trace::Pool(t)) => (l.backward(t, grad), None),
            (Layer::Flatten(l), Trace::Flatten) => (l.backward(grad), None),
            (Layer::Dense(l), Trace::Dense(t)) => {
                let (dx, p) = l.backward(t, grad);
                (dx, Some(p))
            }
            _ => unreachable!("trace was recorded by a different layer kind"),
        }
    }

    pub fn params_mut(&mut self) -> Option<(&mut Array2<f64>, &mut Array1<f64>)> {
        match self {
            Layer::Conv1d(l) => Some((&mut l.weight, &mut l.bias)),
            Layer::Dense(l) => Some((&mut l.weight, &mut l.bias)),
            Layer::MaxPool1d(_) | Layer::Flatten(_) => None,
        }
    }

    pub fn num_parameters(&self) -> usize {
        match self {
            Layer::Conv1d(l) => l.weight.len() + l.bias.len(),
            Layer::Dense(l) => l.weight.len() + l.bias.len(),
            Layer::MaxPool1d(_) | Layer::Flatten(_) => 0,
        }
    }
}
