//! A chain of layers instantiated from a resolved topology, plus the
//! linear output head that maps it back to the observed features.

use log::debug;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::Rng;

use super::layers::{Conv1d, Dense, DenseTrace, Flatten, Layer, MaxPool1d, ParamGrad, Trace};
use super::Uncertainty;
use crate::error::{HarnessError, Result};
use crate::topology::{Activation, LayerSpec, ResolvedLayer};

/// Activation shape flowing between layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Seq { len: usize, channels: usize },
    Flat(usize),
}

impl Shape {
    fn rows_cols(self) -> (usize, usize) {
        match self {
            Shape::Seq { len, channels } => (len, channels),
            Shape::Flat(n) => (1, n),
        }
    }
}

/// Gradients for every parameterised layer, head last.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub layers: Vec<Option<ParamGrad>>,
    pub head: ParamGrad,
}

impl Gradients {
    pub fn add_assign(&mut self, other: &Gradients) {
        for (mine, theirs) in self.layers.iter_mut().zip(&other.layers) {
            if let (Some(mine), Some(theirs)) = (mine, theirs) {
                mine.add_assign(theirs);
            }
        }
        self.head.add_assign(&other.head);
    }

    pub fn scale(&mut self, factor: f64) {
        for grad in self.layers.iter_mut().flatten() {
            grad.scale(factor);
        }
        self.head.scale(factor);
    }

    pub fn norm(&self) -> f64 {
        let layers: f64 = self.layers.iter().flatten().map(ParamGrad::squared_norm).sum();
        (layers + self.head.squared_norm()).sqrt()
    }
}

/// Everything a training step needs from one forward pass.
pub struct Pass {
    traces: Vec<Trace>,
    masks: Vec<Option<Array2<f64>>>,
    head_trace: DenseTrace,
    pub output: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct Network {
    layers: Vec<Layer>,
    head: Dense,
    /// Dropout after layer `i` when `dropout_after[i]` is set.
    dropout_after: Vec<bool>,
    dropout_rate: f64,
}

impl Network {
    /// Instantiate the chain for windows of `lookback` rows by `features`
    /// columns, checking that every layer's shape requirement holds.
    pub fn build(
        topology: &[ResolvedLayer],
        lookback: usize,
        features: usize,
        uncertainty: Uncertainty,
        dropout_rate: f64,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let invalid = |id: &str, msg: String| {
            HarnessError::InvalidTopology(format!("layer '{id}': {msg}"))
        };

        let mut shape = Shape::Seq {
            len: lookback,
            channels: features,
        };
        let mut layers = Vec::with_capacity(topology.len());

        for node in topology {
            let (layer, next) = match (&node.spec, shape) {
                (LayerSpec::Conv1D(p), Shape::Seq { len, channels }) => {
                    if p.filters == 0 || p.kernel_size == 0 {
                        let msg = "filters and kernel_size must be positive";
                        return Err(invalid(&node.id, msg.into()));
                    }
                    let conv = Conv1d::new(channels, p.filters, p.kernel_size, p.activation, rng);
                    let out = conv.output_len(len).ok_or_else(|| {
                        let k = p.kernel_size;
                        let msg = format!("kernel {k} is longer than its input of {len} steps");
                        invalid(&node.id, msg)
                    })?;
                    (Layer::Conv1d(conv), Shape::Seq { len: out, channels: p.filters })
                }
                (LayerSpec::MaxPooling1D(p), Shape::Seq { len, channels }) => {
                    if p.pool_size == 0 || p.stride() == 0 {
                        let msg = "pool_size and strides must be positive";
                        return Err(invalid(&node.id, msg.into()));
                    }
                    let pool = MaxPool1d {
                        pool_size: p.pool_size,
                        stride: p.stride(),
                    };
                    let out = pool.output_len(len).ok_or_else(|| {
                        let size = p.pool_size;
                        let msg = format!("pool {size} is longer than its input of {len} steps");
                        invalid(&node.id, msg)
                    })?;
                    (Layer::MaxPool1d(pool), Shape::Seq { len: out, channels })
                }
                (LayerSpec::Flatten, shape) => {
                    let (rows, cols) = shape.rows_cols();
                    (Layer::Flatten(Flatten { rows, cols }), Shape::Flat(rows * cols))
                }
                (LayerSpec::Dense(p), Shape::Flat(inputs)) => {
                    if p.units == 0 {
                        return Err(invalid(&node.id, "units must be positive".into()));
                    }
                    let dense = Dense::new(inputs, p.units, p.activation, rng);
                    (Layer::Dense(dense), Shape::Flat(p.units))
                }
                (LayerSpec::Dense(_), Shape::Seq { .. }) => {
                    return Err(invalid(&node.id, "Dense needs a Flatten before it".into()));
                }
                (_, Shape::Flat(_)) => {
                    return Err(invalid(&node.id, "sequence layer after Flatten".into()));
                }
            };
            debug!("layer {} -> {:?}", node.id, next);
            layers.push(layer);
            shape = next;
        }

        let (rows, cols) = shape.rows_cols();
        let head_inputs = match shape {
            Shape::Flat(n) => n,
            Shape::Seq { .. } => {
                // an unflattened chain still gets a head over all its outputs
                layers.push(Layer::Flatten(Flatten { rows, cols }));
                rows * cols
            }
        };
        let head = Dense::new(head_inputs, features, Activation::Linear, rng);

        let n = layers.len();
        let dropout_after = (0..n)
            .map(|i| match uncertainty {
                Uncertainty::None => false,
                Uncertainty::Last => i + 1 == n,
                Uncertainty::All => true,
            })
            .collect();

        Ok(Network {
            layers,
            head,
            dropout_after,
            dropout_rate,
        })
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(Layer::num_parameters).sum::<usize>()
            + self.head.weight.len()
            + self.head.bias.len()
    }

    fn has_dropout(&self) -> bool {
        self.dropout_rate > 0.0 && self.dropout_after.iter().any(|&d| d)
    }

    /// Inverted dropout: kept units are scaled by `1 / (1 - rate)`.
    fn dropout_mask(&self, shape: (usize, usize), rng: &mut StdRng) -> Array2<f64> {
        let keep = 1.0 - self.dropout_rate;
        Array2::from_shape_fn(shape, |_| {
            if rng.gen::<f64>() < keep {
                1.0 / keep
            } else {
                0.0
            }
        })
    }

    /// Forward pass keeping traces for backpropagation. Dropout is sampled
    /// from `rng` when given, otherwise skipped.
    pub fn forward(&self, x: &Array2<f64>, mut rng: Option<&mut StdRng>) -> Pass {
        let mut h = x.clone();
        let mut traces = Vec::with_capacity(self.layers.len());
        let mut masks = Vec::with_capacity(self.layers.len());

        for (layer, &drop) in self.layers.iter().zip(&self.dropout_after) {
            let (out, trace) = layer.forward(&h);
            traces.push(trace);
            h = out;
            let mask = match rng.as_deref_mut() {
                Some(rng) if drop && self.dropout_rate > 0.0 => {
                    let mask = self.dropout_mask(h.dim(), rng);
                    h = &h * &mask;
                    Some(mask)
                }
                _ => None,
            };
            masks.push(mask);
        }

        let (output, head_trace) = self.head.forward(&h);
        Pass {
            traces,
            masks,
            head_trace,
            output,
        }
    }

    /// Backpropagate `grad` (d loss / d output) through a recorded pass.
    pub fn backward(&self, pass: &Pass, grad: &Array2<f64>) -> Gradients {
        let (mut g, head) = self.head.backward(&pass.head_trace, grad);

        let mut layers = vec![None; self.layers.len()];
        for i in (0..self.layers.len()).rev() {
            if let Some(mask) = &pass.masks[i] {
                g = &g * mask;
            }
            let (dx, param) = self.layers[i].backward(&pass.traces[i], &g);
            layers[i] = param;
            g = dx;
        }

        Gradients { layers, head }
    }

    /// Plain gradient-descent step.
    pub fn apply(&mut self, grads: &Gradients, learning_rate: f64) {
        for (layer, grad) in self.layers.iter_mut().zip(&grads.layers) {
            if let (Some((w, b)), Some(grad)) = (layer.params_mut(), grad) {
                w.scaled_add(-learning_rate, &grad.weight);
                b.scaled_add(-learning_rate, &grad.bias);
            }
        }
        self.head
            .weight
            .scaled_add(-learning_rate, &grads.head.weight);
        self.head.bias.scaled_add(-learning_rate, &grads.head.bias);
    }

    /// `samples` stochastic predictions for one window, or a single
    /// deterministic one when the network has no dropout.
    pub fn sample_predictions(
        &self,
        x: &Array2<f64>,
        samples: usize,
        rng: &mut StdRng,
    ) -> Vec<Array2<f64>> {
        if !self.has_dropout() {
            return vec![self.forward(x, None).output];
        }

        let only_last = self.dropout_after.iter().rev().skip(1).all(|&d| !d);
        if only_last {
            // the trunk is deterministic; only the head input is resampled
            let h = self
                .layers
                .iter()
                .fold(x.clone(), |h, layer| layer.infer(&h));
            return (0..samples.max(1))
                .map(|_| {
                    let mask = self.dropout_mask(h.dim(), rng);
                    self.head.forward(&(&h * &mask)).0
                })
                .collect();
        }

        (0..samples.max(1))
            .map(|_| self.forward(x, Some(&mut *rng)).output)
            .collect()
    }
}
