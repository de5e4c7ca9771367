use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::network::{Gradients, Network};
use super::{Forecaster, ForecasterConfig, Prediction};
use crate::error::{HarnessError, Result};
use crate::topology::{ResolvedLayer, Topology};

/// Global gradient norm above which a minibatch update is rescaled.
const MAX_GRAD_NORM: f64 = 5.0;

// ---------------------------------------------------------------------------
// Per-column standardisation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Scaler {
    mean: Array1<f64>,
    std: Array1<f64>,
}

impl Scaler {
    fn fit(series: ArrayView2<'_, f64>) -> Self {
        let mean = series
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(series.ncols()));
        // constant columns keep a unit scale
        let std = series
            .std_axis(Axis(0), 0.0)
            .mapv(|v| if v > f64::EPSILON { v } else { 1.0 });
        Scaler { mean, std }
    }

    fn transform(&self, series: ArrayView2<'_, f64>) -> Array2<f64> {
        (&series - &self.mean) / &self.std
    }

    fn inverse(&self, scaled: &Array2<f64>) -> Array2<f64> {
        scaled * &self.std + &self.mean
    }
}

// ---------------------------------------------------------------------------
// CnnForecaster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Fitted {
    network: Network,
    scaler: Scaler,
    lookback: usize,
    features: usize,
    loss_history: Vec<f64>,
}

/// Convolutional one-step-ahead forecaster driven by a [`Topology`].
///
/// The network is only instantiated inside [`Forecaster::fit`], once the
/// lookback and the number of observed columns are known.
#[derive(Debug, Clone)]
pub struct CnnForecaster {
    layers: Vec<ResolvedLayer>,
    config: ForecasterConfig,
    fitted: Option<Fitted>,
}

impl CnnForecaster {
    pub fn new(topology: &Topology, config: ForecasterConfig) -> Result<Self> {
        let bad = |msg: String| Err(HarnessError::Forecast(msg));
        if config.batch_size == 0 {
            return bad("batch size must be at least 1".into());
        }
        if config.epochs == 0 {
            return bad("epoch count must be at least 1".into());
        }
        if !(config.learning_rate.is_finite() && config.learning_rate > 0.0) {
            return bad(format!(
                "learning rate must be positive, got {}",
                config.learning_rate
            ));
        }
        if !(0.0..1.0).contains(&config.dropout_rate) {
            return bad(format!(
                "dropout rate must lie in [0, 1), got {}",
                config.dropout_rate
            ));
        }

        Ok(CnnForecaster {
            layers: topology.resolve()?,
            config,
            fitted: None,
        })
    }

    pub fn config(&self) -> &ForecasterConfig {
        &self.config
    }

    /// Mean training loss of each completed epoch (standardised units).
    pub fn loss_history(&self) -> &[f64] {
        self.fitted
            .as_ref()
            .map(|f| f.loss_history.as_slice())
            .unwrap_or(&[])
    }

    pub fn num_parameters(&self) -> Option<usize> {
        self.fitted.as_ref().map(|f| f.network.num_parameters())
    }

    /// Point forecasts plus their Monte-Carlo spread.
    ///
    /// Sampling restarts from the configured seed on every call, so the same
    /// fitted model and input always give the same result.
    pub fn predict_interval(&self, series: ArrayView2<'_, f64>) -> Result<Prediction> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or_else(|| HarnessError::Forecast("predict called before fit".into()))?;

        if series.ncols() != fitted.features {
            return Err(HarnessError::Forecast(format!(
                "model was fitted on {} columns but got {}",
                fitted.features,
                series.ncols()
            )));
        }
        if series.nrows() <= fitted.lookback {
            return Err(HarnessError::Forecast(format!(
                "{} rows cannot fill a lookback window of {} plus a target",
                series.nrows(),
                fitted.lookback
            )));
        }

        let scaled = fitted.scaler.transform(series);
        let windows = series.nrows() - fitted.lookback;
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1));

        let mut mean = Array2::<f64>::zeros((windows, fitted.features));
        let mut std_dev = Array2::<f64>::zeros((windows, fitted.features));

        for i in 0..windows {
            let x = scaled.slice(s![i..i + fitted.lookback, ..]).to_owned();
            let samples =
                fitted
                    .network
                    .sample_predictions(&x, self.config.mc_samples, &mut rng);

            let count = samples.len() as f64;
            let sample_mean = samples
                .iter()
                .fold(Array2::<f64>::zeros((1, fitted.features)), |acc, s| acc + s)
                / count;
            let sample_var = samples
                .iter()
                .fold(Array2::<f64>::zeros((1, fitted.features)), |acc, s| {
                    acc + (s - &sample_mean).mapv(|v| v * v)
                })
                / count;

            let point = fitted.scaler.inverse(&sample_mean);
            let spread = sample_var.mapv(f64::sqrt) * &fitted.scaler.std;
            mean.row_mut(i).assign(&point.row(0));
            std_dev.row_mut(i).assign(&spread.row(0));
        }

        Ok(Prediction { mean, std_dev })
    }

    /// One pass over `order` in minibatches. Returns the mean loss.
    fn run_epoch(
        &self,
        network: &mut Network,
        scaled: &Array2<f64>,
        lookback: usize,
        order: &[usize],
        epoch: usize,
        rng: &mut StdRng,
    ) -> Result<f64> {
        let features = scaled.ncols() as f64;
        let mut total_loss = 0.0;

        for batch in order.chunks(self.config.batch_size) {
            let mut accumulated: Option<Gradients> = None;
            let mut batch_loss = 0.0;

            for &i in batch {
                let x = scaled.slice(s![i..i + lookback, ..]).to_owned();
                let y = scaled.slice(s![i + lookback..i + lookback + 1, ..]);
                let pass = network.forward(&x, Some(&mut *rng));
                let diff = &pass.output - &y;
                batch_loss += diff.mapv(|v| v * v).sum() / features;

                let grads = network.backward(&pass, &(diff * (2.0 / features)));
                accumulated = Some(match accumulated.take() {
                    Some(mut acc) => {
                        acc.add_assign(&grads);
                        acc
                    }
                    None => grads,
                });
            }

            if !batch_loss.is_finite() {
                return Err(HarnessError::Training {
                    epoch,
                    reason: format!("minibatch loss became {batch_loss}"),
                });
            }
            total_loss += batch_loss;

            if let Some(mut grads) = accumulated {
                grads.scale(1.0 / batch.len() as f64);
                let norm = grads.norm();
                if !norm.is_finite() {
                    return Err(HarnessError::Training {
                        epoch,
                        reason: format!("gradient norm became {norm}"),
                    });
                }
                if norm > MAX_GRAD_NORM {
                    grads.scale(MAX_GRAD_NORM / norm);
                }
                network.apply(&grads, self.config.learning_rate);
            }
        }

        Ok(total_loss / order.len() as f64)
    }
}

impl Forecaster for CnnForecaster {
    fn fit(&mut self, series: ArrayView2<'_, f64>, lookback_period: usize) -> Result<()> {
        if lookback_period == 0 || series.nrows() <= lookback_period {
            return Err(HarnessError::Forecast(format!(
                "{} rows cannot fill a lookback window of {lookback_period} plus a target",
                series.nrows()
            )));
        }

        let features = series.ncols();
        let windows = series.nrows() - lookback_period;
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let scaler = Scaler::fit(series);
        let scaled = scaler.transform(series);
        let mut network = Network::build(
            &self.layers,
            lookback_period,
            features,
            self.config.uncertainty,
            self.config.dropout_rate,
            &mut rng,
        )?;

        info!(
            "fitting: {} parameters, {windows} windows of {lookback_period}x{features}, {} epochs",
            network.num_parameters(),
            self.config.epochs
        );
        if windows < self.config.batch_size {
            warn!(
                "only {windows} training windows for a batch size of {}",
                self.config.batch_size
            );
        }

        let mut order: Vec<usize> = (0..windows).collect();
        let mut loss_history = Vec::with_capacity(self.config.epochs);
        for epoch in 1..=self.config.epochs {
            order.shuffle(&mut rng);
            let loss =
                self.run_epoch(&mut network, &scaled, lookback_period, &order, epoch, &mut rng)?;
            debug!("epoch {epoch}/{}: loss {loss:.6}", self.config.epochs);
            loss_history.push(loss);
        }
        if let Some(last) = loss_history.last() {
            info!("training finished with loss {last:.6}");
        }

        self.fitted = Some(Fitted {
            network,
            scaler,
            lookback: lookback_period,
            features,
            loss_history,
        });
        Ok(())
    }

    fn predict(&self, series: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.predict_interval(series).map(|p| p.mean)
    }

    fn lookback_period(&self) -> Option<usize> {
        self.fitted.as_ref().map(|f| f.lookback)
    }
}
