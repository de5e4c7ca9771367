//! Forecasting models behind a narrow fit/predict contract.
//!
//! The harness only ever talks to [`Forecaster`]; [`CnnForecaster`] is the
//! implementation shipped with the crate.

pub mod cnn;
pub mod layers;
pub mod network;

use clap::ValueEnum;
use ndarray::{Array2, ArrayView2};

use crate::error::Result;

pub use cnn::CnnForecaster;

/// Where Monte-Carlo dropout is applied to estimate predictive spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Uncertainty {
    /// Deterministic point forecasts.
    None,
    /// Dropout on the input of the output head only.
    #[default]
    Last,
    /// Dropout after every hidden layer.
    All,
}

impl std::fmt::Display for Uncertainty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Uncertainty::None => "no",
            Uncertainty::Last => "last-layer",
            Uncertainty::All => "all-layer",
        };
        write!(f, "{name}")
    }
}

/// Scalar hyperparameters shared by every forecaster.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecasterConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub uncertainty: Uncertainty,
    pub dropout_rate: f64,
    /// Stochastic passes averaged per prediction when dropout is active.
    pub mc_samples: usize,
    pub seed: u64,
}

impl Default for ForecasterConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            epochs: 100,
            learning_rate: 0.1,
            uncertainty: Uncertainty::Last,
            dropout_rate: 0.1,
            mc_samples: 20,
            seed: 42,
        }
    }
}

/// Point forecast with its Monte-Carlo spread.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub mean: Array2<f64>,
    /// Per-cell standard deviation across samples; zeros without dropout.
    pub std_dev: Array2<f64>,
}

/// One-step-ahead forecaster over sliding windows.
pub trait Forecaster {
    /// Train in place on every window of `lookback_period` rows of `series`,
    /// each predicting the row right after it.
    fn fit(&mut self, series: ArrayView2<'_, f64>, lookback_period: usize) -> Result<()>;

    /// One prediction per window of `series`: `series.nrows() - lookback`
    /// rows, aligned with rows `lookback..` of `series`. Never mutates the
    /// model.
    fn predict(&self, series: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    /// Lookback the model was fitted with, if it has been fitted.
    fn lookback_period(&self) -> Option<usize>;
}
