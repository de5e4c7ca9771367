//! Command-line parsing into a [`RunConfig`] value.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;

use crate::forecast::{ForecasterConfig, Uncertainty};

/// Multi-letter short flags accepted for compatibility, with the long flag
/// each one stands for. clap only supports single-character shorts.
const SHORT_ALIASES: [(&str, &str); 3] = [
    ("-tf", "--test-fraction"),
    ("-lb", "--lookback-period"),
    ("-lr", "--learning-rate"),
];

#[derive(Parser, Debug)]
#[command(name = "cast-harness")]
#[command(
    about = "Fit a convolutional forecaster on a CSV time series and report its MAPE",
    long_about = None
)]
struct Cli {
    /// Location of the data set (CSV, JSON records or Parquet)
    #[arg(short = 'd', long)]
    data_path: PathBuf,

    /// Fraction of rows held out at the end of the data set (alias -tf)
    #[arg(long)]
    test_fraction: Option<f64>,

    /// Number of past rows fed into each forecast (alias -lb)
    #[arg(long, alias = "lookback_period")]
    lookback_period: usize,

    /// Number of epochs to run
    #[arg(short, long, default_value_t = 100)]
    epochs: usize,

    /// Minibatch size
    #[arg(short, long, default_value_t = 8)]
    batch_size: usize,

    /// Learning rate (alias -lr)
    #[arg(long, default_value_t = 0.1)]
    learning_rate: f64,

    /// JSON topology file; defaults to the built-in three-stage CNN
    #[arg(short, long)]
    topology: Option<PathBuf>,

    /// Field delimiter for text input
    #[arg(long, default_value = ",", value_parser = parse_delimiter)]
    delimiter: u8,

    /// Where Monte-Carlo dropout is applied
    #[arg(long, value_enum, default_value_t = Uncertainty::Last)]
    uncertainty: Uncertainty,

    /// Dropout rate used by the uncertainty mode
    #[arg(long, default_value_t = 0.1)]
    dropout_rate: f64,

    /// Stochastic passes averaged per prediction
    #[arg(long, default_value_t = 20)]
    mc_samples: usize,

    /// Seed for weight initialisation, shuffling and dropout
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn parse_delimiter(s: &str) -> Result<u8, String> {
    let unescaped = if s == "\\t" { "\t" } else { s };
    match unescaped.as_bytes() {
        [b] if b.is_ascii() => Ok(*b),
        _ => Err(format!("delimiter must be a single ASCII character, got '{s}'")),
    }
}

/// Everything one harness run needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub data_path: PathBuf,
    pub delimiter: u8,
    pub test_fraction: Option<f64>,
    pub lookback_period: usize,
    pub topology_path: Option<PathBuf>,
    pub forecaster: ForecasterConfig,
}

impl RunConfig {
    /// Parse a full argument list, program name first.
    pub fn from_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let cli = Cli::try_parse_from(expand_short_aliases(args))?;
        Ok(RunConfig {
            data_path: cli.data_path,
            delimiter: cli.delimiter,
            test_fraction: cli.test_fraction,
            lookback_period: cli.lookback_period,
            topology_path: cli.topology,
            forecaster: ForecasterConfig {
                batch_size: cli.batch_size,
                epochs: cli.epochs,
                learning_rate: cli.learning_rate,
                uncertainty: cli.uncertainty,
                dropout_rate: cli.dropout_rate,
                mc_samples: cli.mc_samples,
                seed: cli.seed,
            },
        })
    }
}

/// Rewrite `-tf 0.1` / `-tf=0.1` style arguments to their long forms.
fn expand_short_aliases<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(|arg| {
            let arg: OsString = arg.into();
            let rewritten = arg.to_str().and_then(rewrite_alias);
            rewritten.map(OsString::from).unwrap_or(arg)
        })
        .collect()
}

fn rewrite_alias(text: &str) -> Option<String> {
    SHORT_ALIASES.iter().find_map(|(short, long)| {
        if text == *short {
            return Some(long.to_string());
        }
        text.strip_prefix(short)
            .and_then(|rest| rest.strip_prefix('='))
            .map(|value| format!("{long}={value}"))
    })
}
