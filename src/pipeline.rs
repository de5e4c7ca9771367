//! Load → split → fit → evaluate → report, in that order and nothing else.

use std::fmt;
use std::io::Write;

use log::{info, log_enabled, warn, Level};

use crate::cli::RunConfig;
use crate::data::loader::load_file;
use crate::data::split::{Segment, SplitData};
use crate::error::Result;
use crate::forecast::{CnnForecaster, Forecaster, Uncertainty};
use crate::metrics::{evaluate, score_predictions};
use crate::topology::Topology;

/// MAPE of one run. `test_mape` is only present when a split was requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub train_mape: f64,
    pub test_mape: Option<f64>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "TRAIN \t Mean Absolute Percentage Error: {:.1}%",
            self.train_mape
        )?;
        if let Some(test) = self.test_mape {
            writeln!(f, "TEST \t Mean Absolute Percentage Error: {test:.1}%")?;
        }
        Ok(())
    }
}

/// Execute one harness run, writing progress notices and the report to
/// `out`. The first failing stage aborts the run.
pub fn run<W: Write>(config: &RunConfig, out: &mut W) -> Result<Report> {
    writeln!(out, "\n\nLoading datasets.")?;
    let table = load_file(&config.data_path, config.delimiter)?;

    let data = SplitData::new(&table, config.test_fraction, config.lookback_period)?;
    info!(
        "train rows {}, test rows {} (lookback {})",
        data.split.train_length, data.split.test_length, data.split.lookback_period
    );
    if let Some(test) = &data.test {
        if test.target.nrows() < config.forecaster.batch_size {
            warn!(
                "test region has {} targets, fewer than the batch size {}",
                test.target.nrows(),
                config.forecaster.batch_size
            );
        }
    }

    let topology = match &config.topology_path {
        Some(path) => Topology::from_json_file(path)?,
        None => Topology::default(),
    };
    writeln!(
        out,
        "\n\nBuild a CNN with {} uncertainty:",
        config.forecaster.uncertainty
    )?;
    write!(out, "{topology}")?;

    let mut forecaster = CnnForecaster::new(&topology, config.forecaster.clone())?;
    forecaster.fit(data.train.input, config.lookback_period)?;
    if let (Some(parameters), Some(loss)) =
        (forecaster.num_parameters(), forecaster.loss_history().last())
    {
        info!("fitted {parameters} parameters, final training loss {loss:.6}");
    }

    // the spread is logged for the last segment scored
    let log_spread = config.forecaster.uncertainty != Uncertainty::None
        && log_enabled!(Level::Info);
    let (train_first, _) = data.split.train_target_range();
    let train_mape = score(
        &forecaster,
        &data.train,
        train_first,
        log_spread && data.test.is_none(),
    )?;
    let test_mape = match (&data.test, data.split.test_target_range()) {
        (Some(test), Some((test_first, _))) => {
            Some(score(&forecaster, test, test_first, log_spread)?)
        }
        _ => None,
    };

    let report = Report {
        train_mape,
        test_mape,
    };
    write!(out, "{report}")?;
    Ok(report)
}

/// MAPE of one segment. With `with_spread` the Monte-Carlo interval is
/// computed once and both the score and the logged spread come from it.
fn score(
    forecaster: &CnnForecaster,
    segment: &Segment<'_>,
    first_target_row: usize,
    with_spread: bool,
) -> Result<f64> {
    if !with_spread {
        return evaluate(forecaster, segment.input, segment.target, first_target_row);
    }

    let interval = forecaster.predict_interval(segment.input)?;
    info!(
        "mean predictive std dev {:.4} over {} samples",
        interval.std_dev.mean().unwrap_or(0.0),
        forecaster.config().mc_samples
    );
    score_predictions(segment.target, interval.mean.view(), first_target_row)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::path::Path;

    use super::*;
    use crate::error::HarnessError;
    use crate::forecast::ForecasterConfig;

    const SMALL_TOPOLOGY: &str = r#"[
        {"id": "c1", "parent": "input", "layer": "Conv1D",
         "params": {"filters": 4, "kernel_size": 3, "activation": "elu"}},
        {"id": "f1", "parent": "c1", "layer": "Flatten"},
        {"id": "d1", "parent": "f1", "layer": "Dense",
         "params": {"units": 8, "activation": "elu"}}
    ]"#;

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    /// Two strictly positive seasonal columns with a header row.
    fn series_csv(rows: usize) -> String {
        let mut text = String::from("load,temperature\n");
        for t in 0..rows {
            let phase = t as f64 * 0.3;
            text.push_str(&format!(
                "{:.4},{:.4}\n",
                10.0 + 2.0 * phase.sin(),
                20.0 + 3.0 * phase.cos()
            ));
        }
        text
    }

    fn config(data: &Path, topology: Option<&Path>, fraction: Option<f64>) -> RunConfig {
        RunConfig {
            data_path: data.to_path_buf(),
            delimiter: b',',
            test_fraction: fraction,
            lookback_period: 6,
            topology_path: topology.map(Path::to_path_buf),
            forecaster: ForecasterConfig {
                epochs: 5,
                learning_rate: 0.01,
                uncertainty: Uncertainty::None,
                ..ForecasterConfig::default()
            },
        }
    }

    fn run_to_string(config: &RunConfig) -> (Result<Report>, String) {
        let mut out = Vec::new();
        let result = run(config, &mut out);
        (result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn report_formats_one_decimal() {
        let report = Report {
            train_mape: 12.345,
            test_mape: Some(7.0),
        };
        assert_eq!(
            report.to_string(),
            "TRAIN \t Mean Absolute Percentage Error: 12.3%\n\
             TEST \t Mean Absolute Percentage Error: 7.0%\n"
        );
        let train_only = Report {
            train_mape: 0.04,
            test_mape: None,
        };
        assert_eq!(
            train_only.to_string(),
            "TRAIN \t Mean Absolute Percentage Error: 0.0%\n"
        );
    }

    #[test]
    fn split_run_prints_train_and_test() {
        let data = write_temp(".csv", &series_csv(110));
        let topology = write_temp(".json", SMALL_TOPOLOGY);
        let (result, output) =
            run_to_string(&config(data.path(), Some(topology.path()), Some(0.1)));

        let report = result.unwrap();
        assert!(report.train_mape.is_finite() && report.train_mape >= 0.0);
        assert!(report.test_mape.unwrap().is_finite());
        assert!(output.contains("Loading datasets."));
        assert!(output.contains("Build a CNN with no uncertainty:"));
        assert_eq!(output.matches("Mean Absolute Percentage Error").count(), 2);
        assert!(output.contains("TRAIN \t Mean Absolute Percentage Error: "));
        assert!(output.contains("TEST \t Mean Absolute Percentage Error: "));
    }

    #[test]
    fn unsplit_run_prints_train_only() {
        let data = write_temp(".csv", &series_csv(50));
        let topology = write_temp(".json", SMALL_TOPOLOGY);
        let (result, output) = run_to_string(&config(data.path(), Some(topology.path()), None));

        assert_eq!(result.unwrap().test_mape, None);
        assert_eq!(output.matches("Mean Absolute Percentage Error").count(), 1);
        assert!(!output.contains("TEST"));
    }

    #[test]
    fn ragged_csv_fails_before_model_construction() {
        let data = write_temp(".csv", "a,b\n1,2\n3\n4,5\n");
        let (result, output) = run_to_string(&config(data.path(), None, None));

        assert!(matches!(result, Err(HarnessError::DataLoad { .. })));
        assert!(output.contains("Loading datasets."));
        assert!(!output.contains("Build a CNN"));
    }

    #[test]
    fn lookback_longer_than_training_history() {
        let data = write_temp(".csv", &series_csv(110));
        let mut config = config(data.path(), None, Some(0.1));
        config.lookback_period = 200;
        let (result, output) = run_to_string(&config);

        assert!(matches!(result, Err(HarnessError::InvalidSplit(_))));
        assert!(!output.contains("TRAIN"));
    }

    #[test]
    fn missing_topology_file() {
        let data = write_temp(".csv", &series_csv(50));
        let config = config(data.path(), Some(Path::new("/nonexistent/net.json")), None);
        let (result, _) = run_to_string(&config);
        assert!(matches!(result, Err(HarnessError::InvalidTopology(_))));
    }

    #[test]
    fn zero_in_ground_truth_is_reported() {
        let mut text = series_csv(40);
        text.push_str("0.0,1.0\n");
        let data = write_temp(".csv", &text);
        let topology = write_temp(".json", SMALL_TOPOLOGY);
        let (result, output) = run_to_string(&config(data.path(), Some(topology.path()), None));

        // data row 40, below the header on line 42 of the file
        assert!(matches!(
            result,
            Err(HarnessError::ZeroActual { row: 40, column: 0 })
        ));
        assert!(!output.contains("TRAIN"));
    }

    #[test]
    fn spread_path_scores_like_plain_evaluation() {
        let table_file = write_temp(".csv", &series_csv(60));
        let table = load_file(table_file.path(), b',').unwrap();
        let data = SplitData::new(&table, Some(0.2), 6).unwrap();
        let topology = Topology::from_json_str(SMALL_TOPOLOGY).unwrap();
        let mut forecaster = CnnForecaster::new(
            &topology,
            ForecasterConfig {
                epochs: 3,
                learning_rate: 0.01,
                mc_samples: 4,
                ..ForecasterConfig::default()
            },
        )
        .unwrap();
        forecaster.fit(data.train.input, 6).unwrap();

        let test = data.test.as_ref().unwrap();
        let plain = score(&forecaster, test, 48, false).unwrap();
        let with_spread = score(&forecaster, test, 48, true).unwrap();
        assert_eq!(plain, with_spread);
    }

    #[test]
    fn built_in_topology_end_to_end() {
        let data = write_temp(".csv", &series_csv(60));
        let mut config = config(data.path(), None, Some(0.2));
        config.lookback_period = 20;
        config.forecaster.epochs = 1;
        let (result, output) = run_to_string(&config);

        let report = result.unwrap();
        assert!(report.test_mape.is_some());
        assert!(output.contains("c1"));
        assert!(output.contains("output"));
    }
}
