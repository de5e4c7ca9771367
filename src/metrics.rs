//! Forecast error metrics.

use ndarray::ArrayView2;

use crate::error::{HarnessError, Result};
use crate::forecast::Forecaster;

/// Mean Absolute Percentage Error (MAPE), as a percentage.
///
/// Averages `|actual - predicted| / |actual|` over every aligned cell.
/// Lower is better. A zero ground-truth value makes the ratio undefined and
/// is reported as [`HarnessError::ZeroActual`] instead of being skipped.
pub fn mean_absolute_percentage_error(
    actual: ArrayView2<'_, f64>,
    predicted: ArrayView2<'_, f64>,
) -> Result<f64> {
    if actual.dim() != predicted.dim() {
        return Err(HarnessError::Metric(format!(
            "ground truth is {:?} but predictions are {:?}",
            actual.dim(),
            predicted.dim()
        )));
    }
    if actual.is_empty() {
        return Err(HarnessError::Metric("no values to compare".into()));
    }

    let mut sum = 0.0;
    for ((row, column), &a) in actual.indexed_iter() {
        if a == 0.0 {
            return Err(HarnessError::ZeroActual { row, column });
        }
        sum += ((a - predicted[[row, column]]) / a).abs();
    }

    Ok(100.0 * sum / actual.len() as f64)
}

/// MAPE of predictions for table rows starting at `first_target_row`.
/// A zero ground-truth cell is reported with its row in the table rather
/// than its offset inside `target`.
pub fn score_predictions(
    target: ArrayView2<'_, f64>,
    predicted: ArrayView2<'_, f64>,
    first_target_row: usize,
) -> Result<f64> {
    mean_absolute_percentage_error(target, predicted).map_err(|err| match err {
        HarnessError::ZeroActual { row, column } => HarnessError::ZeroActual {
            row: row + first_target_row,
            column,
        },
        other => other,
    })
}

/// Score a fitted forecaster: predict over `input` and compare with
/// `target`, which holds the rows those windows forecast and starts at
/// table row `first_target_row`.
pub fn evaluate<F: Forecaster + ?Sized>(
    forecaster: &F,
    input: ArrayView2<'_, f64>,
    target: ArrayView2<'_, f64>,
    first_target_row: usize,
) -> Result<f64> {
    let lookback = forecaster
        .lookback_period()
        .ok_or_else(|| HarnessError::Metric("forecaster has not been fitted".into()))?;
    if input.nrows() != target.nrows() + lookback {
        return Err(HarnessError::Metric(format!(
            "{} input rows with lookback {lookback} do not line up with {} targets",
            input.nrows(),
            target.nrows()
        )));
    }
    let predicted = forecaster.predict(input)?;
    score_predictions(target, predicted.view(), first_target_row)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    use super::*;

    #[test]
    fn perfect_prediction_is_zero() {
        let actual = array![[1.0, -2.0], [3.5, 4.0]];
        let mape = mean_absolute_percentage_error(actual.view(), actual.view()).unwrap();
        assert_eq!(mape, 0.0);
    }

    #[test]
    fn known_value() {
        let actual = array![[100.0], [200.0]];
        let predicted = array![[110.0], [180.0]];
        let mape = mean_absolute_percentage_error(actual.view(), predicted.view()).unwrap();
        assert_relative_eq!(mape, 10.0, epsilon = 1e-12);
    }

    #[test]
    fn negative_actuals_use_absolute_value() {
        let actual = array![[-50.0]];
        let predicted = array![[-55.0]];
        let mape = mean_absolute_percentage_error(actual.view(), predicted.view()).unwrap();
        assert_relative_eq!(mape, 10.0, epsilon = 1e-12);
    }

    #[test]
    fn invariant_under_positive_rescaling() {
        let actual = array![[1.0, 2.0], [3.0, 5.0], [8.0, 13.0]];
        let predicted = array![[1.1, 1.9], [2.7, 5.5], [8.0, 12.0]];
        let base = mean_absolute_percentage_error(actual.view(), predicted.view()).unwrap();
        for factor in [0.001, 3.0, 1e6] {
            let scaled = mean_absolute_percentage_error(
                (&actual * factor).view(),
                (&predicted * factor).view(),
            )
            .unwrap();
            assert_relative_eq!(scaled, base, max_relative = 1e-12);
        }
    }

    #[test]
    fn zero_ground_truth_is_an_error() {
        let actual = array![[1.0, 2.0], [0.0, 4.0]];
        let predicted = array![[1.0, 2.0], [0.1, 4.0]];
        let err = mean_absolute_percentage_error(actual.view(), predicted.view()).unwrap_err();
        assert!(matches!(err, HarnessError::ZeroActual { row: 1, column: 0 }));
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let actual = Array2::<f64>::ones((3, 2));
        let predicted = Array2::<f64>::ones((2, 2));
        assert!(matches!(
            mean_absolute_percentage_error(actual.view(), predicted.view()),
            Err(HarnessError::Metric(_))
        ));
    }

    #[test]
    fn empty_input_is_an_error() {
        let empty = Array2::<f64>::zeros((0, 2));
        assert!(mean_absolute_percentage_error(empty.view(), empty.view()).is_err());
    }

    /// Forecaster that repeats the last row of each window.
    struct Persistence {
        lookback: usize,
    }

    impl Forecaster for Persistence {
        fn fit(&mut self, _series: ArrayView2<'_, f64>, lookback_period: usize) -> Result<()> {
            self.lookback = lookback_period;
            Ok(())
        }

        fn predict(&self, series: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
            Ok(series
                .slice(ndarray::s![self.lookback - 1..series.nrows() - 1, ..])
                .to_owned())
        }

        fn lookback_period(&self) -> Option<usize> {
            Some(self.lookback)
        }
    }

    #[test]
    fn evaluate_aligns_predictions_with_targets() {
        let series = array![[1.0], [2.0], [4.0], [8.0]];
        let targets = series.slice(ndarray::s![2.., ..]);
        let model = Persistence { lookback: 2 };
        // windows predict rows 2 and 3 from rows 1 and 2
        let mape = evaluate(&model, series.view(), targets, 2).unwrap();
        assert_relative_eq!(mape, 50.0, epsilon = 1e-12);
        let again = evaluate(&model, series.view(), targets, 2).unwrap();
        assert_eq!(mape, again);
    }

    #[test]
    fn evaluate_rejects_misaligned_segments() {
        let series = array![[1.0], [2.0], [4.0], [8.0]];
        let model = Persistence { lookback: 2 };
        let err = evaluate(&model, series.view(), series.slice(ndarray::s![1.., ..]), 1)
            .unwrap_err();
        assert!(matches!(err, HarnessError::Metric(_)));
    }

    #[test]
    fn zero_ground_truth_reports_table_row() {
        let series = array![[1.0], [2.0], [4.0], [0.0], [5.0]];
        let model = Persistence { lookback: 2 };
        let err = evaluate(&model, series.view(), series.slice(ndarray::s![2.., ..]), 2)
            .unwrap_err();
        assert!(matches!(err, HarnessError::ZeroActual { row: 3, column: 0 }));
    }
}
