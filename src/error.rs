use std::path::PathBuf;

use thiserror::Error;

/// Every way a harness run can fail. None of these are recovered locally:
/// `main` prints the message and exits non-zero.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to load {}: {reason}", path.display())]
    DataLoad { path: PathBuf, reason: String },

    #[error("invalid split: {0}")]
    InvalidSplit(String),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("forecaster: {0}")]
    Forecast(String),

    #[error("training diverged in epoch {epoch}: {reason}")]
    Training { epoch: usize, reason: String },

    #[error("ground truth is zero at row {row}, column {column}; percentage error is undefined")]
    ZeroActual { row: usize, column: usize },

    #[error("metric error: {0}")]
    Metric(String),

    #[error("writing report: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Wrap a loader failure, keeping the full `anyhow` context chain.
    pub fn data_load(path: impl Into<PathBuf>, err: anyhow::Error) -> Self {
        HarnessError::DataLoad {
            path: path.into(),
            reason: format!("{err:#}"),
        }
    }
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_load_keeps_context_chain() {
        let inner = anyhow::anyhow!("row 3 has 2 fields").context("reading CSV");
        let err = HarnessError::data_load("series.csv", inner);
        let msg = err.to_string();
        assert!(msg.contains("series.csv"));
        assert!(msg.contains("reading CSV"));
        assert!(msg.contains("row 3 has 2 fields"));
    }
}
