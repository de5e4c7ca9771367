use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use clap::Parser;
use parquet::arrow::ArrowWriter;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Write a synthetic multi-column time series for trying out the harness.
#[derive(Parser, Debug)]
#[command(name = "generate_sample")]
struct Args {
    /// Output file; `.parquet` writes Parquet, anything else CSV
    #[arg(short, long, default_value = "sample_series.csv")]
    output: PathBuf,

    /// Number of time steps
    #[arg(short, long, default_value_t = 500)]
    rows: usize,

    /// Standard deviation of the multiplicative noise
    #[arg(long, default_value_t = 0.02)]
    noise: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Level, linear trend, and (period, amplitude) seasonal terms of one column.
struct Component {
    name: &'static str,
    level: f64,
    trend: f64,
    seasons: &'static [(f64, f64)],
}

const COMPONENTS: [Component; 3] = [
    Component {
        name: "load",
        level: 100.0,
        trend: 0.05,
        seasons: &[(24.0, 12.0), (168.0, 5.0)],
    },
    Component {
        name: "temperature",
        level: 40.0,
        trend: 0.0,
        seasons: &[(24.0, 6.0)],
    },
    Component {
        name: "price",
        level: 55.0,
        trend: -0.01,
        seasons: &[(12.0, 3.0), (24.0, 4.0)],
    },
];

/// Noise is multiplicative so every value stays well away from zero.
fn generate_column(
    component: &Component,
    rows: usize,
    noise: &Normal<f64>,
    rng: &mut StdRng,
) -> Vec<f64> {
    (0..rows)
        .map(|t| {
            let t = t as f64;
            let seasonal: f64 = component
                .seasons
                .iter()
                .map(|&(period, amplitude)| {
                    amplitude * (2.0 * std::f64::consts::PI * t / period).sin()
                })
                .sum();
            let clean = component.level + component.trend * t + seasonal;
            clean * (1.0 + noise.sample(rng)).max(0.5)
        })
        .collect()
}

fn write_csv(path: &Path, columns: &[Vec<f64>]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(COMPONENTS.iter().map(|c| c.name))?;
    let rows = columns.first().map_or(0, Vec::len);
    for t in 0..rows {
        writer.write_record(columns.iter().map(|col| format!("{:.4}", col[t])))?;
    }
    writer.flush()?;
    Ok(())
}

fn write_parquet(path: &Path, columns: Vec<Vec<f64>>) -> Result<()> {
    let schema = Arc::new(Schema::new(
        COMPONENTS
            .iter()
            .map(|c| Field::new(c.name, DataType::Float64, false))
            .collect::<Vec<_>>(),
    ));
    let arrays: Vec<ArrayRef> = columns
        .into_iter()
        .map(|values| Arc::new(Float64Array::from(values)) as ArrayRef)
        .collect();
    let batch = RecordBatch::try_new(schema.clone(), arrays).context("building record batch")?;

    let file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let noise = Normal::new(0.0, args.noise).context("noise must be finite and non-negative")?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let columns: Vec<Vec<f64>> = COMPONENTS
        .iter()
        .map(|c| generate_column(c, args.rows, &noise, &mut rng))
        .collect();

    let is_parquet = args
        .output
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("parquet"));
    if is_parquet {
        write_parquet(&args.output, columns)?;
    } else {
        write_csv(&args.output, &columns)?;
    }

    println!(
        "Wrote {} rows x {} columns to {}",
        args.rows,
        COMPONENTS.len(),
        args.output.display()
    );
    Ok(())
}
