//! Statistical comparison of two benchmark output logs.
//!
//! benchdiff does not compute statistics itself; it hands both logs to an
//! engine (benchstat) and only reads back enough of the result to render it
//! elsewhere and to check for regressions.

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;
use std::path::Path;

use crate::error::BenchdiffError;

mod benchstat;
pub use benchstat::Benchstat;

/// Row order of a comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SortOrder {
    /// Largest improvement first
    #[default]
    Delta,
    /// Alphabetical by benchmark name
    Name,
}

/// Output format of a rendered comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFormat {
    Text,
    Csv,
    Html,
}

/// Direction of a statistically significant change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    Better,
    Worse,
    Unchanged,
}

/// One benchmark in a [`Table`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub benchmark: String,
    pub old: String,
    pub new: String,
    /// Formatted change, e.g. `-2.44%`, or `~` when not significant
    pub delta: String,
    pub pct_delta: f64,
    pub change: Change,
    /// p-value and sample counts
    pub note: String,
}

/// Comparison of one metric (time/op, alloc/op, ...) across benchmarks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub metric: String,
    pub unit: String,
    pub rows: Vec<Row>,
}

pub trait ComparisonEngine {
    /// Compares the logs and returns the resulting tables.
    fn tables(&self, old: &Path, new: &Path, sort: SortOrder) -> Result<Vec<Table>>;

    /// Compares the logs and renders the result for display.
    fn render(
        &self,
        old: &Path,
        new: &Path,
        sort: SortOrder,
        format: RenderFormat,
    ) -> Result<String>;
}

/// Fails on the first significant regression larger than `threshold`
/// (a fraction, so `0.05` is 5%). A negative threshold disables the check.
pub fn check_threshold(threshold: f64, tables: &[Table]) -> Result<()> {
    if threshold < 0.0 {
        return Ok(());
    }
    let threshold_pct = threshold * 100.0;
    for table in tables {
        for row in &table.rows {
            if row.change == Change::Worse && row.pct_delta.abs() > threshold_pct {
                return Err(BenchdiffError::Regression {
                    metric: table.metric.clone(),
                    benchmark: row.benchmark.clone(),
                    delta: row.delta.clone(),
                    threshold_pct,
                }
                .into());
            }
        }
    }
    Ok(())
}
