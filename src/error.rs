use std::path::PathBuf;
use thiserror::Error;

/// Failures that callers (and the exit status) care to tell apart.
///
/// Everything is still propagated as `anyhow::Error`; these variants are the
/// root causes attached underneath operation context.
#[derive(Debug, Error)]
pub enum BenchdiffError {
    #[error("invalid git ref {0:?}")]
    InvalidRef(String),

    #[error("--{0} and --{1} incompatible")]
    IncompatibleFlags(&'static str, &'static str),

    #[error("the `{tool}` executable was not found in $PATH: {reason}")]
    ToolNotFound { tool: String, reason: String },

    #[error("building test binary for {package} failed: {reason}")]
    BuildFailed { package: String, reason: String },

    #[error("error running {command}: exit status {status}")]
    BenchmarkFailed { command: String, status: String },

    #[error("merging {kind} profile into {}: {reason}", dest.display())]
    ProfileMerge {
        kind: &'static str,
        dest: PathBuf,
        reason: String,
    },

    #[error("{metric} regression in {benchmark} of {delta} exceeded threshold of {threshold_pct:.2}%")]
    Regression {
        metric: String,
        benchmark: String,
        delta: String,
        threshold_pct: f64,
    },
}
