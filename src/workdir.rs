use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use std::env;
use std::path::{Path, PathBuf};

use crate::benchmarks::Fingerprint;

/// Directory used when neither the config nor the environment names one.
pub const DEFAULT_WORKDIR: &str = "benchdiff";

const RUN_TIME_FORMAT: &str = "%Y-%m-%dT%H_%M_%S";

/// Layout of benchdiff's working directory:
///
/// ```text
/// <root>/<ref>/artifacts/out.<run time>
/// <root>/<ref>/artifacts/<profile>.prof
/// <root>/<ref>/bin/<fingerprint>/<binary>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
}

impl Default for WorkDir {
    fn default() -> Self {
        Self::new(DEFAULT_WORKDIR)
    }
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the work directory from `BENCHDIFF_HOME` or use the default
    pub fn from_env() -> Self {
        match env::var("BENCHDIFF_HOME") {
            Ok(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::default(),
        }
    }

    /// Get the work directory from the config file, environment, or default
    pub fn from_option(root: Option<&Path>) -> Self {
        match root {
            Some(dir) => Self::new(dir),
            None => Self::from_env(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Everything benchdiff stores for one revision.
    pub fn ref_dir(&self, rev: &str) -> PathBuf {
        self.root.join(rev)
    }

    pub fn artifacts_dir(&self, rev: &str) -> PathBuf {
        self.ref_dir(rev).join("artifacts")
    }

    pub fn bin_dir(&self, rev: &str, fingerprint: Fingerprint) -> PathBuf {
        self.ref_dir(rev).join("bin").join(fingerprint.to_string())
    }

    pub fn output_log(&self, rev: &str, run_time: &DateTime<FixedOffset>) -> PathBuf {
        self.artifacts_dir(rev)
            .join(format!("out.{}", format_run_time(run_time)))
    }
}

/// Formats a run time the way output logs are named, e.g.
/// `2024-03-01T14_05_09+01:00` or `2024-03-01T13_05_09Z` in UTC.
pub fn format_run_time(t: &DateTime<FixedOffset>) -> String {
    let stamp = t.format(RUN_TIME_FORMAT);
    if t.offset().local_minus_utc() == 0 {
        format!("{stamp}Z")
    } else {
        format!("{stamp}{}", t.format("%:z"))
    }
}

/// Parses a run time previously produced by [`format_run_time`].
pub fn parse_run_time(s: &str) -> Result<DateTime<FixedOffset>> {
    let normalized = match s.strip_suffix('Z') {
        Some(stamp) => format!("{stamp}+00:00"),
        None => s.to_string(),
    };
    DateTime::parse_from_str(&normalized, &format!("{RUN_TIME_FORMAT}%:z"))
        .with_context(|| {
            format!("Invalid previous run time {s:?}, expected e.g. 2024-03-01T14_05_09+01:00")
        })
}
