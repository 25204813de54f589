use anyhow::{Context, Result};
use indicatif::HumanDuration;
use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Instant;

use super::build::test_bin_to_pkg;
use super::profiles::{self, ProfileMerge, ProfileSelection};
use super::suite::{Suite, TestSet};
use crate::command::CommandExecutor;
use crate::compare::{ComparisonEngine, RenderFormat, SortOrder};
use crate::error::BenchdiffError;
use crate::ui::{fraction, ProgressWriter, Spinner};

/// Exit code of a Go test binary in which one or more benchmarks failed.
pub const BENCHMARK_FAILURE_EXIT_CODE: i32 = 1;

/// How each test binary is invoked.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// `-test.bench` pattern
    pub run_pattern: String,
    /// `-test.benchtime`, left to the binary's default when unset
    pub bench_time: Option<String>,
    /// Invocations per binary and suite
    pub iterations: usize,
    pub profiles: ProfileSelection,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_pattern: ".".to_string(),
            bench_time: None,
            iterations: 10,
            profiles: ProfileSelection::default(),
        }
    }
}

/// A benchmark binary that exited with [`BENCHMARK_FAILURE_EXIT_CODE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftFailure {
    pub rev: String,
    pub binary: String,
    /// 1-based
    pub iteration: usize,
}

impl fmt::Display for SoftFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "saw one or more benchmark failures in {} at {} (iteration {})",
            test_bin_to_pkg(&self.binary),
            self.rev,
            self.iteration
        )
    }
}

/// Runs the binaries of two suites against each other.
///
/// Rather than asking each binary for `-test.count` repetitions, every
/// iteration runs suite A then suite B once, so noise that is correlated in
/// time lands on both sides.
pub struct Orchestrator<'a> {
    progress: Arc<ProgressWriter>,
    options: &'a RunOptions,
    merger: &'a dyn ProfileMerge,
    preview: Option<&'a dyn ComparisonEngine>,
    /// Whether each binary accepts `--logtostderr`
    logtostderr: RefCell<HashMap<PathBuf, bool>>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        progress: Arc<ProgressWriter>,
        options: &'a RunOptions,
        merger: &'a dyn ProfileMerge,
    ) -> Self {
        Self {
            progress,
            options,
            merger,
            preview: None,
            logtostderr: RefCell::new(HashMap::new()),
        }
    }

    /// Shows the comparison so far above the spinner from the second
    /// iteration on.
    pub fn with_preview(mut self, engine: &'a dyn ComparisonEngine) -> Self {
        self.preview = Some(engine);
        self
    }

    /// Runs every binary in `tests` from both suites, interleaved, and
    /// returns the runs in which benchmarks failed.
    pub fn run(&self, a: &Suite, b: &Suite, tests: &TestSet) -> Result<Vec<SoftFailure>> {
        let start = Instant::now();
        let iterations = self.options.iterations;
        let mut failures = Vec::new();

        for suite in [a, b] {
            profiles::clear_merged_profiles(suite.artifacts_dir())?;
        }

        for (i, test) in tests.iter().enumerate() {
            let pkg = test_bin_to_pkg(test);
            let mark = self.progress.mark();
            for j in 0..iterations {
                self.progress.clear_to_mark(mark)?;
                if j > 0 {
                    if let Some(engine) = self.preview {
                        self.write_preview(engine, a, b)?;
                    }
                }

                let mut spinner = Spinner::start(
                    Arc::clone(&self.progress),
                    format!(
                        "running benchmarks:\npkg={} iter={} {pkg}",
                        fraction(i + 1, tests.len()),
                        fraction(j + 1, iterations)
                    ),
                );
                for suite in [a, b] {
                    profiles::clear_last_profiles(suite.artifacts_dir())?;
                }
                for suite in [a, b] {
                    spinner.update(format!(" {}", suite.rev()))?;
                    if !self.run_single(suite, test)? {
                        failures.push(SoftFailure {
                            rev: suite.rev().to_string(),
                            binary: test.to_string(),
                            iteration: j + 1,
                        });
                    }
                    profiles::merge_profiles(
                        self.merger,
                        &self.options.profiles,
                        suite.artifacts_dir(),
                    )?;
                }
                spinner.stop();
            }
            self.progress.clear_to_mark(mark)?;
        }

        for failure in &failures {
            warn!("{failure}");
        }
        info!(
            "Ran {} benchmark binaries {} times each in {}",
            tests.len(),
            iterations,
            HumanDuration(start.elapsed())
        );
        Ok(failures)
    }

    fn write_preview(&self, engine: &dyn ComparisonEngine, a: &Suite, b: &Suite) -> Result<()> {
        let (old, new) = (output_path(a)?, output_path(b)?);
        let text = engine.render(old, new, SortOrder::Name, RenderFormat::Text)?;
        let mut w = self.progress.as_ref();
        write!(w, "{text}")?;
        if !text.ends_with('\n') {
            writeln!(w)?;
        }
        writeln!(w)?;
        Ok(())
    }

    /// Runs one binary of `suite` once, appending its output to the suite's
    /// log. Returns `false` if benchmarks failed.
    fn run_single(&self, suite: &Suite, test: &str) -> Result<bool> {
        let bin = suite.test_binary(test);
        let bin_str = bin.to_string_lossy();
        let logtostderr = self.has_logtostderr(&bin);
        let args = bench_args(self.options, suite.artifacts_dir(), logtostderr);

        let executor = CommandExecutor::builder()
            .output_file(suite.output_file()?)
            .allow_failure(true)
            .build();
        let status = executor.execute_check_status(&bin_str, &args)?;
        check_status(status, || executor.format_command(&bin_str, &args))
            .with_context(|| match suite.output_path() {
                Some(log) => format!("Benchmark output is in {}", log.display()),
                None => format!("Benchmarks failed for {}", suite.rev()),
            })
    }

    fn has_logtostderr(&self, bin: &Path) -> bool {
        *self
            .logtostderr
            .borrow_mut()
            .entry(bin.to_path_buf())
            .or_insert_with(|| probe_logtostderr(bin))
    }
}

fn output_path(suite: &Suite) -> Result<&Path> {
    suite
        .output_path()
        .with_context(|| format!("No output log for {}", suite.rev()))
}

/// `Ok(true)` on success, `Ok(false)` on benchmark failures, an error for
/// anything else (crashes, bad flags).
fn check_status(status: ExitStatus, command: impl FnOnce() -> String) -> Result<bool> {
    match status.code() {
        Some(0) => Ok(true),
        Some(BENCHMARK_FAILURE_EXIT_CODE) => Ok(false),
        code => Err(BenchdiffError::BenchmarkFailed {
            command: command(),
            status: code.map_or_else(|| status.to_string(), |c| c.to_string()),
        }
        .into()),
    }
}

/// Asks the binary for its usage and looks for a `--logtostderr` flag.
/// `--help` exits non-zero, so the status is ignored; a binary that cannot
/// be run at all fails again when benchmarked.
pub fn probe_logtostderr(bin: &Path) -> bool {
    let output = CommandExecutor::builder()
        .capture_output(true)
        .allow_failure(true)
        .build()
        .execute_command_with_args(&bin.to_string_lossy(), &["--help"]);
    match output {
        Ok(out) => {
            let found = [out.stdout, out.stderr]
                .iter()
                .any(|o| String::from_utf8_lossy(o).contains("logtostderr"));
            debug!("{} accepts --logtostderr: {found}", bin.display());
            found
        }
        Err(e) => {
            debug!("Failed to probe {}: {e:#}", bin.display());
            false
        }
    }
}

/// Arguments for one benchmark invocation.
pub fn bench_args(options: &RunOptions, artifacts_dir: &Path, logtostderr: bool) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-test.run".into(),
        "-".into(),
        "-test.bench".into(),
        options.run_pattern.clone(),
        "-test.benchmem".into(),
    ];
    if let Some(bench_time) = &options.bench_time {
        args.push("-test.benchtime".into());
        args.push(bench_time.clone());
    }
    for kind in options.profiles.enabled() {
        args.push(kind.test_flag().into());
        args.push(kind.last_path(artifacts_dir).to_string_lossy().into_owned());
    }
    if logtostderr {
        args.push("--logtostderr".into());
        args.push("NONE".into());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmarks::test_utils::write_script;
    use std::os::unix::process::ExitStatusExt;
    use tempfile::tempdir;

    #[test]
    fn test_bench_args_minimal() {
        let args = bench_args(&RunOptions::default(), Path::new("/art"), false);
        assert_eq!(args, vec!["-test.run", "-", "-test.bench", ".", "-test.benchmem"]);
    }

    #[test]
    fn test_bench_args_full() {
        let options = RunOptions {
            run_pattern: "Datum".into(),
            bench_time: Some("2s".into()),
            iterations: 3,
            profiles: ProfileSelection {
                cpu: true,
                mem: false,
                mutex: true,
            },
        };
        let args = bench_args(&options, Path::new("/art"), true);
        assert_eq!(
            args,
            vec![
                "-test.run",
                "-",
                "-test.bench",
                "Datum",
                "-test.benchmem",
                "-test.benchtime",
                "2s",
                "-test.cpuprofile",
                "/art/cpu_last.prof",
                "-test.mutexprofile",
                "/art/mutex_last.prof",
                "--logtostderr",
                "NONE",
            ]
        );
    }

    #[test]
    fn test_check_status() {
        let cmd = || "bin -test.run -".to_string();
        assert!(check_status(ExitStatus::from_raw(0), cmd).unwrap());
        // Raw wait statuses carry the exit code in the second byte.
        assert!(!check_status(ExitStatus::from_raw(1 << 8), cmd).unwrap());

        let err = check_status(ExitStatus::from_raw(2 << 8), cmd).unwrap_err();
        assert_eq!(err.to_string(), "error running bin -test.run -: exit status 2");
    }

    #[test]
    fn test_probe_logtostderr() {
        let dir = tempdir().unwrap();
        let with = write_script(
            dir.path(),
            "with",
            "echo '  -logtostderr value' >&2; exit 2",
        );
        let without = write_script(dir.path(), "without", "echo '  -test.v'; exit 2");
        assert!(probe_logtostderr(&with));
        assert!(!probe_logtostderr(&without));
        assert!(!probe_logtostderr(&dir.path().join("missing")));
    }

    #[test]
    fn test_soft_failure_display() {
        let failure = SoftFailure {
            rev: "abc123".into(),
            binary: "cockroachdb_cockroach_pkg_kv".into(),
            iteration: 2,
        };
        assert_eq!(
            failure.to_string(),
            "saw one or more benchmark failures in cockroachdb/cockroach/pkg/kv at abc123 (iteration 2)"
        );
    }
}
