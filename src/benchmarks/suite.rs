use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset};
use indicatif::HumanDuration;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use super::build::{BuildBackend, Checkout, PackageLister, BAZEL_DIR_SUFFIX};
use super::fingerprint::Fingerprint;
use crate::path_utils;
use crate::ui::{fraction, ProgressWriter, Spinner};
use crate::workdir::WorkDir;

/// Names of the test binaries in a suite, kept sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSet(BTreeSet<String>);

impl TestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        self.0.insert(name.into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Names present in both sets.
    pub fn intersect(&self, other: &TestSet) -> TestSet {
        TestSet(self.0.intersection(&other.0).cloned().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn sorted(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for TestSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        TestSet(iter.into_iter().map(Into::into).collect())
    }
}

/// The test binaries built for one revision, plus where its benchmark
/// output and profiles go.
#[derive(Debug)]
pub struct Suite {
    rev: String,
    subject: String,
    bin_dir: PathBuf,
    artifacts_dir: PathBuf,
    tests: TestSet,
    output_path: Option<PathBuf>,
    output: Option<Arc<File>>,
}

impl Suite {
    pub fn new(workdir: &WorkDir, rev: impl Into<String>, subject: impl Into<String>) -> Self {
        let rev = rev.into();
        Self {
            artifacts_dir: workdir.artifacts_dir(&rev),
            bin_dir: PathBuf::new(),
            rev,
            subject: subject.into(),
            tests: TestSet::new(),
            output_path: None,
            output: None,
        }
    }

    pub fn rev(&self) -> &str {
        &self.rev
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    pub fn tests(&self) -> &TestSet {
        &self.tests
    }

    pub fn test_binary(&self, name: &str) -> PathBuf {
        self.bin_dir.join(name)
    }

    /// Path of this run's benchmark output log, once one is attached
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Handle the benchmark binaries append their output to
    pub fn output_file(&self) -> Result<Arc<File>> {
        self.output
            .clone()
            .with_context(|| format!("No output log opened for {}", self.rev))
    }

    /// Points the suite at the output log of an earlier run, which must
    /// still exist.
    pub fn attach_previous_run(
        &mut self,
        workdir: &WorkDir,
        run_time: &DateTime<FixedOffset>,
    ) -> Result<()> {
        let path = workdir.output_log(&self.rev, run_time);
        if !path.is_file() {
            bail!("No output from a previous run at {path:?}");
        }
        self.output_path = Some(path);
        Ok(())
    }

    fn open_output_log(&mut self, workdir: &WorkDir, run_time: &DateTime<FixedOffset>) -> Result<()> {
        path_utils::ensure_directory(&self.artifacts_dir)?;
        let path = workdir.output_log(&self.rev, run_time);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open output log {path:?}"))?;
        debug!("Writing benchmark output for {} to {path:?}", self.rev);
        self.output = Some(Arc::new(file));
        self.output_path = Some(path);
        Ok(())
    }
}

/// Intersects the test sets of both suites.
pub fn intersect_tests(a: &Suite, b: &Suite) -> TestSet {
    a.tests.intersect(&b.tests)
}

/// Checks out each requested revision and builds its test binaries, reusing
/// binaries from an earlier run with the same package filter.
pub struct SuiteBuilder<'a> {
    workdir: &'a WorkDir,
    repo: &'a dyn Checkout,
    lister: &'a dyn PackageLister,
    backend: &'a dyn BuildBackend,
    post_checkout: Option<String>,
    progress: Arc<ProgressWriter>,
}

impl<'a> SuiteBuilder<'a> {
    pub fn new(
        workdir: &'a WorkDir,
        repo: &'a dyn Checkout,
        lister: &'a dyn PackageLister,
        backend: &'a dyn BuildBackend,
        progress: Arc<ProgressWriter>,
    ) -> Self {
        Self {
            workdir,
            repo,
            lister,
            backend,
            post_checkout: None,
            progress,
        }
    }

    pub fn post_checkout(mut self, cmd: Option<String>) -> Self {
        self.post_checkout = cmd;
        self
    }

    /// Builds every suite, then puts the working tree back on the branch it
    /// started on.
    pub fn build_all(
        &self,
        filter: &[String],
        suites: &mut [&mut Suite],
        run_time: &DateTime<FixedOffset>,
    ) -> Result<()> {
        let _restore = RestoreRef::capture(self.repo)?;
        for suite in suites.iter_mut() {
            self.build(filter, suite, run_time)?;
        }
        Ok(())
    }

    /// Populates `suite` with test binaries for `filter` and opens its
    /// output log. Panics if `suite` already has binaries.
    pub fn build(
        &self,
        filter: &[String],
        suite: &mut Suite,
        run_time: &DateTime<FixedOffset>,
    ) -> Result<()> {
        assert!(suite.tests.is_empty(), "suite for {} already built", suite.rev);
        let bin_dir = self.workdir.bin_dir(&suite.rev, Fingerprint::of(filter));
        suite.bin_dir = bin_dir.clone();

        if bin_dir.is_dir() {
            info!("Using cached test binaries for {} in {bin_dir:?}", suite.rev);
            suite.tests = discover_binaries(&bin_dir)?;
        } else {
            let start = Instant::now();
            suite.tests = self.build_binaries(filter, suite)?;
            info!(
                "Built {} test binaries for {} in {}",
                suite.tests.len(),
                suite.rev,
                HumanDuration(start.elapsed())
            );
        }

        suite.open_output_log(self.workdir, run_time)
    }

    fn build_binaries(&self, filter: &[String], suite: &Suite) -> Result<TestSet> {
        path_utils::ensure_directory(&suite.bin_dir)?;
        let cleanup = RemoveDirOnFailure::new(&suite.bin_dir);

        self.repo
            .checkout(&suite.rev, self.post_checkout.as_deref())?;
        let pkgs = self
            .lister
            .expand(filter)
            .with_context(|| format!("Failed to list packages for {}", suite.rev))?;

        let mut spinner = Spinner::start(
            Arc::clone(&self.progress),
            format!(
                "building benchmark binaries for {}: {:.50} [{}] ",
                suite.rev,
                suite.subject,
                self.backend.name()
            ),
        );
        let mut tests = TestSet::new();
        for (i, pkg) in pkgs.iter().enumerate() {
            spinner.update(fraction(i + 1, pkgs.len()))?;
            if let Some(bin) = self.backend.build(pkg, &suite.bin_dir)? {
                tests.insert(bin);
            }
        }
        spinner.stop();

        cleanup.disarm();
        Ok(tests)
    }
}

/// Lists the binaries in a populated bin directory.
fn discover_binaries(bin_dir: &Path) -> Result<TestSet> {
    let mut tests = TestSet::new();
    let entries =
        fs::read_dir(bin_dir).with_context(|| format!("Failed to read {bin_dir:?}"))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            if name.ends_with(BAZEL_DIR_SUFFIX) {
                continue;
            }
            bail!("Unexpected directory {name:?} in {bin_dir:?}");
        }
        tests.insert(name);
    }
    Ok(tests)
}

/// Checks the original branch back out when dropped.
struct RestoreRef<'a> {
    repo: &'a dyn Checkout,
    rev: Option<String>,
}

impl<'a> RestoreRef<'a> {
    fn capture(repo: &'a dyn Checkout) -> Result<Self> {
        let rev = repo.current_symbolic_ref()?;
        if rev.is_none() {
            debug!("HEAD is detached, it will not be restored after building");
        }
        Ok(Self { repo, rev })
    }
}

impl Drop for RestoreRef<'_> {
    fn drop(&mut self) {
        if let Some(rev) = self.rev.take() {
            if let Err(e) = self.repo.checkout(&rev, None) {
                warn!("Failed to restore original ref {rev}: {e:#}");
            }
        }
    }
}

/// Removes a half-built bin directory unless disarmed.
struct RemoveDirOnFailure {
    dir: Option<PathBuf>,
}

impl RemoveDirOnFailure {
    fn new(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
        }
    }

    fn disarm(mut self) {
        self.dir = None;
    }
}

impl Drop for RemoveDirOnFailure {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            debug!("Removing incomplete binary directory {dir:?}");
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("Failed to remove {dir:?}: {e}");
            }
        }
    }
}
