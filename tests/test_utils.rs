use anyhow::Result;
use benchdiff::benchmarks::{
    BuildBackend, Checkout, PackageLister, ProfileMerge, Suite, SuiteBuilder,
};
use benchdiff::path_utils::write_executable_script;
use benchdiff::ui::ProgressWriter;
use benchdiff::workdir::{parse_run_time, WorkDir};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const OLD: &str = "aaaaaaaaaaaa";
pub const NEW: &str = "bbbbbbbbbbbb";

/// Stand-in for a Go test binary. Records each benchmark invocation
/// (`$0 $*`) in `calls` and each `--help` probe in `probes`, writes a
/// sample for every profile flag, prints one benchmark result and exits
/// with `@CODE@`.
const BENCH_SCRIPT: &str = r#"#!/bin/sh
if [ "$1" = "--help" ]; then
  echo probe >> "@PROBES@"
  echo "  -logtostderr value"
  exit 2
fi
echo "$0 $*" >> "@CALLS@"
while [ $# -gt 0 ]; do
  case "$1" in
    -test.cpuprofile|-test.memprofile|-test.mutexprofile) echo sample > "$2"; shift ;;
  esac
  shift
done
echo "BenchmarkEncode-8   1000   1234 ns/op   64 B/op   1 allocs/op"
exit @CODE@
"#;

pub struct Fixture {
    pub dir: TempDir,
    pub workdir: WorkDir,
    pub calls: PathBuf,
    pub probes: PathBuf,
    pub progress: Arc<ProgressWriter>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            workdir: WorkDir::new(dir.path().join("benchdiff")),
            calls: dir.path().join("calls"),
            probes: dir.path().join("probes"),
            progress: Arc::new(ProgressWriter::new(std::io::sink())),
            dir,
        }
    }

    /// Builds the old and new suites for `pkgs`.
    pub fn build(&self, pkgs: &[&str]) -> (Suite, Suite) {
        let filter: Vec<String> = pkgs.iter().map(|p| p.to_string()).collect();
        let backend = ScriptBackend {
            calls: self.calls.clone(),
            probes: self.probes.clone(),
        };
        let run_time = parse_run_time("2024-03-01T10_00_00+01:00").unwrap();

        let mut old = Suite::new(&self.workdir, OLD, "old subject");
        let mut new = Suite::new(&self.workdir, NEW, "new subject");
        SuiteBuilder::new(
            &self.workdir,
            &NoCheckout,
            &Identity,
            &backend,
            Arc::clone(&self.progress),
        )
        .build_all(&filter, &mut [&mut old, &mut new], &run_time)
        .unwrap();
        (old, new)
    }

    pub fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }
}

pub struct NoCheckout;

impl Checkout for NoCheckout {
    fn current_symbolic_ref(&self) -> Result<Option<String>> {
        Ok(None)
    }

    fn checkout(&self, _rev: &str, _post_checkout: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Each filter is a package.
pub struct Identity;

impl PackageLister for Identity {
    fn expand(&self, filters: &[String]) -> Result<Vec<String>> {
        Ok(filters.to_vec())
    }
}

/// Installs [`BENCH_SCRIPT`] per package. Packages ending in `soft` exit
/// with 1 (benchmark failures), `crash` with 2.
pub struct ScriptBackend {
    calls: PathBuf,
    probes: PathBuf,
}

impl BuildBackend for ScriptBackend {
    fn name(&self) -> &'static str {
        "script"
    }

    fn build(&self, package: &str, dst: &Path) -> Result<Option<String>> {
        let code = if package.ends_with("soft") {
            "1"
        } else if package.ends_with("crash") {
            "2"
        } else {
            "0"
        };
        let script = BENCH_SCRIPT
            .replace("@CALLS@", &self.calls.to_string_lossy())
            .replace("@PROBES@", &self.probes.to_string_lossy())
            .replace("@CODE@", code);
        let bin = package.replace('/', "_");
        write_executable_script(&script, &dst.join(&bin))?;
        Ok(Some(bin))
    }
}

/// Concatenates profiles instead of merging them.
pub struct Concat;

impl ProfileMerge for Concat {
    fn merge(&self, inputs: &[&Path], output: &Path) -> Result<()> {
        let mut merged = Vec::new();
        for input in inputs {
            merged.extend(fs::read(input)?);
        }
        fs::write(output, merged)?;
        Ok(())
    }
}
