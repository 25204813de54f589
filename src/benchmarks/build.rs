use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

use crate::command::CommandExecutor;
use crate::error::BenchdiffError;
use crate::path_utils;

/// Import path prefix stripped from package names before naming binaries.
pub const DEFAULT_IMPORT_ROOT: &str = "github.com";

/// Suffix of the per-binary support directory written by [`BazelBuilder`].
pub const BAZEL_DIR_SUFFIX: &str = ".bazel";

/// Launcher installed in place of a bazel-built test binary. It finds the
/// real binary and its runfiles in the `<script>.bazel` directory next to
/// itself, so the bin directory can be moved around.
const BAZEL_RUN_SCRIPT: &str = r#"#!/bin/bash
SCRIPT_PATH="$(realpath "$0")"
BAZEL_DIR="${SCRIPT_PATH}.bazel"
export RUNFILES_DIR="${BAZEL_DIR}/@NAME@.runfiles"
exec "${BAZEL_DIR}/@NAME@" "$@"
"#;

/// The working tree the suites are built from.
pub trait Checkout {
    /// Branch HEAD points at, or `None` when detached
    fn current_symbolic_ref(&self) -> Result<Option<String>>;

    /// Check out `rev`, then run the post-checkout hook if there is one
    fn checkout(&self, rev: &str, post_checkout: Option<&str>) -> Result<()>;
}

/// Expands package filters (`./pkg/...`) into concrete package import paths.
pub trait PackageLister {
    fn expand(&self, filters: &[String]) -> Result<Vec<String>>;
}

/// Compiles the test binary of one package.
pub trait BuildBackend {
    /// Short name shown while building
    fn name(&self) -> &'static str;

    /// Builds `package` into `dst`, returning the binary name, or `None` if
    /// the package has no tests.
    fn build(&self, package: &str, dst: &Path) -> Result<Option<String>>;
}

/// Translates a Go package name into a test binary name, e.g.
/// `github.com/cockroachdb/cockroach/pkg/util/log` becomes
/// `cockroachdb_cockroach_pkg_util_log`.
pub fn pkg_to_test_bin(pkg: &str, import_root: &str) -> String {
    let f = pkg.strip_prefix(import_root).unwrap_or(pkg);
    f.replace('/', "_").trim_start_matches('_').to_string()
}

/// Translates a test binary name back to a package name. This does not
/// round-trip (underscores in the original path come back as slashes) but
/// is close enough for display.
pub fn test_bin_to_pkg(bin: &str) -> String {
    bin.replace('_', "/")
}

/// `go list` over the package filters.
pub struct GoList {
    go: String,
}

impl GoList {
    pub fn new(go: impl Into<String>) -> Self {
        Self { go: go.into() }
    }
}

impl PackageLister for GoList {
    fn expand(&self, filters: &[String]) -> Result<Vec<String>> {
        let mut args = vec!["list".to_string()];
        args.extend(filters.iter().cloned());
        let pkgs = CommandExecutor::new()
            .capture(&self.go, &args)
            .context("Failed to expand packages")?;
        Ok(pkgs
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

/// Builds test binaries with `go test -c`.
pub struct GoTestBuilder {
    go: String,
    import_root: String,
}

impl GoTestBuilder {
    pub fn new(go: impl Into<String>, import_root: impl Into<String>) -> Self {
        Self {
            go: go.into(),
            import_root: import_root.into(),
        }
    }
}

impl BuildBackend for GoTestBuilder {
    fn name(&self) -> &'static str {
        "go"
    }

    fn build(&self, package: &str, dst: &Path) -> Result<Option<String>> {
        let bin = pkg_to_test_bin(package, &self.import_root);
        let out = absolute(dst)?.join(&bin);
        let out_str = out.to_string_lossy().into_owned();

        // Capture so that "no test files" warnings stay off the terminal.
        CommandExecutor::new()
            .execute_command_with_args(&self.go, &["test", "-c", "-o", out_str.as_str(), package])
            .map_err(|e| BenchdiffError::BuildFailed {
                package: package.to_string(),
                reason: format!("{e:#}"),
            })?;

        // If there were no tests in the package, no file will have been created.
        if !out
            .try_exists()
            .with_context(|| format!("Failed to look for test binary {out:?}"))?
        {
            debug!("No tests in {package}");
            return Ok(None);
        }
        Ok(Some(bin))
    }
}

/// Builds test binaries with bazel. Each binary and its runfiles land in a
/// `<bin>.bazel` directory, and `<bin>` itself is a launcher script.
pub struct BazelBuilder {
    bazel: String,
    import_root: String,
    /// Import path of the repository root, stripped to get bazel packages
    module_path: String,
    /// bazel's output directory, relative to the workspace
    bazel_bin: PathBuf,
    workspace: PathBuf,
}

impl BazelBuilder {
    pub fn new(
        bazel: impl Into<String>,
        import_root: impl Into<String>,
        module_path: impl Into<String>,
        bazel_bin: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bazel: bazel.into(),
            import_root: import_root.into(),
            module_path: module_path.into(),
            bazel_bin: bazel_bin.into(),
            workspace: PathBuf::from("."),
        }
    }

    /// Runs bazel in `dir`, the root of the bazel workspace, instead of
    /// the current directory.
    pub fn in_workspace(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace = dir.into();
        self
    }

    /// `(bazel package, target base name)` for an import path, e.g.
    /// `("pkg/util/log", "log")`.
    fn bazel_package<'a>(&self, package: &'a str) -> (&'a str, &'a str) {
        let rel = package
            .strip_prefix(self.module_path.as_str())
            .unwrap_or(package)
            .trim_matches('/');
        let last = rel.rsplit('/').next().unwrap_or(rel);
        (rel, last)
    }
}

impl BuildBackend for BazelBuilder {
    fn name(&self) -> &'static str {
        "bazel"
    }

    fn build(&self, package: &str, dst: &Path) -> Result<Option<String>> {
        let build_failed = |e: anyhow::Error| BenchdiffError::BuildFailed {
            package: package.to_string(),
            reason: format!("{e:#}"),
        };

        let bin = pkg_to_test_bin(package, &self.import_root);
        let (rel, last) = self.bazel_package(package);
        let test_name = format!("{last}_test");
        let target = format!("//{rel}:{test_name}");

        CommandExecutor::builder()
            .capture_output(true)
            .working_dir(Some(&self.workspace))
            .build()
            .execute_command_with_args(&self.bazel, &["build", target.as_str()])
            .map_err(build_failed)?;

        // e.g. _bazel/bin/pkg/util/log/log_test_/log_test
        let out_dir = self
            .workspace
            .join(&self.bazel_bin)
            .join(rel)
            .join(format!("{test_name}_"));
        let src_bin = out_dir.join(&test_name);
        let src_runfiles = out_dir.join(format!("{test_name}.runfiles"));

        if !src_bin
            .try_exists()
            .with_context(|| format!("Failed to look for test binary {src_bin:?}"))?
        {
            debug!("No tests in {package}");
            return Ok(None);
        }

        let support_dir = dst.join(format!("{bin}{BAZEL_DIR_SUFFIX}"));
        fs::create_dir(&support_dir)
            .with_context(|| format!("Failed to create bazel binary directory {support_dir:?}"))?;

        let mut cp_args = vec![
            "-rL".to_string(),
            src_bin.to_string_lossy().into_owned(),
        ];
        if src_runfiles.exists() {
            cp_args.push(src_runfiles.to_string_lossy().into_owned());
        }
        cp_args.push(support_dir.to_string_lossy().into_owned());
        CommandExecutor::new()
            .execute_command_with_args("cp", &cp_args)
            .context("Failed to copy binary and bazel runfiles")
            .map_err(build_failed)?;

        let script = BAZEL_RUN_SCRIPT.replace("@NAME@", &test_name);
        path_utils::write_executable_script(&script, &dst.join(&bin))
            .context("Failed to write bazel binary script")?;
        Ok(Some(bin))
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Failed to resolve path {path:?}"))
}
