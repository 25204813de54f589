use anyhow::{Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::benchmarks::Checkout;
use crate::command::CommandExecutor;
use crate::error::BenchdiffError;

/// Length revisions are shortened to before they are used as directory names.
const SHORT_REF_LEN: usize = 12;

/// Special `--old` value selecting the most recent merge commit.
pub const LAST_MERGE: &str = "lastmerge";

/// Thin wrapper over the `git` CLI for the working tree benchdiff runs in.
pub struct GitRepo {
    dir: Option<PathBuf>,
}

impl Default for GitRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl GitRepo {
    /// The repository containing the current directory
    pub fn new() -> Self {
        Self { dir: None }
    }

    pub fn at(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: Some(dir.as_ref().to_path_buf()),
        }
    }

    fn executor(&self) -> CommandExecutor {
        CommandExecutor::builder()
            .capture_output(true)
            .working_dir(self.dir.as_ref())
            .build()
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        self.executor().capture("git", args)
    }

    /// Resolves the `--old`/`--new` selectors into short commit hashes.
    ///
    /// `new` defaults to HEAD and `old` to the parent of `new`; `old` may
    /// also be [`LAST_MERGE`].
    pub fn resolve_refs(&self, old: Option<&str>, new: Option<&str>) -> Result<(String, String)> {
        let new = match new {
            Some(r) => self.rev_parse(r)?,
            None => self.rev_parse("HEAD")?,
        };
        let new = shorten_ref(&new).to_string();
        self.check_valid_ref(&new)?;

        let old = match old {
            None => self.rev_parse(&format!("{new}~"))?,
            Some(LAST_MERGE) => self
                .git(&["log", "-n", "1", "--merges", "--format=%H", &new])
                .context("Failed to find last merge commit")?,
            Some(r) => self.rev_parse(r)?,
        };
        let old = shorten_ref(&old).to_string();
        self.check_valid_ref(&old)?;

        debug!("Resolved refs: old={old} new={new}");
        Ok((old, new))
    }

    fn rev_parse(&self, r: &str) -> Result<String> {
        self.git(&["rev-parse", r])
            .map_err(|_| anyhow::Error::from(BenchdiffError::InvalidRef(r.to_string())))
    }

    fn check_valid_ref(&self, r: &str) -> Result<()> {
        let output = CommandExecutor::builder()
            .capture_output(true)
            .allow_failure(true)
            .working_dir(self.dir.as_ref())
            .build()
            .execute_command_with_args("git", &["cat-file", "-t", r])?;

        let obj_type = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() || obj_type != "commit" {
            return Err(BenchdiffError::InvalidRef(r.to_string()).into());
        }
        Ok(())
    }

    /// Root directory of the working tree
    pub fn toplevel(&self) -> Result<PathBuf> {
        self.git(&["rev-parse", "--show-toplevel"])
            .map(PathBuf::from)
            .context("Not inside a git working tree")
    }

    /// Commit summary line, for display
    pub fn subject(&self, r: &str) -> Result<String> {
        self.git(&["log", "-n", "1", "--format=%s", r])
            .with_context(|| format!("Failed to read subject of {r}"))
    }
}

impl Checkout for GitRepo {
    fn current_symbolic_ref(&self) -> Result<Option<String>> {
        let output = CommandExecutor::builder()
            .capture_output(true)
            .allow_failure(true)
            .working_dir(self.dir.as_ref())
            .build()
            .execute_command_with_args("git", &["symbolic-ref", "-q", "--short", "HEAD"])?;

        // A detached HEAD has no symbolic ref to go back to.
        if !output.status.success() {
            return Ok(None);
        }
        let name = String::from_utf8(output.stdout)?.trim().to_string();
        Ok(Some(name).filter(|n| !n.is_empty()))
    }

    fn checkout(&self, r: &str, post_checkout: Option<&str>) -> Result<()> {
        info!("Checking out {r}");
        self.git(&["checkout", "-q", r])
            .with_context(|| format!("Failed to checkout {r}"))?;

        if let Some(hook) = post_checkout {
            info!("Running post-checkout hook: {hook}");
            self.executor()
                .execute_shell(hook)
                .with_context(|| format!("Post-checkout hook failed for {r}"))?;
        }
        Ok(())
    }
}

/// Shortens a full commit hash to the length used in directory names.
pub fn shorten_ref(r: &str) -> &str {
    match r.char_indices().nth(SHORT_REF_LEN) {
        Some((idx, _)) => &r[..idx],
        None => r,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn git_in(dir: &Path, args: &[&str]) -> String {
        let mut full = vec!["-c", "user.name=bench", "-c", "user.email=bench@example.com"];
        full.extend_from_slice(args);
        CommandExecutor::builder()
            .capture_output(true)
            .working_dir(Some(dir))
            .build()
            .capture("git", &full)
            .unwrap()
    }

    /// A repository on branch `main` with two commits.
    pub(crate) fn repo_with_history() -> TempDir {
        let dir = TempDir::new().unwrap();
        git_in(dir.path(), &["init", "-q", "-b", "main"]);
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        git_in(dir.path(), &["add", "."]);
        git_in(dir.path(), &["commit", "-q", "-m", "first commit"]);
        std::fs::write(dir.path().join("a.txt"), "two").unwrap();
        git_in(dir.path(), &["commit", "-q", "-a", "-m", "second commit"]);
        dir
    }

    #[test]
    fn test_shorten_ref() {
        assert_eq!(
            shorten_ref("0123456789abcdef0123456789abcdef01234567"),
            "0123456789ab"
        );
        assert_eq!(shorten_ref("abc"), "abc");
    }

    #[test]
    fn test_resolve_default_refs() {
        let dir = repo_with_history();
        let repo = GitRepo::at(dir.path());

        let (old, new) = repo.resolve_refs(None, None).unwrap();
        assert_eq!(new, shorten_ref(&git_in(dir.path(), &["rev-parse", "HEAD"])));
        assert_eq!(old, shorten_ref(&git_in(dir.path(), &["rev-parse", "HEAD~"])));
        assert_eq!(repo.subject(&new).unwrap(), "second commit");
        assert_eq!(repo.subject(&old).unwrap(), "first commit");
    }

    #[test]
    fn test_resolve_invalid_ref() {
        let dir = repo_with_history();
        let repo = GitRepo::at(dir.path());

        let err = repo.resolve_refs(Some("no-such-branch"), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BenchdiffError>(),
            Some(BenchdiffError::InvalidRef(r)) if r == "no-such-branch"
        ));
    }

    #[test]
    fn test_checkout_and_symbolic_ref() {
        let dir = repo_with_history();
        let repo = GitRepo::at(dir.path());
        assert_eq!(repo.current_symbolic_ref().unwrap(), Some("main".into()));

        let (old, _) = repo.resolve_refs(None, None).unwrap();
        repo.checkout(&old, Some("touch hooked")).unwrap();
        assert!(dir.path().join("hooked").exists());
        assert_eq!(repo.current_symbolic_ref().unwrap(), None);

        repo.checkout("main", None).unwrap();
        assert_eq!(repo.current_symbolic_ref().unwrap(), Some("main".into()));
    }

    #[test]
    fn test_toplevel_from_subdirectory() {
        let dir = repo_with_history();
        let sub = dir.path().join("pkg/util");
        std::fs::create_dir_all(&sub).unwrap();

        let top = GitRepo::at(&sub).toplevel().unwrap();
        assert_eq!(
            top.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );

        let outside = TempDir::new().unwrap();
        assert!(GitRepo::at(outside.path()).toplevel().is_err());
    }
}
