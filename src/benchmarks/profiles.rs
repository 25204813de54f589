use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::command::CommandExecutor;
use crate::error::BenchdiffError;
use crate::path_utils;

/// Profiles the Go test binaries can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Cpu,
    Mem,
    Mutex,
}

impl ProfileKind {
    pub const ALL: [ProfileKind; 3] = [ProfileKind::Cpu, ProfileKind::Mem, ProfileKind::Mutex];

    pub fn name(self) -> &'static str {
        match self {
            ProfileKind::Cpu => "cpu",
            ProfileKind::Mem => "mem",
            ProfileKind::Mutex => "mutex",
        }
    }

    /// The `go test` flag that makes a binary write this profile
    pub fn test_flag(self) -> &'static str {
        match self {
            ProfileKind::Cpu => "-test.cpuprofile",
            ProfileKind::Mem => "-test.memprofile",
            ProfileKind::Mutex => "-test.mutexprofile",
        }
    }

    /// Where a single benchmark invocation writes its sample
    pub fn last_path(self, artifacts_dir: &Path) -> PathBuf {
        artifacts_dir.join(format!("{}_last.prof", self.name()))
    }

    /// The profile accumulated over all invocations
    pub fn merged_path(self, artifacts_dir: &Path) -> PathBuf {
        artifacts_dir.join(format!("{}.prof", self.name()))
    }
}

/// Which profiles were requested on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileSelection {
    pub cpu: bool,
    pub mem: bool,
    pub mutex: bool,
}

impl ProfileSelection {
    pub fn enabled(&self) -> impl Iterator<Item = ProfileKind> + '_ {
        ProfileKind::ALL.into_iter().filter(move |kind| match kind {
            ProfileKind::Cpu => self.cpu,
            ProfileKind::Mem => self.mem,
            ProfileKind::Mutex => self.mutex,
        })
    }
}

/// Combines several pprof profiles into one.
pub trait ProfileMerge {
    fn merge(&self, inputs: &[&Path], output: &Path) -> Result<()>;
}

/// Merges with `go tool pprof -proto`.
pub struct PprofMerger {
    go: String,
}

impl PprofMerger {
    pub fn new(go: impl Into<String>) -> Self {
        Self { go: go.into() }
    }
}

impl ProfileMerge for PprofMerger {
    fn merge(&self, inputs: &[&Path], output: &Path) -> Result<()> {
        let mut args = vec![
            "tool".to_string(),
            "pprof".to_string(),
            "-proto".to_string(),
            "-output".to_string(),
            output.to_string_lossy().into_owned(),
        ];
        args.extend(inputs.iter().map(|p| p.to_string_lossy().into_owned()));
        CommandExecutor::new().execute_command_with_args(&self.go, &args)?;
        Ok(())
    }
}

/// Folds the latest sample of `kind` into the accumulated profile.
///
/// The first sample is taken over as is. The accumulated file is only ever
/// replaced by a rename, so an interrupted merge leaves the previous one
/// intact.
pub fn merge_profile(merger: &dyn ProfileMerge, kind: ProfileKind, artifacts_dir: &Path) -> Result<()> {
    let last = kind.last_path(artifacts_dir);
    let merged = kind.merged_path(artifacts_dir);
    let fail = |reason: String| BenchdiffError::ProfileMerge {
        kind: kind.name(),
        dest: merged.clone(),
        reason,
    };

    if !last.is_file() {
        return Err(fail(format!("no profile written to {}", last.display())).into());
    }

    let tmp = NamedTempFile::new_in(artifacts_dir)
        .with_context(|| format!("Failed to create temporary profile in {artifacts_dir:?}"))?;
    if merged.is_file() {
        merger
            .merge(&[merged.as_path(), last.as_path()], tmp.path())
            .map_err(|e| fail(format!("{e:#}")))?;
    } else {
        fs::copy(&last, tmp.path()).map_err(|e| fail(e.to_string()))?;
    }
    tmp.persist(&merged).map_err(|e| fail(e.error.to_string()))?;
    debug!("Merged {} into {}", last.display(), merged.display());
    Ok(())
}

pub fn merge_profiles(
    merger: &dyn ProfileMerge,
    selection: &ProfileSelection,
    artifacts_dir: &Path,
) -> Result<()> {
    for kind in selection.enabled() {
        merge_profile(merger, kind, artifacts_dir)?;
    }
    Ok(())
}

/// Removes the per-invocation samples so a missing sample is noticed.
pub fn clear_last_profiles(artifacts_dir: &Path) -> Result<()> {
    for kind in ProfileKind::ALL {
        path_utils::remove_file_if_exists(&kind.last_path(artifacts_dir))?;
    }
    Ok(())
}

/// Removes profiles accumulated by earlier runs.
pub fn clear_merged_profiles(artifacts_dir: &Path) -> Result<()> {
    for kind in ProfileKind::ALL {
        path_utils::remove_file_if_exists(&kind.merged_path(artifacts_dir))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// "Merges" by concatenating the inputs.
    struct Concat;

    impl ProfileMerge for Concat {
        fn merge(&self, inputs: &[&Path], output: &Path) -> Result<()> {
            let mut out = Vec::new();
            for input in inputs {
                out.extend(fs::read(input)?);
            }
            fs::write(output, out)?;
            Ok(())
        }
    }

    struct Failing;

    impl ProfileMerge for Failing {
        fn merge(&self, _inputs: &[&Path], _output: &Path) -> Result<()> {
            anyhow::bail!("pprof: parsing profile: unrecognized profile format")
        }
    }

    #[test]
    fn test_selection() {
        let selection = ProfileSelection {
            cpu: true,
            mutex: true,
            ..Default::default()
        };
        assert_eq!(
            selection.enabled().collect::<Vec<_>>(),
            vec![ProfileKind::Cpu, ProfileKind::Mutex]
        );
        assert_eq!(ProfileSelection::default().enabled().count(), 0);
    }

    #[test]
    fn test_first_merge_copies_sample() {
        let dir = tempdir().unwrap();
        let last = ProfileKind::Cpu.last_path(dir.path());
        fs::write(&last, b"\x1f\x8bsample").unwrap();

        merge_profile(&Concat, ProfileKind::Cpu, dir.path()).unwrap();
        assert_eq!(
            fs::read(ProfileKind::Cpu.merged_path(dir.path())).unwrap(),
            b"\x1f\x8bsample"
        );

        fs::write(&last, b"+more").unwrap();
        merge_profile(&Concat, ProfileKind::Cpu, dir.path()).unwrap();
        assert_eq!(
            fs::read(dir.path().join("cpu.prof")).unwrap(),
            b"\x1f\x8bsample+more"
        );
    }

    #[test]
    fn test_missing_sample_is_an_error() {
        let dir = tempdir().unwrap();
        let err = merge_profile(&Concat, ProfileKind::Mem, dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BenchdiffError>(),
            Some(BenchdiffError::ProfileMerge { kind: "mem", .. })
        ));
    }

    #[test]
    fn test_failed_merge_keeps_previous_profile() {
        let dir = tempdir().unwrap();
        fs::write(ProfileKind::Mutex.merged_path(dir.path()), b"old").unwrap();
        fs::write(ProfileKind::Mutex.last_path(dir.path()), b"new").unwrap();

        assert!(merge_profile(&Failing, ProfileKind::Mutex, dir.path()).is_err());
        assert_eq!(
            fs::read(ProfileKind::Mutex.merged_path(dir.path())).unwrap(),
            b"old"
        );
        // Only the two profiles are left; the temporary file is cleaned up.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_clear_profiles() {
        let dir = tempdir().unwrap();
        for kind in ProfileKind::ALL {
            fs::write(kind.last_path(dir.path()), b"x").unwrap();
            fs::write(kind.merged_path(dir.path()), b"x").unwrap();
        }

        clear_last_profiles(dir.path()).unwrap();
        for kind in ProfileKind::ALL {
            assert!(!kind.last_path(dir.path()).exists());
            assert!(kind.merged_path(dir.path()).exists());
        }

        clear_merged_profiles(dir.path()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
