use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::benchmarks::DEFAULT_IMPORT_ROOT;
use crate::config::traits::{Configuration, PathConfiguration};
use crate::path_utils;
use crate::workdir::WorkDir;

/// Config file picked up from the current directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "benchdiff.yml";

/// Application configuration loaded from benchdiff.yml
#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Where binaries, logs and profiles are kept
    pub workdir: Option<PathBuf>,
    /// Import path prefix dropped from test binary names
    pub import_root: String,
    /// `go` executable
    pub go: String,
    /// `benchstat` executable
    pub benchstat: String,
    pub bazel: BazelConfig,
    pub sheets: SheetsConfig,
    /// Path to the config file (set during loading)
    #[serde(skip)]
    pub path: PathBuf,
}

/// Settings for `--bazel` builds
#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct BazelConfig {
    pub executable: String,
    /// Import path of the workspace root
    pub module_path: String,
    /// bazel's output directory, relative to the workspace
    pub bin_dir: PathBuf,
}

/// Settings for `--sheets`
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SheetsConfig {
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token
    pub token_env: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workdir: None,
            import_root: DEFAULT_IMPORT_ROOT.to_string(),
            go: "go".to_string(),
            benchstat: "benchstat".to_string(),
            bazel: BazelConfig::default(),
            sheets: SheetsConfig::default(),
            path: PathBuf::new(),
        }
    }
}

impl Default for BazelConfig {
    fn default() -> Self {
        Self {
            executable: "bazel".to_string(),
            module_path: "github.com/cockroachdb/cockroach/".to_string(),
            bin_dir: PathBuf::from("_bazel/bin"),
        }
    }
}

impl AppConfig {
    /// The work directory: from the config file, else `$BENCHDIFF_HOME`,
    /// else `./benchdiff`
    pub fn workdir(&self) -> WorkDir {
        WorkDir::from_option(self.workdir.as_deref())
    }
}

impl Configuration for AppConfig {
    fn config_path(&self) -> &PathBuf {
        &self.path
    }

    fn config_type(&self) -> &str {
        "application"
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("go", &self.go),
            ("benchstat", &self.benchstat),
            ("bazel.executable", &self.bazel.executable),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("Invalid {name}: executable must not be empty");
            }
        }

        if self.bazel.bin_dir.is_absolute() {
            anyhow::bail!(
                "Invalid bazel.bin_dir {}: must be relative to the workspace",
                self.bazel.bin_dir.display()
            );
        }

        if let Some(endpoint) = &self.sheets.endpoint {
            Url::parse(endpoint)
                .with_context(|| format!("Invalid sheets.endpoint {endpoint:?}"))?;
        }

        Ok(())
    }
}

impl PathConfiguration for AppConfig {
    fn with_expanded_paths(&self, config_dir: &Path) -> Result<Self> {
        let mut config = self.clone();
        if let Some(workdir) = &config.workdir {
            let expanded = path_utils::expand_path_buf(workdir);
            config.workdir = Some(if expanded.is_relative() {
                config_dir.join(expanded)
            } else {
                expanded
            });
        }
        config.go = path_utils::expand_path_str(&config.go);
        config.benchstat = path_utils::expand_path_str(&config.benchstat);
        config.bazel.executable = path_utils::expand_path_str(&config.bazel.executable);
        Ok(config)
    }
}

/// Load application configuration from a YAML file.
///
/// Without an explicit path, `benchdiff.yml` in the current directory is
/// used if present and built-in defaults otherwise.
pub fn load_app_config(app_config_path: Option<&Path>) -> Result<AppConfig> {
    let app_config_path = match app_config_path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("App config file not found: {:?}", path);
            }
            path.to_path_buf()
        }
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !path.exists() {
                debug!("No {DEFAULT_CONFIG_FILE}, using default configuration");
                return Ok(AppConfig::default());
            }
            path
        }
    };

    let config_dir = match app_config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let contents = std::fs::read_to_string(&app_config_path)
        .with_context(|| format!("Failed to read app config file: {:?}", app_config_path))?;

    let mut config: AppConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse YAML from file: {:?}", app_config_path))?;

    // Set the configuration path
    config.path = app_config_path;

    let config = config.with_expanded_paths(&config_dir)?;

    config.validate()?;

    debug!(
        "Using {} configuration from {:?}\n{:?}",
        config.config_type(),
        config.config_path(),
        config
    );
    Ok(config)
}
