use anyhow::{Context, Result};
use log::debug;
use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::Arc;

use crate::error::BenchdiffError;

/// Command execution context
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    /// Current working directory
    pub working_dir: Option<PathBuf>,
    /// Capture output
    pub capture_output: bool,
    /// Send both stdout and stderr to this file instead
    pub output_file: Option<Arc<File>>,
    /// Allow command to fail without returning an error
    pub allow_failure: bool,
}

/// Builder for CommandExecutor
pub struct CommandExecutorBuilder {
    context: CommandContext,
}

impl Default for CommandExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutorBuilder {
    pub fn new() -> Self {
        Self {
            context: CommandContext::default(),
        }
    }

    /// Set whether to capture command output
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.context.capture_output = capture;
        self
    }

    /// Append stdout and stderr of the command to an already open file
    pub fn output_file(mut self, file: Arc<File>) -> Self {
        self.context.output_file = Some(file);
        self
    }

    /// Set the working directory
    pub fn working_dir<P: AsRef<Path>>(mut self, dir: Option<P>) -> Self {
        self.context.working_dir = dir.map(|d| d.as_ref().to_path_buf());
        self
    }

    /// Set whether to allow command failures without returning an error
    pub fn allow_failure(mut self, allow: bool) -> Self {
        self.context.allow_failure = allow;
        self
    }

    pub fn build(self) -> CommandExecutor {
        CommandExecutor {
            context: self.context,
        }
    }
}

/// The one place child processes are spawned from: git, go, bazel,
/// benchstat and the benchmark binaries themselves.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    context: CommandContext,
}

impl CommandExecutor {
    /// Create a new CommandExecutor which captures output and fails on a
    /// non-zero exit
    pub fn new() -> Self {
        Self::builder().capture_output(true).build()
    }

    pub fn builder() -> CommandExecutorBuilder {
        CommandExecutorBuilder::new()
    }

    /// Execute a shell command line and wait for it to complete
    pub fn execute_shell(&self, cmd_line: &str) -> Result<Output> {
        self.execute_command_with_args("sh", &["-c", cmd_line])
    }

    /// Execute a command with arguments and wait for it to complete, returning the output
    pub fn execute_command_with_args<S: AsRef<OsStr>>(
        &self,
        cmd: &str,
        args: &[S],
    ) -> Result<Output> {
        let child = self.launch_command(cmd, args)?;

        let output = child.wait_with_output().with_context(|| {
            format!(
                "Failed to wait for command completion: {}",
                self.format_command(cmd, args)
            )
        })?;

        if !output.status.success() && !self.context.allow_failure {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "Command failed with status {}: {}\nStderr: {}",
                output.status.code().unwrap_or(-1),
                self.format_command(cmd, args),
                stderr.trim_end()
            ));
        }

        Ok(output)
    }

    /// Run a command and return its trimmed stdout
    pub fn capture<S: AsRef<OsStr>>(&self, cmd: &str, args: &[S]) -> Result<String> {
        let output = self.execute_command_with_args(cmd, args)?;
        let stdout = String::from_utf8(output.stdout).with_context(|| {
            format!("Invalid UTF-8 in output of {}", self.format_command(cmd, args))
        })?;
        Ok(stdout.trim().to_string())
    }

    /// Execute a command and return its exit status
    pub fn execute_check_status<S: AsRef<OsStr>>(
        &self,
        cmd: &str,
        args: &[S],
    ) -> Result<ExitStatus> {
        let output = self.execute_command_with_args(cmd, args)?;
        Ok(output.status)
    }

    /// Launch a command, returning the child process handle
    pub fn launch_command<S: AsRef<OsStr>>(&self, cmd: &str, args: &[S]) -> Result<Child> {
        let command_str = self.format_command(cmd, args);
        debug!("Launching command: {}", command_str);

        let mut command = Command::new(cmd);
        command.args(args);

        if let Some(dir) = &self.context.working_dir {
            command.current_dir(dir);
        }

        if let Some(file) = &self.context.output_file {
            let stdout = file
                .try_clone()
                .context("Failed to duplicate output file handle")?;
            let stderr = file
                .try_clone()
                .context("Failed to duplicate output file handle")?;
            command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
        } else if self.context.capture_output {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", command_str))?;

        Ok(child)
    }

    /// Format command and arguments for logging
    pub fn format_command<S: AsRef<OsStr>>(&self, cmd: &str, args: &[S]) -> String {
        let args: Vec<_> = args
            .iter()
            .map(|a| a.as_ref().to_string_lossy())
            .collect();
        format!("{} {}", cmd, args.join(" "))
    }
}

/// Resolves an executable on `$PATH` (or a path to one) before any work
/// depends on it.
pub fn require_executable(name: &str) -> Result<PathBuf> {
    let path = which::which(name).map_err(|e| BenchdiffError::ToolNotFound {
        tool: name.to_string(),
        reason: e.to_string(),
    })?;
    debug!("Using {name} at {path:?}");
    Ok(path)
}
