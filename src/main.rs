use anyhow::{Context, Result};
use benchdiff::{
    benchmarks::{
        intersect_tests, BazelBuilder, BuildBackend, GoList, GoTestBuilder, Orchestrator,
        PprofMerger, ProfileSelection, RunOptions, Suite, SuiteBuilder,
    },
    command::require_executable,
    compare::{check_threshold, Benchstat, SortOrder},
    config::{load_app_config, AppConfig},
    git::GitRepo,
    output::{self, HttpSheetUploader, OutputFormat, Report, SheetUploader},
    ui::{ProgressWriter, SharedProgress},
    workdir::{format_run_time, parse_run_time},
};
use chrono::Local;
use clap::{ArgAction, CommandFactory, Parser};
use env_logger::{Env, Target};
use log::{info, warn};
use std::{env, io, path::PathBuf, process, sync::Arc};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Compare the benchmarks of two revisions of a Go codebase",
    long_about = "Builds the test binaries of both revisions, runs their benchmarks \
                  interleaved, and compares the results with benchstat.\n\n\
                  Example:\n  benchdiff --new=d1fbdb2 --run=Datum --count=2 --csv ./pkg/sql/..."
)]
struct Cli {
    /// Packages to benchmark, e.g. ./pkg/sql/...
    pkgs: Vec<String>,

    /// Old revision to compare against; `lastmerge` picks the last merge
    /// commit [default: <new>~]
    #[arg(short, long)]
    old: Option<String>,

    /// New revision to compare [default: HEAD]
    #[arg(short, long)]
    new: Option<String>,

    /// Run only benchmarks matching this regexp
    #[arg(short, long, default_value = ".")]
    run: String,

    /// Run each benchmark this many times
    #[arg(short, long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    count: u32,

    /// Run enough iterations of each benchmark to take this long, e.g. 1s or 100x
    #[arg(short = 'd', long)]
    benchtime: Option<String>,

    /// Write a merged cpu profile
    #[arg(long)]
    cpuprofile: bool,

    /// Write a merged memory profile
    #[arg(long)]
    memprofile: bool,

    /// Write a merged mutex contention profile
    #[arg(long)]
    mutexprofile: bool,

    /// Exit with an error if any benchmark regresses by more than this
    /// fraction (0.05 is 5%); negative disables the check
    #[arg(short, long, default_value_t = -1.0, allow_negative_numbers = true)]
    threshold: f64,

    /// Compare the output of an earlier run, identified by its timestamp,
    /// instead of running benchmarks
    #[arg(short, long)]
    previous_run: Option<String>,

    /// Command to run after each revision is checked out
    #[arg(long)]
    post_checkout: Option<String>,

    /// Show the comparison so far while benchmarks run
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    preview: bool,

    /// Build the test binaries with bazel
    #[arg(short, long)]
    bazel: bool,

    /// Sort the comparison by delta (largest improvement first) or name
    #[arg(short, long, value_enum, default_value_t = SortOrder::Delta)]
    sort: SortOrder,

    /// Print the comparison as CSV
    #[arg(long)]
    csv: bool,

    /// Print the comparison as an HTML table
    #[arg(long)]
    html: bool,

    /// Also upload the comparison to a sheet
    #[arg(long)]
    sheets: bool,

    /// Application config
    #[arg(long, env = "BENCHDIFF_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    fn profiles(&self) -> ProfileSelection {
        ProfileSelection {
            cpu: self.cpuprofile,
            mem: self.memprofile,
            mutex: self.mutexprofile,
        }
    }
}

fn main() {
    // Logs share the terminal with the spinners, so they go through the same
    // line-counting writer.
    let progress = Arc::new(ProgressWriter::stderr());
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Pipe(Box::new(SharedProgress(Arc::clone(&progress)))))
        .init();
    let cli = Cli::parse();

    if cli.pkgs.is_empty() && cli.previous_run.is_none() {
        if let Err(e) = Cli::command().print_help() {
            eprintln!("fatal: {e}");
            process::exit(1);
        }
        return;
    }

    if let Err(e) = run(cli, progress) {
        eprintln!("fatal: {e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli, progress: Arc<ProgressWriter>) -> Result<()> {
    let mut pkgs = cli.pkgs.clone();
    pkgs.sort();
    let profiles = cli.profiles();

    let format = output::output_format(cli.csv, cli.html, cli.sheets)?;
    let config = load_app_config(cli.config.as_deref())?;
    // Set up the sheet client first so credential problems show up before
    // anything is built.
    let uploader = match format {
        OutputFormat::Sheets => Some(sheet_uploader(&config)?),
        _ => None,
    };
    check_tools(&cli, &config)?;

    let repo = GitRepo::new();
    let (old_ref, new_ref) = repo.resolve_refs(cli.old.as_deref(), cli.new.as_deref())?;
    let workdir = config.workdir();
    let mut old = Suite::new(&workdir, &old_ref, repo.subject(&old_ref)?);
    let mut new = Suite::new(&workdir, &new_ref, repo.subject(&new_ref)?);

    let args: Vec<String> = env::args().skip(1).collect();
    output::write_header(&mut io::stdout(), &old, &new, &args)?;

    let benchstat = Benchstat::new(&config.benchstat);
    match &cli.previous_run {
        Some(previous) => {
            let run_time = parse_run_time(previous)?;
            old.attach_previous_run(&workdir, &run_time)?;
            new.attach_previous_run(&workdir, &run_time)?;
            info!(
                "Found previous run; old={} new={}",
                old.output_path().unwrap_or(workdir.root()).display(),
                new.output_path().unwrap_or(workdir.root()).display()
            );
        }
        None => {
            let run_time = Local::now().fixed_offset();
            info!(
                "Benchmark output is kept under {}; pass --previous-run={} to compare it again",
                workdir.root().display(),
                format_run_time(&run_time)
            );

            let lister = GoList::new(&config.go);
            let backend: Box<dyn BuildBackend> = if cli.bazel {
                Box::new(
                    BazelBuilder::new(
                        &config.bazel.executable,
                        &config.import_root,
                        &config.bazel.module_path,
                        &config.bazel.bin_dir,
                    )
                    .in_workspace(repo.toplevel()?),
                )
            } else {
                Box::new(GoTestBuilder::new(&config.go, &config.import_root))
            };
            SuiteBuilder::new(&workdir, &repo, &lister, backend.as_ref(), Arc::clone(&progress))
                .post_checkout(cli.post_checkout.clone())
                .build_all(&pkgs, &mut [&mut old, &mut new], &run_time)?;

            let tests = intersect_tests(&old, &new);
            if tests.is_empty() {
                warn!("No test binaries in common between {old_ref} and {new_ref}");
            }

            let options = RunOptions {
                run_pattern: cli.run.clone(),
                bench_time: cli.benchtime.clone(),
                iterations: cli.count as usize,
                profiles,
            };
            let merger = PprofMerger::new(&config.go);
            let mut orchestrator = Orchestrator::new(progress, &options, &merger);
            if cli.preview {
                orchestrator = orchestrator.with_preview(&benchstat);
            }
            let failures = orchestrator.run(&old, &new, &tests)?;
            if !failures.is_empty() {
                warn!(
                    "{} benchmark runs had failures, their results may be incomplete",
                    failures.len()
                );
            }
        }
    }

    let report = Report {
        engine: &benchstat,
        sort: cli.sort,
        format,
        uploader: uploader.as_ref().map(|u| u as &dyn SheetUploader),
    };
    let tables = report.write(&mut io::stdout(), &old, &new, &pkgs)?;
    output::write_profile_locations(&mut io::stdout(), &old, &new, &profiles)?;

    check_threshold(cli.threshold, &tables)
}

fn sheet_uploader(config: &AppConfig) -> Result<HttpSheetUploader> {
    let endpoint = config
        .sheets
        .endpoint
        .as_deref()
        .context("--sheets needs sheets.endpoint in the app config")?;
    HttpSheetUploader::new(endpoint, config.sheets.token_env.as_deref())
}

/// Fails early if an external tool this run needs is missing.
fn check_tools(cli: &Cli, config: &AppConfig) -> Result<()> {
    require_executable("git")?;
    require_executable(&config.benchstat)?;
    if cli.previous_run.is_none() {
        require_executable(&config.go)?;
        if cli.bazel {
            require_executable(&config.bazel.executable)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_flag_forms() {
        let cli = Cli::try_parse_from(["benchdiff", "./pkg/kv"]).unwrap();
        assert!(cli.preview);

        let cli = Cli::try_parse_from(["benchdiff", "--preview", "./pkg/kv"]).unwrap();
        assert!(cli.preview);
        assert_eq!(cli.pkgs, vec!["./pkg/kv"]);

        let cli = Cli::try_parse_from(["benchdiff", "--preview=false", "./pkg/kv"]).unwrap();
        assert!(!cli.preview);
    }

    #[test]
    fn test_negative_threshold() {
        let cli = Cli::try_parse_from(["benchdiff", "-t", "-1", "./pkg/kv"]).unwrap();
        assert_eq!(cli.threshold, -1.0);
        assert!(Cli::try_parse_from(["benchdiff", "--count=0", "./pkg/kv"]).is_err());
    }
}
