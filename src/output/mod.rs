//! What benchdiff prints on stdout once the benchmarks have run.

use anyhow::{Context, Result};
use std::io::Write;

use crate::benchmarks::{ProfileSelection, Suite};
use crate::compare::{ComparisonEngine, RenderFormat, SortOrder, Table};
use crate::error::BenchdiffError;

mod sheets;
pub use sheets::{HttpSheetUploader, SheetUploader};

/// Where the comparison goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Csv,
    Html,
    /// Text on stdout, plus an uploaded sheet
    Sheets,
}

/// Picks the output format from the mutually exclusive format flags.
pub fn output_format(csv: bool, html: bool, sheets: bool) -> Result<OutputFormat> {
    let incompatible = |a: &'static str, b: &'static str| -> Result<OutputFormat> {
        Err(BenchdiffError::IncompatibleFlags(a, b).into())
    };
    match (csv, html, sheets) {
        (true, true, _) => incompatible("csv", "html"),
        (true, _, true) => incompatible("csv", "sheets"),
        (_, true, true) => incompatible("html", "sheets"),
        (true, _, _) => Ok(OutputFormat::Csv),
        (_, true, _) => Ok(OutputFormat::Html),
        (_, _, true) => Ok(OutputFormat::Sheets),
        _ => Ok(OutputFormat::Text),
    }
}

/// Prints the revisions being compared and the command line.
pub fn write_header(w: &mut dyn Write, old: &Suite, new: &Suite, args: &[String]) -> Result<()> {
    writeln!(w, "old:  {} {:.50}", old.rev(), old.subject())?;
    writeln!(w, "new:  {} {:.50}", new.rev(), new.subject())?;
    let quoted: Vec<String> = args.iter().map(|a| format!("{a:?}")).collect();
    writeln!(w, "args: benchdiff {}", quoted.join(" "))?;
    writeln!(w)?;
    Ok(())
}

/// Renders the comparison of two suites' output logs.
pub struct Report<'a> {
    pub engine: &'a dyn ComparisonEngine,
    pub sort: SortOrder,
    pub format: OutputFormat,
    /// Required for [`OutputFormat::Sheets`]
    pub uploader: Option<&'a dyn SheetUploader>,
}

impl Report<'_> {
    /// Writes the comparison and returns its tables for the regression
    /// check.
    pub fn write(
        &self,
        w: &mut dyn Write,
        old: &Suite,
        new: &Suite,
        pkgs: &[String],
    ) -> Result<Vec<Table>> {
        let (old_log, new_log) = match (old.output_path(), new.output_path()) {
            (Some(o), Some(n)) => (o, n),
            _ => anyhow::bail!("Benchmark output logs are not available"),
        };

        let render = match self.format {
            OutputFormat::Text | OutputFormat::Sheets => RenderFormat::Text,
            OutputFormat::Csv => RenderFormat::Csv,
            OutputFormat::Html => RenderFormat::Html,
        };
        let rendered = self.engine.render(old_log, new_log, self.sort, render)?;
        write!(w, "{rendered}")?;

        let tables = self.engine.tables(old_log, new_log, self.sort)?;
        if self.format == OutputFormat::Sheets {
            let uploader = self
                .uploader
                .context("No sheet uploader configured for --sheets")?;
            let title = format!(
                "benchdiff: {} ({} -> {})",
                pkgs.join(" "),
                old.rev(),
                new.rev()
            );
            let url = uploader.create_sheet(&title, &tables)?;
            writeln!(w, "\ngenerated sheet: {url}")?;
        }
        Ok(tables)
    }
}

/// Tells the user where the accumulated profiles ended up.
pub fn write_profile_locations(
    w: &mut dyn Write,
    old: &Suite,
    new: &Suite,
    profiles: &ProfileSelection,
) -> Result<()> {
    for kind in profiles.enabled() {
        writeln!(
            w,
            "\nwrote merged {} profile to:\n  old={}\n  new={}",
            kind.name(),
            kind.merged_path(old.artifacts_dir()).display(),
            kind.merged_path(new.artifacts_dir()).display()
        )?;
    }
    Ok(())
}
