use anyhow::{bail, Context, Result};
use std::os::unix::fs::symlink;
use std::path::Path;
use tempfile::TempDir;

use super::{Change, ComparisonEngine, RenderFormat, Row, SortOrder, Table};
use crate::command::CommandExecutor;

/// The `benchstat` CLI (golang.org/x/perf/cmd/benchstat).
pub struct Benchstat {
    executable: String,
}

impl Benchstat {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Runs benchstat over the two logs. benchstat labels its columns with
    /// the file names, so the logs are linked as `old` and `new` in a
    /// scratch directory first.
    fn run(&self, old: &Path, new: &Path, flags: &[&str]) -> Result<String> {
        let dir = TempDir::new().context("Failed to create benchstat directory")?;
        for (name, log) in [("old", old), ("new", new)] {
            let target = std::path::absolute(log)
                .with_context(|| format!("Failed to resolve path {log:?}"))?;
            symlink(&target, dir.path().join(name))
                .with_context(|| format!("Failed to link {target:?}"))?;
        }

        let mut args = flags.to_vec();
        args.extend(["old", "new"]);
        let output = CommandExecutor::builder()
            .capture_output(true)
            .working_dir(Some(dir.path()))
            .build()
            .execute_command_with_args(&self.executable, &args)
            .context("Failed to compare benchmark results")?;
        String::from_utf8(output.stdout).context("Invalid UTF-8 in benchstat output")
    }
}

fn sort_flag(sort: SortOrder) -> &'static str {
    match sort {
        SortOrder::Delta => "-delta",
        SortOrder::Name => "name",
    }
}

impl ComparisonEngine for Benchstat {
    fn tables(&self, old: &Path, new: &Path, sort: SortOrder) -> Result<Vec<Table>> {
        let csv = self.run(old, new, &["-csv", "-sort", sort_flag(sort)])?;
        parse_csv(&csv)
    }

    fn render(
        &self,
        old: &Path,
        new: &Path,
        sort: SortOrder,
        format: RenderFormat,
    ) -> Result<String> {
        let mut flags = vec!["-sort", sort_flag(sort)];
        match format {
            RenderFormat::Text => {}
            RenderFormat::Csv => flags.push("-csv"),
            RenderFormat::Html => flags.push("-html"),
        }
        self.run(old, new, &flags)
    }
}

/// Parses benchstat's CSV output: one block per metric, separated by blank
/// lines, each starting with a header like
/// `name,old time/op (ns/op),±,new time/op (ns/op),±,delta,±`.
pub(crate) fn parse_csv(csv: &str) -> Result<Vec<Table>> {
    let mut tables = Vec::new();
    let mut current: Option<Table> = None;

    for line in csv.lines() {
        let fields = split_record(line);
        if fields.iter().all(|f| f.trim().is_empty()) {
            tables.extend(current.take());
            continue;
        }
        match current.as_mut() {
            None => current = Some(parse_header(&fields)?),
            Some(table) => table.rows.push(parse_row(&table.metric, &table.unit, &fields)?),
        }
    }
    tables.extend(current);
    Ok(tables)
}

fn parse_header(fields: &[String]) -> Result<Table> {
    if fields.first().map(String::as_str) != Some("name") || fields.len() < 2 {
        bail!("Unexpected benchstat header: {}", fields.join(","));
    }
    let column = fields[1].strip_prefix("old ").unwrap_or(&fields[1]);
    let (metric, unit) = match column.rsplit_once(" (") {
        Some((metric, unit)) => (metric, unit.trim_end_matches(')')),
        None => (column, ""),
    };
    Ok(Table {
        metric: metric.to_string(),
        unit: unit.to_string(),
        rows: Vec::new(),
    })
}

fn parse_row(metric: &str, unit: &str, fields: &[String]) -> Result<Row> {
    let field = |i: usize| fields.get(i).cloned().unwrap_or_default();
    if fields.len() < 6 {
        bail!("Unexpected benchstat row: {}", fields.join(","));
    }

    let delta = field(5);
    let (pct_delta, change) = match delta.trim().trim_end_matches('%') {
        "~" | "" => (0.0, Change::Unchanged),
        pct => {
            let pct: f64 = pct
                .parse()
                .with_context(|| format!("Invalid delta {delta:?} for {}", field(0)))?;
            let change = if pct == 0.0 {
                Change::Unchanged
            } else if (pct > 0.0) == higher_is_better(metric, unit) {
                Change::Better
            } else {
                Change::Worse
            };
            (pct, change)
        }
    };

    Ok(Row {
        benchmark: field(0),
        old: field(1),
        new: field(3),
        delta,
        pct_delta,
        change,
        note: field(6)
            .trim_matches(|c| c == '(' || c == ')')
            .to_string(),
    })
}

/// Throughput metrics improve upwards; everything else (time, bytes,
/// allocations) improves downwards.
fn higher_is_better(metric: &str, unit: &str) -> bool {
    metric == "speed" || unit.ends_with("/s")
}

/// Splits one CSV record, honouring double-quoted fields.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmarks::test_utils::write_script;
    use std::fs;

    const OUTPUT: &str = "\
name,old time/op (ns/op),±,new time/op (ns/op),±,delta,±
Encode-8,1.23E+03,1%,1.20E+03,2%,-2.44%,p=0.008 n=5+5
Decode-8,500,3%,530,1%,+6.00%,p=0.016 n=5+5
\"Parse/a=1,b=2-8\",42.0,0%,42.1,0%,~,(p=0.421 n=5+5)

name,old speed,±,new speed,±,delta,±
Encode-8,10.0MB/s,1%,12.0MB/s,2%,+20.00%,p=0.008 n=5+5

name,old alloc/op (B/op),±,new alloc/op (B/op),±,delta,±
Encode-8,64.0,0%,32.0,0%,-50.00%,p=0.008 n=5+5
";

    #[test]
    fn test_parse_csv() {
        let tables = parse_csv(OUTPUT).unwrap();
        assert_eq!(tables.len(), 3);

        let time = &tables[0];
        assert_eq!((time.metric.as_str(), time.unit.as_str()), ("time/op", "ns/op"));
        assert_eq!(time.rows.len(), 3);
        assert_eq!(time.rows[0].change, Change::Better);
        assert_eq!(time.rows[0].old, "1.23E+03");
        assert_eq!(time.rows[1].change, Change::Worse);
        assert_eq!(time.rows[1].pct_delta, 6.0);
        assert_eq!(time.rows[2].benchmark, "Parse/a=1,b=2-8");
        assert_eq!(time.rows[2].change, Change::Unchanged);
        assert_eq!(time.rows[2].note, "p=0.421 n=5+5");

        assert_eq!(tables[1].metric, "speed");
        assert_eq!(tables[1].rows[0].change, Change::Better);
        assert_eq!(tables[2].unit, "B/op");
        assert_eq!(tables[2].rows[0].change, Change::Better);
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_csv("").unwrap().is_empty());
        assert!(parse_csv("\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_csv("benchstat: no data\n").is_err());
    }

    #[test]
    fn test_benchstat_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.log");
        let new = dir.path().join("new.log");
        fs::write(&old, "old-data").unwrap();
        fs::write(&new, "new-data").unwrap();
        // Echo the arguments, then the contents of the linked logs.
        let exe = write_script(
            dir.path(),
            "benchstat",
            r#"echo "$*"; cat old; echo; cat new; echo"#,
        );

        let out = Benchstat::new(exe.to_string_lossy())
            .render(&old, &new, SortOrder::Delta, RenderFormat::Html)
            .unwrap();
        assert_eq!(out, "-sort -delta -html old new\nold-data\nnew-data\n");

        let out = Benchstat::new(exe.to_string_lossy())
            .render(&old, &new, SortOrder::Name, RenderFormat::Text)
            .unwrap();
        assert!(out.starts_with("-sort name old new\n"), "{out}");
    }

    #[test]
    fn test_benchstat_tables() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("out.log");
        fs::write(&log, "").unwrap();
        fs::write(dir.path().join("table.csv"), OUTPUT).unwrap();
        let exe = write_script(
            dir.path(),
            "benchstat",
            &format!("cat {}", dir.path().join("table.csv").display()),
        );

        let tables = Benchstat::new(exe.to_string_lossy())
            .tables(&log, &log, SortOrder::Name)
            .unwrap();
        assert_eq!(tables.len(), 3);
    }
}
