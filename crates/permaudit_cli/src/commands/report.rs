//! Report emitter: writes the three audit tables to disk and prints a summary.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use permaudit::{AuditReport, AuditTables};
use serde::{Deserialize, Serialize};

/// File format for the audit tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// One CSV file per table (default)
    #[default]
    Csv,
    /// One JSON array file per table
    Json,
}

impl ReportFormat {
    fn extension(self) -> &'static str {
        match self {
            ReportFormat::Csv => "csv",
            ReportFormat::Json => "json",
        }
    }
}

/// Write `<org>_user_permissions`, `<org>_user_summary` and
/// `<org>_repository_summary` into `dir`, returning the paths in that order.
pub(crate) fn write_tables(
    tables: &AuditTables,
    org: &str,
    dir: &Path,
    format: ReportFormat,
) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    fs::create_dir_all(dir)?;

    let path_for = |table: &str| dir.join(format!("{}_{}.{}", org, table, format.extension()));

    let paths = vec![
        path_for("user_permissions"),
        path_for("user_summary"),
        path_for("repository_summary"),
    ];

    write_rows(&paths[0], &tables.user_permissions, format)?;
    write_rows(&paths[1], &tables.user_summary, format)?;
    write_rows(&paths[2], &tables.repository_summary, format)?;

    for path in &paths {
        tracing::info!(path = %path.display(), "Wrote report");
    }

    Ok(paths)
}

fn write_rows<T: Serialize>(
    path: &Path,
    rows: &[T],
    format: ReportFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        ReportFormat::Csv => {
            let mut writer = csv::Writer::from_path(path)?;
            for row in rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        ReportFormat::Json => {
            let mut writer = BufWriter::new(File::create(path)?);
            serde_json::to_writer_pretty(&mut writer, rows)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
    }
    Ok(())
}

/// One line of the run summary.
#[derive(Debug, Clone, tabled::Tabled)]
pub(crate) struct SummaryLine {
    #[tabled(rename = "Metric")]
    pub metric: &'static str,
    #[tabled(rename = "Value")]
    pub value: String,
}

impl SummaryLine {
    pub(crate) fn new(metric: &'static str, value: impl ToString) -> Self {
        Self {
            metric,
            value: value.to_string(),
        }
    }
}

pub(crate) fn summary_lines(report: &AuditReport) -> Vec<SummaryLine> {
    let stats = &report.stats;
    let anomalies = &report.anomalies;

    vec![
        SummaryLine::new("Organization", &report.organization.login),
        SummaryLine::new("Repositories discovered", stats.repositories_discovered),
        SummaryLine::new("Repositories audited", stats.repositories_processed),
        SummaryLine::new("  with collaborators", stats.repositories_with_collaborators),
        SummaryLine::new("  without collaborators", stats.repositories_without_collaborators),
        SummaryLine::new("Repositories skipped", stats.repositories_skipped),
        SummaryLine::new("Users", report.tables.user_summary.len()),
        SummaryLine::new("Permission pairs", stats.permission_pairs),
        SummaryLine::new("Queries", stats.queries),
        SummaryLine::new("Pages", stats.pages),
        SummaryLine::new("Rate-limit waits", stats.rate_limit_waits),
        SummaryLine::new(
            "Completeness",
            format!("{:.1}%", stats.completeness_percent()),
        ),
        SummaryLine::new("Anomalies", anomalies.total()),
        SummaryLine::new(
            "Elapsed",
            format!("{:.1}s", stats.elapsed().as_secs_f64()),
        ),
    ]
}

pub(crate) fn print_summary(report: &AuditReport, paths: &[PathBuf]) {
    let mut table = tabled::Table::new(summary_lines(report));
    table.with(tabled::settings::Style::rounded());
    println!("{}", table);

    for path in paths {
        println!("  {}", path.display());
    }

    if !report.warnings.is_empty() {
        println!("{} warning(s); see the log for details.", report.warnings.len());
    }
}
