use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use permaudit::{AuditOptions, CancelFlag, preflight, run_audit};

use crate::commands::report::{self, ReportFormat};
use crate::commands::shared::build_client;
use crate::config::Config;
use crate::progress::ProgressReporter;

/// Arguments for `permaudit audit`.
#[derive(Debug, Args)]
pub(crate) struct AuditArgs {
    /// Organization login to audit
    pub org: String,

    /// Include archived repositories
    #[arg(long)]
    pub include_archived: bool,

    /// Directory for the report files (default: current directory)
    #[arg(long, short = 'o', value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Report file format
    #[arg(long, short = 'f', value_enum)]
    pub format: Option<ReportFormat>,

    /// Maximum repositories audited at once
    #[arg(long, short = 'c', value_parser = clap::value_parser!(u16).range(1..=64))]
    pub concurrency: Option<u16>,

    /// Skip the outside-collaborator pass (one fewer query per repository)
    #[arg(long)]
    pub no_outside_detection: bool,

    /// Skip the credential and organization checks before the audit
    #[arg(long)]
    pub skip_preflight: bool,
}

impl AuditArgs {
    /// Merge CLI flags over the configured defaults.
    fn options(&self, config: &Config) -> AuditOptions {
        let concurrency = self
            .concurrency
            .map(usize::from)
            .unwrap_or(config.audit.concurrency);

        AuditOptions::new(&self.org)
            .with_include_archived(self.include_archived || config.audit.include_archived)
            .with_concurrency(concurrency)
            .with_outside_detection(config.audit.detect_outside && !self.no_outside_detection)
    }

    fn output_dir(&self, config: &Config) -> PathBuf {
        self.output_dir
            .clone()
            .or_else(|| config.audit.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn format(&self, config: &Config) -> ReportFormat {
        self.format.unwrap_or(config.audit.format)
    }
}

pub(crate) async fn handle_audit(
    args: AuditArgs,
    config: &Config,
    cancel: CancelFlag,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = build_client(config)?;
    let options = args.options(config);

    let reporter = Arc::new(ProgressReporter::new());
    let callback = reporter.as_callback();

    if !args.skip_preflight {
        let checked = match preflight(&client, &options.org, Some(callback.as_ref())).await {
            Ok(checked) => checked,
            Err(e) => {
                reporter.finish();
                return Err(e.into());
            }
        };
        if !checked.missing_scopes.is_empty() {
            tracing::warn!(
                missing = %checked.missing_scopes.join(", "),
                "Some repositories may be invisible to this credential"
            );
        }
    }

    let result = run_audit(&client, &options, &cancel, Some(Arc::clone(&callback))).await;
    reporter.finish();
    let audit = result?;

    for warning in &audit.warnings {
        tracing::debug!(warning = %warning, "Audit warning");
    }

    let paths = report::write_tables(
        &audit.tables,
        &audit.organization.login,
        &args.output_dir(config),
        args.format(config),
    )?;
    report::print_summary(&audit, &paths);

    Ok(())
}
