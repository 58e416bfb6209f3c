use permaudit::{PreflightReport, preflight};

use crate::commands::report::SummaryLine;
use crate::commands::shared::build_client;
use crate::config::Config;

/// Verify the credential and organization access without auditing.
pub(crate) async fn handle_check(
    org: &str,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = build_client(config)?;
    let report = preflight(&client, org, None).await?;

    let mut table = tabled::Table::new(check_lines(&report));
    table.with(tabled::settings::Style::rounded());
    println!("{}", table);

    Ok(())
}

fn check_lines(report: &PreflightReport) -> Vec<SummaryLine> {
    let yes_no = |b: bool| if b { "yes" } else { "no" };

    let mut lines = vec![
        SummaryLine::new("Authenticated as", &report.viewer.login),
        SummaryLine::new("Organization", &report.organization.login),
    ];
    if let Some(ref name) = report.organization.name {
        lines.push(SummaryLine::new("Name", name));
    }
    lines.push(SummaryLine::new(
        "Member",
        yes_no(report.organization.viewer_is_a_member),
    ));
    lines.push(SummaryLine::new(
        "Administrator",
        yes_no(report.organization.viewer_can_administer),
    ));
    if let Some(ref limits) = report.viewer.rate_limit {
        lines.push(SummaryLine::new(
            "Rate limit",
            format!("{}/{} remaining", limits.remaining, limits.limit),
        ));
    }
    let missing = if report.missing_scopes.is_empty() {
        "none".to_string()
    } else {
        report.missing_scopes.join(", ")
    };
    lines.push(SummaryLine::new("Missing scopes", missing));

    lines
}
