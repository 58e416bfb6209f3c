//! Permaudit CLI - audit who can access which repositories of a GitHub organization.

mod commands;
mod config;
mod progress;
mod shutdown;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::Term;
use permaudit::{AuditError, CancelFlag, FailureKind};
use tracing_subscriber::EnvFilter;

use crate::commands::audit::AuditArgs;
use crate::commands::limits::OutputFormat;

#[derive(Parser)]
#[command(name = "permaudit")]
#[command(version)]
#[command(about = "Audit collaborator permissions across a GitHub organization")]
#[command(
    long_about = "Permaudit walks every repository of a GitHub organization through the \
GraphQL API, collects each repository's collaborators with their permission level, and \
writes per-user permissions, a per-user summary and a per-repository summary."
)]
#[command(after_long_help = r#"EXAMPLES
    Audit an organization, writing CSV reports to the current directory:
        $ permaudit audit acme

    Include archived repositories and write JSON to a directory:
        $ permaudit audit acme --include-archived --format json --output-dir reports

    Check the credential before a long run:
        $ permaudit check acme

    Show the remaining GraphQL quota:
        $ permaudit limits

CONFIGURATION
    Permaudit reads configuration from:
      1. ~/.config/permaudit/config.toml (or $XDG_CONFIG_HOME/permaudit/config.toml)
      2. ./permaudit.toml
      3. Environment variables (PERMAUDIT_ prefix, e.g., PERMAUDIT_AUDIT__CONCURRENCY)
      4. .env file in current directory

ENVIRONMENT VARIABLES
    GITHUB_PAT                    Personal access token (preferred)
    GITHUB_TOKEN                  Default token, used when GITHUB_PAT is unset
    PERMAUDIT_GITHUB__ENDPOINT    GraphQL endpoint for GitHub Enterprise Server
    RUST_LOG                      Log filter (default: permaudit=info,permaudit_cli=info)

EXIT STATUS
    0 success, 1 other failure, 2 authentication, 3 organization not found,
    4 retries exhausted, 130 cancelled
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Audit every repository of an organization and write the reports
    Audit(AuditArgs),

    /// Verify the credential and organization access without auditing
    Check {
        /// Organization login
        org: String,
    },

    /// Show the current GraphQL rate limit
    Limits {
        /// Output format
        #[arg(long, short = 'o', value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },

    /// Generate man pages
    Man {
        /// Directory to write man pages to (prints the main page to stdout if omitted)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
}

/// Map a failed run to the process exit status.
fn exit_code(err: &(dyn std::error::Error + 'static)) -> u8 {
    let kind = err
        .downcast_ref::<AuditError>()
        .map(AuditError::kind)
        .unwrap_or(FailureKind::Other);

    match kind {
        FailureKind::Auth => 2,
        FailureKind::NotFound => 3,
        FailureKind::RetryExhausted => 4,
        FailureKind::Cancelled => shutdown::FORCE_QUIT_EXIT_CODE as u8,
        FailureKind::Other => 1,
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Audit(args) => {
            let config = config::Config::load();
            let cancel = CancelFlag::new();
            shutdown::setup_shutdown_handler(cancel.clone());
            commands::audit::handle_audit(args, &config, cancel).await?;
        }
        Commands::Check { org } => {
            let config = config::Config::load();
            commands::check::handle_check(&org, &config).await?;
        }
        Commands::Limits { output } => {
            let config = config::Config::load();
            commands::limits::handle_limits(output, &config).await?;
        }
        Commands::Completions { shell } => commands::meta::handle_completions(shell)?,
        Commands::Man { output } => commands::meta::handle_man(output)?,
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // Structured logging only when not connected to a TTY; progress bars otherwise
    if !Term::stdout().is_term() {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::new("permaudit=info,permaudit_cli=info"),
        };

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(exit_code(e.as_ref()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exit_codes_follow_failure_kind() {
        let cases: Vec<(AuditError, u8)> = vec![
            (AuditError::auth("bad credentials"), 2),
            (AuditError::OrgNotFound("ghost".to_string()), 3),
            (
                AuditError::RetryExhausted {
                    scope: "repositories(acme) page 1".to_string(),
                    attempts: 5,
                    last_error: "Network error: reset".to_string(),
                },
                4,
            ),
            (AuditError::Cancelled, 130),
            (AuditError::api("unexpected"), 1),
        ];

        for (err, expected) in cases {
            let boxed: Box<dyn std::error::Error> = Box::new(err);
            assert_eq!(exit_code(boxed.as_ref()), expected);
        }
    }

    #[test]
    fn non_audit_errors_exit_with_one() {
        let boxed: Box<dyn std::error::Error> = "boom".into();
        assert_eq!(exit_code(boxed.as_ref()), 1);
    }

    #[test]
    fn audit_subcommand_parses() {
        let cli = Cli::try_parse_from(["permaudit", "audit", "acme", "--skip-preflight"]).unwrap();
        match cli.command {
            Commands::Audit(args) => {
                assert_eq!(args.org, "acme");
                assert!(args.skip_preflight);
            }
            _ => panic!("expected audit"),
        }
    }

    #[test]
    fn limits_defaults_to_table() {
        let cli = Cli::try_parse_from(["permaudit", "limits"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Limits {
                output: OutputFormat::Table
            }
        ));
    }
}
