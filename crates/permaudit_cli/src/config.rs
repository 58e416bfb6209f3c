//! Configuration file support for permaudit.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (prefixed with `PERMAUDIT_`, sections separated by
//!    a double underscore, e.g. `PERMAUDIT_AUDIT__CONCURRENCY`)
//! 3. Config file (./permaudit.toml, then ~/.config/permaudit/config.toml)
//! 4. Built-in defaults
//!
//! The credential is resolved separately: `GITHUB_PAT` wins over
//! `GITHUB_TOKEN`, which wins over `[github] token`.
//!
//! Example config file:
//! ```toml
//! [github]
//! token = "ghp_..."  # prefer GITHUB_PAT in the environment
//! endpoint = "https://api.github.com/graphql"
//!
//! [audit]
//! concurrency = 4
//! include_archived = false
//! detect_outside = true
//! output_dir = "reports"
//! format = "csv"
//!
//! [rate_limit]
//! requests_per_second = 10  # 0 disables proactive pacing
//! max_reset_wait_secs = 3600
//! ```

use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use permaudit::{DEFAULT_CONCURRENCY, GovernorConfig};
use serde::Deserialize;

use crate::commands::report::ReportFormat;

/// Personal token, preferred when present.
const PERSONAL_TOKEN_VAR: &str = "GITHUB_PAT";
/// Default token, e.g. the one a CI runner injects.
const DEFAULT_TOKEN_VAR: &str = "GITHUB_TOKEN";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GitHub configuration.
    pub github: GitHubConfig,
    /// Default audit options.
    pub audit: AuditConfig,
    /// Rate governor tuning.
    pub rate_limit: RateLimitConfig,
}

/// GitHub configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// GitHub API token, used when neither GITHUB_PAT nor GITHUB_TOKEN is set.
    pub token: Option<String>,
    /// GraphQL endpoint, for GitHub Enterprise Server.
    pub endpoint: Option<String>,
}

/// Default audit options.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Maximum repositories audited at once.
    pub concurrency: usize,
    pub include_archived: bool,
    /// Run the outside-collaborator pass for each repository.
    pub detect_outside: bool,
    /// Directory report files are written to (defaults to the working directory).
    pub output_dir: Option<PathBuf>,
    pub format: ReportFormat,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            include_archived: false,
            detect_outside: true,
            output_dir: None,
            format: ReportFormat::default(),
        }
    }
}

/// Rate governor tuning.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Proactive request pacing; 0 disables it.
    pub requests_per_second: u32,
    /// Longest wait for a quota reset before the run gives up.
    pub max_reset_wait_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: permaudit::rate_limit::defaults::REQUESTS_PER_SECOND,
            max_reset_wait_secs: permaudit::rate_limit::defaults::MAX_RESET_WAIT.as_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn governor_config(&self) -> GovernorConfig {
        GovernorConfig {
            requests_per_second: NonZeroU32::new(self.requests_per_second),
            max_reset_wait: Duration::from_secs(self.max_reset_wait_secs),
            ..GovernorConfig::default()
        }
    }
}

/// Where the credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    PersonalToken,
    DefaultToken,
    ConfigFile,
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::PersonalToken => write!(f, "{PERSONAL_TOKEN_VAR}"),
            TokenSource::DefaultToken => write!(f, "{DEFAULT_TOKEN_VAR}"),
            TokenSource::ConfigFile => f.write_str("config file"),
        }
    }
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    ///
    /// Sources are loaded in order (later sources override earlier):
    /// 1. Built-in defaults
    /// 2. XDG config file (~/.config/permaudit/config.toml)
    /// 3. Local config file (./permaudit.toml)
    /// 4. Environment variables with PERMAUDIT_ prefix
    pub fn load() -> Self {
        let mut builder = ConfigBuilder::builder();

        if let Some(xdg_config) = Self::default_config_path()
            && xdg_config.exists()
        {
            tracing::debug!("Loading config from {:?}", xdg_config);
            builder = builder.add_source(
                File::from(xdg_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        let local_config = PathBuf::from("permaudit.toml");
        if local_config.exists() {
            tracing::debug!("Loading config from ./permaudit.toml");
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        // e.g., PERMAUDIT_AUDIT__INCLUDE_ARCHIVED -> audit.include_archived
        builder = builder.add_source(
            Environment::with_prefix("PERMAUDIT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        match builder.build() {
            Ok(settings) => match settings.try_deserialize::<Config>() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to deserialize config: {}", e);
                    Config::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to build config: {}", e);
                Config::default()
            }
        }
    }

    /// Resolve the credential from the process environment and this config.
    pub fn github_token(&self) -> Option<(String, TokenSource)> {
        self.github_token_with(|name| std::env::var(name).ok())
    }

    fn github_token_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Option<(String, TokenSource)> {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        non_empty(lookup(PERSONAL_TOKEN_VAR))
            .map(|t| (t, TokenSource::PersonalToken))
            .or_else(|| non_empty(lookup(DEFAULT_TOKEN_VAR)).map(|t| (t, TokenSource::DefaultToken)))
            .or_else(|| non_empty(self.github.token.clone()).map(|t| (t, TokenSource::ConfigFile)))
    }

    /// Get the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "permaudit").map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
