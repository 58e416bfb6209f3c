//! Permaudit - GitHub organization permission auditing.
//!
//! This library walks every repository of an organization through the GitHub
//! GraphQL API, collects each repository's collaborators with their
//! permission level, and folds the result into three tables: per-user
//! permissions, a per-user summary and a per-repository summary.
//!
//! All requests share one [`RateGovernor`], so concurrent repository streams
//! never outrun the remote quota. Transient failures are retried with
//! backoff; terminal failures abort the run without producing tables.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use permaudit::{AuditOptions, CancelFlag, GraphQlClient, RateGovernor, run_audit};
//! use permaudit::http::reqwest_transport::ReqwestTransport;
//!
//! let transport = Arc::new(ReqwestTransport::new(reqwest::Client::new()));
//! let client = GraphQlClient::new(transport, token, RateGovernor::default());
//! let report = run_audit(&client, &AuditOptions::new("acme"), &CancelFlag::new(), None).await?;
//! println!("{} users", report.tables.user_summary.len());
//! ```

pub mod aggregate;
pub mod audit;
pub mod error;
pub mod graphql;
pub mod http;
pub mod pagination;
pub mod permission;
pub mod progress;
pub mod queries;
pub mod rate_limit;
pub mod retry;

pub use aggregate::{
    Aggregator, AuditTables, RepositorySummaryRow, UserPermissionRow, UserSummaryRow,
};
pub use audit::{
    AuditOptions, AuditReport, AuditStats, CancelFlag, DEFAULT_CONCURRENCY, PreflightReport,
    preflight, run_audit,
};
pub use error::{AuditError, FailureKind, Result, short_error_message};
pub use graphql::{GITHUB_GRAPHQL_URL, GraphQlClient};
pub use pagination::{Page, PagedQuery, Paginator, TraversalComplete};
pub use permission::{Affiliation, AnomalyCounts, Permission};
pub use progress::{AuditProgress, ProgressCallback};
pub use queries::{RateLimitInfo, RateLimitStatusQuery, Repository, Visibility};
pub use rate_limit::{GovernorConfig, RateGovernor, RateLimitSnapshot};
pub use retry::RetryConfig;
