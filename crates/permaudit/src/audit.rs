//! The audit engine.
//!
//! Repositories are discovered through one paginated stream. Each discovered
//! repository gets its own collaborator stream, run concurrently under a
//! semaphore. Results are folded into an [`Aggregator`] as tasks finish, and
//! the tables are finalized only when discovery reached its last page and
//! every repository task succeeded.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::aggregate::{Aggregator, AuditTables};
use crate::error::{AuditError, Result, missing_scopes};
use crate::graphql::GraphQlClient;
use crate::pagination::{PageAnomaly, Paginator};
use crate::permission::{Affiliation, AnomalyCounts, NormalizedEdge, merge_duplicates, normalize};
use crate::progress::{AuditProgress, ProgressCallback, emit};
use crate::queries::{
    CollaboratorAffiliation, CollaboratorsQuery, OrgAccess, OrgAccessQuery, OrgRepositoriesQuery,
    Organization, Repository, ViewerInfo, ViewerQuery,
};

/// Default number of repositories audited in parallel.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// What to audit and how.
#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub org: String,
    pub include_archived: bool,
    /// Repositories whose collaborators are fetched in parallel.
    pub concurrency: usize,
    /// Run the extra outside-collaborator pass per repository.
    pub detect_outside: bool,
}

impl AuditOptions {
    pub fn new(org: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            include_archived: false,
            concurrency: DEFAULT_CONCURRENCY,
            detect_outside: true,
        }
    }

    #[must_use]
    pub fn with_include_archived(mut self, include: bool) -> Self {
        self.include_archived = include;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_outside_detection(mut self, detect: bool) -> Self {
        self.detect_outside = detect;
        self
    }
}

/// Shared cancellation switch.
///
/// Once set, no new page request is issued; requests already in flight are
/// allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters describing one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    /// GraphQL requests sent, retries included.
    pub queries: u64,
    pub pages: u64,
    pub repositories_discovered: usize,
    pub repositories_processed: usize,
    /// Filtered, malformed or unreadable repositories.
    pub repositories_skipped: usize,
    pub repositories_with_collaborators: usize,
    pub repositories_without_collaborators: usize,
    pub permission_pairs: usize,
    pub rate_limit_waits: u64,
    pub elapsed_ms: u64,
}

impl AuditStats {
    /// Share of discovered repositories whose collaborators were read.
    pub fn completeness_percent(&self) -> f64 {
        if self.repositories_discovered == 0 {
            return 100.0;
        }
        let readable =
            self.repositories_with_collaborators + self.repositories_without_collaborators;
        readable as f64 / self.repositories_discovered as f64 * 100.0
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Everything a successful run produces.
#[derive(Debug, Clone)]
pub struct AuditReport {
    pub organization: Organization,
    pub tables: AuditTables,
    pub stats: AuditStats,
    pub anomalies: AnomalyCounts,
    /// Human-readable anomaly details.
    pub warnings: Vec<String>,
}

/// Result of the credential and organization checks.
#[derive(Debug, Clone)]
pub struct PreflightReport {
    pub viewer: ViewerInfo,
    pub organization: OrgAccess,
    /// Required scopes the credential does not report.
    pub missing_scopes: Vec<String>,
}

/// Verify the credential and that the organization is visible.
pub async fn preflight(
    client: &GraphQlClient,
    org: &str,
    on_progress: Option<&ProgressCallback>,
) -> Result<PreflightReport> {
    let viewer = ViewerQuery.fetch(client, on_progress).await?;
    tracing::info!(login = %viewer.login, "Authenticated");
    emit(
        on_progress,
        AuditProgress::Authenticated {
            login: viewer.login.clone(),
            remaining: viewer.rate_limit.as_ref().map(|r| r.remaining),
            limit: viewer.rate_limit.as_ref().map(|r| r.limit),
        },
    );

    let missing = missing_scopes(client.granted_scopes().as_deref());
    if !missing.is_empty() {
        tracing::warn!(missing = %missing.join(", "), "Credential lacks recommended scopes");
    }

    let access = OrgAccessQuery::new(org).fetch(client, on_progress).await?;
    if !access.viewer_is_a_member {
        tracing::warn!(org, "Not a member of the organization; results may be incomplete");
    }
    emit(
        on_progress,
        AuditProgress::OrganizationAccess {
            org: access.login.clone(),
            is_member: access.viewer_is_a_member,
            can_administer: access.viewer_can_administer,
        },
    );

    Ok(PreflightReport {
        viewer,
        organization: access,
        missing_scopes: missing,
    })
}

/// Collaborators of one repository, ready to ingest.
#[derive(Debug)]
struct RepositoryOutcome {
    repository: Repository,
    edges: Vec<NormalizedEdge>,
    pages: u64,
    anomalies: AnomalyCounts,
    details: Vec<String>,
    inaccessible: bool,
}

impl RepositoryOutcome {
    /// Count a page anomaly from one of the collaborator passes.
    ///
    /// An unreadable outside pass leaves the outside flags incomplete; the
    /// repository itself is only inaccessible when the full pass fails.
    fn note_anomaly(&mut self, anomaly: PageAnomaly, affiliation: CollaboratorAffiliation) {
        let name = &self.repository.name_with_owner;
        match (anomaly, affiliation) {
            (PageAnomaly::Malformed(detail), _) => {
                self.anomalies.malformed_records += 1;
                tracing::warn!(repo = %name, detail = %detail, "Skipped malformed collaborator");
                self.details.push(detail);
            }
            (PageAnomaly::Inaccessible(detail), CollaboratorAffiliation::All) => {
                self.anomalies.inaccessible_repositories += 1;
                self.inaccessible = true;
                tracing::warn!(repo = %name, detail = %detail, "Collaborators not readable");
                self.details.push(detail);
            }
            (PageAnomaly::Inaccessible(detail), CollaboratorAffiliation::Outside) => {
                self.anomalies.incomplete_collaborator_lists += 1;
                tracing::warn!(repo = %name, detail = %detail, "Outside collaborators not readable");
                self.details.push(format!("{detail} (outside collaborators unknown)"));
            }
        }
    }
}

/// Mutable state of one run, owned by the coordinating task.
struct RunState {
    aggregator: Aggregator,
    stats: AuditStats,
    anomalies: AnomalyCounts,
    warnings: Vec<String>,
    repository_ids: Vec<String>,
    failure: Option<AuditError>,
    done: usize,
}

impl RunState {
    fn fail(&mut self, err: AuditError, cancel: &CancelFlag) {
        cancel.cancel();
        // The first failure wins; later ones are usually its echo.
        if self.failure.is_none() {
            tracing::error!(error = %err, "Audit aborted");
            self.failure = Some(err);
        }
    }

    fn note_anomalies(
        &mut self,
        repo: &str,
        anomalies: Vec<PageAnomaly>,
        on_progress: Option<&ProgressCallback>,
    ) {
        for anomaly in anomalies {
            let detail = match anomaly {
                PageAnomaly::Malformed(detail) => {
                    self.anomalies.malformed_records += 1;
                    detail
                }
                PageAnomaly::Inaccessible(detail) => {
                    self.anomalies.inaccessible_repositories += 1;
                    detail
                }
            };
            tracing::warn!(repo, detail = %detail, "Data anomaly");
            emit(
                on_progress,
                AuditProgress::Anomaly {
                    repo: repo.to_string(),
                    detail: detail.clone(),
                },
            );
            self.warnings.push(detail);
        }
    }

    fn absorb(
        &mut self,
        joined: std::result::Result<Result<RepositoryOutcome>, JoinError>,
        cancel: &CancelFlag,
        on_progress: Option<&ProgressCallback>,
    ) {
        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => return self.fail(err, cancel),
            Err(err) => return self.fail(AuditError::api(format!("repository task failed: {err}")), cancel),
        };

        let name = outcome.repository.name_with_owner.clone();
        let collaborators = outcome.edges.len();

        self.stats.pages += outcome.pages;
        self.stats.repositories_processed += 1;
        if outcome.inaccessible {
            self.stats.repositories_skipped += 1;
        } else if collaborators == 0 {
            self.stats.repositories_without_collaborators += 1;
        } else {
            self.stats.repositories_with_collaborators += 1;
        }

        self.anomalies.absorb(&outcome.anomalies);
        for detail in outcome.details {
            emit(
                on_progress,
                AuditProgress::Anomaly {
                    repo: name.clone(),
                    detail: detail.clone(),
                },
            );
            self.warnings.push(detail);
        }

        self.aggregator.ingest(&outcome.repository, outcome.edges);
        self.done += 1;

        emit(
            on_progress,
            AuditProgress::RepoAudited {
                repo: name,
                collaborators,
                done: self.done,
                known: self.repository_ids.len(),
            },
        );
    }
}

/// Audit every repository of an organization.
///
/// Terminal errors abort the run: the cancel flag is raised, in-flight
/// repository tasks are drained, and the error is returned without tables.
pub async fn run_audit(
    client: &GraphQlClient,
    options: &AuditOptions,
    cancel: &CancelFlag,
    on_progress: Option<Arc<ProgressCallback>>,
) -> Result<AuditReport> {
    let started = Instant::now();
    let queries_before = client.query_count();
    let waits_before = client.governor().wait_count();
    let progress = on_progress.as_deref();

    let concurrency = options.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut join_set: JoinSet<Result<RepositoryOutcome>> = JoinSet::new();

    let mut run = RunState {
        aggregator: Aggregator::new(),
        stats: AuditStats::default(),
        anomalies: AnomalyCounts::default(),
        warnings: Vec::new(),
        repository_ids: Vec::new(),
        failure: None,
        done: 0,
    };

    tracing::info!(
        org = %options.org,
        include_archived = options.include_archived,
        concurrency,
        "Starting audit"
    );
    emit(
        progress,
        AuditProgress::FetchingRepos {
            org: options.org.clone(),
            include_archived: options.include_archived,
        },
    );

    let mut repositories = Paginator::new(
        client,
        OrgRepositoriesQuery::new(&options.org, options.include_archived),
    )
    .with_progress(progress);

    loop {
        if cancel.is_cancelled() {
            if run.failure.is_none() {
                run.failure = Some(AuditError::Cancelled);
            }
            break;
        }

        let page = match repositories.next_page().await {
            Ok(Some(page)) => page,
            Ok(None) => break,
            Err(err) => {
                run.fail(err, cancel);
                break;
            }
        };

        run.stats.pages += 1;
        run.stats.repositories_skipped += page.filtered + page.anomalies.len();
        run.note_anomalies(&options.org, page.anomalies, progress);

        for repository in page.items {
            run.repository_ids.push(repository.id.clone());
            join_set.spawn(audit_repository(
                client.clone(),
                repository,
                options.detect_outside,
                cancel.clone(),
                Arc::clone(&semaphore),
                on_progress.clone(),
            ));
        }

        emit(
            progress,
            AuditProgress::FetchedRepoPage {
                page: page.number,
                count: page.records,
                total_so_far: run.repository_ids.len(),
                total_count: page.total_count,
            },
        );

        while let Some(joined) = join_set.try_join_next() {
            run.absorb(joined, cancel, progress);
        }
        if run.failure.is_some() {
            break;
        }
    }

    run.stats.repositories_discovered = run.repository_ids.len();
    if run.failure.is_none() {
        tracing::info!(
            repositories = run.repository_ids.len(),
            skipped = run.stats.repositories_skipped,
            "Repository discovery complete"
        );
        emit(
            progress,
            AuditProgress::ReposDiscovered {
                total: run.repository_ids.len(),
                skipped: run.stats.repositories_skipped,
            },
        );
    } else {
        emit(
            progress,
            AuditProgress::Cancelling {
                in_flight: join_set.len(),
            },
        );
    }

    while let Some(joined) = join_set.join_next().await {
        run.absorb(joined, cancel, progress);
    }

    if let Some(err) = run.failure {
        return Err(err);
    }
    if cancel.is_cancelled() {
        return Err(AuditError::Cancelled);
    }
    let Some(complete) = repositories.completion() else {
        return Err(AuditError::api("repository traversal did not complete"));
    };

    let tables = run.aggregator.finalize(complete);

    let mut stats = run.stats;
    stats.queries = client.query_count().saturating_sub(queries_before);
    stats.rate_limit_waits = client.governor().wait_count().saturating_sub(waits_before);
    stats.permission_pairs = tables.user_permissions.len();
    stats.elapsed_ms = started.elapsed().as_millis() as u64;

    tracing::info!(
        repositories = tables.repository_summary.len(),
        users = tables.user_summary.len(),
        pairs = tables.user_permissions.len(),
        anomalies = run.anomalies.total(),
        "Audit complete"
    );
    emit(
        progress,
        AuditProgress::Finalized {
            permission_rows: tables.user_permissions.len(),
            users: tables.user_summary.len(),
            repositories: tables.repository_summary.len(),
        },
    );

    Ok(AuditReport {
        organization: Organization {
            login: options.org.clone(),
            repository_ids: run.repository_ids,
        },
        tables,
        stats,
        anomalies: run.anomalies,
        warnings: run.warnings,
    })
}

/// Fetch, normalize and merge the collaborators of one repository.
async fn audit_repository(
    client: GraphQlClient,
    repository: Repository,
    detect_outside: bool,
    cancel: CancelFlag,
    semaphore: Arc<Semaphore>,
    on_progress: Option<Arc<ProgressCallback>>,
) -> Result<RepositoryOutcome> {
    let _permit = semaphore
        .acquire()
        .await
        .map_err(|_| AuditError::api("semaphore closed"))?;
    let progress = on_progress.as_deref();
    let name = repository.name_with_owner.clone();

    let mut outcome = RepositoryOutcome {
        repository: repository.clone(),
        edges: Vec::new(),
        pages: 0,
        anomalies: AnomalyCounts::default(),
        details: Vec::new(),
        inaccessible: false,
    };

    let mut outside: HashSet<String> = HashSet::new();
    if detect_outside {
        let mut pages = Paginator::new(
            &client,
            CollaboratorsQuery::new(repository.clone(), CollaboratorAffiliation::Outside),
        )
        .with_progress(progress);
        loop {
            if cancel.is_cancelled() {
                return Err(AuditError::Cancelled);
            }
            let Some(page) = pages.next_page().await? else {
                break;
            };
            outcome.pages += 1;
            for anomaly in page.anomalies {
                outcome.note_anomaly(anomaly, CollaboratorAffiliation::Outside);
            }
            outside.extend(page.items.into_iter().map(|edge| edge.user_login));
        }
    }

    let mut pages = Paginator::new(
        &client,
        CollaboratorsQuery::new(repository, CollaboratorAffiliation::All),
    )
    .with_progress(progress);

    let mut raw = Vec::new();
    let mut records = 0usize;
    let mut total_count = None;
    loop {
        if cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }
        let Some(page) = pages.next_page().await? else {
            break;
        };

        outcome.pages += 1;
        records += page.records;
        total_count = page.total_count.or(total_count);
        emit(
            progress,
            AuditProgress::FetchedCollaboratorPage {
                repo: name.clone(),
                page: page.number,
                count: page.records,
            },
        );

        for anomaly in page.anomalies {
            outcome.note_anomaly(anomaly, CollaboratorAffiliation::All);
        }
        raw.extend(page.items);
    }

    if let Some(total) = total_count
        && records < total
    {
        outcome.anomalies.incomplete_collaborator_lists += 1;
        let detail = format!("{name}: received {records} of {total} collaborators");
        tracing::warn!(repo = %name, received = records, total, "Collaborator list incomplete");
        outcome.details.push(detail);
    }

    let normalized: Vec<NormalizedEdge> = raw
        .iter()
        .map(|edge| {
            let mut normalized = normalize(edge);
            if outside.contains(&normalized.user_login) {
                normalized.affiliation = Affiliation::Outside;
            }
            normalized
        })
        .collect();

    let unrecognized = normalized.iter().filter(|e| e.anomalous).count();
    if unrecognized > 0 {
        outcome.anomalies.unrecognized_permissions += unrecognized;
        outcome.details.push(format!(
            "{name}: {unrecognized} unrecognized permission value(s) recorded as none"
        ));
    }

    outcome.edges = merge_duplicates(normalized);
    tracing::debug!(
        repo = %name,
        collaborators = outcome.edges.len(),
        pages = outcome.pages,
        "Repository audited"
    );
    Ok(outcome)
}
