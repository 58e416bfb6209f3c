use permaudit::AuditProgress;

/// Logging reporter using tracing for structured output.
pub struct LoggingReporter;

impl LoggingReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, event: AuditProgress) {
        match event {
            AuditProgress::Authenticated {
                login,
                remaining,
                limit,
            } => {
                tracing::info!(login = %login, remaining = ?remaining, limit = ?limit, "Authenticated");
            }

            AuditProgress::OrganizationAccess {
                org,
                is_member,
                can_administer,
            } => {
                tracing::info!(org = %org, is_member, can_administer, "Organization visible");
            }

            AuditProgress::FetchingRepos {
                org,
                include_archived,
            } => {
                tracing::info!(org = %org, include_archived, "Fetching repositories");
            }

            AuditProgress::FetchedRepoPage {
                page,
                count,
                total_so_far,
                total_count,
            } => {
                tracing::debug!(page, count, total_so_far, total_count = ?total_count, "Fetched repository page");
            }

            AuditProgress::ReposDiscovered { total, skipped } => {
                tracing::info!(total, skipped, "Repository discovery complete");
            }

            AuditProgress::FetchedCollaboratorPage { repo, page, count } => {
                tracing::debug!(repo = %repo, page, count, "Fetched collaborator page");
            }

            AuditProgress::RepoAudited {
                repo,
                collaborators,
                done,
                known,
            } => {
                tracing::info!(repo = %repo, collaborators, done, known, "Repository audited");
            }

            AuditProgress::RetryBackoff {
                scope,
                retry_after_ms,
                attempt,
                error,
            } => {
                tracing::warn!(
                    scope = %scope,
                    retry_after_ms,
                    attempt,
                    error = %error,
                    "Request failed, backing off"
                );
            }

            AuditProgress::Anomaly { repo, detail } => {
                tracing::warn!(repo = %repo, detail = %detail, "Data anomaly");
            }

            AuditProgress::Cancelling { in_flight } => {
                tracing::warn!(in_flight, "Cancelling, draining in-flight repositories");
            }

            AuditProgress::Finalized {
                permission_rows,
                users,
                repositories,
            } => {
                tracing::info!(permission_rows, users, repositories, "Tables finalized");
            }

            _ => {}
        }
    }
}

impl Default for LoggingReporter {
    fn default() -> Self {
        Self::new()
    }
}
