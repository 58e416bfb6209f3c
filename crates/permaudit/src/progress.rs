//! Progress reporting types for audit runs.
//!
//! The engine never prints. It emits [`AuditProgress`] events through an
//! optional callback and lets the caller decide how to render them.

/// Progress events emitted during an audit run.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AuditProgress {
    /// Preflight resolved the authenticated user.
    Authenticated {
        login: String,
        remaining: Option<u64>,
        limit: Option<u64>,
    },

    /// Preflight resolved organization access.
    OrganizationAccess {
        org: String,
        is_member: bool,
        can_administer: bool,
    },

    /// Starting repository discovery.
    FetchingRepos {
        org: String,
        include_archived: bool,
    },

    /// Fetched a page of organization repositories.
    FetchedRepoPage {
        page: u32,
        count: usize,
        total_so_far: usize,
        /// Total repositories reported by the service.
        total_count: Option<usize>,
    },

    /// Repository discovery finished.
    ReposDiscovered {
        /// Repositories kept for auditing.
        total: usize,
        /// Repositories dropped by the archived filter or skipped as malformed.
        skipped: usize,
    },

    /// Fetched a page of collaborators for one repository.
    FetchedCollaboratorPage {
        repo: String,
        page: u32,
        count: usize,
    },

    /// One repository's collaborators were folded into the tables.
    RepoAudited {
        repo: String,
        collaborators: usize,
        done: usize,
        /// Repositories known so far (grows while discovery is running).
        known: usize,
    },

    /// Waiting before retrying a request.
    RetryBackoff {
        scope: String,
        retry_after_ms: u64,
        attempt: u32,
        error: String,
    },

    /// A record could not be interpreted and was normalized or skipped.
    Anomaly {
        repo: String,
        detail: String,
    },

    /// Cancellation observed; waiting for in-flight requests.
    Cancelling { in_flight: usize },

    /// Tables finalized.
    Finalized {
        permission_rows: usize,
        users: usize,
        repositories: usize,
    },
}

/// Callback type for progress reporting.
pub type ProgressCallback = Box<dyn Fn(AuditProgress) + Send + Sync>;

/// Helper to emit progress events.
#[inline]
pub fn emit(callback: Option<&ProgressCallback>, event: AuditProgress) {
    if let Some(cb) = callback {
        cb(event);
    }
}
