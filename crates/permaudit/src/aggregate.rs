//! Folding normalized edges into the three report tables.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::pagination::TraversalComplete;
use crate::permission::{Affiliation, NormalizedEdge, Permission};
use crate::queries::Repository;

/// One (user, repository) permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserPermissionRow {
    pub user: String,
    pub repository: String,
    pub permission: Permission,
    pub affiliation: Affiliation,
}

/// Per-user totals across the organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummaryRow {
    pub user: String,
    pub total_repositories: usize,
    pub admin: usize,
    pub maintain: usize,
    pub write: usize,
    pub triage: usize,
    pub read: usize,
    pub none: usize,
    pub is_outside_collaborator_any: bool,
    pub private_repositories: usize,
    pub public_repositories: usize,
    pub archived_repositories: usize,
    pub fork_repositories: usize,
    pub original_repositories: usize,
    pub disabled_repositories: usize,
}

/// Per-repository totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositorySummaryRow {
    pub repository: String,
    pub archived: bool,
    pub visibility: &'static str,
    pub fork: bool,
    pub disabled: bool,
    pub collaborators: usize,
    pub admin: usize,
    pub maintain: usize,
    pub write: usize,
    pub triage: usize,
    pub read: usize,
    pub none: usize,
}

/// The three finalized views of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditTables {
    pub user_permissions: Vec<UserPermissionRow>,
    pub user_summary: Vec<UserSummaryRow>,
    pub repository_summary: Vec<RepositorySummaryRow>,
}

#[derive(Debug, Clone, Copy)]
struct Grant {
    permission: Permission,
    affiliation: Affiliation,
}

#[derive(Debug)]
struct RepositoryEntry {
    repository: Repository,
    collaborators: HashMap<String, Grant>,
}

#[derive(Debug, Default)]
struct UserTally {
    levels: [usize; 6],
    total: usize,
    outside: bool,
    private: usize,
    public: usize,
    archived: usize,
    forks: usize,
    originals: usize,
    disabled: usize,
}

/// Accumulates the (repository, user) matrix for one run.
///
/// Holds exactly one grant per pair: repeated observations merge by maximum
/// permission, so ingestion order does not affect the result.
#[derive(Debug, Default)]
pub struct Aggregator {
    repositories: BTreeMap<String, RepositoryEntry>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one repository's collaborators into the matrix.
    ///
    /// A repository with no edges is still recorded so it gets a summary row.
    pub fn ingest(&mut self, repository: &Repository, edges: Vec<NormalizedEdge>) {
        let entry = self
            .repositories
            .entry(repository.id.clone())
            .or_insert_with(|| RepositoryEntry {
                repository: repository.clone(),
                collaborators: HashMap::new(),
            });

        for edge in edges {
            let incoming = Grant {
                permission: edge.permission,
                affiliation: edge.affiliation,
            };
            entry
                .collaborators
                .entry(edge.user_login)
                .and_modify(|grant| {
                    grant.permission = grant.permission.max(incoming.permission);
                    grant.affiliation = grant.affiliation.merge(incoming.affiliation);
                })
                .or_insert(incoming);
        }
    }

    /// Repositories ingested so far.
    pub fn repository_count(&self) -> usize {
        self.repositories.len()
    }

    /// Distinct (repository, user) pairs so far.
    pub fn pair_count(&self) -> usize {
        self.repositories
            .values()
            .map(|entry| entry.collaborators.len())
            .sum()
    }

    /// Build the tables. Only possible once traversal finished.
    pub fn finalize(self, _complete: TraversalComplete) -> AuditTables {
        let mut user_permissions = Vec::with_capacity(self.pair_count());
        let mut users: HashMap<String, UserTally> = HashMap::new();
        let mut repository_summary = Vec::with_capacity(self.repositories.len());

        for entry in self.repositories.into_values() {
            let repo = &entry.repository;
            let mut levels = [0usize; 6];

            for (login, grant) in &entry.collaborators {
                levels[grant.permission.rank()] += 1;

                let tally = users.entry(login.clone()).or_default();
                tally.levels[grant.permission.rank()] += 1;
                tally.total += 1;
                tally.outside |= grant.affiliation == Affiliation::Outside;
                if repo.is_private {
                    tally.private += 1;
                } else {
                    tally.public += 1;
                }
                if repo.is_archived {
                    tally.archived += 1;
                }
                if repo.is_fork {
                    tally.forks += 1;
                } else {
                    tally.originals += 1;
                }
                if repo.is_disabled {
                    tally.disabled += 1;
                }

                user_permissions.push(UserPermissionRow {
                    user: login.clone(),
                    repository: repo.name.clone(),
                    permission: grant.permission,
                    affiliation: grant.affiliation,
                });
            }

            repository_summary.push(RepositorySummaryRow {
                repository: repo.name.clone(),
                archived: repo.is_archived,
                visibility: repo.visibility.as_str(),
                fork: repo.is_fork,
                disabled: repo.is_disabled,
                collaborators: entry.collaborators.len(),
                admin: levels[Permission::Admin.rank()],
                maintain: levels[Permission::Maintain.rank()],
                write: levels[Permission::Write.rank()],
                triage: levels[Permission::Triage.rank()],
                read: levels[Permission::Read.rank()],
                none: levels[Permission::None.rank()],
            });
        }

        let mut user_summary: Vec<UserSummaryRow> = users
            .into_iter()
            .map(|(user, t)| UserSummaryRow {
                user,
                total_repositories: t.total,
                admin: t.levels[Permission::Admin.rank()],
                maintain: t.levels[Permission::Maintain.rank()],
                write: t.levels[Permission::Write.rank()],
                triage: t.levels[Permission::Triage.rank()],
                read: t.levels[Permission::Read.rank()],
                none: t.levels[Permission::None.rank()],
                is_outside_collaborator_any: t.outside,
                private_repositories: t.private,
                public_repositories: t.public,
                archived_repositories: t.archived,
                fork_repositories: t.forks,
                original_repositories: t.originals,
                disabled_repositories: t.disabled,
            })
            .collect();

        user_permissions.sort_by(|a, b| {
            (a.user.to_lowercase(), &a.user, a.repository.to_lowercase(), &a.repository).cmp(&(
                b.user.to_lowercase(),
                &b.user,
                b.repository.to_lowercase(),
                &b.repository,
            ))
        });
        user_summary.sort_by(|a, b| {
            (Reverse(a.total_repositories), a.user.to_lowercase(), &a.user).cmp(&(
                Reverse(b.total_repositories),
                b.user.to_lowercase(),
                &b.user,
            ))
        });
        repository_summary.sort_by(|a, b| {
            (Reverse(a.collaborators), a.repository.to_lowercase(), &a.repository).cmp(&(
                Reverse(b.collaborators),
                b.repository.to_lowercase(),
                &b.repository,
            ))
        });

        AuditTables {
            user_permissions,
            user_summary,
            repository_summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{RawEdge, RawPermission, merge_duplicates, normalize};
    use crate::queries::Visibility;

    fn repo(id: &str, name: &str) -> Repository {
        Repository {
            id: id.to_string(),
            name: name.to_string(),
            name_with_owner: format!("acme/{name}"),
            owner: "acme".to_string(),
            is_archived: false,
            is_private: true,
            visibility: Visibility::Private,
            is_fork: false,
            is_disabled: false,
        }
    }

    fn edges(repo: &Repository, raw: &[(&str, RawPermission, Affiliation)]) -> Vec<NormalizedEdge> {
        let normalized = raw
            .iter()
            .map(|(user, permission, affiliation)| {
                normalize(&RawEdge {
                    repository_id: repo.id.clone(),
                    user_login: user.to_string(),
                    user_id: None,
                    permission: *permission,
                    affiliation: *affiliation,
                })
            })
            .collect();
        merge_duplicates(normalized)
    }

    fn acme() -> Vec<(Repository, Vec<NormalizedEdge>)> {
        let r1 = repo("R_1", "R1");
        let r2 = repo("R_2", "R2");
        let e1 = edges(
            &r1,
            &[
                ("U1", RawPermission::Write, Affiliation::Direct),
                ("U2", RawPermission::Read, Affiliation::Organization),
            ],
        );
        let e2 = edges(
            &r2,
            &[
                ("U1", RawPermission::Admin, Affiliation::Direct),
                ("U1", RawPermission::Read, Affiliation::Organization),
            ],
        );
        vec![(r1, e1), (r2, e2)]
    }

    fn aggregate(data: &[(Repository, Vec<NormalizedEdge>)]) -> AuditTables {
        let mut agg = Aggregator::new();
        for (repo, edges) in data {
            agg.ingest(repo, edges.clone());
        }
        agg.finalize(TraversalComplete::new())
    }

    #[test]
    fn acme_scenario() {
        let tables = aggregate(&acme());

        assert_eq!(tables.user_permissions.len(), 3);
        let r2_u1 = tables
            .user_permissions
            .iter()
            .find(|r| r.user == "U1" && r.repository == "R2")
            .unwrap();
        assert_eq!(r2_u1.permission, Permission::Admin);
        assert_eq!(r2_u1.affiliation, Affiliation::Direct);

        let u1 = &tables.user_summary[0];
        assert_eq!(u1.user, "U1");
        assert_eq!(u1.total_repositories, 2);
        assert_eq!(u1.admin, 1);
        assert_eq!(u1.write, 1);
        assert_eq!(u1.read, 0);

        let u2 = &tables.user_summary[1];
        assert_eq!(u2.user, "U2");
        assert_eq!(u2.total_repositories, 1);
        assert_eq!(u2.read, 1);

        assert_eq!(tables.repository_summary[0].repository, "R1");
        assert_eq!(tables.repository_summary[0].collaborators, 2);
        assert_eq!(tables.repository_summary[1].repository, "R2");
        assert_eq!(tables.repository_summary[1].collaborators, 1);
    }

    #[test]
    fn aggregation_is_idempotent_and_order_independent() {
        let data = acme();
        let first = serde_json::to_string(&aggregate(&data)).unwrap();
        let second = serde_json::to_string(&aggregate(&data)).unwrap();
        assert_eq!(first, second);

        let mut reversed = data.clone();
        reversed.reverse();
        for (_, edges) in &mut reversed {
            edges.reverse();
        }
        assert_eq!(first, serde_json::to_string(&aggregate(&reversed)).unwrap());
    }

    #[test]
    fn zero_collaborator_repository_has_one_zero_row() {
        let empty = repo("R_9", "empty");
        let tables = aggregate(&[(empty, Vec::new())]);

        assert!(tables.user_permissions.is_empty());
        assert!(tables.user_summary.is_empty());
        assert_eq!(tables.repository_summary.len(), 1);
        let row = &tables.repository_summary[0];
        assert_eq!(row.repository, "empty");
        assert_eq!(row.collaborators, 0);
        assert_eq!(
            row.admin + row.maintain + row.write + row.triage + row.read + row.none,
            0
        );
    }

    #[test]
    fn repeated_ingest_keeps_one_grant_per_pair() {
        let r1 = repo("R_1", "R1");
        let mut agg = Aggregator::new();
        agg.ingest(&r1, edges(&r1, &[("U1", RawPermission::Read, Affiliation::Direct)]));
        agg.ingest(&r1, edges(&r1, &[("U1", RawPermission::Maintain, Affiliation::Organization)]));
        assert_eq!(agg.repository_count(), 1);
        assert_eq!(agg.pair_count(), 1);

        let tables = agg.finalize(TraversalComplete::new());
        assert_eq!(tables.user_permissions.len(), 1);
        assert_eq!(tables.user_permissions[0].permission, Permission::Maintain);
        assert_eq!(tables.user_permissions[0].affiliation, Affiliation::Direct);
    }

    #[test]
    fn outside_only_user_is_flagged() {
        let r1 = repo("R_1", "R1");
        let tables = aggregate(&[(
            r1.clone(),
            edges(
                &r1,
                &[
                    ("guest", RawPermission::Read, Affiliation::Outside),
                    ("member", RawPermission::Write, Affiliation::Direct),
                ],
            ),
        )]);

        let guest = tables
            .user_summary
            .iter()
            .find(|r| r.user == "guest")
            .unwrap();
        assert!(guest.is_outside_collaborator_any);
        let member = tables
            .user_summary
            .iter()
            .find(|r| r.user == "member")
            .unwrap();
        assert!(!member.is_outside_collaborator_any);
    }

    #[test]
    fn user_summary_counts_repository_characteristics() {
        let original = repo("R_1", "api");
        let mut fork = repo("R_2", "api-fork");
        fork.is_fork = true;
        fork.is_private = false;
        let mut frozen = repo("R_3", "legacy");
        frozen.is_disabled = true;
        frozen.is_archived = true;

        let data: Vec<(Repository, Vec<NormalizedEdge>)> = [original, fork, frozen]
            .into_iter()
            .map(|r| {
                let e = edges(&r, &[("dev", RawPermission::Write, Affiliation::Direct)]);
                (r, e)
            })
            .collect();
        let tables = aggregate(&data);

        let dev = &tables.user_summary[0];
        assert_eq!(dev.total_repositories, 3);
        assert_eq!(dev.fork_repositories, 1);
        assert_eq!(dev.original_repositories, 2);
        assert_eq!(dev.disabled_repositories, 1);
        assert_eq!(dev.archived_repositories, 1);
        assert_eq!(dev.public_repositories, 1);
        assert_eq!(dev.private_repositories, 2);
    }

    #[test]
    fn unrecognized_permission_is_counted_as_none() {
        let r1 = repo("R_1", "R1");
        let tables = aggregate(&[(
            r1.clone(),
            edges(&r1, &[("u", RawPermission::Unrecognized, Affiliation::Direct)]),
        )]);
        assert_eq!(tables.repository_summary[0].none, 1);
        assert_eq!(tables.user_summary[0].none, 1);
        assert_eq!(tables.user_permissions[0].permission, Permission::None);
    }

    #[test]
    fn rows_are_sorted_case_insensitively() {
        let a = repo("R_a", "alpha");
        let b = repo("R_b", "Beta");
        let tables = aggregate(&[
            (
                b.clone(),
                edges(
                    &b,
                    &[
                        ("zed", RawPermission::Read, Affiliation::Direct),
                        ("Amy", RawPermission::Read, Affiliation::Direct),
                    ],
                ),
            ),
            (a.clone(), edges(&a, &[("bob", RawPermission::Read, Affiliation::Direct)])),
        ]);

        let order: Vec<(&str, &str)> = tables
            .user_permissions
            .iter()
            .map(|r| (r.user.as_str(), r.repository.as_str()))
            .collect();
        assert_eq!(order, vec![("Amy", "Beta"), ("bob", "alpha"), ("zed", "Beta")]);

        assert_eq!(tables.repository_summary[0].repository, "Beta");
        assert_eq!(tables.repository_summary[1].repository, "alpha");
    }
}
