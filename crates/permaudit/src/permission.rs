//! Permission normalization.
//!
//! Raw GitHub permission values are mapped onto one ordered scale through an
//! explicit match table. Values outside the table map to [`Permission::None`]
//! and are flagged as anomalies instead of failing the run.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Permission value as delivered by the service.
///
/// GraphQL sends `ADMIN`, `MAINTAIN`, `WRITE`, `TRIAGE`, `READ`; the REST
/// spellings `push` and `pull` are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum RawPermission {
    #[serde(rename = "ADMIN", alias = "admin")]
    Admin,
    #[serde(rename = "MAINTAIN", alias = "maintain")]
    Maintain,
    #[serde(rename = "WRITE", alias = "write")]
    Write,
    #[serde(rename = "PUSH", alias = "push")]
    Push,
    #[serde(rename = "TRIAGE", alias = "triage")]
    Triage,
    #[serde(rename = "READ", alias = "read")]
    Read,
    #[serde(rename = "PULL", alias = "pull")]
    Pull,
    #[serde(other)]
    Unrecognized,
}

impl RawPermission {
    /// Map onto the canonical scale.
    pub const fn canonical(self) -> Permission {
        match self {
            RawPermission::Admin => Permission::Admin,
            RawPermission::Maintain => Permission::Maintain,
            RawPermission::Write | RawPermission::Push => Permission::Write,
            RawPermission::Triage => Permission::Triage,
            RawPermission::Read | RawPermission::Pull => Permission::Read,
            RawPermission::Unrecognized => Permission::None,
        }
    }

    pub const fn is_recognized(self) -> bool {
        !matches!(self, RawPermission::Unrecognized)
    }
}

/// Canonical permission scale, ordered from least to most access.
///
/// `Triage` is GitHub's triage role (issue and pull request management
/// without write access).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    None,
    Read,
    Triage,
    Write,
    Maintain,
    Admin,
}

impl Permission {
    /// All levels, lowest first.
    pub const ALL: [Permission; 6] = [
        Permission::None,
        Permission::Read,
        Permission::Triage,
        Permission::Write,
        Permission::Maintain,
        Permission::Admin,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Permission::None => "none",
            Permission::Read => "read",
            Permission::Triage => "triage",
            Permission::Write => "write",
            Permission::Maintain => "maintain",
            Permission::Admin => "admin",
        }
    }

    /// Position on the scale, usable as an array index.
    pub const fn rank(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a user came to have access to a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Affiliation {
    /// Granted on the repository itself.
    Direct,
    /// Inherited through organization base permissions or a team.
    Organization,
    /// Not a member of the organization.
    Outside,
}

impl Affiliation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Affiliation::Direct => "direct",
            Affiliation::Organization => "organization",
            Affiliation::Outside => "outside",
        }
    }

    const fn precedence(self) -> u8 {
        match self {
            Affiliation::Organization => 0,
            Affiliation::Direct => 1,
            Affiliation::Outside => 2,
        }
    }

    /// Combine two observations of the same user on one repository.
    ///
    /// Outside wins (it is a property of the user), then direct.
    pub fn merge(self, other: Affiliation) -> Affiliation {
        if other.precedence() > self.precedence() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (repository, user, permission, affiliation) observation from a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEdge {
    pub repository_id: String,
    pub user_login: String,
    pub user_id: Option<String>,
    pub permission: RawPermission,
    pub affiliation: Affiliation,
}

/// A [`RawEdge`] mapped onto the canonical scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEdge {
    pub repository_id: String,
    pub user_login: String,
    pub user_id: Option<String>,
    pub permission: Permission,
    pub affiliation: Affiliation,
    /// The raw permission was not recognized.
    pub anomalous: bool,
}

/// Map a raw edge onto the canonical scale.
pub fn normalize(edge: &RawEdge) -> NormalizedEdge {
    let anomalous = !edge.permission.is_recognized();
    if anomalous {
        tracing::warn!(
            repository = %edge.repository_id,
            user = %edge.user_login,
            "Unrecognized permission value, recording as none"
        );
    }

    NormalizedEdge {
        repository_id: edge.repository_id.clone(),
        user_login: edge.user_login.clone(),
        user_id: edge.user_id.clone(),
        permission: edge.permission.canonical(),
        affiliation: edge.affiliation,
        anomalous,
    }
}

/// Collapse edges of one repository so each user appears once.
///
/// The highest permission survives; affiliations merge via
/// [`Affiliation::merge`]. Users keep their first-seen position.
pub fn merge_duplicates(edges: Vec<NormalizedEdge>) -> Vec<NormalizedEdge> {
    let mut merged: Vec<NormalizedEdge> = Vec::with_capacity(edges.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(edges.len());

    for edge in edges {
        match index.get(&edge.user_login) {
            Some(&i) => {
                let existing = &mut merged[i];
                if edge.permission > existing.permission {
                    existing.permission = edge.permission;
                    existing.anomalous = edge.anomalous;
                }
                existing.affiliation = existing.affiliation.merge(edge.affiliation);
                if existing.user_id.is_none() {
                    existing.user_id = edge.user_id;
                }
            }
            None => {
                index.insert(edge.user_login.clone(), merged.len());
                merged.push(edge);
            }
        }
    }

    merged
}

/// Records that were normalized to a fallback or skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnomalyCounts {
    /// Permission values outside the known table.
    pub unrecognized_permissions: usize,
    /// Null nodes or nodes missing required fields.
    pub malformed_records: usize,
    /// Repositories whose collaborators could not be read.
    pub inaccessible_repositories: usize,
    /// Collaborator streams that returned fewer entries than advertised.
    pub incomplete_collaborator_lists: usize,
}

impl AnomalyCounts {
    pub fn total(&self) -> usize {
        self.unrecognized_permissions
            + self.malformed_records
            + self.inaccessible_repositories
            + self.incomplete_collaborator_lists
    }

    pub fn absorb(&mut self, other: &AnomalyCounts) {
        self.unrecognized_permissions += other.unrecognized_permissions;
        self.malformed_records += other.malformed_records;
        self.inaccessible_repositories += other.inaccessible_repositories;
        self.incomplete_collaborator_lists += other.incomplete_collaborator_lists;
    }
}
