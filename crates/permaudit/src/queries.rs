//! GraphQL documents and their response shapes.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{AuditError, Result};
use crate::graphql::{GraphQlClient, GraphQlResponse};
use crate::pagination::{PageAnomaly, PageContent, PagedQuery};
use crate::permission::{Affiliation, RawEdge, RawPermission};
use crate::progress::ProgressCallback;
use crate::rate_limit::RateLimitSnapshot;

/// Connection page size (GitHub's maximum).
pub const PAGE_SIZE: u32 = 100;

const ORG_REPOSITORIES: &str = r#"
query OrgRepositories($org: String!, $first: Int!, $after: String, $isArchived: Boolean) {
  organization(login: $org) {
    repositories(first: $first, after: $after, isArchived: $isArchived, orderBy: {field: NAME, direction: ASC}) {
      totalCount
      pageInfo { hasNextPage endCursor }
      nodes { id name nameWithOwner isArchived isPrivate visibility isFork isDisabled owner { login } }
    }
  }
}"#;

const COLLABORATORS: &str = r#"
query Collaborators($owner: String!, $name: String!, $first: Int!, $after: String, $affiliation: CollaboratorAffiliation) {
  repository(owner: $owner, name: $name) {
    collaborators(first: $first, after: $after, affiliation: $affiliation) {
      totalCount
      pageInfo { hasNextPage endCursor }
      edges {
        permission
        permissionSources { permission source { __typename } }
        node { id login }
      }
    }
  }
}"#;

const VIEWER: &str = r#"
query Viewer {
  viewer { login }
  rateLimit { limit remaining used resetAt cost }
}"#;

const ORG_ACCESS: &str = r#"
query OrgAccess($org: String!) {
  organization(login: $org) { login name viewerIsAMember viewerCanAdminister }
}"#;

const RATE_LIMIT_STATUS: &str = r#"
query RateLimitStatus {
  rateLimit { limit remaining used resetAt cost nodeCount }
}"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

// ---------- Repositories ----------

/// Repository visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Visibility {
    Public,
    Private,
    Internal,
    #[serde(other)]
    Unknown,
}

impl Visibility {
    pub const fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
            Visibility::Internal => "internal",
            Visibility::Unknown => "unknown",
        }
    }
}

/// A repository discovered in the organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// GraphQL node id.
    pub id: String,
    pub name: String,
    pub name_with_owner: String,
    pub owner: String,
    pub is_archived: bool,
    pub is_private: bool,
    pub visibility: Visibility,
    pub is_fork: bool,
    pub is_disabled: bool,
}

/// An organization and the repositories found in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organization {
    pub login: String,
    pub repository_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OrgRepositoriesData {
    organization: Option<OrgRepositoriesOrg>,
}

#[derive(Debug, Deserialize)]
struct OrgRepositoriesOrg {
    repositories: RepositoryConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryConnection {
    total_count: Option<usize>,
    page_info: PageInfo,
    #[serde(default)]
    nodes: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryNode {
    id: Option<String>,
    name: Option<String>,
    name_with_owner: Option<String>,
    #[serde(default)]
    is_archived: Option<bool>,
    #[serde(default)]
    is_private: Option<bool>,
    #[serde(default)]
    visibility: Option<Visibility>,
    #[serde(default)]
    is_fork: Option<bool>,
    #[serde(default)]
    is_disabled: Option<bool>,
    #[serde(default)]
    owner: Option<Login>,
}

#[derive(Debug, Deserialize)]
struct Login {
    login: String,
}

impl RepositoryNode {
    fn into_repository(self, org: &str) -> Option<Repository> {
        let id = self.id?;
        let name = self.name?;
        let name_with_owner = self
            .name_with_owner
            .unwrap_or_else(|| format!("{org}/{name}"));
        let is_private = self.is_private.unwrap_or_default();
        let visibility = self.visibility.unwrap_or(if is_private {
            Visibility::Private
        } else {
            Visibility::Public
        });

        Some(Repository {
            id,
            name,
            name_with_owner,
            owner: self.owner.map_or_else(|| org.to_string(), |o| o.login),
            is_archived: self.is_archived.unwrap_or_default(),
            is_private,
            visibility,
            is_fork: self.is_fork.unwrap_or_default(),
            is_disabled: self.is_disabled.unwrap_or_default(),
        })
    }
}

/// Repositories of one organization, optionally excluding archived ones.
#[derive(Debug, Clone)]
pub struct OrgRepositoriesQuery {
    pub org: String,
    pub include_archived: bool,
    pub page_size: u32,
}

impl OrgRepositoriesQuery {
    pub fn new(org: impl Into<String>, include_archived: bool) -> Self {
        Self {
            org: org.into(),
            include_archived,
            page_size: PAGE_SIZE,
        }
    }
}

impl PagedQuery for OrgRepositoriesQuery {
    type Item = Repository;

    fn document(&self) -> &'static str {
        ORG_REPOSITORIES
    }

    fn variables(&self, after: Option<&str>) -> Value {
        // null lists everything; false excludes archived repositories.
        let is_archived = if self.include_archived {
            Value::Null
        } else {
            Value::Bool(false)
        };
        json!({
            "org": self.org,
            "first": self.page_size,
            "after": after,
            "isArchived": is_archived,
        })
    }

    fn scope(&self, page: u32) -> String {
        format!("repositories({}) page {}", self.org, page)
    }

    fn extract(&self, response: GraphQlResponse) -> Result<PageContent<Repository>> {
        let data: OrgRepositoriesData = if response.data.is_null() {
            OrgRepositoriesData { organization: None }
        } else {
            response.decode()?
        };

        let Some(org) = data.organization else {
            if let Some(err) = response.error_of_type("FORBIDDEN") {
                return Err(AuditError::auth(err.message.clone()));
            }
            return Err(AuditError::OrgNotFound(self.org.clone()));
        };

        let conn = org.repositories;
        let nodes = conn.nodes.unwrap_or_default();
        let mut content = PageContent {
            records: nodes.len(),
            total_count: conn.total_count,
            has_next_page: conn.page_info.has_next_page,
            end_cursor: conn.page_info.end_cursor,
            ..PageContent::empty()
        };

        for node in nodes {
            let repository = decode_record::<RepositoryNode>(node).and_then(|n| {
                n.into_repository(&self.org)
                    .ok_or_else(|| "repository node missing id or name".to_string())
            });
            match repository {
                Ok(repo) if repo.is_archived && !self.include_archived => content.filtered += 1,
                Ok(repo) => content.items.push(repo),
                Err(detail) => content.anomalies.push(PageAnomaly::Malformed(format!(
                    "{}: {detail}",
                    self.org
                ))),
            }
        }

        Ok(content)
    }
}

// ---------- Collaborators ----------

/// Affiliation filter of the collaborators connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CollaboratorAffiliation {
    All,
    Outside,
}

#[derive(Debug, Deserialize)]
struct CollaboratorsData {
    repository: Option<CollaboratorsRepository>,
}

#[derive(Debug, Deserialize)]
struct CollaboratorsRepository {
    collaborators: Option<CollaboratorConnection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollaboratorConnection {
    total_count: Option<usize>,
    page_info: PageInfo,
    #[serde(default)]
    edges: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollaboratorEdge {
    #[serde(default)]
    permission: Option<RawPermission>,
    #[serde(default)]
    permission_sources: Option<Vec<PermissionSource>>,
    #[serde(default)]
    node: Option<UserNode>,
}

#[derive(Debug, Deserialize)]
struct PermissionSource {
    #[serde(default)]
    permission: Option<RawPermission>,
    #[serde(default)]
    source: Option<SourceRef>,
}

#[derive(Debug, Deserialize)]
struct SourceRef {
    #[serde(rename = "__typename")]
    typename: String,
}

#[derive(Debug, Deserialize)]
struct UserNode {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    login: Option<String>,
}

/// Decode one connection element on its own, so a bad record costs only itself.
fn decode_record<T: DeserializeOwned>(value: Value) -> std::result::Result<T, String> {
    if value.is_null() {
        return Err("null record".to_string());
    }
    serde_json::from_value(value).map_err(|e| format!("unreadable record: {e}"))
}

fn source_affiliation(source: Option<&SourceRef>) -> Affiliation {
    match source.map(|s| s.typename.as_str()) {
        Some("Organization" | "Team") => Affiliation::Organization,
        _ => Affiliation::Direct,
    }
}

/// Expand one collaborator edge into raw edges, one per permission source.
///
/// Returns `None` when the edge has no usable user.
fn expand_edge(repository_id: &str, edge: CollaboratorEdge) -> Option<Vec<RawEdge>> {
    let node = edge.node?;
    let login = node.login.filter(|l| !l.is_empty())?;
    let effective = edge.permission.unwrap_or(RawPermission::Unrecognized);

    let make = |permission: RawPermission, affiliation: Affiliation| RawEdge {
        repository_id: repository_id.to_string(),
        user_login: login.clone(),
        user_id: node.id.clone(),
        permission,
        affiliation,
    };

    let sources = edge.permission_sources.unwrap_or_default();
    if sources.is_empty() {
        return Some(vec![make(effective, Affiliation::Direct)]);
    }

    let mut edges: Vec<RawEdge> = sources
        .iter()
        .map(|src| {
            make(
                src.permission.unwrap_or(effective),
                source_affiliation(src.source.as_ref()),
            )
        })
        .collect();

    let strongest_source = edges.iter().map(|e| e.permission.canonical()).max();
    if strongest_source.is_some_and(|max| effective.canonical() > max) {
        edges.push(make(effective, Affiliation::Direct));
    }

    Some(edges)
}

/// Collaborators of one repository.
#[derive(Debug, Clone)]
pub struct CollaboratorsQuery {
    pub repository: Repository,
    pub affiliation: CollaboratorAffiliation,
    pub page_size: u32,
}

impl CollaboratorsQuery {
    pub fn new(repository: Repository, affiliation: CollaboratorAffiliation) -> Self {
        Self {
            repository,
            affiliation,
            page_size: PAGE_SIZE,
        }
    }
}

impl PagedQuery for CollaboratorsQuery {
    type Item = RawEdge;

    fn document(&self) -> &'static str {
        COLLABORATORS
    }

    fn variables(&self, after: Option<&str>) -> Value {
        json!({
            "owner": self.repository.owner,
            "name": self.repository.name,
            "first": self.page_size,
            "after": after,
            "affiliation": self.affiliation,
        })
    }

    fn scope(&self, page: u32) -> String {
        let kind = match self.affiliation {
            CollaboratorAffiliation::All => "collaborators",
            CollaboratorAffiliation::Outside => "outside-collaborators",
        };
        format!("{kind}({}) page {page}", self.repository.name_with_owner)
    }

    fn extract(&self, response: GraphQlResponse) -> Result<PageContent<RawEdge>> {
        let decoded: std::result::Result<CollaboratorsData, String> = if response.data.is_null() {
            Ok(CollaboratorsData { repository: None })
        } else {
            serde_json::from_value(response.data.clone()).map_err(|e| e.to_string())
        };

        // An unreadable envelope ends this repository's stream, not the run.
        let conn = match decoded {
            Ok(data) => data.repository.and_then(|r| r.collaborators).ok_or_else(|| {
                if response.errors.is_empty() {
                    "collaborators not returned".to_string()
                } else {
                    response.error_summary()
                }
            }),
            Err(err) => Err(format!("unreadable collaborators page: {err}")),
        };
        let conn = match conn {
            Ok(conn) => conn,
            Err(reason) => {
                let mut content = PageContent::empty();
                content.anomalies.push(PageAnomaly::Inaccessible(format!(
                    "{}: {reason}",
                    self.repository.name_with_owner
                )));
                return Ok(content);
            }
        };

        let edges = conn.edges.unwrap_or_default();
        let mut content = PageContent {
            records: edges.len(),
            total_count: conn.total_count,
            has_next_page: conn.page_info.has_next_page,
            end_cursor: conn.page_info.end_cursor,
            ..PageContent::empty()
        };

        for edge in edges {
            let expanded = decode_record::<CollaboratorEdge>(edge).and_then(|e| {
                expand_edge(&self.repository.id, e)
                    .ok_or_else(|| "collaborator without login".to_string())
            });
            match expanded {
                Ok(edges) => content.items.extend(edges),
                Err(detail) => content.anomalies.push(PageAnomaly::Malformed(format!(
                    "{}: {detail}",
                    self.repository.name_with_owner
                ))),
            }
        }

        Ok(content)
    }
}

// ---------- One-shot queries ----------

/// The `rateLimit` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    #[serde(default)]
    pub used: Option<u64>,
    pub reset_at: DateTime<Utc>,
    #[serde(default)]
    pub cost: Option<u64>,
    #[serde(default)]
    pub node_count: Option<u64>,
}

impl RateLimitInfo {
    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            limit: Some(self.limit),
            remaining: self.remaining,
            used: self.used,
            reset_at: self.reset_at,
        }
    }
}

/// The authenticated user and current quota.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerInfo {
    pub login: String,
    #[serde(skip)]
    pub rate_limit: Option<RateLimitInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewerData {
    viewer: Option<ViewerInfo>,
    rate_limit: Option<RateLimitInfo>,
}

/// Resolve the credential's user.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewerQuery;

impl ViewerQuery {
    pub async fn fetch(
        self,
        client: &GraphQlClient,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<ViewerInfo> {
        let response = client.execute(VIEWER, json!({}), "viewer", on_progress).await?;
        let data: ViewerData = response.decode()?;

        let mut viewer = data
            .viewer
            .ok_or_else(|| AuditError::auth("credential does not resolve to a user"))?;
        if let Some(ref limits) = data.rate_limit {
            client.governor().observe(&limits.snapshot());
        }
        viewer.rate_limit = data.rate_limit;
        Ok(viewer)
    }
}

/// The credential's relationship to an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgAccess {
    pub login: String,
    pub name: Option<String>,
    pub viewer_is_a_member: bool,
    pub viewer_can_administer: bool,
}

#[derive(Debug, Deserialize)]
struct OrgAccessData {
    organization: Option<OrgAccess>,
}

/// Check that an organization exists and is visible.
#[derive(Debug, Clone)]
pub struct OrgAccessQuery {
    pub org: String,
}

impl OrgAccessQuery {
    pub fn new(org: impl Into<String>) -> Self {
        Self { org: org.into() }
    }

    pub async fn fetch(
        &self,
        client: &GraphQlClient,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<OrgAccess> {
        let scope = format!("organization({})", self.org);
        let response = client
            .execute(ORG_ACCESS, json!({ "org": self.org }), &scope, on_progress)
            .await?;

        let data: OrgAccessData = if response.data.is_null() {
            OrgAccessData { organization: None }
        } else {
            response.decode()?
        };

        match data.organization {
            Some(access) => Ok(access),
            None => match response.error_of_type("FORBIDDEN") {
                Some(err) => Err(AuditError::auth(err.message.clone())),
                None => Err(AuditError::OrgNotFound(self.org.clone())),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitData {
    rate_limit: Option<RateLimitInfo>,
}

/// Current GraphQL quota.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitStatusQuery;

impl RateLimitStatusQuery {
    pub async fn fetch(
        self,
        client: &GraphQlClient,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<RateLimitInfo> {
        let response = client
            .execute(RATE_LIMIT_STATUS, json!({}), "rateLimit", on_progress)
            .await?;
        let data: RateLimitData = response.decode()?;
        let info = data
            .rate_limit
            .ok_or_else(|| AuditError::decode("rateLimit missing from response"))?;
        client.governor().observe(&info.snapshot());
        Ok(info)
    }
}
