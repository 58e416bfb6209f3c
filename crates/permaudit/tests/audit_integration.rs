//! End-to-end audit runs against a scripted GitHub.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;

use permaudit::http::{HttpError, HttpRequest, HttpResponse, HttpTransport};
use permaudit::{
    Affiliation, AuditError, AuditOptions, AuditProgress, CancelFlag, FailureKind, GovernorConfig,
    GraphQlClient, Permission, ProgressCallback, RateGovernor, RetryConfig, run_audit,
};

/// Outcome forced onto the next request instead of a normal answer.
enum Fault {
    Transport,
    Status(u16),
}

#[derive(Default)]
struct Script {
    faults: VecDeque<Fault>,
    /// Answer number (1-based) that reports an exhausted quota.
    exhaust_quota_on: Option<usize>,
}

/// A fake GraphQL endpoint answering by query name and variables.
#[derive(Default)]
struct FakeGitHub {
    org: String,
    repo_pages: Vec<Vec<Value>>,
    collaborator_pages: HashMap<String, Vec<Vec<Value>>>,
    outside: HashMap<String, Vec<String>>,
    script: Mutex<Script>,
    answered: AtomicUsize,
    sent_at: Mutex<Vec<(Instant, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeGitHub {
    fn new(org: &str) -> Self {
        Self {
            org: org.to_string(),
            ..Self::default()
        }
    }

    fn repos(mut self, pages: Vec<Vec<Value>>) -> Self {
        self.repo_pages = pages;
        self
    }

    fn collaborators(mut self, repo: &str, pages: Vec<Vec<Value>>) -> Self {
        self.collaborator_pages.insert(repo.to_string(), pages);
        self
    }

    fn outside(mut self, repo: &str, logins: &[&str]) -> Self {
        self.outside
            .insert(repo.to_string(), logins.iter().map(|s| s.to_string()).collect());
        self
    }

    fn fault(self, fault: Fault) -> Self {
        self.script.lock().unwrap().faults.push_back(fault);
        self
    }

    fn exhaust_quota_on(self, answer: usize) -> Self {
        self.script.lock().unwrap().exhaust_quota_on = Some(answer);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn requests(&self) -> Vec<(Instant, String)> {
        self.sent_at.lock().unwrap().clone()
    }

    fn page_index(cursor: &Value, prefix: char) -> usize {
        cursor
            .as_str()
            .and_then(|c| c.strip_prefix(prefix))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    fn answer(&self, query: &str, vars: &Value) -> Value {
        if query.contains("OrgRepositories") {
            if vars["org"] != json!(self.org) {
                return json!({
                    "data": {"organization": null},
                    "errors": [{"type": "NOT_FOUND", "message": "Could not resolve to an Organization"}]
                });
            }
            let index = Self::page_index(&vars["after"], 'r');
            let total: usize = self.repo_pages.iter().map(Vec::len).sum();
            let nodes = self.repo_pages.get(index).cloned().unwrap_or_default();
            return json!({"data": {"organization": {"repositories": {
                "totalCount": total,
                "pageInfo": {
                    "hasNextPage": index + 1 < self.repo_pages.len(),
                    "endCursor": format!("r{}", index + 1)
                },
                "nodes": nodes
            }}}});
        }

        if query.contains("Collaborators") {
            let name = vars["name"].as_str().unwrap_or_default();
            if vars["affiliation"] == json!("OUTSIDE") {
                let edges: Vec<Value> = self
                    .outside
                    .get(name)
                    .map(|logins| {
                        logins
                            .iter()
                            .map(|l| json!({"permission": "READ", "node": {"id": format!("U_{l}"), "login": l}}))
                            .collect()
                    })
                    .unwrap_or_default();
                return json!({"data": {"repository": {"collaborators": {
                    "totalCount": edges.len(),
                    "pageInfo": {"hasNextPage": false, "endCursor": null},
                    "edges": edges
                }}}});
            }

            let pages = self.collaborator_pages.get(name).cloned().unwrap_or_default();
            let index = Self::page_index(&vars["after"], 'c');
            let total: usize = pages.iter().map(Vec::len).sum();
            let edges = pages.get(index).cloned().unwrap_or_default();
            return json!({"data": {"repository": {"collaborators": {
                "totalCount": total,
                "pageInfo": {
                    "hasNextPage": index + 1 < pages.len(),
                    "endCursor": format!("c{}", index + 1)
                },
                "edges": edges
            }}}});
        }

        json!({"errors": [{"message": format!("unexpected query: {query}")}]})
    }
}

#[async_trait]
impl HttpTransport for FakeGitHub {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let body: Value = serde_json::from_slice(&request.body)
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        let query = body["query"].as_str().unwrap_or_default().to_string();
        let vars = body["variables"].clone();

        let label = format!(
            "{} {} {}",
            query.split_whitespace().nth(1).unwrap_or(""),
            vars["name"].as_str().or(vars["org"].as_str()).unwrap_or(""),
            vars["after"].as_str().unwrap_or("-"),
        );
        self.sent_at.lock().unwrap().push((Instant::now(), label));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fault = self.script.lock().unwrap().faults.pop_front();
        match fault {
            Some(Fault::Transport) => return Err(HttpError::Transport("connection reset".into())),
            Some(Fault::Status(status)) => {
                return Ok(HttpResponse {
                    status,
                    headers: vec![("X-OAuth-Scopes".into(), "repo, read:org, read:user".into())],
                    body: br#"{"message":"Bad credentials"}"#.to_vec(),
                });
            }
            None => {}
        }

        let answer_no = self.answered.fetch_add(1, Ordering::SeqCst) + 1;
        let exhausted = self.script.lock().unwrap().exhaust_quota_on == Some(answer_no);
        let (remaining, reset) = if exhausted {
            (0, chrono::Utc::now() + chrono::Duration::seconds(30))
        } else {
            (4999, chrono::Utc::now() + chrono::Duration::seconds(3600))
        };

        Ok(HttpResponse {
            status: 200,
            headers: vec![
                ("X-RateLimit-Limit".into(), "5000".into()),
                ("X-RateLimit-Remaining".into(), remaining.to_string()),
                ("X-RateLimit-Reset".into(), reset.timestamp().to_string()),
            ],
            body: serde_json::to_vec(&self.answer(&query, &vars)).unwrap(),
        })
    }
}

fn repo(id: &str, name: &str) -> Value {
    json!({
        "id": id, "name": name, "nameWithOwner": format!("acme/{name}"),
        "isArchived": false, "isPrivate": true, "visibility": "PRIVATE",
        "isFork": false, "isDisabled": false, "owner": {"login": "acme"}
    })
}

fn edge(login: &str, permission: &str) -> Value {
    json!({"permission": permission, "node": {"id": format!("U_{login}"), "login": login}})
}

fn sourced_edge(login: &str, permission: &str, sources: &[(&str, &str)]) -> Value {
    let sources: Vec<Value> = sources
        .iter()
        .map(|(perm, kind)| json!({"permission": perm, "source": {"__typename": kind}}))
        .collect();
    json!({
        "permission": permission,
        "permissionSources": sources,
        "node": {"id": format!("U_{login}"), "login": login}
    })
}

fn client(fake: Arc<FakeGitHub>) -> GraphQlClient {
    GraphQlClient::new(
        fake,
        "test-token",
        RateGovernor::new(GovernorConfig::default().without_pacing()),
    )
    .with_endpoint("https://fake.test/graphql")
    .with_retry_config(
        RetryConfig::new(Duration::from_millis(5), Duration::from_millis(20), 5).with_jitter(false),
    )
}

fn acme() -> FakeGitHub {
    FakeGitHub::new("acme")
        .repos(vec![vec![repo("R_1", "R1"), repo("R_2", "R2")]])
        .collaborators("R1", vec![vec![edge("U1", "WRITE"), edge("U2", "READ")]])
        .collaborators(
            "R2",
            vec![vec![sourced_edge(
                "U1",
                "ADMIN",
                &[("ADMIN", "Repository"), ("READ", "Team")],
            )]],
        )
}

#[tokio::test]
async fn acme_end_to_end() {
    let fake = Arc::new(acme());
    let report = run_audit(
        &client(Arc::clone(&fake)),
        &AuditOptions::new("acme"),
        &CancelFlag::new(),
        None,
    )
    .await
    .expect("audit should succeed");

    let tables = &report.tables;
    assert_eq!(tables.user_permissions.len(), 3);

    let u1 = &tables.user_summary[0];
    assert_eq!(u1.user, "U1");
    assert_eq!(u1.total_repositories, 2);
    assert_eq!(u1.admin, 1);
    assert_eq!(u1.write, 1);

    let u2 = &tables.user_summary[1];
    assert_eq!(u2.user, "U2");
    assert_eq!(u2.total_repositories, 1);
    assert_eq!(u2.read, 1);

    let r1 = tables
        .repository_summary
        .iter()
        .find(|r| r.repository == "R1")
        .unwrap();
    let r2 = tables
        .repository_summary
        .iter()
        .find(|r| r.repository == "R2")
        .unwrap();
    assert_eq!(r1.collaborators, 2);
    assert_eq!(r2.collaborators, 1);
    assert_eq!(r2.admin, 1);

    let r2_u1 = tables
        .user_permissions
        .iter()
        .find(|r| r.user == "U1" && r.repository == "R2")
        .unwrap();
    assert_eq!(r2_u1.permission, Permission::Admin);
    assert_eq!(r2_u1.affiliation, Affiliation::Direct);

    assert_eq!(report.anomalies.total(), 0);
    assert_eq!(report.stats.repositories_discovered, 2);
    assert_eq!(report.stats.completeness_percent(), 100.0);
}

#[tokio::test]
async fn repeated_runs_serialize_identically() {
    let first = run_audit(
        &client(Arc::new(acme())),
        &AuditOptions::new("acme").with_concurrency(4),
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();
    let second = run_audit(
        &client(Arc::new(acme())),
        &AuditOptions::new("acme").with_concurrency(1),
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(
        serde_json::to_string(&first.tables).unwrap(),
        serde_json::to_string(&second.tables).unwrap()
    );
}

#[tokio::test]
async fn zero_collaborator_repository_is_reported() {
    let fake = FakeGitHub::new("acme")
        .repos(vec![vec![repo("R_1", "busy"), repo("R_2", "quiet")]])
        .collaborators("busy", vec![vec![edge("alice", "MAINTAIN")]]);

    let report = run_audit(
        &client(Arc::new(fake)),
        &AuditOptions::new("acme"),
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    let quiet: Vec<_> = report
        .tables
        .repository_summary
        .iter()
        .filter(|r| r.repository == "quiet")
        .collect();
    assert_eq!(quiet.len(), 1);
    assert_eq!(quiet[0].collaborators, 0);
    assert_eq!(report.stats.repositories_without_collaborators, 1);
    assert_eq!(report.stats.repositories_with_collaborators, 1);
}

#[tokio::test]
async fn mistyped_records_are_counted_and_the_run_completes() {
    let mut loose = repo("R_1", "a");
    loose["isArchived"] = Value::Null;
    let fake = FakeGitHub::new("acme")
        .repos(vec![vec![loose, json!({"id": 5, "name": "broken"}), repo("R_2", "b")]])
        .collaborators(
            "a",
            vec![vec![
                edge("alice", "WRITE"),
                json!({"permission": "READ", "node": {"id": "U_x", "login": 42}}),
            ]],
        )
        .collaborators("b", vec![vec![edge("bob", "ADMIN")]]);

    let report = run_audit(
        &client(Arc::new(fake)),
        &AuditOptions::new("acme"),
        &CancelFlag::new(),
        None,
    )
    .await
    .expect("malformed records must not abort the run");

    assert_eq!(report.anomalies.malformed_records, 2);
    assert_eq!(report.anomalies.inaccessible_repositories, 0);
    assert_eq!(report.warnings.len(), 2);

    let pairs: Vec<(&str, &str, Permission)> = report
        .tables
        .user_permissions
        .iter()
        .map(|r| (r.user.as_str(), r.repository.as_str(), r.permission))
        .collect();
    assert_eq!(
        pairs,
        vec![("alice", "a", Permission::Write), ("bob", "b", Permission::Admin)]
    );

    let a = report
        .tables
        .repository_summary
        .iter()
        .find(|r| r.repository == "a")
        .unwrap();
    assert!(!a.archived);
    assert_eq!(report.tables.repository_summary.len(), 2);
}

#[tokio::test]
async fn multi_page_streams_are_followed_to_the_end() {
    let repo_pages: Vec<Vec<Value>> = (0..3)
        .map(|p| {
            (0..2)
                .map(|i| {
                    let n = p * 2 + i;
                    repo(&format!("R_{n}"), &format!("repo-{n}"))
                })
                .collect()
        })
        .collect();
    let mut fake = FakeGitHub::new("acme").repos(repo_pages);
    for n in 0..6 {
        fake = fake.collaborators(
            &format!("repo-{n}"),
            vec![
                vec![edge("alice", "READ"), edge("bob", "WRITE")],
                vec![edge("carol", "TRIAGE")],
            ],
        );
    }

    let report = run_audit(
        &client(Arc::new(fake)),
        &AuditOptions::new("acme").with_outside_detection(false),
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.tables.repository_summary.len(), 6);
    assert_eq!(report.tables.user_permissions.len(), 18);
    assert!(report.tables.user_summary.iter().all(|u| u.total_repositories == 6));
    // 3 repository pages plus 2 collaborator pages for each of 6 repositories.
    assert_eq!(report.stats.pages, 15);
    assert_eq!(report.stats.queries, 15);
}

#[tokio::test]
async fn concurrency_is_bounded() {
    let repos: Vec<Value> = (0..12)
        .map(|n| repo(&format!("R_{n}"), &format!("repo-{n}")))
        .collect();
    let mut fake = FakeGitHub::new("acme")
        .repos(vec![repos])
        .with_delay(Duration::from_millis(5));
    for n in 0..12 {
        fake = fake.collaborators(&format!("repo-{n}"), vec![vec![edge("alice", "READ")]]);
    }
    let fake = Arc::new(fake);

    let report = run_audit(
        &client(Arc::clone(&fake)),
        &AuditOptions::new("acme")
            .with_concurrency(3)
            .with_outside_detection(false),
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.tables.repository_summary.len(), 12);
    assert!(fake.max_in_flight.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn outside_collaborators_are_flagged() {
    let fake = FakeGitHub::new("acme")
        .repos(vec![vec![repo("R_1", "R1")]])
        .collaborators("R1", vec![vec![edge("guest", "READ"), edge("member", "WRITE")]])
        .outside("R1", &["guest"]);

    let report = run_audit(
        &client(Arc::new(fake)),
        &AuditOptions::new("acme"),
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    let guest = report
        .tables
        .user_summary
        .iter()
        .find(|u| u.user == "guest")
        .unwrap();
    assert!(guest.is_outside_collaborator_any);
    let row = report
        .tables
        .user_permissions
        .iter()
        .find(|r| r.user == "guest")
        .unwrap();
    assert_eq!(row.affiliation, Affiliation::Outside);
}

#[tokio::test(start_paused = true)]
async fn exhausted_quota_pauses_until_reset_without_losing_records() {
    // The second answer (first collaborator page) reports remaining = 0.
    let fake = Arc::new(
        FakeGitHub::new("acme")
            .repos(vec![vec![repo("R_1", "R1"), repo("R_2", "R2")]])
            .collaborators("R1", vec![vec![edge("U1", "WRITE")], vec![edge("U2", "READ")]])
            .collaborators("R2", vec![vec![edge("U1", "ADMIN")]])
            .exhaust_quota_on(2),
    );

    let report = run_audit(
        &client(Arc::clone(&fake)),
        &AuditOptions::new("acme")
            .with_concurrency(1)
            .with_outside_detection(false),
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    let sent = fake.requests();
    assert_eq!(sent.len(), 4, "no request may be repeated or dropped: {sent:?}");
    let gap = sent[2].0 - sent[1].0;
    assert!(gap >= Duration::from_secs(25), "resumed after only {gap:?}");

    assert_eq!(report.tables.user_permissions.len(), 3);
    assert_eq!(report.stats.rate_limit_waits, 1);
}

#[tokio::test(start_paused = true)]
async fn persistent_transport_failure_exhausts_retries() {
    let mut fake = acme();
    for _ in 0..5 {
        fake = fake.fault(Fault::Transport);
    }
    let fake = Arc::new(fake);

    let err = run_audit(
        &client(Arc::clone(&fake)),
        &AuditOptions::new("acme"),
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), FailureKind::RetryExhausted);
    match err {
        AuditError::RetryExhausted { scope, attempts, .. } => {
            assert_eq!(attempts, 5);
            assert!(scope.starts_with("repositories(acme)"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(fake.requests().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_absorbed() {
    let fake = Arc::new(
        acme()
            .fault(Fault::Transport)
            .fault(Fault::Status(502))
            .fault(Fault::Transport),
    );

    let report = run_audit(
        &client(Arc::clone(&fake)),
        &AuditOptions::new("acme").with_concurrency(1),
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.tables.user_permissions.len(), 3);
    assert!(report.stats.queries > report.stats.pages);
}

#[tokio::test]
async fn bad_credential_is_terminal() {
    let fake = Arc::new(acme().fault(Fault::Status(401)));

    let err = run_audit(
        &client(Arc::clone(&fake)),
        &AuditOptions::new("acme"),
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Auth);
    assert_eq!(fake.requests().len(), 1);
}

#[tokio::test]
async fn unknown_organization_is_terminal() {
    let fake = Arc::new(acme());
    let err = run_audit(
        &client(fake),
        &AuditOptions::new("nope"),
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), FailureKind::NotFound);
}

#[tokio::test]
async fn cancellation_discards_partial_results() {
    let repos: Vec<Value> = (0..5)
        .map(|n| repo(&format!("R_{n}"), &format!("repo-{n}")))
        .collect();
    let mut fake = FakeGitHub::new("acme").repos(vec![repos]);
    for n in 0..5 {
        fake = fake.collaborators(&format!("repo-{n}"), vec![vec![edge("alice", "READ")]]);
    }

    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let callback: Arc<ProgressCallback> = Arc::new(Box::new(move |event: AuditProgress| {
        if matches!(event, AuditProgress::RepoAudited { .. }) {
            trigger.cancel();
        }
    }));

    let err = run_audit(
        &client(Arc::new(fake)),
        &AuditOptions::new("acme")
            .with_concurrency(1)
            .with_outside_detection(false),
        &cancel,
        Some(callback),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Cancelled);
}
