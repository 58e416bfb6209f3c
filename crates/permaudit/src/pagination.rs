//! Cursor pagination over GraphQL connections.
//!
//! A [`Paginator`] owns its cursor and issues pages strictly in order. It
//! never skips a page: either the next page is returned, or the terminal
//! error that stopped it.

use serde_json::Value;

use crate::error::{AuditError, Result};
use crate::graphql::{GraphQlClient, GraphQlResponse};
use crate::progress::ProgressCallback;

/// Problems found while extracting one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageAnomaly {
    /// A node was null or lacked required fields; it was skipped.
    Malformed(String),
    /// The resource behind the page could not be read with this credential.
    Inaccessible(String),
}

/// Items extracted from one response, before the paginator numbers them.
#[derive(Debug)]
pub struct PageContent<T> {
    pub items: Vec<T>,
    /// Records present in the response, including skipped ones.
    pub records: usize,
    /// Items dropped by a client-side filter.
    pub filtered: usize,
    pub total_count: Option<usize>,
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
    pub anomalies: Vec<PageAnomaly>,
}

impl<T> PageContent<T> {
    /// An empty final page.
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            records: 0,
            filtered: 0,
            total_count: None,
            has_next_page: false,
            end_cursor: None,
            anomalies: Vec::new(),
        }
    }
}

/// A numbered page yielded by a [`Paginator`].
#[derive(Debug)]
pub struct Page<T> {
    /// 1-based page number.
    pub number: u32,
    pub items: Vec<T>,
    pub records: usize,
    pub filtered: usize,
    pub total_count: Option<usize>,
    pub anomalies: Vec<PageAnomaly>,
}

/// A cursor-paged GraphQL query.
pub trait PagedQuery {
    type Item;

    /// The GraphQL document.
    fn document(&self) -> &'static str;

    /// Variables for the page starting after `after`.
    fn variables(&self, after: Option<&str>) -> Value;

    /// Label for logs and errors.
    fn scope(&self, page: u32) -> String;

    /// Pull the page out of a response.
    fn extract(&self, response: GraphQlResponse) -> Result<PageContent<Self::Item>>;
}

/// Explicit page sequence carrying its own cursor.
pub struct Paginator<'a, Q: PagedQuery> {
    client: &'a GraphQlClient,
    query: Q,
    cursor: Option<String>,
    page: u32,
    exhausted: bool,
    on_progress: Option<&'a ProgressCallback>,
}

impl<'a, Q: PagedQuery> Paginator<'a, Q> {
    pub fn new(client: &'a GraphQlClient, query: Q) -> Self {
        Self {
            client,
            query,
            cursor: None,
            page: 0,
            exhausted: false,
            on_progress: None,
        }
    }

    /// Report retries through a progress callback.
    #[must_use]
    pub fn with_progress(mut self, on_progress: Option<&'a ProgressCallback>) -> Self {
        self.on_progress = on_progress;
        self
    }

    pub fn query(&self) -> &Q {
        &self.query
    }

    /// Pages fetched so far.
    pub fn pages_fetched(&self) -> u32 {
        self.page
    }

    /// Whether the last page has been returned.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Fetch the next page, or `None` once the connection is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Page<Q::Item>>> {
        if self.exhausted {
            return Ok(None);
        }

        let number = self.page + 1;
        let scope = self.query.scope(number);
        let response = self
            .client
            .execute(
                self.query.document(),
                self.query.variables(self.cursor.as_deref()),
                &scope,
                self.on_progress,
            )
            .await?;
        let content = self.query.extract(response)?;

        if content.has_next_page {
            match content.end_cursor {
                Some(ref next) if self.cursor.as_deref() != Some(next.as_str()) => {}
                _ => {
                    return Err(AuditError::api(format!(
                        "{scope}: cursor did not advance"
                    )));
                }
            }
        }

        tracing::debug!(
            scope = %scope,
            items = content.items.len(),
            has_next = content.has_next_page,
            "Fetched page"
        );

        self.page = number;
        self.exhausted = !content.has_next_page;
        self.cursor = content.end_cursor;

        Ok(Some(Page {
            number,
            items: content.items,
            records: content.records,
            filtered: content.filtered,
            total_count: content.total_count,
            anomalies: content.anomalies,
        }))
    }

    /// Drain every remaining page.
    pub async fn collect_all(&mut self) -> Result<Vec<Q::Item>> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await? {
            items.extend(page.items);
        }
        Ok(items)
    }
}

/// Proof that organization repository discovery reached its last page.
///
/// Only an exhausted repository paginator hands this out, and
/// [`crate::Aggregator::finalize`] requires it, so a partial traversal can
/// never produce tables.
#[derive(Debug)]
pub struct TraversalComplete(());

impl TraversalComplete {
    pub(crate) fn new() -> Self {
        Self(())
    }
}

impl Paginator<'_, crate::queries::OrgRepositoriesQuery> {
    /// Completion token, available once every repository page was fetched.
    pub fn completion(&self) -> Option<TraversalComplete> {
        self.exhausted.then(TraversalComplete::new)
    }
}
