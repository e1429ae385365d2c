//! Blocking GraphQL client implementing the core [`Upstream`] trait.
//!
//! Transport and HTTP failures are classified into [`UpstreamError`] here so
//! the core fetcher can decide what to retry. Rate-limit headers are surfaced
//! as a [`RateBudget`] on every successful response.

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::time::Duration;
use wikimirror_core::upstream::{
    ListedPage, PageDetail, Paginated, RateBudget, Response, RevisionRecord, Upstream,
    UpstreamAttribution, UpstreamError, UpstreamUser, VoteRecord,
};

const LIST_PAGES_QUERY: &str = r#"
query ListPages($site: String!, $first: Int!, $after: String) {
  pages(filter: { site: $site }, first: $first, after: $after) {
    edges { node {
      url wikidotId title tags rating voteCount revisionCount createdAt isDeleted
    } }
    pageInfo { hasNextPage endCursor }
    totalCount
  }
}"#;

const PAGE_DETAIL_QUERY: &str = r#"
query PageDetail($url: URL!) {
  page(url: $url) {
    url wikidotId title tags rating voteCount revisionCount createdAt isDeleted
    source
    createdBy { id name }
    attributions { user { id name } type order date }
  }
}"#;

const PAGE_VOTES_QUERY: &str = r#"
query PageVotes($url: URL!, $first: Int!, $after: String) {
  page(url: $url) {
    votes(first: $first, after: $after) {
      edges { node { user { id name } direction timestamp } }
      pageInfo { hasNextPage endCursor }
      totalCount
    }
  }
}"#;

const PAGE_REVISIONS_QUERY: &str = r#"
query PageRevisions($url: URL!, $first: Int!, $after: String) {
  page(url: $url) {
    revisions(first: $first, after: $after) {
      edges { node { index timestamp user { id name } comment type } }
      pageInfo { hasNextPage endCursor }
      totalCount
    }
  }
}"#;

const RATE_REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RATE_RESET_HEADER: &str = "x-ratelimit-reset";
const RETRY_AFTER_HEADER: &str = "retry-after";
const ERROR_SNIPPET_CHARS: usize = 200;

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "unexpected user id {}",
            other
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "N: Deserialize<'de>"))]
struct Connection<N> {
    #[serde(default)]
    edges: Vec<Edge<N>>,
    page_info: PageInfo,
    total_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Edge<N> {
    node: N,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

impl<N> Connection<N> {
    fn into_paginated<T>(
        self,
        convert: impl FnMut(N) -> Option<T>,
    ) -> Result<Paginated<T>, UpstreamError> {
        let next_cursor = match (self.page_info.has_next_page, self.page_info.end_cursor) {
            (true, Some(cursor)) => Some(cursor),
            (true, None) => {
                return Err(UpstreamError::Malformed(
                    "hasNextPage without endCursor".to_string(),
                ))
            }
            (false, _) => None,
        };
        Ok(Paginated {
            items: self
                .edges
                .into_iter()
                .map(|edge| edge.node)
                .filter_map(convert)
                .collect(),
            next_cursor,
            total: self.total_count,
        })
    }
}

#[derive(Debug, Deserialize)]
struct UserNode {
    #[serde(deserialize_with = "id_string")]
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageNode {
    url: String,
    wikidot_id: Option<u64>,
    title: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    rating: Option<i64>,
    vote_count: Option<u32>,
    revision_count: Option<u32>,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    is_deleted: bool,
}

impl From<PageNode> for ListedPage {
    fn from(node: PageNode) -> Self {
        Self {
            url: node.url,
            upstream_id: node.wikidot_id,
            title: node.title.unwrap_or_default(),
            tags: node.tags,
            rating: node.rating,
            vote_count: node.vote_count,
            revision_count: node.revision_count,
            created_at: node.created_at,
            is_deleted: node.is_deleted,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AttributionNode {
    user: UserNode,
    #[serde(rename = "type")]
    kind: String,
    order: Option<u32>,
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetailNode {
    #[serde(flatten)]
    page: PageNode,
    source: Option<String>,
    created_by: Option<UserNode>,
    #[serde(default)]
    attributions: Vec<AttributionNode>,
}

impl From<DetailNode> for PageDetail {
    fn from(node: DetailNode) -> Self {
        let attributions = node
            .attributions
            .into_iter()
            .enumerate()
            .map(|(index, entry)| UpstreamAttribution {
                user_id: entry.user.id,
                user_name: entry.user.name,
                role: entry.kind,
                order: entry.order.unwrap_or(index as u32),
                date: entry.date,
            })
            .collect();
        let listed = ListedPage::from(node.page);
        Self {
            url: listed.url,
            upstream_id: listed.upstream_id,
            title: listed.title,
            tags: listed.tags,
            rating: listed.rating,
            vote_count: listed.vote_count,
            revision_count: listed.revision_count,
            content: node.source,
            created_at: listed.created_at,
            created_by: node.created_by.map(|user| UpstreamUser {
                id: user.id,
                name: user.name,
            }),
            attributions,
            is_deleted: listed.is_deleted,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VoteNode {
    user: Option<UserNode>,
    direction: i64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RevisionNode {
    index: u32,
    timestamp: DateTime<Utc>,
    user: Option<UserNode>,
    comment: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListingData {
    pages: Connection<PageNode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DetailData {
    page: Option<DetailNode>,
}

#[derive(Debug, Deserialize)]
struct VotesPage {
    votes: Connection<VoteNode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VotesData {
    page: Option<VotesPage>,
}

#[derive(Debug, Deserialize)]
struct RevisionsPage {
    revisions: Connection<RevisionNode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RevisionsData {
    page: Option<RevisionsPage>,
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(ERROR_SNIPPET_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Map a non-success HTTP status to an upstream failure class.
pub(crate) fn classify_status(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> UpstreamError {
    match status {
        429 => UpstreamError::RateLimited { retry_after },
        404 => UpstreamError::NotFound,
        408 | 500..=599 => UpstreamError::Transient(format!("HTTP {}: {}", status, snippet(body))),
        _ => UpstreamError::Fatal(format!("HTTP {}: {}", status, snippet(body))),
    }
}

/// `Retry-After` in delta-seconds form.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Remaining quota from `X-RateLimit-Remaining` / `X-RateLimit-Reset`.
///
/// The reset header may be absolute epoch seconds or seconds from `now`.
pub(crate) fn rate_budget(headers: &HeaderMap, now: DateTime<Utc>) -> Option<RateBudget> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let remaining = header(RATE_REMAINING_HEADER)?.trim().parse::<u64>().ok()?;
    let reset_at = header(RATE_RESET_HEADER)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .and_then(|value| {
            if value > 1_000_000_000 {
                Utc.timestamp_opt(value, 0).single()
            } else {
                Some(now + chrono::Duration::seconds(value.max(0)))
            }
        });
    Some(RateBudget {
        remaining,
        reset_at,
    })
}

/// Parse a GraphQL response body.
///
/// # Errors
/// [`UpstreamError::Malformed`] for undecodable bodies and missing data,
/// [`UpstreamError::RateLimited`] or [`UpstreamError::Transient`] when the
/// error list reports throttling or a timeout, [`UpstreamError::Fatal`] for
/// any other error-only response.
pub(crate) fn decode_envelope<T: DeserializeOwned>(body: &str) -> Result<T, UpstreamError> {
    let envelope: Envelope<T> = serde_json::from_str(body)
        .map_err(|err| UpstreamError::Malformed(format!("{}: {}", err, snippet(body))))?;
    if let Some(data) = envelope.data {
        if !envelope.errors.is_empty() {
            tracing::debug!(errors = envelope.errors.len(), "GraphQL response carried partial errors");
        }
        return Ok(data);
    }
    let messages: Vec<String> = envelope.errors.into_iter().map(|e| e.message).collect();
    if messages.is_empty() {
        return Err(UpstreamError::Malformed("response without data".to_string()));
    }
    let joined = messages.join("; ");
    let lowered = joined.to_lowercase();
    if lowered.contains("rate limit") || lowered.contains("too many requests") {
        Err(UpstreamError::RateLimited { retry_after: None })
    } else if lowered.contains("timeout") || lowered.contains("timed out") {
        Err(UpstreamError::Transient(joined))
    } else {
        Err(UpstreamError::Fatal(joined))
    }
}

pub(crate) fn listing_from(data: ListingData) -> Result<Paginated<ListedPage>, UpstreamError> {
    data.pages.into_paginated(|node| Some(ListedPage::from(node)))
}

pub(crate) fn detail_from(data: DetailData) -> Result<PageDetail, UpstreamError> {
    data.page.map(PageDetail::from).ok_or(UpstreamError::NotFound)
}

pub(crate) fn votes_from(data: VotesData) -> Result<Paginated<VoteRecord>, UpstreamError> {
    let page = data.page.ok_or(UpstreamError::NotFound)?;
    page.votes.into_paginated(|node| {
        // Votes by removed accounts carry no user and cannot be attributed.
        let user = node.user?;
        Some(VoteRecord {
            user_id: user.id,
            user_name: user.name,
            direction: node.direction,
            cast_at: node.timestamp,
        })
    })
}

pub(crate) fn revisions_from(
    data: RevisionsData,
) -> Result<Paginated<RevisionRecord>, UpstreamError> {
    let page = data.page.ok_or(UpstreamError::NotFound)?;
    page.revisions.into_paginated(|node| {
        let (user_id, user_name) = match node.user {
            Some(user) => (Some(user.id), user.name),
            None => (None, None),
        };
        Some(RevisionRecord {
            number: node.index,
            created_at: node.timestamp,
            user_id,
            user_name,
            comment: node.comment.unwrap_or_default(),
            kind: node.kind.unwrap_or_default(),
        })
    })
}

/// GraphQL upstream over blocking HTTP.
pub struct HttpUpstream {
    client: reqwest::blocking::Client,
    endpoint: String,
    site: String,
}

impl HttpUpstream {
    /// Build a client for `endpoint` scoped to `site`.
    ///
    /// Must be called outside an async context; the blocking client owns its
    /// own runtime.
    ///
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(endpoint: &str, site: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("wikimirror/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            site: site.to_string(),
        })
    }

    fn query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<Response<T>, UpstreamError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .map_err(|err| UpstreamError::Transient(format!("request failed: {}", err)))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .map_err(|err| UpstreamError::Transient(format!("reading body failed: {}", err)))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), retry_after(&headers), &body));
        }
        Ok(Response {
            data: decode_envelope(&body)?,
            budget: rate_budget(&headers, Utc::now()),
        })
    }

    fn absolute_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.site.trim_end_matches('/'), url.trim_start_matches('/'))
        }
    }
}

fn map_response<A, B>(
    response: Response<A>,
    convert: impl FnOnce(A) -> Result<B, UpstreamError>,
) -> Result<Response<B>, UpstreamError> {
    Ok(Response {
        data: convert(response.data)?,
        budget: response.budget,
    })
}

impl Upstream for HttpUpstream {
    fn list_pages(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Response<Paginated<ListedPage>>, UpstreamError> {
        let response = self.query::<ListingData>(
            LIST_PAGES_QUERY,
            json!({ "site": self.site, "first": limit, "after": cursor }),
        )?;
        map_response(response, listing_from)
    }

    fn page_detail(&self, url: &str) -> Result<Response<PageDetail>, UpstreamError> {
        let response = self.query::<DetailData>(
            PAGE_DETAIL_QUERY,
            json!({ "url": self.absolute_url(url) }),
        )?;
        map_response(response, detail_from)
    }

    fn page_votes(
        &self,
        url: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Response<Paginated<VoteRecord>>, UpstreamError> {
        let response = self.query::<VotesData>(
            PAGE_VOTES_QUERY,
            json!({ "url": self.absolute_url(url), "first": limit, "after": cursor }),
        )?;
        map_response(response, votes_from)
    }

    fn page_revisions(
        &self,
        url: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Response<Paginated<RevisionRecord>>, UpstreamError> {
        let response = self.query::<RevisionsData>(
            PAGE_REVISIONS_QUERY,
            json!({ "url": self.absolute_url(url), "first": limit, "after": cursor }),
        )?;
        map_response(response, revisions_from)
    }
}
