//! Upstream query interface consumed by the sync stages.
//!
//! The upstream is a paginated, cursor-based API with independent cursors for
//! the page listing and for each page's vote and revision history. Every
//! response may carry the remaining rate-limit budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure classes reported by an upstream call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("malformed upstream payload: {0}")]
    Malformed(String),

    #[error("not found upstream")]
    NotFound,

    #[error("fatal upstream failure: {0}")]
    Fatal(String),
}

impl UpstreamError {
    /// `true` for failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transient(_) | Self::Malformed(_)
        )
    }

    /// Machine-readable reason code for logs and fetch outcomes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Transient(_) => "transient",
            Self::Malformed(_) => "malformed",
            Self::NotFound => "not_found",
            Self::Fatal(_) => "fatal",
        }
    }
}

/// Remaining request quota reported by the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBudget {
    pub remaining: u64,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Upstream payload plus the budget observed on the response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    pub data: T,
    pub budget: Option<RateBudget>,
}

impl<T> Response<T> {
    /// Response without budget information.
    pub fn new(data: T) -> Self {
        Self { data, budget: None }
    }
}

/// One page of a cursor-paginated collection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub total: Option<u64>,
}

/// Lightweight listing entry used by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedPage {
    pub url: String,
    pub upstream_id: Option<u64>,
    pub title: String,
    pub tags: Vec<String>,
    pub rating: Option<i64>,
    pub vote_count: Option<u32>,
    pub revision_count: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

/// Upstream attribution entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamAttribution {
    pub user_id: String,
    pub user_name: Option<String>,
    pub role: String,
    pub order: u32,
    pub date: Option<DateTime<Utc>>,
}

/// Upstream user reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamUser {
    pub id: String,
    pub name: Option<String>,
}

/// Full page detail used by the content stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageDetail {
    pub url: String,
    pub upstream_id: Option<u64>,
    pub title: String,
    pub tags: Vec<String>,
    pub rating: Option<i64>,
    pub vote_count: Option<u32>,
    pub revision_count: Option<u32>,
    pub content: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub created_by: Option<UpstreamUser>,
    pub attributions: Vec<UpstreamAttribution>,
    pub is_deleted: bool,
}

/// Upstream vote observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub user_id: String,
    pub user_name: Option<String>,
    pub direction: i64,
    pub cast_at: DateTime<Utc>,
}

/// Upstream revision entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub number: u32,
    pub created_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub comment: String,
    pub kind: String,
}

/// Blocking upstream query interface.
pub trait Upstream: Send + Sync {
    /// Fetch one batch of the page listing starting at `cursor`.
    fn list_pages(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Response<Paginated<ListedPage>>, UpstreamError>;

    /// Fetch full detail for one page.
    fn page_detail(&self, url: &str) -> Result<Response<PageDetail>, UpstreamError>;

    /// Fetch one batch of a page's vote history.
    fn page_votes(
        &self,
        url: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Response<Paginated<VoteRecord>>, UpstreamError>;

    /// Fetch one batch of a page's revision history.
    fn page_revisions(
        &self,
        url: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Response<Paginated<RevisionRecord>>, UpstreamError>;
}
