//! Page identity and temporal version models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Stable identity for a mirrored document, keyed by canonical URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page {
    pub url: String,
    pub upstream_id: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Page {
    /// Create a page row first observed at `seen_at`.
    pub fn new(url: impl Into<String>, seen_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            upstream_id: None,
            created_at: None,
            first_seen_at: seen_at,
            last_seen_at: seen_at,
        }
    }

    /// URL slug (the last path segment), lowercased.
    pub fn slug(&self) -> String {
        slug_of(&self.url)
    }
}

/// Return the lowercased last path segment of a page URL.
pub fn slug_of(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Which stage produced a version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VersionSource {
    Listing,
    Content,
    Reconciliation,
}

/// Immutable snapshot of a page valid over `[valid_from, valid_to)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageVersion {
    pub page_url: String,
    pub seq: u32,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub title: String,
    pub tags: Vec<String>,
    pub rating: Option<i64>,
    pub vote_count: Option<u32>,
    pub upvotes: Option<u32>,
    pub downvotes: Option<u32>,
    pub revision_count: Option<u32>,
    pub content: Option<String>,
    pub content_hash: Option<String>,
    pub is_deleted: bool,
    pub source: VersionSource,
}

impl PageVersion {
    /// `true` while this version has no end time.
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    /// `true` when the version carries `tag` (case-insensitive).
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Structural pages (fragments, components) never carry their own votes.
    pub fn is_structural(&self) -> bool {
        has_structural_tag(&self.tags)
    }
}

/// Fields compared when deciding whether an observation supersedes a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionField {
    Title,
    Tags,
    Rating,
    VoteCount,
    VoteSplit,
    RevisionCount,
    Content,
    Deleted,
}

/// Observed state of a page at a point in time, before it becomes a version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PageSnapshot {
    pub title: String,
    pub tags: Vec<String>,
    pub rating: Option<i64>,
    pub vote_count: Option<u32>,
    pub upvotes: Option<u32>,
    pub downvotes: Option<u32>,
    pub revision_count: Option<u32>,
    pub content: Option<String>,
    pub is_deleted: bool,
}

fn has_structural_tag(tags: &[String]) -> bool {
    tags.iter().any(|tag| {
        crate::constants::STRUCTURAL_TAGS
            .iter()
            .any(|structural| tag.trim().eq_ignore_ascii_case(structural))
    })
}

fn tag_set(tags: &[String]) -> BTreeSet<String> {
    tags.iter().map(|tag| tag.trim().to_lowercase()).collect()
}

/// blake3 hex digest of page content.
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

impl PageSnapshot {
    /// Rebuild the observed state carried by an existing version.
    pub fn from_version(version: &PageVersion) -> Self {
        Self {
            title: version.title.clone(),
            tags: version.tags.clone(),
            rating: version.rating,
            vote_count: version.vote_count,
            upvotes: version.upvotes,
            downvotes: version.downvotes,
            revision_count: version.revision_count,
            content: version.content.clone(),
            is_deleted: version.is_deleted,
        }
    }

    /// See [`PageVersion::is_structural`].
    pub fn is_structural(&self) -> bool {
        has_structural_tag(&self.tags)
    }

    /// List the fields in which this observation differs from `current`.
    pub fn changed_fields(&self, current: &PageVersion) -> Vec<VersionField> {
        let mut changed = Vec::new();
        if self.title != current.title {
            changed.push(VersionField::Title);
        }
        if tag_set(&self.tags) != tag_set(&current.tags) {
            changed.push(VersionField::Tags);
        }
        if self.rating != current.rating {
            changed.push(VersionField::Rating);
        }
        if self.vote_count != current.vote_count {
            changed.push(VersionField::VoteCount);
        }
        if self.upvotes != current.upvotes || self.downvotes != current.downvotes {
            changed.push(VersionField::VoteSplit);
        }
        if self.revision_count != current.revision_count {
            changed.push(VersionField::RevisionCount);
        }
        let hash = self.content.as_deref().map(content_hash);
        if hash != current.content_hash {
            changed.push(VersionField::Content);
        }
        if self.is_deleted != current.is_deleted {
            changed.push(VersionField::Deleted);
        }
        changed
    }

    /// `true` when this observation must close `current` and open a new version.
    pub fn differs_from(&self, current: &PageVersion) -> bool {
        !self.changed_fields(current).is_empty()
    }

    /// Materialize this observation as version `seq` of `page_url`.
    pub fn into_version(
        self,
        page_url: &str,
        seq: u32,
        valid_from: DateTime<Utc>,
        source: VersionSource,
    ) -> PageVersion {
        let content_hash = self.content.as_deref().map(content_hash);
        PageVersion {
            page_url: page_url.to_string(),
            seq,
            valid_from,
            valid_to: None,
            title: self.title,
            tags: self.tags,
            rating: self.rating,
            vote_count: self.vote_count,
            upvotes: self.upvotes,
            downvotes: self.downvotes,
            revision_count: self.revision_count,
            content: self.content,
            content_hash,
            is_deleted: self.is_deleted,
            source,
        }
    }
}
