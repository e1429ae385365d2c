//! Checkpoint payload schemas, one tagged variant per crawl kind.

use crate::constants::CHECKPOINT_SCHEMA_VERSION;
use crate::error::AppError;
use crate::upstream::{RevisionRecord, VoteRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Crawl kinds that keep checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointKind {
    PageListing,
    ContentCrawl,
}

impl CheckpointKind {
    pub const ALL: [CheckpointKind; 2] = [CheckpointKind::PageListing, CheckpointKind::ContentCrawl];

    /// Directory name holding this kind's slots.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PageListing => "page-listing",
            Self::ContentCrawl => "content-crawl",
        }
    }
}

/// Progress through the upstream page listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageListingCheckpoint {
    /// Cursor for the next listing batch; `None` before the first batch.
    pub cursor: Option<String>,
    /// URLs observed so far in this pass.
    pub seen: BTreeSet<String>,
    pub processed: u64,
    pub started_at: DateTime<Utc>,
    /// Set on the final save of a full pass; the next run starts fresh.
    #[serde(default)]
    pub complete: bool,
}

impl PageListingCheckpoint {
    pub fn fresh(started_at: DateTime<Utc>) -> Self {
        Self {
            cursor: None,
            seen: BTreeSet::new(),
            processed: 0,
            started_at,
            complete: false,
        }
    }
}

/// Accumulated history for a page whose content fetch was interrupted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PagePartial {
    pub vote_cursor: Option<String>,
    pub votes: Vec<VoteRecord>,
    pub revision_cursor: Option<String>,
    pub revisions: Vec<RevisionRecord>,
}

/// Progress through the content stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentCrawlCheckpoint {
    pub completed: BTreeSet<String>,
    pub partials: BTreeMap<String, PagePartial>,
}

/// Tagged checkpoint payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum CheckpointPayload {
    PageListing(PageListingCheckpoint),
    ContentCrawl(ContentCrawlCheckpoint),
}

impl CheckpointPayload {
    pub fn kind(&self) -> CheckpointKind {
        match self {
            Self::PageListing(_) => CheckpointKind::PageListing,
            Self::ContentCrawl(_) => CheckpointKind::ContentCrawl,
        }
    }

    /// Structural checks beyond what deserialization enforces.
    ///
    /// # Errors
    /// Returns [`AppError::BadRequest`] describing the first violation.
    pub fn validate(&self) -> Result<(), AppError> {
        match self {
            Self::PageListing(listing) => {
                if listing.processed < listing.seen.len() as u64 {
                    return Err(AppError::BadRequest(format!(
                        "listing checkpoint processed {} < seen {}",
                        listing.processed,
                        listing.seen.len()
                    )));
                }
                if listing.complete && listing.cursor.is_some() {
                    return Err(AppError::BadRequest(
                        "completed listing checkpoint still carries a cursor".to_string(),
                    ));
                }
                if listing.cursor.as_deref().is_some_and(str::is_empty) {
                    return Err(AppError::BadRequest(
                        "listing checkpoint has an empty cursor".to_string(),
                    ));
                }
            }
            Self::ContentCrawl(crawl) => {
                if let Some(url) = crawl.partials.keys().find(|url| crawl.completed.contains(*url)) {
                    return Err(AppError::BadRequest(format!(
                        "content checkpoint lists '{}' as both completed and partial",
                        url
                    )));
                }
                if crawl.completed.iter().any(|url| url.is_empty()) {
                    return Err(AppError::BadRequest(
                        "content checkpoint contains an empty url".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// On-disk envelope with schema version and save time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEnvelope {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub payload: CheckpointPayload,
}

impl CheckpointEnvelope {
    pub fn new(payload: CheckpointPayload, saved_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            saved_at,
            payload,
        }
    }

    /// Check schema version, kind and payload structure.
    ///
    /// # Errors
    /// Returns [`AppError::BadRequest`] when the envelope cannot be resumed from.
    pub fn validate(&self, expected: CheckpointKind) -> Result<(), AppError> {
        if self.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(AppError::BadRequest(format!(
                "unsupported checkpoint schema version {}",
                self.schema_version
            )));
        }
        if self.payload.kind() != expected {
            return Err(AppError::BadRequest(format!(
                "checkpoint kind {:?} stored under {:?}",
                self.payload.kind(),
                expected
            )));
        }
        self.payload.validate()
    }
}
