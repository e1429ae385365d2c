//! Append-only activity records: votes, revisions, attributions and users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a single vote observation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VoteDirection {
    Down,
    Neutral,
    Up,
}

impl VoteDirection {
    /// Signed contribution of this direction to a rating.
    pub fn value(self) -> i64 {
        match self {
            Self::Down => -1,
            Self::Neutral => 0,
            Self::Up => 1,
        }
    }

    /// Map an upstream signed value onto a direction.
    ///
    /// # Returns
    /// `None` for values outside `-1..=1`.
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            -1 => Some(Self::Down),
            0 => Some(Self::Neutral),
            1 => Some(Self::Up),
            _ => None,
        }
    }
}

/// One observation of a user voting on a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vote {
    pub page_url: String,
    pub user_id: String,
    pub direction: VoteDirection,
    pub cast_at: DateTime<Utc>,
    pub version_seq: Option<u32>,
}

/// Append-only edit-history record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Revision {
    pub page_url: String,
    pub number: u32,
    pub created_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub comment: String,
    pub kind: String,
    pub version_seq: Option<u32>,
}

/// Role a user holds on a page version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttributionRole {
    Author,
    CoAuthor,
    Submitter,
    Translator,
    Maintainer,
}

impl AttributionRole {
    /// Stable lowercase name used in storage keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Author => "author",
            Self::CoAuthor => "coauthor",
            Self::Submitter => "submitter",
            Self::Translator => "translator",
            Self::Maintainer => "maintainer",
        }
    }

    /// Parse an upstream attribution type.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "author" => Some(Self::Author),
            "coauthor" | "co-author" | "rewrite" => Some(Self::CoAuthor),
            "submitter" => Some(Self::Submitter),
            "translator" => Some(Self::Translator),
            "maintainer" => Some(Self::Maintainer),
            _ => None,
        }
    }

    /// Roles credited with the page's rating during aggregation.
    pub fn is_authorship(self) -> bool {
        !matches!(self, Self::Maintainer)
    }
}

/// Link between a user and a page version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attribution {
    pub page_url: String,
    pub version_seq: u32,
    pub user_id: String,
    pub role: AttributionRole,
    pub order_index: u32,
    pub date: Option<DateTime<Utc>>,
}

/// Upstream user seen in votes, revisions or attributions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}
