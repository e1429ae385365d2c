//! Derived aggregates rebuilt by the aggregation engine, plus task watermarks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag-derived rating category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Overall,
    Original,
    Scp,
    Story,
    GoiFormat,
    WanderersLibrary,
    Art,
    Translation,
}

impl Category {
    /// All categories in report order.
    pub const ALL: [Category; 8] = [
        Category::Overall,
        Category::Original,
        Category::Scp,
        Category::Story,
        Category::GoiFormat,
        Category::WanderersLibrary,
        Category::Art,
        Category::Translation,
    ];

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overall => "overall",
            Self::Original => "original",
            Self::Scp => "scp",
            Self::Story => "story",
            Self::GoiFormat => "goi_format",
            Self::WanderersLibrary => "wanderers_library",
            Self::Art => "art",
            Self::Translation => "translation",
        }
    }
}

/// A user's totals within one category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CategoryStats {
    pub page_count: u32,
    pub rating: i64,
    pub rank: Option<u32>,
}

/// Per-user ratings, rankings and live voting activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStats {
    pub user_id: String,
    pub name: Option<String>,
    pub categories: BTreeMap<Category, CategoryStats>,
    pub votes_cast_up: u32,
    pub votes_cast_down: u32,
}

impl UserStats {
    /// Empty stats row for `user_id`.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: None,
            categories: BTreeMap::new(),
            votes_cast_up: 0,
            votes_cast_down: 0,
        }
    }

    /// Totals for `category` (zeroed when the user has none).
    pub fn category(&self, category: Category) -> CategoryStats {
        self.categories.get(&category).copied().unwrap_or_default()
    }
}

/// Confidence and controversy scores for one page's current vote split.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageScores {
    pub page_url: String,
    pub upvotes: u32,
    pub downvotes: u32,
    pub wilson_lower_bound: f64,
    pub controversy: f64,
}

/// Occupancy of one numbering-scheme series.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesStats {
    pub series: u32,
    pub first_number: u32,
    pub last_number: u32,
    pub total_slots: u32,
    pub occupied: Vec<u32>,
    pub used_slots: u32,
    pub usage_percent: f64,
    pub is_open: bool,
}

/// Site-wide totals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteStats {
    pub total_pages: u64,
    pub live_pages: u64,
    pub deleted_pages: u64,
    pub live_upvotes: u64,
    pub live_downvotes: u64,
    pub ranked_users: u64,
    pub generated_at: DateTime<Utc>,
}

/// Last-run marker for a batch task (consumed by jobs outside the sync core too).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskWatermark {
    pub task: String,
    pub last_run_at: DateTime<Utc>,
    pub cursor_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}
