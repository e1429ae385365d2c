//! Rating, ranking and series aggregation.
//!
//! A full recomputation from current versions, their attributions and the
//! vote history. Nothing is merged incrementally: every run replaces the
//! stored aggregates, so re-running on unchanged data yields identical rows.

/// Tag-derived category rules.
pub mod categories;
/// Confidence and controversy scores.
pub mod scores;
/// Numbering-series occupancy.
pub mod series;

use crate::constants::FRAGMENT_TAG;
use crate::db::stats::AggregateSet;
use crate::db::Database;
use crate::error::AppError;
use crate::models::activity::{Attribution, User, Vote, VoteDirection};
use crate::models::page::{slug_of, PageVersion};
use crate::models::stats::{Category, SiteStats, UserStats};
use crate::votes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

pub use categories::{categories_for, CategoryRule};
pub use scores::{controversy, page_scores, wilson_lower_bound};
pub use series::{compute_series, series_number};

/// Batch recomputation of every derived aggregate.
pub struct AggregationEngine;

impl AggregationEngine {
    /// Derive all aggregates from source rows.
    ///
    /// `versions` are the open versions of every page. Fragments and deleted
    /// pages contribute nothing; each authorship-class user is credited a
    /// page's full rating once, in every category the page belongs to.
    pub fn compute(
        versions: &[PageVersion],
        attributions: &[Attribution],
        vote_history: &[Vote],
        users: &[User],
        now: DateTime<Utc>,
    ) -> AggregateSet {
        let counted: BTreeMap<&str, &PageVersion> = versions
            .iter()
            .filter(|v| !v.is_deleted && !v.has_tag(FRAGMENT_TAG))
            .map(|v| (v.page_url.as_str(), v))
            .collect();

        let mut credited: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for attribution in attributions {
            let Some(version) = counted.get(attribution.page_url.as_str()) else {
                continue;
            };
            if attribution.version_seq == version.seq && attribution.role.is_authorship() {
                credited
                    .entry(version.page_url.as_str())
                    .or_default()
                    .insert(attribution.user_id.as_str());
            }
        }

        let mut stats: BTreeMap<String, UserStats> = BTreeMap::new();
        for (url, version) in &counted {
            let Some(authors) = credited.get(url) else {
                continue;
            };
            let rating = version.rating.unwrap_or(0);
            let categories = categories_for(&version.tags);
            for author in authors {
                let row = stats
                    .entry(author.to_string())
                    .or_insert_with(|| UserStats::new(*author));
                for category in &categories {
                    let totals = row.categories.entry(*category).or_default();
                    totals.page_count += 1;
                    totals.rating += rating;
                }
            }
        }

        for vote in votes::latest_votes(vote_history).into_values() {
            let row = stats
                .entry(vote.user_id.clone())
                .or_insert_with(|| UserStats::new(vote.user_id.clone()));
            match vote.direction {
                VoteDirection::Up => row.votes_cast_up += 1,
                VoteDirection::Down => row.votes_cast_down += 1,
                VoteDirection::Neutral => {}
            }
        }

        let names: BTreeMap<&str, &str> = users
            .iter()
            .map(|user| (user.id.as_str(), user.name.as_str()))
            .collect();
        for row in stats.values_mut() {
            row.name = names.get(row.user_id.as_str()).map(|name| name.to_string());
        }
        assign_ranks(&mut stats);

        let tallies = votes::reconcile_all(vote_history);
        let empty = votes::VoteTally::default();
        let scores = counted
            .keys()
            .map(|url| page_scores(url, tallies.get(*url).unwrap_or(&empty)))
            .collect();

        let numbers: BTreeSet<u32> = counted
            .keys()
            .filter_map(|url| series_number(&slug_of(url)))
            .collect();

        let live: Vec<&PageVersion> = versions.iter().filter(|v| !v.is_deleted).collect();
        let (live_upvotes, live_downvotes) = live
            .iter()
            .filter_map(|v| tallies.get(v.page_url.as_str()))
            .fold((0u64, 0u64), |(up, down), tally| {
                (up + u64::from(tally.upvotes), down + u64::from(tally.downvotes))
            });
        let site = SiteStats {
            total_pages: versions.len() as u64,
            live_pages: live.len() as u64,
            deleted_pages: (versions.len() - live.len()) as u64,
            live_upvotes,
            live_downvotes,
            ranked_users: stats
                .values()
                .filter(|row| row.category(Category::Overall).rank.is_some())
                .count() as u64,
            generated_at: now,
        };

        AggregateSet {
            users: stats.into_values().collect(),
            series: compute_series(&numbers),
            scores,
            site,
        }
    }

    /// Recompute from the database and replace the stored aggregates.
    ///
    /// # Errors
    /// Returns an error when storage access fails; stored aggregates are left
    /// untouched in that case.
    pub fn run(db: &Database, now: DateTime<Utc>) -> Result<AggregateSet, AppError> {
        let versions = db.pages.current_versions()?;
        let attributions = db.pages.all_attributions()?;
        let vote_history = db.activity.all_votes()?;
        let users = db.activity.list_users()?;
        let set = Self::compute(&versions, &attributions, &vote_history, &users, now);
        db.stats.replace_all(&set)?;
        tracing::info!(
            users = set.users.len(),
            series = set.series.len(),
            pages = set.scores.len(),
            "Aggregates rebuilt"
        );
        Ok(set)
    }
}

/// Rank users per category by rating descending, then user id.
///
/// Users with a non-positive rating in a category get no rank there.
fn assign_ranks(stats: &mut BTreeMap<String, UserStats>) {
    for category in Category::ALL {
        let mut ranked: Vec<(i64, String)> = stats
            .values()
            .filter_map(|row| {
                row.categories
                    .get(&category)
                    .filter(|totals| totals.rating > 0)
                    .map(|totals| (totals.rating, row.user_id.clone()))
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        for (index, (_, user_id)) in ranked.into_iter().enumerate() {
            if let Some(totals) = stats
                .get_mut(&user_id)
                .and_then(|row| row.categories.get_mut(&category))
            {
                totals.rank = Some(index as u32 + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests;
