//! Vote-history reconciliation.
//!
//! Votes are append-only observations; only the latest observation per
//! `(page, user)` pair is live. A live `Neutral` vote contributes nothing.
//! Observations with identical timestamps resolve by direction order, so the
//! result never depends on input order.

use crate::models::activity::{Vote, VoteDirection};
use std::collections::BTreeMap;

/// Reconciled live votes for one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteTally {
    /// Live non-neutral direction per user.
    pub live: BTreeMap<String, VoteDirection>,
    pub upvotes: u32,
    pub downvotes: u32,
}

impl VoteTally {
    /// Signed sum of live votes; the authoritative rating.
    pub fn rating(&self) -> i64 {
        i64::from(self.upvotes) - i64::from(self.downvotes)
    }

    /// Number of live non-neutral votes.
    pub fn vote_count(&self) -> u32 {
        self.upvotes.saturating_add(self.downvotes)
    }

    /// Signed contribution of `user_id` to the rating.
    pub fn contribution(&self, user_id: &str) -> i64 {
        self.live
            .get(user_id)
            .map(|direction| direction.value())
            .unwrap_or(0)
    }
}

fn supersedes(candidate: &Vote, current: &Vote) -> bool {
    (candidate.cast_at, candidate.direction) > (current.cast_at, current.direction)
}

/// Keep the latest observation per `(page_url, user_id)`.
pub fn latest_votes<'a, I>(votes: I) -> BTreeMap<(&'a str, &'a str), &'a Vote>
where
    I: IntoIterator<Item = &'a Vote>,
{
    let mut latest: BTreeMap<(&str, &str), &Vote> = BTreeMap::new();
    for vote in votes {
        let key = (vote.page_url.as_str(), vote.user_id.as_str());
        let replace = latest
            .get(&key)
            .map_or(true, |current| supersedes(vote, current));
        if replace {
            latest.insert(key, vote);
        }
    }
    latest
}

/// Reconcile a full vote history into per-page tallies.
pub fn reconcile_all<'a, I>(votes: I) -> BTreeMap<String, VoteTally>
where
    I: IntoIterator<Item = &'a Vote>,
{
    let mut tallies: BTreeMap<String, VoteTally> = BTreeMap::new();
    for ((page_url, user_id), vote) in latest_votes(votes) {
        let tally = tallies.entry(page_url.to_string()).or_default();
        match vote.direction {
            VoteDirection::Up => tally.upvotes += 1,
            VoteDirection::Down => tally.downvotes += 1,
            VoteDirection::Neutral => continue,
        }
        tally.live.insert(user_id.to_string(), vote.direction);
    }
    tallies
}

/// Reconcile one page's vote history.
///
/// Votes for other pages in the input are ignored.
pub fn reconcile_page<'a, I>(page_url: &str, votes: I) -> VoteTally
where
    I: IntoIterator<Item = &'a Vote>,
{
    reconcile_all(votes.into_iter().filter(|vote| vote.page_url == page_url))
        .remove(page_url)
        .unwrap_or_default()
}
