//! Per-page confidence and controversy scores.

use crate::constants::WILSON_Z;
use crate::models::stats::PageScores;
use crate::votes::VoteTally;

/// Wilson score lower bound of the upvote proportion at `WILSON_Z`.
///
/// # Returns
/// `0.0` when the page has no votes.
pub fn wilson_lower_bound(upvotes: u32, downvotes: u32) -> f64 {
    let n = f64::from(upvotes) + f64::from(downvotes);
    if n == 0.0 {
        return 0.0;
    }
    let z = WILSON_Z;
    let z2 = z * z;
    let p = f64::from(upvotes) / n;
    let centre = p + z2 / (2.0 * n);
    let margin = z * ((p * (1.0 - p) + z2 / (4.0 * n)) / n).sqrt();
    ((centre - margin) / (1.0 + z2 / n)).max(0.0)
}

/// Minority-to-majority ratio weighted by the log of total votes.
///
/// # Returns
/// `0.0` unless both sides have at least one vote.
pub fn controversy(upvotes: u32, downvotes: u32) -> f64 {
    if upvotes == 0 || downvotes == 0 {
        return 0.0;
    }
    let (low, high) = if upvotes < downvotes {
        (upvotes, downvotes)
    } else {
        (downvotes, upvotes)
    };
    (f64::from(low) / f64::from(high)) * (f64::from(upvotes) + f64::from(downvotes)).ln()
}

pub fn page_scores(page_url: &str, tally: &VoteTally) -> PageScores {
    PageScores {
        page_url: page_url.to_string(),
        upvotes: tally.upvotes,
        downvotes: tally.downvotes,
        wilson_lower_bound: wilson_lower_bound(tally.upvotes, tally.downvotes),
        controversy: controversy(tally.upvotes, tally.downvotes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wilson_matches_reference_values() {
        assert_eq!(wilson_lower_bound(0, 0), 0.0);
        assert!((wilson_lower_bound(10, 0) - 0.7225).abs() < 1e-3);
        assert!((wilson_lower_bound(50, 50) - 0.4038).abs() < 1e-3);
        assert!(wilson_lower_bound(100, 5) > wilson_lower_bound(10, 0));
    }

    #[test]
    fn controversy_rewards_even_splits_at_volume() {
        assert_eq!(controversy(40, 0), 0.0);
        let even = controversy(50, 50);
        assert!((even - 100f64.ln()).abs() < 1e-9);
        assert!(controversy(60, 40) < even);
        assert!(controversy(5, 5) < even);
        assert_eq!(controversy(3, 7), controversy(7, 3));
    }
}
