//! Data-quality assessment of fetched collections against expected sizes.

use crate::config::FetchTuning;

/// How a fetched size compares with the size the upstream advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    /// No expectation to compare against.
    Unbounded,
    /// At or above the expected size.
    Complete,
    /// Short of the expectation but within the fuzzy-counter window.
    WithinTolerance,
    /// Short of the expectation, but not short enough to suggest throttling.
    Partial,
    /// Materially below expectation; symptomatic of a throttled response.
    Undercount,
    /// Nothing came back although something was expected.
    Empty,
}

impl Quality {
    /// `true` when the payload can be accepted as complete.
    pub fn is_acceptable(self) -> bool {
        matches!(self, Self::Unbounded | Self::Complete | Self::WithinTolerance)
    }
}

/// Thresholds for the skip-if-unchanged check and payload assessment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    pub unchanged_threshold: u64,
    pub undercount_ratio: f64,
    pub fuzzy_ratio: f64,
    pub fuzzy_slack: u64,
}

impl QualityGate {
    pub fn from_tuning(tuning: &FetchTuning) -> Self {
        Self {
            unchanged_threshold: tuning.unchanged_threshold,
            undercount_ratio: tuning.undercount_ratio,
            fuzzy_ratio: tuning.fuzzy_ratio,
            fuzzy_slack: tuning.fuzzy_slack,
        }
    }

    /// `true` when existing local data is close enough to skip the fetch.
    pub fn is_unchanged(&self, expected: u64, existing: u64) -> bool {
        existing > 0 && expected.abs_diff(existing) <= self.unchanged_threshold
    }

    /// Classify a fetched size.
    pub fn assess(&self, fetched: u64, expected: Option<u64>) -> Quality {
        let Some(expected) = expected else {
            return Quality::Unbounded;
        };
        if fetched >= expected {
            return Quality::Complete;
        }
        if fetched == 0 {
            return Quality::Empty;
        }
        // Undercount wins over both fuzzy rules, including the absolute slack.
        if (fetched as f64) < expected as f64 * self.undercount_ratio {
            return Quality::Undercount;
        }
        let shortfall = expected - fetched;
        if shortfall <= self.fuzzy_slack || shortfall as f64 <= expected as f64 * self.fuzzy_ratio {
            return Quality::WithinTolerance;
        }
        Quality::Partial
    }

    /// `true` when `fetched` is below the throttled-partial threshold.
    pub fn is_undercount(&self, fetched: u64, expected: Option<u64>) -> bool {
        matches!(
            self.assess(fetched, expected),
            Quality::Undercount | Quality::Empty
        )
    }
}
