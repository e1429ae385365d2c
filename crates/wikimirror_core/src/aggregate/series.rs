//! Numbering-series occupancy.
//!
//! Series 1 holds numbers 2..=999; series N >= 2 holds
//! `(N-1)*1000..=N*1000-1` and opens when its milestone page
//! `(N-1)*1000` exists. Numbers beyond [`MAX_SERIES`] are not series pages.

use crate::constants::{MAX_SERIES, SERIES_BLOCK_SIZE, SERIES_SLUG_PREFIX};
use crate::models::stats::SeriesStats;
use std::collections::BTreeSet;

/// Number encoded in a series slug such as `scp-cn-173`.
pub fn series_number(slug: &str) -> Option<u32> {
    let digits = slug.strip_prefix(SERIES_SLUG_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number: u32 = digits.parse().ok()?;
    (number / SERIES_BLOCK_SIZE < MAX_SERIES).then_some(number)
}

/// Inclusive number range of `series` (1-based).
pub fn series_range(series: u32) -> (u32, u32) {
    let series = series.min(MAX_SERIES);
    if series <= 1 {
        (2, SERIES_BLOCK_SIZE - 1)
    } else {
        (
            (series - 1) * SERIES_BLOCK_SIZE,
            series * SERIES_BLOCK_SIZE - 1,
        )
    }
}

/// Series containing `number`, if any.
pub fn series_of(number: u32) -> Option<u32> {
    if number < 2 {
        return None;
    }
    let series = number / SERIES_BLOCK_SIZE + 1;
    (series <= MAX_SERIES).then_some(series)
}

/// Occupancy of series 1 and of every other series holding at least one number.
pub fn compute_series(numbers: &BTreeSet<u32>) -> Vec<SeriesStats> {
    let mut present: BTreeSet<u32> = numbers.iter().filter_map(|n| series_of(*n)).collect();
    if present.is_empty() {
        return Vec::new();
    }
    present.insert(1);
    present
        .into_iter()
        .map(|series| {
            let (first, last) = series_range(series);
            let occupied: Vec<u32> = numbers.range(first..=last).copied().collect();
            let total_slots = last - first + 1;
            let used_slots = occupied.len() as u32;
            SeriesStats {
                series,
                first_number: first,
                last_number: last,
                total_slots,
                used_slots,
                usage_percent: f64::from(used_slots) * 100.0 / f64::from(total_slots),
                is_open: series == 1 || numbers.contains(&first),
                occupied,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_parse_only_plain_numbers() {
        assert_eq!(series_number("scp-cn-173"), Some(173));
        assert_eq!(series_number("scp-cn-001"), Some(1));
        assert_eq!(series_number("scp-cn-1000"), Some(1000));
        assert_eq!(series_number("scp-cn-173-j"), None);
        assert_eq!(series_number("scp-173"), None);
        assert_eq!(series_number("scp-cn-"), None);
    }

    #[test]
    fn series_boundaries() {
        assert_eq!(series_range(1), (2, 999));
        assert_eq!(series_range(2), (1000, 1999));
        assert_eq!(series_of(1), None);
        assert_eq!(series_of(2), Some(1));
        assert_eq!(series_of(999), Some(1));
        assert_eq!(series_of(1000), Some(2));
        assert_eq!(series_of(2999), Some(3));
    }

    #[test]
    fn first_series_with_950_pages_is_open_at_95_percent() {
        let numbers: BTreeSet<u32> = (2..=951).collect();
        let series = compute_series(&numbers);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].total_slots, 998);
        assert_eq!(series[0].used_slots, 950);
        assert!((series[0].usage_percent - 95.19).abs() < 0.01);
        assert!(series[0].is_open);
    }

    #[test]
    fn later_series_open_only_with_milestone() {
        let without: BTreeSet<u32> = [5, 1001, 2500].into_iter().collect();
        let series = compute_series(&without);
        assert_eq!(series.len(), 3);
        assert!(!series[1].is_open);
        assert!(!series[2].is_open);
        assert_eq!(series[1].occupied, vec![1001]);

        let with: BTreeSet<u32> = [1000, 1001].into_iter().collect();
        assert!(compute_series(&with)[1].is_open);
    }

    #[test]
    fn empty_series_between_occupied_ones_are_not_reported() {
        let numbers: BTreeSet<u32> = [5, 99_999_999].into_iter().collect();
        let series = compute_series(&numbers);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].series, 1);
        assert_eq!(series[1].series, 100_000);
        assert_eq!(series[1].occupied, vec![99_999_999]);

        let only_later: BTreeSet<u32> = [2500].into_iter().collect();
        let series = compute_series(&only_later);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].used_slots, 0);
    }

    #[test]
    fn numbers_past_the_last_series_are_ignored() {
        assert_eq!(series_number("scp-cn-4294967295"), None);
        assert_eq!(series_number("scp-cn-99999999999"), None);
        assert_eq!(series_of(u32::MAX), None);
        assert_eq!(series_range(u32::MAX), series_range(MAX_SERIES));

        let numbers: BTreeSet<u32> = [5, u32::MAX].into_iter().collect();
        let series = compute_series(&numbers);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].occupied, vec![5]);
    }
}
