//! Configuration loading from environment variables.

use crate::constants::*;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for the mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub db_path: String,
    pub checkpoint_dir: String,
    pub endpoint: String,
    pub site: String,
    pub fetch: FetchTuning,
    pub sync: SyncTuning,
}

/// Fetch-quality heuristics and retry pacing.
///
/// The tolerance values are tuned against one upstream's eventual-consistency
/// behavior and are exposed so they can be adjusted without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchTuning {
    pub unchanged_threshold: u64,
    pub undercount_ratio: f64,
    pub fuzzy_ratio: f64,
    pub fuzzy_slack: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub throttle_multiplier_cap: u32,
    pub budget_reserve: u64,
}

/// Pagination, concurrency and checkpoint settings for the sync stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncTuning {
    pub listing_page_size: usize,
    pub history_page_size: usize,
    pub content_concurrency: usize,
    pub batch_pause_ms: u64,
    pub checkpoint_keep: usize,
    pub checkpoint_interval: usize,
    pub claim_lease_secs: i64,
}

impl Default for FetchTuning {
    fn default() -> Self {
        Self {
            unchanged_threshold: DEFAULT_UNCHANGED_THRESHOLD,
            undercount_ratio: DEFAULT_UNDERCOUNT_RATIO,
            fuzzy_ratio: DEFAULT_FUZZY_RATIO,
            fuzzy_slack: DEFAULT_FUZZY_SLACK,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            throttle_multiplier_cap: DEFAULT_THROTTLE_MULTIPLIER_CAP,
            budget_reserve: DEFAULT_BUDGET_RESERVE,
        }
    }
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            listing_page_size: DEFAULT_LISTING_PAGE_SIZE,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            content_concurrency: DEFAULT_CONTENT_CONCURRENCY,
            batch_pause_ms: DEFAULT_BATCH_PAUSE_MS,
            checkpoint_keep: DEFAULT_CHECKPOINT_KEEP,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            claim_lease_secs: DEFAULT_CLAIM_LEASE_SECS,
        }
    }
}

impl SyncTuning {
    /// Claim lease as a chrono duration.
    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_lease_secs.clamp(0, MAX_CLAIM_LEASE_SECS))
    }

    /// Pause between listing batches.
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

/// Expand tilde (~) in paths to the user's home directory
fn expand_tilde(path: String) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = resolve_home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path
}

fn resolve_home_dir() -> Option<PathBuf> {
    if let Ok(home) = env::var("HOME") {
        if !home.trim().is_empty() {
            return Some(PathBuf::from(home));
        }
    }

    if let Ok(profile) = env::var("USERPROFILE") {
        if !profile.trim().is_empty() {
            return Some(PathBuf::from(profile));
        }
    }

    std::env::current_dir().ok()
}

fn default_data_dir() -> PathBuf {
    let home = resolve_home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".cache").join("wikimirror")
}

fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|err| {
            AppError::Config(format!("{} has invalid value '{}': {}", name, raw, err))
        }),
        _ => Ok(default),
    }
}

fn parse_ratio<F>(lookup: &F, name: &str, default: f64) -> Result<f64, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_var(lookup, name, default)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(AppError::Config(format!(
            "{} must be within 0.0..=1.0, got {}",
            name, value
        )));
    }
    Ok(value)
}

fn parse_bounded<F>(lookup: &F, name: &str, default: i64, max: i64) -> Result<i64, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_var(lookup, name, default)?;
    if !(0..=max).contains(&value) {
        return Err(AppError::Config(format!(
            "{} must be within 0..={}, got {}",
            name, max, value
        )));
    }
    Ok(value)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Returns
    /// A populated [`Config`] with defaults applied when env vars are missing.
    ///
    /// # Errors
    /// Returns [`AppError::Config`] when a variable is present but malformed.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns [`AppError::Config`] when a variable is present but malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup("WIKIMIRROR_DATA_DIR")
            .map(expand_tilde)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let db_path = lookup("WIKIMIRROR_DB_PATH")
            .map(expand_tilde)
            .unwrap_or_else(|| data_dir.join("db").to_string_lossy().to_string());
        let checkpoint_dir = lookup("WIKIMIRROR_CHECKPOINT_DIR")
            .map(expand_tilde)
            .unwrap_or_else(|| data_dir.join("checkpoints").to_string_lossy().to_string());

        let fetch = FetchTuning {
            unchanged_threshold: parse_var(
                &lookup,
                "WIKIMIRROR_UNCHANGED_THRESHOLD",
                DEFAULT_UNCHANGED_THRESHOLD,
            )?,
            undercount_ratio: parse_ratio(
                &lookup,
                "WIKIMIRROR_UNDERCOUNT_RATIO",
                DEFAULT_UNDERCOUNT_RATIO,
            )?,
            fuzzy_ratio: parse_ratio(&lookup, "WIKIMIRROR_FUZZY_RATIO", DEFAULT_FUZZY_RATIO)?,
            fuzzy_slack: parse_var(&lookup, "WIKIMIRROR_FUZZY_SLACK", DEFAULT_FUZZY_SLACK)?,
            max_attempts: parse_var(&lookup, "WIKIMIRROR_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?
                .max(1),
            backoff_base_ms: parse_var(
                &lookup,
                "WIKIMIRROR_BACKOFF_BASE_MS",
                DEFAULT_BACKOFF_BASE_MS,
            )?,
            backoff_max_ms: parse_var(
                &lookup,
                "WIKIMIRROR_BACKOFF_MAX_MS",
                DEFAULT_BACKOFF_MAX_MS,
            )?,
            throttle_multiplier_cap: parse_var(
                &lookup,
                "WIKIMIRROR_THROTTLE_MULTIPLIER_CAP",
                DEFAULT_THROTTLE_MULTIPLIER_CAP,
            )?
            .max(1),
            budget_reserve: parse_var(
                &lookup,
                "WIKIMIRROR_BUDGET_RESERVE",
                DEFAULT_BUDGET_RESERVE,
            )?,
        };

        let sync = SyncTuning {
            listing_page_size: parse_var(
                &lookup,
                "WIKIMIRROR_LISTING_PAGE_SIZE",
                DEFAULT_LISTING_PAGE_SIZE,
            )?
            .max(1),
            history_page_size: parse_var(
                &lookup,
                "WIKIMIRROR_HISTORY_PAGE_SIZE",
                DEFAULT_HISTORY_PAGE_SIZE,
            )?
            .max(1),
            content_concurrency: parse_var(
                &lookup,
                "WIKIMIRROR_CONCURRENCY",
                DEFAULT_CONTENT_CONCURRENCY,
            )?
            .max(1),
            batch_pause_ms: parse_var(
                &lookup,
                "WIKIMIRROR_BATCH_PAUSE_MS",
                DEFAULT_BATCH_PAUSE_MS,
            )?,
            checkpoint_keep: parse_var(
                &lookup,
                "WIKIMIRROR_CHECKPOINT_KEEP",
                DEFAULT_CHECKPOINT_KEEP,
            )?
            .max(1),
            checkpoint_interval: parse_var(
                &lookup,
                "WIKIMIRROR_CHECKPOINT_INTERVAL",
                DEFAULT_CHECKPOINT_INTERVAL,
            )?
            .max(1),
            claim_lease_secs: parse_bounded(
                &lookup,
                "WIKIMIRROR_CLAIM_LEASE_SECS",
                DEFAULT_CLAIM_LEASE_SECS,
                MAX_CLAIM_LEASE_SECS,
            )?,
        };

        Ok(Self {
            db_path,
            checkpoint_dir,
            endpoint: lookup("WIKIMIRROR_ENDPOINT")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            site: lookup("WIKIMIRROR_SITE")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SITE.to_string()),
            fetch,
            sync,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_variables_are_missing() {
        let config = Config::from_lookup(lookup_from(&[("WIKIMIRROR_DATA_DIR", "/tmp/wm")]))
            .expect("config");
        assert_eq!(config.db_path, "/tmp/wm/db");
        assert_eq!(config.checkpoint_dir, "/tmp/wm/checkpoints");
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.fetch, FetchTuning::default());
        assert_eq!(config.sync, SyncTuning::default());
    }

    #[test]
    fn tolerances_are_overridable() {
        let config = Config::from_lookup(lookup_from(&[
            ("WIKIMIRROR_UNDERCOUNT_RATIO", "0.5"),
            ("WIKIMIRROR_FUZZY_SLACK", "9"),
            ("WIKIMIRROR_CONCURRENCY", "0"),
        ]))
        .expect("config");
        assert_eq!(config.fetch.undercount_ratio, 0.5);
        assert_eq!(config.fetch.fuzzy_slack, 9);
        assert_eq!(config.sync.content_concurrency, 1);
    }

    #[test]
    fn malformed_values_are_fatal() {
        let err = Config::from_lookup(lookup_from(&[("WIKIMIRROR_MAX_ATTEMPTS", "lots")]))
            .expect_err("malformed attempts");
        assert!(matches!(err, AppError::Config(_)));

        let err = Config::from_lookup(lookup_from(&[("WIKIMIRROR_FUZZY_RATIO", "1.5")]))
            .expect_err("ratio out of range");
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn claim_lease_outside_bounds_is_fatal() {
        for raw in ["9223372036854775807", "-5", "604801"] {
            let err = Config::from_lookup(lookup_from(&[("WIKIMIRROR_CLAIM_LEASE_SECS", raw)]))
                .expect_err("lease out of range");
            assert!(matches!(err, AppError::Config(_)), "{}", raw);
        }
        let config = Config::from_lookup(lookup_from(&[("WIKIMIRROR_CLAIM_LEASE_SECS", "604800")]))
            .expect("config");
        assert_eq!(config.sync.claim_lease(), chrono::Duration::days(7));

        let tuning = SyncTuning {
            claim_lease_secs: i64::MAX,
            ..SyncTuning::default()
        };
        assert_eq!(tuning.claim_lease(), chrono::Duration::days(7));
    }
}
