//! Rate-limit-safe fetch protocol.
//!
//! [`Fetcher`] wraps upstream calls with throttle detection, capped
//! exponential backoff, rate-budget pacing and a data-quality gate. Its core
//! guarantee: a fetch assessed as incomplete never replaces non-empty local
//! data with less-complete data. Throttle counters and the protection cache
//! live on the instance; callers share it by handle.

/// Retry pacing and the sleep seam.
pub mod policy;
/// Payload assessment.
pub mod quality;

use crate::config::FetchTuning;
use crate::upstream::{RateBudget, Response, UpstreamError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub use policy::{ExponentialBackoff, RetryPolicy, Sleeper, ThreadSleeper};
pub use quality::{Quality, QualityGate};

/// Size of a fetched payload, compared against upstream counters.
pub trait Measured {
    fn measured_size(&self) -> u64;
}

impl<T> Measured for Vec<T> {
    fn measured_size(&self) -> u64 {
        self.len() as u64
    }
}

/// What to fetch and what is already known about it.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Identity used in logs and the protection cache.
    pub target: &'a str,
    /// Size advertised by the upstream, when known.
    pub expected: Option<u64>,
    /// Size of the data already stored locally.
    pub existing: u64,
    /// Allow the skip-if-unchanged short circuit.
    pub skip_unchanged: bool,
}

impl<'a> FetchRequest<'a> {
    pub fn new(target: &'a str, expected: Option<u64>, existing: u64) -> Self {
        Self {
            target,
            expected,
            existing,
            skip_unchanged: true,
        }
    }

    /// Always go to the upstream, even when the counts match.
    pub fn always_fetch(mut self) -> Self {
        self.skip_unchanged = false;
        self
    }
}

/// Machine-readable reason attached to every fetch outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchReason {
    Unchanged,
    Complete,
    WithinTolerance,
    NoExpectation,
    PartialImprovement,
    BestEffort,
    EmptyPayload,
    Undercount,
    Partial,
    Throttled,
    Transient,
    Malformed,
    NotFound,
    Fatal,
}

impl FetchReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Complete => "complete",
            Self::WithinTolerance => "within_tolerance",
            Self::NoExpectation => "no_expectation",
            Self::PartialImprovement => "partial_improvement",
            Self::BestEffort => "best_effort",
            Self::EmptyPayload => "empty_payload",
            Self::Undercount => "undercount",
            Self::Partial => "partial",
            Self::Throttled => "throttled",
            Self::Transient => "transient",
            Self::Malformed => "malformed",
            Self::NotFound => "not_found",
            Self::Fatal => "fatal",
        }
    }

    fn from_error(err: &UpstreamError) -> Self {
        match err {
            UpstreamError::RateLimited { .. } => Self::Throttled,
            UpstreamError::Transient(_) => Self::Transient,
            UpstreamError::Malformed(_) => Self::Malformed,
            UpstreamError::NotFound => Self::NotFound,
            UpstreamError::Fatal(_) => Self::Fatal,
        }
    }

    fn from_quality(quality: Quality) -> Self {
        match quality {
            Quality::Unbounded => Self::NoExpectation,
            Quality::Complete => Self::Complete,
            Quality::WithinTolerance => Self::WithinTolerance,
            Quality::Partial => Self::Partial,
            Quality::Undercount => Self::Undercount,
            Quality::Empty => Self::EmptyPayload,
        }
    }
}

/// Terminal result of [`Fetcher::fetch`].
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    /// New data should be written. `complete` is false for best-effort payloads.
    Accepted {
        data: T,
        complete: bool,
        reason: FetchReason,
        attempts: u32,
    },
    /// Keep the locally stored data.
    UseExisting { reason: FetchReason },
    /// Nothing usable locally and retries are exhausted.
    Failed {
        reason: FetchReason,
        error: Option<UpstreamError>,
    },
}

impl<T> FetchOutcome<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Accepted { complete: true, .. })
    }

    pub fn use_existing(&self) -> bool {
        matches!(self, Self::UseExisting { .. })
    }

    pub fn reason(&self) -> FetchReason {
        match self {
            Self::Accepted { reason, .. }
            | Self::UseExisting { reason }
            | Self::Failed { reason, .. } => *reason,
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            Self::Accepted { data, .. } => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ThrottleState {
    consecutive: u32,
    multiplier: u32,
}

impl Default for ThrottleState {
    fn default() -> Self {
        Self {
            consecutive: 0,
            multiplier: 1,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared fetch wrapper owning throttle state and the protection cache.
pub struct Fetcher {
    gate: QualityGate,
    policy: RetryPolicy,
    budget_reserve: u64,
    sleeper: Arc<dyn Sleeper>,
    throttle: Mutex<ThrottleState>,
    budget: Mutex<Option<RateBudget>>,
    protected: Mutex<BTreeMap<String, FetchReason>>,
}

impl Fetcher {
    /// Build a fetcher from configuration.
    pub fn new(tuning: &FetchTuning, sleeper: Arc<dyn Sleeper>) -> Self {
        Self::with_policy(
            QualityGate::from_tuning(tuning),
            RetryPolicy::from_tuning(tuning),
            tuning.budget_reserve,
            sleeper,
        )
    }

    /// Build a fetcher from explicit components.
    pub fn with_policy(
        gate: QualityGate,
        policy: RetryPolicy,
        budget_reserve: u64,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            gate,
            policy,
            budget_reserve,
            sleeper,
            throttle: Mutex::new(ThrottleState::default()),
            budget: Mutex::new(None),
            protected: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    /// Number of rate-limit responses seen since the last success.
    pub fn consecutive_throttles(&self) -> u32 {
        lock(&self.throttle).consecutive
    }

    /// Current backoff multiplier.
    pub fn throttle_multiplier(&self) -> u32 {
        lock(&self.throttle).multiplier
    }

    /// Targets whose local data was protected from a worse fetch.
    pub fn protected_targets(&self) -> Vec<(String, FetchReason)> {
        lock(&self.protected)
            .iter()
            .map(|(target, reason)| (target.clone(), *reason))
            .collect()
    }

    /// Remove and return the protection record for `target`.
    pub fn take_protection(&self, target: &str) -> Option<FetchReason> {
        lock(&self.protected).remove(target)
    }

    /// Explicit pause through the injected sleeper (inter-batch pacing).
    pub fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            self.sleeper.sleep(duration);
        }
    }

    /// Record the budget reported by an upstream response.
    pub fn observe_budget(&self, budget: Option<RateBudget>) {
        if let Some(budget) = budget {
            *lock(&self.budget) = Some(budget);
        }
    }

    /// Sleep until the budget resets when the remaining quota is at the reserve.
    pub fn pace(&self) {
        let Some(budget) = *lock(&self.budget) else {
            return;
        };
        if budget.remaining > self.budget_reserve {
            return;
        }
        let wait = budget
            .reset_at
            .and_then(|reset_at| (reset_at - Utc::now()).to_std().ok())
            .unwrap_or_else(|| self.policy.backoff.delay(0))
            .min(self.policy.backoff.max());
        tracing::info!(
            remaining = budget.remaining,
            wait_ms = wait.as_millis() as u64,
            "Rate budget at reserve; waiting for reset"
        );
        self.sleeper.sleep(wait);
        *lock(&self.budget) = None;
    }

    fn on_success(&self) {
        let mut throttle = lock(&self.throttle);
        throttle.consecutive = 0;
        throttle.multiplier = (throttle.multiplier / 2).max(1);
    }

    fn on_throttle(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let multiplier = {
            let mut throttle = lock(&self.throttle);
            throttle.consecutive = throttle.consecutive.saturating_add(1);
            throttle.multiplier = throttle
                .multiplier
                .saturating_mul(2)
                .min(self.policy.multiplier_cap);
            throttle.multiplier
        };
        let computed = self.policy.delay(attempt, multiplier);
        retry_after
            .map(|hint| hint.max(computed))
            .unwrap_or(computed)
            .min(self.policy.backoff.max())
    }

    fn record_protection(&self, target: &str, reason: FetchReason) {
        lock(&self.protected).insert(target.to_string(), reason);
    }

    /// Retry a single upstream call without a quality gate.
    ///
    /// # Errors
    /// Returns the last upstream error once attempts are exhausted, or the
    /// first non-retryable error.
    pub fn call<T, F>(&self, target: &str, mut op: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Result<Response<T>, UpstreamError>,
    {
        let mut attempt = 1;
        loop {
            self.pace();
            let err = match op() {
                Ok(response) => {
                    self.observe_budget(response.budget);
                    self.on_success();
                    return Ok(response.data);
                }
                Err(err) => err,
            };
            if !err.is_retryable() || attempt >= self.policy.max_attempts {
                tracing::warn!(key = target, attempt, reason = err.code(), "Upstream call failed");
                return Err(err);
            }
            let delay = match &err {
                UpstreamError::RateLimited { retry_after } => {
                    self.on_throttle(attempt, *retry_after)
                }
                _ => self.policy.delay(attempt, 1),
            };
            tracing::debug!(
                key = target,
                attempt,
                reason = err.code(),
                delay_ms = delay.as_millis() as u64,
                "Retrying upstream call"
            );
            self.sleeper.sleep(delay);
            attempt += 1;
        }
    }

    /// Fetch a sized collection with skip-if-unchanged, quality gating and
    /// data-protection fallback.
    ///
    /// `op` receives the one-based attempt number.
    pub fn fetch<T, F>(&self, request: &FetchRequest<'_>, mut op: F) -> FetchOutcome<T>
    where
        T: Measured,
        F: FnMut(u32) -> Result<Response<T>, UpstreamError>,
    {
        if let Some(expected) = request.expected.filter(|_| request.skip_unchanged) {
            if self.gate.is_unchanged(expected, request.existing) {
                tracing::debug!(
                    key = request.target,
                    expected,
                    existing = request.existing,
                    "Skipping fetch; local data unchanged"
                );
                return FetchOutcome::UseExisting {
                    reason: FetchReason::Unchanged,
                };
            }
        }

        let mut best: Option<(T, u64)> = None;
        let mut last_reason = FetchReason::Transient;
        let mut last_error: Option<UpstreamError> = None;

        for attempt in 1..=self.policy.max_attempts {
            self.pace();
            let delay = match op(attempt) {
                Ok(response) => {
                    self.observe_budget(response.budget);
                    self.on_success();
                    let size = response.data.measured_size();
                    let quality = self.gate.assess(size, request.expected);
                    if quality.is_acceptable() {
                        return FetchOutcome::Accepted {
                            data: response.data,
                            complete: true,
                            reason: FetchReason::from_quality(quality),
                            attempts: attempt,
                        };
                    }
                    last_reason = FetchReason::from_quality(quality);
                    tracing::warn!(
                        key = request.target,
                        attempt,
                        fetched = size,
                        expected = request.expected,
                        reason = last_reason.code(),
                        "Fetched payload failed quality check"
                    );
                    if best.as_ref().map_or(true, |(_, best_size)| size > *best_size) {
                        best = Some((response.data, size));
                    }
                    self.policy.delay(attempt, 1)
                }
                Err(err) => {
                    last_reason = FetchReason::from_error(&err);
                    if !err.is_retryable() {
                        tracing::warn!(
                            key = request.target,
                            attempt,
                            reason = err.code(),
                            "Upstream rejected fetch"
                        );
                        return FetchOutcome::Failed {
                            reason: last_reason,
                            error: Some(err),
                        };
                    }
                    let delay = match &err {
                        UpstreamError::RateLimited { retry_after } => {
                            self.on_throttle(attempt, *retry_after)
                        }
                        _ => self.policy.delay(attempt, 1),
                    };
                    tracing::warn!(
                        key = request.target,
                        attempt,
                        reason = err.code(),
                        consecutive_throttles = self.consecutive_throttles(),
                        "Fetch attempt failed"
                    );
                    last_error = Some(err);
                    delay
                }
            };
            if attempt < self.policy.max_attempts {
                self.sleeper.sleep(delay);
            }
        }

        self.resolve_exhausted(request, best, last_reason, last_error)
    }

    fn resolve_exhausted<T>(
        &self,
        request: &FetchRequest<'_>,
        best: Option<(T, u64)>,
        last_reason: FetchReason,
        last_error: Option<UpstreamError>,
    ) -> FetchOutcome<T> {
        let attempts = self.policy.max_attempts;
        if request.existing > 0 {
            if let Some((data, size)) = best {
                let undercount = self.gate.is_undercount(size, request.expected);
                if size > request.existing && !undercount {
                    tracing::info!(
                        key = request.target,
                        fetched = size,
                        existing = request.existing,
                        "Accepting partial payload larger than local data"
                    );
                    return FetchOutcome::Accepted {
                        data,
                        complete: false,
                        reason: FetchReason::PartialImprovement,
                        attempts,
                    };
                }
            }
            tracing::warn!(
                key = request.target,
                existing = request.existing,
                reason = last_reason.code(),
                "Retries exhausted; keeping existing data"
            );
            self.record_protection(request.target, last_reason);
            return FetchOutcome::UseExisting {
                reason: last_reason,
            };
        }

        match best {
            Some((data, size)) if size > 0 => {
                tracing::warn!(
                    key = request.target,
                    fetched = size,
                    expected = request.expected,
                    "Retries exhausted; accepting best-effort payload"
                );
                FetchOutcome::Accepted {
                    data,
                    complete: false,
                    reason: FetchReason::BestEffort,
                    attempts,
                }
            }
            _ => {
                tracing::error!(
                    key = request.target,
                    attempts,
                    reason = last_reason.code(),
                    "Fetch failed with no usable local data"
                );
                FetchOutcome::Failed {
                    reason: last_reason,
                    error: last_error,
                }
            }
        }
    }
}
