//! Dirty-page work queue records and the explicit phase state machine.
//!
//! A page moves through `Clean -> NeedsB -> InB -> (Clean | NeedsC)` and
//! `NeedsC -> InC -> Clean`. Every mutation goes through [`DirtyPage`]
//! methods, which reject transitions not listed in
//! [`PhaseState::can_transition_to`].

use crate::error::AppError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Processing phase that consumes dirty pages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Full content, attribution, vote and revision fetch (phase B).
    Content,
    /// Full-history recount and boundary repair (phase C).
    Reconcile,
}

impl Phase {
    /// Short name used in logs and watermarks.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Reconcile => "reconcile",
        }
    }

    /// State a page waits in before this phase claims it.
    pub fn pending_state(self) -> PhaseState {
        match self {
            Self::Content => PhaseState::NeedsB,
            Self::Reconcile => PhaseState::NeedsC,
        }
    }

    /// State a page holds while this phase processes it.
    pub fn in_flight_state(self) -> PhaseState {
        match self {
            Self::Content => PhaseState::InB,
            Self::Reconcile => PhaseState::InC,
        }
    }
}

/// Queue state of one page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhaseState {
    Clean,
    NeedsB,
    InB,
    NeedsC,
    InC,
}

impl PhaseState {
    /// All states, in index order.
    pub const ALL: [PhaseState; 5] = [
        PhaseState::Clean,
        PhaseState::NeedsB,
        PhaseState::InB,
        PhaseState::NeedsC,
        PhaseState::InC,
    ];

    /// Compact code used as the state-index key prefix.
    pub fn code(self) -> u8 {
        match self {
            Self::Clean => 0,
            Self::NeedsB => 1,
            Self::InB => 2,
            Self::NeedsC => 3,
            Self::InC => 4,
        }
    }

    /// Legal transitions. Self-loops on `InB`/`InC` model lease takeover.
    pub fn can_transition_to(self, next: PhaseState) -> bool {
        use PhaseState::*;
        matches!(
            (self, next),
            (Clean, NeedsB)
                | (Clean, NeedsC)
                | (NeedsB, NeedsB)
                | (NeedsB, InB)
                | (InB, InB)
                | (InB, Clean)
                | (InB, NeedsB)
                | (InB, NeedsC)
                | (NeedsC, NeedsB)
                | (NeedsC, NeedsC)
                | (NeedsC, InC)
                | (InC, InC)
                | (InC, Clean)
                | (InC, NeedsB)
                | (InC, NeedsC)
        )
    }
}

/// Why a page entered the queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DriftReason {
    NewPage,
    Title,
    Tags,
    Rating,
    VoteCount,
    RevisionCount,
    Deleted,
    Disappeared,
    BoundaryDefect,
    CountMismatch,
    FetchFallback,
    Manual,
}

impl DriftReason {
    /// Reasons that always warrant a deep reconciliation pass.
    pub fn requires_reconcile(self) -> bool {
        matches!(
            self,
            Self::BoundaryDefect | Self::CountMismatch | Self::FetchFallback
        )
    }
}

/// Active claim on a dirty page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimInfo {
    pub token: Uuid,
    pub phase: Phase,
    pub claimed_at: DateTime<Utc>,
}

/// Handle returned to the worker that won a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub url: String,
    pub phase: Phase,
    pub token: Uuid,
}

/// Per-page work-queue record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirtyPage {
    pub url: String,
    pub state: PhaseState,
    pub reasons: Vec<DriftReason>,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claim: Option<ClaimInfo>,
    pub attempts_b: u32,
    pub attempts_c: u32,
    pub done_b_at: Option<DateTime<Utc>>,
    pub done_c_at: Option<DateTime<Utc>>,
    pub rearm: bool,
    pub last_error: Option<String>,
}

impl DirtyPage {
    /// Create a clean record for `url`.
    pub fn new(url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            state: PhaseState::Clean,
            reasons: Vec::new(),
            detected_at: now,
            updated_at: now,
            claim: None,
            attempts_b: 0,
            attempts_c: 0,
            done_b_at: None,
            done_c_at: None,
            rearm: false,
            last_error: None,
        }
    }

    /// Phase B still owes work on this page.
    pub fn need_phase_b(&self) -> bool {
        matches!(self.state, PhaseState::NeedsB | PhaseState::InB)
    }

    /// Phase C still owes work on this page.
    pub fn need_phase_c(&self) -> bool {
        matches!(self.state, PhaseState::NeedsC | PhaseState::InC)
    }

    fn transition(&mut self, next: PhaseState, now: DateTime<Utc>) -> Result<(), AppError> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                url: self.url.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    fn add_reasons(&mut self, reasons: &[DriftReason]) {
        for reason in reasons {
            if !self.reasons.contains(reason) {
                self.reasons.push(*reason);
            }
        }
        self.reasons.sort();
    }

    /// Flag the page for a content fetch.
    ///
    /// A page already in flight keeps its state and is re-armed so it returns
    /// to `NeedsB` once the running stage finishes.
    pub fn mark_needs_b(
        &mut self,
        reasons: &[DriftReason],
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if self.state == PhaseState::Clean {
            self.detected_at = now;
        }
        self.add_reasons(reasons);
        match self.state {
            PhaseState::InB | PhaseState::InC => {
                self.rearm = true;
                self.updated_at = now;
                Ok(())
            }
            _ => self.transition(PhaseState::NeedsB, now),
        }
    }

    /// Flag the page for deep reconciliation.
    ///
    /// Pages still owed a content fetch keep their state; the recorded reason
    /// routes them to `NeedsC` when phase B completes.
    pub fn mark_needs_c(&mut self, reason: DriftReason, now: DateTime<Utc>) -> Result<(), AppError> {
        self.add_reasons(&[reason]);
        match self.state {
            PhaseState::Clean => {
                self.detected_at = now;
                self.transition(PhaseState::NeedsC, now)
            }
            _ => {
                self.updated_at = now;
                Ok(())
            }
        }
    }

    /// `true` when `phase` may claim this page at `now`.
    pub fn is_claimable(&self, phase: Phase, now: DateTime<Utc>, lease: Duration) -> bool {
        if self.state == phase.pending_state() {
            return true;
        }
        if self.state != phase.in_flight_state() {
            return false;
        }
        match self.claim {
            Some(claim) => claim.claimed_at + lease <= now,
            None => true,
        }
    }

    /// Take the page for `phase`.
    ///
    /// # Errors
    /// Returns [`AppError::InvalidTransition`] when the page is not claimable.
    pub fn claim(
        &mut self,
        phase: Phase,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<ClaimInfo, AppError> {
        if !self.is_claimable(phase, now, lease) {
            return Err(AppError::InvalidTransition {
                url: self.url.clone(),
                from: self.state,
                to: phase.in_flight_state(),
            });
        }
        if let Some(stale) = self.claim {
            tracing::warn!(
                url = %self.url,
                phase = phase.as_str(),
                stale_since = %stale.claimed_at,
                "Taking over expired claim"
            );
        }
        self.transition(phase.in_flight_state(), now)?;
        let info = ClaimInfo {
            token: Uuid::new_v4(),
            phase,
            claimed_at: now,
        };
        self.claim = Some(info);
        match phase {
            Phase::Content => self.attempts_b = self.attempts_b.saturating_add(1),
            Phase::Reconcile => self.attempts_c = self.attempts_c.saturating_add(1),
        }
        Ok(info)
    }

    fn holds_claim(&self, phase: Phase, token: Uuid) -> bool {
        self.state == phase.in_flight_state()
            && self
                .claim
                .map(|claim| claim.token == token && claim.phase == phase)
                .unwrap_or(false)
    }

    /// Finish a claimed phase.
    ///
    /// # Returns
    /// `Ok(false)` when the claim is no longer held (already completed or
    /// taken over); completing twice is a no-op.
    pub fn complete(
        &mut self,
        phase: Phase,
        token: Uuid,
        needs_reconcile: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        if !self.holds_claim(phase, token) {
            return Ok(false);
        }
        let next = match phase {
            _ if self.rearm => PhaseState::NeedsB,
            Phase::Content
                if needs_reconcile || self.reasons.iter().any(|r| r.requires_reconcile()) =>
            {
                PhaseState::NeedsC
            }
            _ => PhaseState::Clean,
        };
        self.transition(next, now)?;
        match phase {
            Phase::Content => self.done_b_at = Some(now),
            Phase::Reconcile => self.done_c_at = Some(now),
        }
        self.claim = None;
        self.rearm = false;
        self.last_error = None;
        if next == PhaseState::Clean {
            self.reasons.clear();
        }
        Ok(true)
    }

    /// Return a claimed page to its pending state after a failure.
    ///
    /// # Returns
    /// `Ok(false)` when the claim is no longer held.
    pub fn release(
        &mut self,
        phase: Phase,
        token: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        if !self.holds_claim(phase, token) {
            return Ok(false);
        }
        let next = if self.rearm {
            PhaseState::NeedsB
        } else {
            phase.pending_state()
        };
        self.transition(next, now)?;
        self.claim = None;
        self.rearm = false;
        self.last_error = Some(error.to_string());
        Ok(true)
    }
}
