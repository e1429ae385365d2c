//! Data models for the mirror's source-of-truth graph and derived views.

/// Votes, revisions, attributions and users.
pub mod activity;
/// Pages and temporal versions.
pub mod page;
/// Dirty-page work queue records and the phase state machine.
pub mod queue;
/// Derived aggregates and task watermarks.
pub mod stats;
