//! redb table definitions shared by storage modules.

use redb::TableDefinition;

/// File name for the redb database within the configured DB directory.
pub const REDB_FILE_NAME: &str = "data.redb";

/// Page identity rows (`Page`, bincode-encoded).
pub const PAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("pages");
/// Temporal versions keyed by `(page_url, seq)`.
pub const PAGE_VERSIONS: TableDefinition<(&str, u32), &[u8]> =
    TableDefinition::new("page_versions");
/// Sequence number of each page's open version.
pub const CURRENT_VERSIONS: TableDefinition<&str, u32> = TableDefinition::new("current_versions");

/// Attributions keyed by `(page_url, version_seq, user_id, role)`.
pub const ATTRIBUTIONS: TableDefinition<(&str, u32, &str, &str), &[u8]> =
    TableDefinition::new("attributions");
/// Vote observations keyed by `(page_url, user_id, cast_at_millis)`.
pub const VOTES: TableDefinition<(&str, &str, i64), &[u8]> = TableDefinition::new("votes");
/// Revisions keyed by `(page_url, revision_number)`.
pub const REVISIONS: TableDefinition<(&str, u32), &[u8]> = TableDefinition::new("revisions");
/// Upstream users keyed by id.
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Dirty-page records keyed by url.
pub const DIRTY_PAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("dirty_pages");
/// State index `(state_code, url)` kept in step with `DIRTY_PAGES`.
pub const DIRTY_BY_STATE: TableDefinition<(u8, &str), ()> = TableDefinition::new("dirty_by_state");

/// Derived per-user stats.
pub const USER_STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("user_stats");
/// Derived per-series occupancy.
pub const SERIES_STATS: TableDefinition<u32, &[u8]> = TableDefinition::new("series_stats");
/// Derived per-page scores.
pub const PAGE_SCORES: TableDefinition<&str, &[u8]> = TableDefinition::new("page_scores");
/// Single-row site totals under [`SITE_STATS_KEY`].
pub const SITE_STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("site_stats");
pub const SITE_STATS_KEY: &str = "site";

/// Batch-task watermarks keyed by task name.
pub const TASK_WATERMARKS: TableDefinition<&str, &[u8]> = TableDefinition::new("task_watermarks");
