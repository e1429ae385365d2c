//! Shared constants used across wikimirror crates.

/// Default upstream query endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://apiv1.crom.avn.sh/graphql";

/// Default site base URL whose pages are mirrored.
pub const DEFAULT_SITE: &str = "http://scp-wiki-cn.wikidot.com";

/// Skip-if-unchanged threshold: existing and expected sizes this close are not refetched.
pub const DEFAULT_UNCHANGED_THRESHOLD: u64 = 2;
/// Fetched payloads below this share of the expected size are treated as throttled partials.
pub const DEFAULT_UNDERCOUNT_RATIO: f64 = 0.30;
/// Relative tolerance for the upstream's fuzzy counters.
pub const DEFAULT_FUZZY_RATIO: f64 = 0.15;
/// Absolute tolerance for the upstream's fuzzy counters.
pub const DEFAULT_FUZZY_SLACK: u64 = 5;

/// Maximum attempts per fetch before falling back or failing.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// First backoff delay in milliseconds.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
/// Upper bound for any single backoff delay in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
/// Cap on the consecutive-throttle backoff multiplier.
pub const DEFAULT_THROTTLE_MULTIPLIER_CAP: u32 = 16;
/// Remaining request budget at which the fetcher waits for the budget reset.
pub const DEFAULT_BUDGET_RESERVE: u64 = 5;

/// Listing page size for discovery.
pub const DEFAULT_LISTING_PAGE_SIZE: usize = 100;
/// Vote and revision page size for the content stage.
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 100;
/// Pages processed concurrently by the content stage.
pub const DEFAULT_CONTENT_CONCURRENCY: usize = 2;
/// Pause between listing batches in milliseconds.
pub const DEFAULT_BATCH_PAUSE_MS: u64 = 250;

/// Checkpoint generations kept per kind after a successful pass.
pub const DEFAULT_CHECKPOINT_KEEP: usize = 3;
/// Pages processed between checkpoint saves.
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 20;
/// Seconds after which an in-flight claim may be taken over.
pub const DEFAULT_CLAIM_LEASE_SECS: i64 = 900;
/// Longest accepted claim lease (one week).
pub const MAX_CLAIM_LEASE_SECS: i64 = 7 * 24 * 60 * 60;

/// Checkpoint payload schema understood by this build.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;
/// File extension for committed checkpoint slots.
pub const CHECKPOINT_EXTENSION: &str = "json";
/// Prefix for in-flight checkpoint temp files.
pub const CHECKPOINT_TMP_PREFIX: &str = ".tmp-";

/// Owner lock file held by the active sync process.
pub const DB_OWNER_LOCK_FILE_NAME: &str = "db.owner.lock";

/// Tag marking original (non-translated) works.
pub const ORIGINAL_TAG: &str = "原创";
/// Tags marking structural pages whose votes belong elsewhere.
pub const STRUCTURAL_TAGS: &[&str] = &["fragment", "_component", "component"];
/// Tag marking fragment pages excluded from aggregation.
pub const FRAGMENT_TAG: &str = "fragment";

/// Clock skew tolerated between adjacent version boundaries, in milliseconds.
pub const BOUNDARY_SKEW_TOLERANCE_MS: i64 = 1_000;

/// Slug prefix of numbered series pages (`scp-cn-173`).
pub const SERIES_SLUG_PREFIX: &str = "scp-cn-";
/// Slots per numbering series.
pub const SERIES_BLOCK_SIZE: u32 = 1000;

/// Highest series whose number range still fits in a `u32`.
pub const MAX_SERIES: u32 = u32::MAX / SERIES_BLOCK_SIZE;
/// Normal quantile used for the Wilson lower bound (95% confidence).
pub const WILSON_Z: f64 = 1.96;
