//! Shared test-only helpers for wikimirror_core.

use crate::db::Database;
use crate::fetch::Sleeper;
use crate::models::page::PageVersion;
use crate::upstream::{
    ListedPage, PageDetail, Paginated, Response, RevisionRecord, Upstream, UpstreamError,
    UpstreamUser, VoteRecord,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Creates an isolated temporary database and returns it with the temp dir.
///
/// Keep the [`TempDir`] alive for the full test to preserve the backing files.
///
/// # Panics
/// Panics if temp-dir creation or database initialization fails.
pub(crate) fn setup_temp_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("db");
    let db = Database::new(db_path.to_str().expect("db path")).expect("db");
    (db, temp_dir)
}

/// Fixed test clock: `1_700_000_000 + secs`.
pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("timestamp")
}

/// Asserts adjacent versions are contiguous and exactly one is open.
///
/// # Panics
/// Panics on the first boundary or open-version violation.
pub(crate) fn assert_versions_contiguous(versions: &[PageVersion]) {
    for pair in versions.windows(2) {
        assert_eq!(
            pair[0].valid_to,
            Some(pair[1].valid_from),
            "boundary drift between seq {} and {}",
            pair[0].seq,
            pair[1].seq
        );
    }
    let open = versions.iter().filter(|v| v.is_open()).count();
    assert_eq!(open, 1, "expected exactly one open version, found {}", open);
}

/// [`Sleeper`] that records requested delays instead of sleeping.
#[derive(Default)]
pub(crate) struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub(crate) fn recorded(&self) -> Vec<Duration> {
        self.delays.lock().expect("sleeper lock").clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.lock().expect("sleeper lock").push(duration);
    }
}

/// One page held by [`FakeUpstream`].
#[derive(Debug, Clone)]
pub(crate) struct FakePage {
    pub listed: ListedPage,
    pub detail: PageDetail,
    pub votes: Vec<VoteRecord>,
    pub revisions: Vec<RevisionRecord>,
}

impl FakePage {
    /// A live page with `votes` and consistent counters.
    pub(crate) fn new(url: &str, title: &str, tags: &[&str], votes: Vec<VoteRecord>) -> Self {
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        let rating = crate::votes::reconcile_page(
            url,
            &votes
                .iter()
                .filter_map(|v| {
                    Some(crate::models::activity::Vote {
                        page_url: url.to_string(),
                        user_id: v.user_id.clone(),
                        direction: crate::models::activity::VoteDirection::from_value(
                            v.direction,
                        )?,
                        cast_at: v.cast_at,
                        version_seq: None,
                    })
                })
                .collect::<Vec<_>>(),
        );
        let revisions = vec![RevisionRecord {
            number: 0,
            created_at: at(0),
            user_id: Some("creator".to_string()),
            user_name: Some("Creator".to_string()),
            comment: "created".to_string(),
            kind: "source".to_string(),
        }];
        let listed = ListedPage {
            url: url.to_string(),
            upstream_id: None,
            title: title.to_string(),
            tags: tags.clone(),
            rating: Some(rating.rating()),
            vote_count: Some(rating.vote_count()),
            revision_count: Some(revisions.len() as u32),
            created_at: Some(at(0)),
            is_deleted: false,
        };
        let detail = PageDetail {
            url: url.to_string(),
            upstream_id: None,
            title: title.to_string(),
            tags,
            rating: listed.rating,
            vote_count: listed.vote_count,
            revision_count: listed.revision_count,
            content: Some(format!("content of {}", title)),
            created_at: Some(at(0)),
            created_by: Some(UpstreamUser {
                id: "creator".to_string(),
                name: Some("Creator".to_string()),
            }),
            attributions: Vec::new(),
            is_deleted: false,
        };
        Self {
            listed,
            detail,
            votes,
            revisions,
        }
    }
}

/// Vote record helper.
pub(crate) fn vote_record(user: &str, direction: i64, secs: i64) -> VoteRecord {
    VoteRecord {
        user_id: user.to_string(),
        user_name: Some(user.to_uppercase()),
        direction,
        cast_at: at(secs),
    }
}

#[derive(Default)]
struct FakeState {
    pages: BTreeMap<String, FakePage>,
    failures: BTreeMap<String, VecDeque<UpstreamError>>,
    vote_caps: BTreeMap<String, usize>,
    calls: Vec<String>,
}

/// Scripted in-memory upstream.
///
/// Cursors are decimal offsets. Failures queued with [`FakeUpstream::fail`]
/// are returned (one per call) before the real response for that operation
/// key: `list`, `detail:<url>`, `votes:<url>` or `revisions:<url>`.
#[derive(Default)]
pub(crate) struct FakeUpstream {
    state: Mutex<FakeState>,
}

impl FakeUpstream {
    pub(crate) fn with_pages(pages: Vec<FakePage>) -> Self {
        let upstream = Self::default();
        for page in pages {
            upstream.put(page);
        }
        upstream
    }

    pub(crate) fn put(&self, page: FakePage) {
        let mut state = self.state.lock().expect("fake lock");
        state.pages.insert(page.listed.url.clone(), page);
    }

    pub(crate) fn remove(&self, url: &str) {
        self.state.lock().expect("fake lock").pages.remove(url);
    }

    pub(crate) fn edit<F: FnOnce(&mut FakePage)>(&self, url: &str, f: F) {
        let mut state = self.state.lock().expect("fake lock");
        f(state.pages.get_mut(url).expect("fake page"));
    }

    pub(crate) fn fail(&self, key: &str, errors: Vec<UpstreamError>) {
        let mut state = self.state.lock().expect("fake lock");
        state
            .failures
            .entry(key.to_string())
            .or_default()
            .extend(errors);
    }

    /// Return at most `cap` votes for `url`, simulating a throttled partial.
    pub(crate) fn cap_votes(&self, url: &str, cap: Option<usize>) {
        let mut state = self.state.lock().expect("fake lock");
        match cap {
            Some(cap) => state.vote_caps.insert(url.to_string(), cap),
            None => state.vote_caps.remove(url),
        };
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().expect("fake lock").calls.clone()
    }

    fn enter(&self, key: String) -> Result<std::sync::MutexGuard<'_, FakeState>, UpstreamError> {
        let mut state = self.state.lock().expect("fake lock");
        state.calls.push(key.clone());
        if let Some(err) = state.failures.get_mut(&key).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(state)
    }
}

fn offset(cursor: Option<&str>) -> Result<usize, UpstreamError> {
    cursor
        .map(|c| {
            c.parse::<usize>()
                .map_err(|_| UpstreamError::Malformed(format!("bad cursor {}", c)))
        })
        .unwrap_or(Ok(0))
}

fn paginate<T: Clone>(
    items: &[T],
    cursor: Option<&str>,
    limit: usize,
) -> Result<Paginated<T>, UpstreamError> {
    let start = offset(cursor)?.min(items.len());
    let end = (start + limit.max(1)).min(items.len());
    Ok(Paginated {
        items: items[start..end].to_vec(),
        next_cursor: (end < items.len()).then(|| end.to_string()),
        total: Some(items.len() as u64),
    })
}

impl Upstream for FakeUpstream {
    fn list_pages(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Response<Paginated<ListedPage>>, UpstreamError> {
        let state = self.enter("list".to_string())?;
        let listed: Vec<ListedPage> = state.pages.values().map(|p| p.listed.clone()).collect();
        Ok(Response::new(paginate(&listed, cursor, limit)?))
    }

    fn page_detail(&self, url: &str) -> Result<Response<PageDetail>, UpstreamError> {
        let state = self.enter(format!("detail:{}", url))?;
        state
            .pages
            .get(url)
            .map(|p| Response::new(p.detail.clone()))
            .ok_or(UpstreamError::NotFound)
    }

    fn page_votes(
        &self,
        url: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Response<Paginated<VoteRecord>>, UpstreamError> {
        let state = self.enter(format!("votes:{}", url))?;
        let page = state.pages.get(url).ok_or(UpstreamError::NotFound)?;
        let votes = match state.vote_caps.get(url) {
            Some(cap) => &page.votes[..(*cap).min(page.votes.len())],
            None => &page.votes[..],
        };
        Ok(Response::new(paginate(votes, cursor, limit)?))
    }

    fn page_revisions(
        &self,
        url: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Response<Paginated<RevisionRecord>>, UpstreamError> {
        let state = self.enter(format!("revisions:{}", url))?;
        let page = state.pages.get(url).ok_or(UpstreamError::NotFound)?;
        Ok(Response::new(paginate(&page.revisions, cursor, limit)?))
    }
}
