//! Persisted row types shared by the store gateway, the datastore façade,
//! and the dispatcher.
//!
//! Each struct mirrors one table of the wide-column schema:
//! - `DomainInfo` -> `domain_info`, keyed by registerable domain
//! - `LinkRow` -> `links`, keyed by the five-tuple `(dom, subdom, path, proto, time)`
//! - `SegmentRow` -> `segments`, keyed by `(dom, subdom, path, proto)`

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The "unclaimed" sentinel written into `domain_info.claim_tok`.
///
/// The column is indexed, so the schema cannot use null for "no owner";
/// the all-zero UUID stands in for it.
pub const ZERO_TOKEN: Uuid = Uuid::nil();

/// Separator for multi-valued HTTP headers stored in a single map value.
pub const HEADER_JOIN: char = '\u{0}';

/// The epoch sentinel stored in `links.time` for a URL that has been parsed
/// out of a page but never fetched.
pub fn not_yet_crawled() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).unwrap()
}

/// A domain priority class.
///
/// Priorities bias how often a domain is handed out by `claim_new_host`:
/// in steady state a priority-4 domain is claimed twice as often as a
/// priority-2 one. Only the eleven values in [`Priority::ALLOWED`] are
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i8);

impl Priority {
    /// The closed set of admissible priority classes.
    pub const ALLOWED: [Priority; 11] = [
        Priority(5),
        Priority(4),
        Priority(3),
        Priority(2),
        Priority(1),
        Priority(0),
        Priority(-1),
        Priority(-2),
        Priority(-3),
        Priority(-4),
        Priority(-5),
    ];

    /// The highest admissible priority.
    pub const MAX: Priority = Priority(5);

    pub fn is_valid(self) -> bool {
        Self::ALLOWED.contains(&self)
    }

    pub fn value(self) -> i8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(0)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:+}", self.0)
    }
}

/// Row of the `domain_info` table.
#[derive(Debug, Clone)]
pub struct DomainInfo {
    /// Registerable domain (TLD+1), e.g. `example.com`.
    pub dom: String,

    /// Claim-frequency bias.
    pub priority: Priority,

    /// Token of the owning fetcher; [`ZERO_TOKEN`] when unclaimed.
    pub claim_tok: Uuid,

    /// Wall-clock time of the most recent claim. Retained after release.
    pub claim_time: DateTime<Utc>,

    /// True iff a segment exists for this domain and is ready to be claimed.
    pub dispatched: bool,

    /// Soft exclusion: an excluded domain is never dispatched.
    pub excluded: bool,
    pub exclude_reason: Option<String>,

    /// Dispatcher-maintained statistics. Stale between passes is acceptable.
    pub tot_links: u64,
    pub uncrawled_links: u64,
    pub queued_links: u64,

    /// Last time the dispatcher built a non-empty segment for this domain.
    pub last_dispatch: DateTime<Utc>,

    /// Last time a dispatcher pass found nothing to dispatch.
    pub last_empty_dispatch: DateTime<Utc>,
}

impl DomainInfo {
    /// A fresh, unclaimed, undispatched row for a newly discovered domain.
    pub fn new(dom: impl Into<String>, priority: Priority) -> Self {
        Self {
            dom: dom.into(),
            priority,
            claim_tok: ZERO_TOKEN,
            claim_time: not_yet_crawled(),
            dispatched: false,
            excluded: false,
            exclude_reason: None,
            tot_links: 0,
            uncrawled_links: 0,
            queued_links: 0,
            last_dispatch: not_yet_crawled(),
            last_empty_dispatch: not_yet_crawled(),
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claim_tok != ZERO_TOKEN
    }
}

/// Four-column key shared by `links` (as its partition+clustering prefix)
/// and `segments` (as its full key).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UrlKey {
    pub dom: String,
    pub subdom: String,
    pub path: String,
    pub proto: String,
}

impl UrlKey {
    pub fn new(
        dom: impl Into<String>,
        subdom: impl Into<String>,
        path: impl Into<String>,
        proto: impl Into<String>,
    ) -> Self {
        Self {
            dom: dom.into(),
            subdom: subdom.into(),
            path: path.into(),
            proto: proto.into(),
        }
    }

    /// Full host, `subdom.dom` or bare `dom`.
    pub fn host(&self) -> String {
        if self.subdom.is_empty() {
            self.dom.clone()
        } else {
            format!("{}.{}", self.subdom, self.dom)
        }
    }
}

/// Row of the `links` table.
///
/// `time` makes this an append-only per-URL history: the epoch row records
/// the original parse and is never rewritten; every fetch attempt appends a
/// new row.
#[derive(Debug, Clone)]
pub struct LinkRow {
    pub key: UrlKey,
    pub time: DateTime<Utc>,

    pub status: Option<i32>,
    pub error: Option<String>,
    pub robots_excluded: bool,
    pub redto_url: Option<String>,
    pub getnow: bool,
    pub mime: Option<String>,
    pub fnv: Option<i64>,
    pub body: Option<String>,

    /// Response headers; multi-valued headers are joined with [`HEADER_JOIN`].
    pub headers: Option<HashMap<String, String>>,
}

impl LinkRow {
    /// A bare epoch row for a freshly parsed URL.
    pub fn parsed(key: UrlKey) -> Self {
        Self::at(key, not_yet_crawled())
    }

    /// A bare row at an arbitrary fetch time.
    pub fn at(key: UrlKey, time: DateTime<Utc>) -> Self {
        Self {
            key,
            time,
            status: None,
            error: None,
            robots_excluded: false,
            redto_url: None,
            getnow: false,
            mime: None,
            fnv: None,
            body: None,
            headers: None,
        }
    }

    pub fn is_uncrawled(&self) -> bool {
        self.time == not_yet_crawled()
    }
}

/// Row of the `segments` table: one URL chosen for a domain's next crawl
/// batch. `time` is the last-crawled timestamp the fetcher should send as
/// `If-Modified-Since` (the epoch sentinel for never-crawled URLs).
#[derive(Debug, Clone)]
pub struct SegmentRow {
    pub key: UrlKey,
    pub time: DateTime<Utc>,
}

/// Statistics written back to `domain_info` when a segment is published.
#[derive(Debug, Clone, Copy)]
pub struct DispatchStats {
    pub tot_links: u64,
    pub uncrawled_links: u64,
    pub queued_links: u64,
    pub last_dispatch: DateTime<Utc>,
}
