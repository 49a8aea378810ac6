//! Store gateway trait and error types
//!
//! Every persisted operation the control plane performs goes through the
//! [`Store`] trait: single-row reads, clustering-ordered scans, plain
//! writes, compare-and-set updates, and counter arithmetic. The production
//! implementation talks to a Cassandra-compatible cluster; the test suite
//! substitutes an in-memory implementation with the same semantics.

use crate::model::{DispatchStats, DomainInfo, LinkRow, Priority, SegmentRow, UrlKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to connect to store: {0}")]
    Session(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Failed to decode row: {0}")]
    Decode(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Typed access to the wide-column backend
///
/// Implementations own query construction and the transient-failure retry
/// policy. Callers rely on three semantic guarantees:
///
/// - `cas_*` methods are linearizable per row: of N concurrent calls against
///   the same precondition, at most one observes `true`.
/// - `scan_links` returns rows in clustering order, `(subdom, path, proto)`
///   ascending and then `time` ascending, so the last row of each URL group
///   is its most recent fetch.
/// - counter updates are commutative and survive concurrent increments.
#[async_trait]
pub trait Store: Send + Sync {
    // ===== domain_info =====

    /// CAS insert-if-absent. Returns true when this call created the row.
    async fn insert_domain_if_absent(&self, info: &DomainInfo) -> StoreResult<bool>;

    /// Single-row read by TLD+1.
    async fn find_domain(&self, dom: &str) -> StoreResult<Option<DomainInfo>>;

    /// Rewrites the soft-exclusion flag and reason.
    async fn set_domain_exclusion(
        &self,
        dom: &str,
        excluded: bool,
        reason: Option<&str>,
    ) -> StoreResult<()>;

    async fn set_domain_priority(&self, dom: &str, priority: Priority) -> StoreResult<()>;

    /// CAS claim: writes `claim_tok`/`claim_time` iff the domain is
    /// dispatched and currently unclaimed. Returns false when a peer won.
    async fn cas_claim_domain(
        &self,
        dom: &str,
        tok: Uuid,
        when: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Clears `dispatched`, `claim_tok`, and `queued_links`. Used both by
    /// the fetcher-side unclaim and by stranded-claim recovery.
    async fn release_domain(&self, dom: &str) -> StoreResult<()>;

    /// Marks a domain dispatched and records segment statistics.
    async fn mark_dispatched(&self, dom: &str, stats: DispatchStats) -> StoreResult<()>;

    async fn record_empty_dispatch(&self, dom: &str, when: DateTime<Utc>) -> StoreResult<()>;

    /// Pages `(dom, priority)` for unclaimed, dispatched domains, starting
    /// strictly after `cursor` in scan order. `None` starts from the top.
    async fn scan_claimable(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<(String, Priority)>>;

    /// Pages full rows ordered by domain, starting strictly after `seed`.
    async fn scan_domains(&self, seed: Option<&str>, limit: usize) -> StoreResult<Vec<DomainInfo>>;

    /// Full corpus scan for the dispatcher pass.
    async fn scan_all_domains(&self) -> StoreResult<Vec<DomainInfo>>;

    /// Domains currently owned by a fetcher token.
    async fn domains_claimed_by(&self, tok: Uuid) -> StoreResult<Vec<String>>;

    // ===== domain_counters =====

    /// Adds `delta` to the domain's claim-credit counter.
    async fn add_claim_credit(&self, dom: &str, delta: i64) -> StoreResult<()>;

    /// Reads the claim-credit counter; a missing row reads as zero.
    async fn read_claim_credit(&self, dom: &str) -> StoreResult<i64>;

    // ===== links =====

    async fn insert_link(&self, row: &LinkRow) -> StoreResult<()>;

    /// Every `time` row for one URL, ascending.
    async fn link_history(&self, key: &UrlKey) -> StoreResult<Vec<LinkRow>>;

    /// Every link row for a domain, in clustering order.
    async fn scan_links(&self, dom: &str) -> StoreResult<Vec<LinkRow>>;

    /// Pages link rows for a domain, starting strictly after the URL
    /// identified by `seed` (all of its `time` rows excluded).
    async fn links_page(
        &self,
        dom: &str,
        seed: Option<&UrlKey>,
        limit: usize,
    ) -> StoreResult<Vec<LinkRow>>;

    /// Deletes the full history of one URL.
    async fn delete_link_history(&self, key: &UrlKey) -> StoreResult<()>;

    // ===== segments =====

    async fn insert_segment(&self, row: &SegmentRow) -> StoreResult<()>;

    async fn segments_for_domain(&self, dom: &str) -> StoreResult<Vec<SegmentRow>>;

    /// Deletes every segment row for a domain. No grace period: deletion is
    /// immediately permanent.
    async fn delete_segments(&self, dom: &str) -> StoreResult<()>;

    // ===== active_fetchers =====

    /// Upserts the fetcher token with the given TTL.
    async fn write_keep_alive(&self, tok: Uuid, ttl: Duration) -> StoreResult<()>;

    /// True iff the token's row has not yet expired.
    async fn fetcher_alive(&self, tok: Uuid) -> StoreResult<bool>;

    // ===== walker_globals =====

    /// The corpus-wide `max_priority` scalar, if set.
    async fn max_priority(&self) -> StoreResult<Option<i8>>;

    // ===== test support =====

    /// Drops every row in every table. Test fixtures only.
    async fn truncate_all(&self) -> StoreResult<()>;
}
