//! Priority-weighted claim scheduler
//!
//! Backs `claim_new_host`. Each fetcher keeps a small local queue of
//! domains it has already claimed; refills page the corpus for unclaimed,
//! dispatched domains and race peers for them with a compare-and-set
//! update, so no two fetchers ever hold the same domain.
//!
//! Fairness comes from a per-domain credit counter: every scan that passes
//! over a domain adds its priority to the counter, and a claim is only
//! attempted once the counter reaches the corpus-wide `max_priority` (a
//! successful claim spends that much credit). A priority-2 domain therefore
//! accrues a claim half as often as a priority-4 one, without any global
//! coordination beyond the commutative counter.

use crate::datastore::Datastore;
use crate::model::Priority;
use crate::store::StoreResult;
use chrono::Utc;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Domains fetched per claim scan.
pub(crate) const CLAIM_BATCH: usize = 50;

/// Scan attempts per refill before giving up until the next call.
const CLAIM_RETRY_LIMIT: usize = 5;

/// How long a cached `max_priority` value stays fresh.
const MAX_PRIORITY_REFRESH: Duration = Duration::from_secs(60);

/// Per-process claim state, guarded by the datastore's claim mutex.
pub(crate) struct ClaimState {
    /// Domains this process has claimed but not yet handed out.
    queue: VecDeque<String>,

    /// Last domain inspected by the paged scan.
    claim_cursor: Option<String>,

    /// Set when a scan ran off the end of the corpus; the next scan starts
    /// from the top.
    restart_cursor: bool,

    /// Cached `walker_globals.max_priority`.
    max_priority: i64,
    refreshed_at: Option<Instant>,
}

impl Default for ClaimState {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            claim_cursor: None,
            restart_cursor: false,
            max_priority: Priority::MAX.value() as i64,
            refreshed_at: None,
        }
    }
}

impl Datastore {
    /// Hands out one dispatched, previously unclaimed domain, or `None`
    /// when nothing is claimable right now.
    ///
    /// Claims are exclusive: the underlying compare-and-set guarantees that
    /// of all concurrently racing fetchers exactly one receives any given
    /// domain. Transient store failures are logged and surface as `None`;
    /// the fetcher is expected to simply call again.
    pub async fn claim_new_host(&self) -> Option<String> {
        let mut state = self.claim.lock().await;
        if state.queue.is_empty() {
            if let Err(err) = self.refill_claim_queue(&mut state).await {
                tracing::warn!("claim refill failed: {err}");
            }
        }
        state.queue.pop_front()
    }

    async fn refill_claim_queue(&self, state: &mut ClaimState) -> StoreResult<()> {
        self.refresh_max_priority(state).await?;
        for _ in 0..CLAIM_RETRY_LIMIT {
            let retry = self.try_claim_hosts(state, CLAIM_BATCH).await?;
            if !state.queue.is_empty() || !retry {
                break;
            }
        }
        Ok(())
    }

    async fn refresh_max_priority(&self, state: &mut ClaimState) -> StoreResult<()> {
        let stale = state
            .refreshed_at
            .map_or(true, |at| at.elapsed() >= MAX_PRIORITY_REFRESH);
        if !stale {
            return Ok(());
        }

        let value = self
            .store
            .max_priority()
            .await?
            .unwrap_or(Priority::MAX.value());
        state.max_priority = value as i64;
        state.refreshed_at = Some(Instant::now());
        Ok(())
    }

    /// One scan-and-claim cycle over up to `limit` candidates.
    ///
    /// Returns true when the caller should scan again: either the cursor
    /// ran off the end of the corpus, or every candidate was trumped by a
    /// peer's concurrent claim.
    async fn try_claim_hosts(&self, state: &mut ClaimState, limit: usize) -> StoreResult<bool> {
        let cursor = if state.restart_cursor {
            None
        } else {
            state.claim_cursor.clone()
        };
        state.restart_cursor = false;

        let candidates = self.store.scan_claimable(cursor.as_deref(), limit).await?;
        if candidates.is_empty() {
            state.restart_cursor = true;
            return Ok(true);
        }

        let mut trumped = 0usize;
        for (dom, priority) in &candidates {
            self.store
                .add_claim_credit(dom, priority.value() as i64)
                .await?;
            let credit = self.store.read_claim_credit(dom).await?;
            if credit < state.max_priority {
                // Not enough accrued credit this cycle; the counter keeps
                // the balance for later scans.
                continue;
            }

            if self
                .store
                .cas_claim_domain(dom, self.token, Utc::now())
                .await?
            {
                self.store
                    .add_claim_credit(dom, -state.max_priority)
                    .await?;
                state.queue.push_back(dom.clone());
                tracing::debug!("claimed {dom}");
            } else {
                trumped += 1;
            }
        }

        state.claim_cursor = candidates.last().map(|(dom, _)| dom.clone());
        Ok(trumped >= limit)
    }
}
