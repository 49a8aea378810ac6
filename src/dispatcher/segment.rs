//! Per-domain segment generation
//!
//! A segment is the bounded batch of URLs a fetcher crawls after claiming a
//! domain. Generation walks the domain's full link history in clustering
//! order, reduces each URL to its most recent row, and partitions the URLs
//! into three buckets: get-now (operator-flagged, always first), uncrawled
//! (epoch rows), and crawled (refresh candidates, oldest first). The
//! refresh-percentage split then decides how the remaining capacity is
//! divided between new fetches and recrawls.

use crate::dispatcher::correct::correct_url_normalization;
use crate::dispatcher::DispatchShared;
use crate::model::{DispatchStats, LinkRow, SegmentRow};
use crate::url::CrawlUrl;
use crate::Result;
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// A crawled URL waiting in the refresh heap, ordered by fetch time
#[derive(Debug, Clone)]
struct RefreshEntry {
    time: DateTime<Utc>,
    url: CrawlUrl,
}

// Explicit ordering so the heap pops deterministically when fetch times tie.
impl Ord for RefreshEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.url.key().cmp(&other.url.key()))
    }
}

impl PartialOrd for RefreshEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RefreshEntry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.url.key() == other.url.key()
    }
}

impl Eq for RefreshEntry {}

/// URL buckets accumulated during the history walk
struct Candidates {
    getnow: Vec<CrawlUrl>,
    uncrawled: Vec<CrawlUrl>,
    crawled: BinaryHeap<Reverse<RefreshEntry>>,

    /// Distinct URLs observed.
    tot: u64,

    /// Distinct uncrawled URLs observed, including past the bucket cap.
    uncrawled_seen: u64,
}

impl Candidates {
    fn new() -> Self {
        Self {
            getnow: Vec::new(),
            uncrawled: Vec::new(),
            crawled: BinaryHeap::new(),
            tot: 0,
            uncrawled_seen: 0,
        }
    }

    /// Merges the buckets into the final segment list.
    ///
    /// Get-now URLs are taken whole; the remaining capacity splits between
    /// recrawls and new fetches per `refresh_percentage`, each bucket
    /// backfilling the other's shortfall.
    fn merge(mut self, max_links: usize, refresh_percentage: u8) -> Vec<CrawlUrl> {
        let mut picked = self.getnow;
        let room = max_links.saturating_sub(picked.len());

        // Half-away-from-zero rounding.
        let ideal_crawled =
            ((room as f64 * refresh_percentage as f64 / 100.0) + 0.5).floor() as usize;
        let ideal_uncrawled = room - ideal_crawled.min(room);

        let mut uncrawled = self.uncrawled.into_iter();
        for url in uncrawled.by_ref().take(ideal_uncrawled) {
            picked.push(url);
        }
        for _ in 0..ideal_crawled {
            match self.crawled.pop() {
                Some(Reverse(entry)) => picked.push(entry.url),
                None => break,
            }
        }

        // Whichever bucket still has supply covers the shortfall.
        while picked.len() < max_links {
            if let Some(url) = uncrawled.next() {
                picked.push(url);
            } else if let Some(Reverse(entry)) = self.crawled.pop() {
                picked.push(entry.url);
            } else {
                break;
            }
        }

        picked
    }
}

impl DispatchShared {
    /// Builds and publishes the next segment for one domain.
    ///
    /// An empty candidate set records an empty dispatch and leaves the
    /// domain undispatched; otherwise the segment rows are written (per-row
    /// failures logged and skipped) and the domain is marked dispatched
    /// with fresh statistics.
    pub(crate) async fn generate_segment(&self, dom: &str) -> Result<()> {
        let now = Utc::now();
        let rows = self.store.scan_links(dom).await?;

        // Rows arrive ordered by (subdom, path, proto) and then ascending
        // time, so the last row of each group is the URL's latest fetch.
        let mut candidates = Candidates::new();
        let mut previous: Option<LinkRow> = None;
        let mut aborted = false;
        for row in rows {
            if let Some(prev) = previous.take() {
                // Equal keys mean the same URL at a newer time; the newer
                // row simply replaces the older one.
                if prev.key != row.key && !self.classify(&mut candidates, prev, now).await {
                    aborted = true;
                    break;
                }
            }
            previous = Some(row);
        }
        if !aborted {
            if let Some(prev) = previous.take() {
                self.classify(&mut candidates, prev, now).await;
            }
        }

        let tot_links = candidates.tot;
        let uncrawled_links = candidates.uncrawled_seen;
        let picked = candidates.merge(
            self.config.dispatcher.max_links_per_segment,
            self.config.dispatcher.refresh_percentage,
        );

        if picked.is_empty() {
            self.store.record_empty_dispatch(dom, now).await?;
            tracing::debug!("nothing to dispatch for {dom}");
            return Ok(());
        }

        let queued_links = picked.len() as u64;
        for url in &picked {
            let row = SegmentRow {
                key: url.key(),
                time: url.last_crawled,
            };
            if let Err(err) = self.store.insert_segment(&row).await {
                tracing::error!("segment row insert for {url} failed: {err}");
            }
        }

        self.store
            .mark_dispatched(
                dom,
                DispatchStats {
                    tot_links,
                    uncrawled_links,
                    queued_links,
                    last_dispatch: now,
                },
            )
            .await?;

        tracing::info!("dispatched {queued_links} links for {dom}");
        Ok(())
    }

    /// Buckets one URL by its most recent history row.
    ///
    /// Returns false when the get-now bucket overflows the segment cap,
    /// which aborts the history walk.
    async fn classify(&self, candidates: &mut Candidates, row: LinkRow, now: DateTime<Utc>) -> bool {
        let mut url = CrawlUrl::from_key(&row.key, row.time);
        if self.config.dispatcher.correct_link_normalization {
            url = correct_url_normalization(
                self.store.as_ref(),
                url,
                &self.config.links.purge_sid_list,
            )
            .await;
        }

        candidates.tot += 1;
        let max_links = self.config.dispatcher.max_links_per_segment;

        if row.getnow {
            if candidates.getnow.len() >= max_links {
                tracing::warn!("get-now links for {} exceed the segment cap", url.dom);
                return false;
            }
            candidates.getnow.push(url);
        } else if row.is_uncrawled() {
            candidates.uncrawled_seen += 1;
            if candidates.uncrawled.len() < max_links {
                candidates.uncrawled.push(url);
            }
        } else {
            let min_refresh = chrono::Duration::from_std(self.config.dispatcher.min_link_refresh_time)
                .unwrap_or(chrono::Duration::zero());
            if now.signed_duration_since(row.time) > min_refresh {
                candidates.crawled.push(Reverse(RefreshEntry {
                    time: row.time,
                    url,
                }));
            }
            // Younger than the refresh window: omitted from this batch.
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{not_yet_crawled, UrlKey};

    fn url(path: &str, time: DateTime<Utc>) -> CrawlUrl {
        CrawlUrl::from_key(&UrlKey::new("example.com", "", path, "http"), time)
    }

    fn candidates(
        getnow: Vec<CrawlUrl>,
        uncrawled: Vec<CrawlUrl>,
        crawled: Vec<CrawlUrl>,
    ) -> Candidates {
        let mut c = Candidates::new();
        c.getnow = getnow;
        c.uncrawled = uncrawled;
        for url in crawled {
            c.crawled.push(Reverse(RefreshEntry {
                time: url.last_crawled,
                url,
            }));
        }
        c
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::days(days)
    }

    #[test]
    fn test_merge_split_is_half_away_from_zero() {
        // room 6, 33% -> 1.98 rounds to 2 recrawls, 4 new fetches.
        let getnow: Vec<CrawlUrl> = (0..3)
            .map(|i| url(&format!("/g{i}"), not_yet_crawled()))
            .collect();
        let uncrawled: Vec<CrawlUrl> = (0..9)
            .map(|i| url(&format!("/u{i}"), not_yet_crawled()))
            .collect();
        let crawled: Vec<CrawlUrl> = (1..=4).map(|d| url(&format!("/c{d}"), days_ago(d))).collect();

        let picked = candidates(getnow, uncrawled, crawled).merge(9, 33);
        assert_eq!(picked.len(), 9);

        let paths: Vec<String> = picked.iter().map(|u| u.path.clone()).collect();
        assert!(paths.iter().filter(|p| p.starts_with("/g")).count() == 3);
        assert!(paths.iter().filter(|p| p.starts_with("/u")).count() == 4);
        // The two oldest recrawls.
        assert!(paths.contains(&"/c4".to_string()));
        assert!(paths.contains(&"/c3".to_string()));
    }

    #[test]
    fn test_merge_backfills_from_crawled() {
        // No uncrawled supply: recrawls fill the whole room.
        let crawled: Vec<CrawlUrl> = (1..=5).map(|d| url(&format!("/c{d}"), days_ago(d))).collect();
        let picked = candidates(Vec::new(), Vec::new(), crawled).merge(4, 25);

        assert_eq!(picked.len(), 4);
        let paths: Vec<String> = picked.iter().map(|u| u.path.clone()).collect();
        assert_eq!(paths, vec!["/c5", "/c4", "/c3", "/c2"]);
    }

    #[test]
    fn test_merge_backfills_from_uncrawled() {
        let uncrawled: Vec<CrawlUrl> = (0..6)
            .map(|i| url(&format!("/u{i}"), not_yet_crawled()))
            .collect();
        let picked = candidates(Vec::new(), uncrawled, Vec::new()).merge(4, 50);
        assert_eq!(picked.len(), 4);
    }

    #[test]
    fn test_merge_zero_refresh_percentage() {
        let uncrawled = vec![url("/u", not_yet_crawled())];
        let crawled = vec![url("/c", days_ago(3))];
        let picked = candidates(Vec::new(), uncrawled, crawled).merge(1, 0);
        assert_eq!(picked[0].path, "/u");
    }

    #[test]
    fn test_merge_empty_is_empty() {
        let picked = candidates(Vec::new(), Vec::new(), Vec::new()).merge(10, 25);
        assert!(picked.is_empty());
    }

    #[test]
    fn test_refresh_heap_pops_oldest_first() {
        let mut heap = BinaryHeap::new();
        for d in [2, 4, 1, 3] {
            heap.push(Reverse(RefreshEntry {
                time: days_ago(d),
                url: url(&format!("/c{d}"), days_ago(d)),
            }));
        }

        let order: Vec<String> = std::iter::from_fn(|| heap.pop())
            .map(|Reverse(e)| e.url.path)
            .collect();
        assert_eq!(order, vec!["/c4", "/c3", "/c2", "/c1"]);
    }
}
