//! In-memory store implementation
//!
//! Backs the test suite with the same semantics the control plane relies on
//! from the wide-column backend: per-row CAS atomicity, clustering order of
//! `links`, commutative counters, and TTL expiry of `active_fetchers`. One
//! coarse mutex stands in for the cluster; nothing here is performance
//! sensitive.

use crate::model::{DispatchStats, DomainInfo, LinkRow, Priority, SegmentRow, UrlKey, ZERO_TOKEN};
use crate::store::{Store, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Clustering key of the `links` table: `(dom, subdom, path, proto, time)`.
type LinkKey = (String, String, String, String, i64);

/// Key of the `segments` table: `(dom, subdom, path, proto)`.
type SegmentKey = (String, String, String, String);

#[derive(Default)]
struct Inner {
    domains: BTreeMap<String, DomainInfo>,
    counters: HashMap<String, i64>,
    links: BTreeMap<LinkKey, LinkRow>,
    segments: BTreeMap<SegmentKey, SegmentRow>,
    fetchers: HashMap<Uuid, Instant>,
    max_priority: Option<i8>,
}

/// In-process [`Store`] for tests
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the corpus-wide `max_priority` global.
    pub fn set_max_priority(&self, value: Option<i8>) {
        self.inner.lock().unwrap().max_priority = value;
    }

    /// Unconditionally writes a domain row. Test fixtures only.
    pub fn upsert_domain(&self, info: DomainInfo) {
        self.inner
            .lock()
            .unwrap()
            .domains
            .insert(info.dom.clone(), info);
    }

    fn link_key(row: &LinkRow) -> LinkKey {
        (
            row.key.dom.clone(),
            row.key.subdom.clone(),
            row.key.path.clone(),
            row.key.proto.clone(),
            row.time.timestamp_millis(),
        )
    }

    fn segment_key(key: &UrlKey) -> SegmentKey {
        (
            key.dom.clone(),
            key.subdom.clone(),
            key.path.clone(),
            key.proto.clone(),
        )
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_domain_if_absent(&self, info: &DomainInfo) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.domains.contains_key(&info.dom) {
            return Ok(false);
        }
        inner.domains.insert(info.dom.clone(), info.clone());
        Ok(true)
    }

    async fn find_domain(&self, dom: &str) -> StoreResult<Option<DomainInfo>> {
        Ok(self.inner.lock().unwrap().domains.get(dom).cloned())
    }

    async fn set_domain_exclusion(
        &self,
        dom: &str,
        excluded: bool,
        reason: Option<&str>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let info = inner
            .domains
            .get_mut(dom)
            .ok_or_else(|| StoreError::Query(format!("no domain_info row for {dom}")))?;
        info.excluded = excluded;
        info.exclude_reason = reason.map(str::to_string);
        Ok(())
    }

    async fn set_domain_priority(&self, dom: &str, priority: Priority) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let info = inner
            .domains
            .get_mut(dom)
            .ok_or_else(|| StoreError::Query(format!("no domain_info row for {dom}")))?;
        info.priority = priority;
        Ok(())
    }

    async fn cas_claim_domain(
        &self,
        dom: &str,
        tok: Uuid,
        when: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(info) = inner.domains.get_mut(dom) else {
            return Ok(false);
        };
        if !info.dispatched || info.claim_tok != ZERO_TOKEN {
            return Ok(false);
        }
        info.claim_tok = tok;
        info.claim_time = when;
        Ok(true)
    }

    async fn release_domain(&self, dom: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.domains.get_mut(dom) {
            info.dispatched = false;
            info.claim_tok = ZERO_TOKEN;
            info.queued_links = 0;
        }
        Ok(())
    }

    async fn mark_dispatched(&self, dom: &str, stats: DispatchStats) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let info = inner
            .domains
            .get_mut(dom)
            .ok_or_else(|| StoreError::Query(format!("no domain_info row for {dom}")))?;
        info.dispatched = true;
        info.last_dispatch = stats.last_dispatch;
        info.tot_links = stats.tot_links;
        info.uncrawled_links = stats.uncrawled_links;
        info.queued_links = stats.queued_links;
        Ok(())
    }

    async fn record_empty_dispatch(&self, dom: &str, when: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.domains.get_mut(dom) {
            info.last_empty_dispatch = when;
        }
        Ok(())
    }

    async fn scan_claimable(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<(String, Priority)>> {
        let inner = self.inner.lock().unwrap();
        let range = match cursor {
            Some(cursor) => inner
                .domains
                .range::<str, _>((Excluded(cursor), Unbounded)),
            None => inner.domains.range::<str, _>(..),
        };
        Ok(range
            .filter(|(_, info)| info.dispatched && info.claim_tok == ZERO_TOKEN)
            .take(limit)
            .map(|(dom, info)| (dom.clone(), info.priority))
            .collect())
    }

    async fn scan_domains(&self, seed: Option<&str>, limit: usize) -> StoreResult<Vec<DomainInfo>> {
        let inner = self.inner.lock().unwrap();
        let range = match seed {
            Some(seed) => inner.domains.range::<str, _>((Excluded(seed), Unbounded)),
            None => inner.domains.range::<str, _>(..),
        };
        Ok(range.take(limit).map(|(_, info)| info.clone()).collect())
    }

    async fn scan_all_domains(&self) -> StoreResult<Vec<DomainInfo>> {
        Ok(self.inner.lock().unwrap().domains.values().cloned().collect())
    }

    async fn domains_claimed_by(&self, tok: Uuid) -> StoreResult<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .domains
            .values()
            .filter(|info| info.claim_tok == tok)
            .map(|info| info.dom.clone())
            .collect())
    }

    async fn add_claim_credit(&self, dom: &str, delta: i64) -> StoreResult<()> {
        *self
            .inner
            .lock()
            .unwrap()
            .counters
            .entry(dom.to_string())
            .or_insert(0) += delta;
        Ok(())
    }

    async fn read_claim_credit(&self, dom: &str) -> StoreResult<i64> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .counters
            .get(dom)
            .copied()
            .unwrap_or(0))
    }

    async fn insert_link(&self, row: &LinkRow) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .links
            .insert(Self::link_key(row), row.clone());
        Ok(())
    }

    async fn link_history(&self, key: &UrlKey) -> StoreResult<Vec<LinkRow>> {
        let inner = self.inner.lock().unwrap();
        let lo = (
            key.dom.clone(),
            key.subdom.clone(),
            key.path.clone(),
            key.proto.clone(),
            i64::MIN,
        );
        let hi = (
            key.dom.clone(),
            key.subdom.clone(),
            key.path.clone(),
            key.proto.clone(),
            i64::MAX,
        );
        Ok(inner.links.range(lo..=hi).map(|(_, row)| row.clone()).collect())
    }

    async fn scan_links(&self, dom: &str) -> StoreResult<Vec<LinkRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .links
            .range((dom.to_string(), String::new(), String::new(), String::new(), i64::MIN)..)
            .take_while(|((d, ..), _)| d == dom)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn links_page(
        &self,
        dom: &str,
        seed: Option<&UrlKey>,
        limit: usize,
    ) -> StoreResult<Vec<LinkRow>> {
        let inner = self.inner.lock().unwrap();
        let start: LinkKey = match seed {
            // Strictly after every time row of the seed URL.
            Some(seed) => (
                dom.to_string(),
                seed.subdom.clone(),
                seed.path.clone(),
                seed.proto.clone(),
                i64::MAX,
            ),
            None => (dom.to_string(), String::new(), String::new(), String::new(), i64::MIN),
        };
        Ok(inner
            .links
            .range((Excluded(start), Unbounded))
            .take_while(|((d, ..), _)| d == dom)
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn delete_link_history(&self, key: &UrlKey) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<LinkKey> = inner
            .links
            .range((
                key.dom.clone(),
                key.subdom.clone(),
                key.path.clone(),
                key.proto.clone(),
                i64::MIN,
            )..)
            .take_while(|((d, s, p, pr, _), _)| {
                d == &key.dom && s == &key.subdom && p == &key.path && pr == &key.proto
            })
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            inner.links.remove(&k);
        }
        Ok(())
    }

    async fn insert_segment(&self, row: &SegmentRow) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .segments
            .insert(Self::segment_key(&row.key), row.clone());
        Ok(())
    }

    async fn segments_for_domain(&self, dom: &str) -> StoreResult<Vec<SegmentRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .segments
            .range((dom.to_string(), String::new(), String::new(), String::new())..)
            .take_while(|((d, ..), _)| d == dom)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn delete_segments(&self, dom: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<SegmentKey> = inner
            .segments
            .range((dom.to_string(), String::new(), String::new(), String::new())..)
            .take_while(|((d, ..), _)| d == dom)
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            inner.segments.remove(&k);
        }
        Ok(())
    }

    async fn write_keep_alive(&self, tok: Uuid, ttl: Duration) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .fetchers
            .insert(tok, Instant::now() + ttl);
        Ok(())
    }

    async fn fetcher_alive(&self, tok: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.fetchers.get(&tok) {
            Some(expiry) if *expiry > Instant::now() => Ok(true),
            Some(_) => {
                inner.fetchers.remove(&tok);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn max_priority(&self) -> StoreResult<Option<i8>> {
        Ok(self.inner.lock().unwrap().max_priority)
    }

    async fn truncate_all(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::not_yet_crawled;

    fn link(dom: &str, subdom: &str, path: &str, millis: i64) -> LinkRow {
        let mut row = LinkRow::parsed(UrlKey::new(dom, subdom, path, "http"));
        row.time = DateTime::from_timestamp_millis(millis).unwrap();
        row
    }

    #[tokio::test]
    async fn test_cas_claim_is_exclusive() {
        let store = MemoryStore::new();
        let mut info = DomainInfo::new("example.com", Priority(0));
        info.dispatched = true;
        store.upsert_domain(info);

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(store.cas_claim_domain("example.com", a, Utc::now()).await.unwrap());
        assert!(!store.cas_claim_domain("example.com", b, Utc::now()).await.unwrap());

        let info = store.find_domain("example.com").await.unwrap().unwrap();
        assert_eq!(info.claim_tok, a);
    }

    #[tokio::test]
    async fn test_cas_claim_requires_dispatched() {
        let store = MemoryStore::new();
        store.upsert_domain(DomainInfo::new("example.com", Priority(0)));

        let applied = store
            .cas_claim_domain("example.com", Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_scan_links_clustering_order() {
        let store = MemoryStore::new();
        store.insert_link(&link("example.com", "", "/b", 10)).await.unwrap();
        store.insert_link(&link("example.com", "", "/a", 30)).await.unwrap();
        store.insert_link(&link("example.com", "", "/a", 20)).await.unwrap();
        store.insert_link(&link("other.com", "", "/z", 5)).await.unwrap();

        let rows = store.scan_links("example.com").await.unwrap();
        let got: Vec<(String, i64)> = rows
            .iter()
            .map(|r| (r.key.path.clone(), r.time.timestamp_millis()))
            .collect();
        assert_eq!(
            got,
            vec![("/a".into(), 20), ("/a".into(), 30), ("/b".into(), 10)]
        );
    }

    #[tokio::test]
    async fn test_links_page_skips_seed_history() {
        let store = MemoryStore::new();
        store.insert_link(&link("example.com", "", "/a", 0)).await.unwrap();
        store.insert_link(&link("example.com", "", "/a", 50)).await.unwrap();
        store.insert_link(&link("example.com", "", "/b", 0)).await.unwrap();

        let seed = UrlKey::new("example.com", "", "/a", "http");
        let rows = store.links_page("example.com", Some(&seed), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key.path, "/b");
    }

    #[tokio::test]
    async fn test_counters_accumulate() {
        let store = MemoryStore::new();
        store.add_claim_credit("example.com", 3).await.unwrap();
        store.add_claim_credit("example.com", 2).await.unwrap();
        assert_eq!(store.read_claim_credit("example.com").await.unwrap(), 5);

        store.add_claim_credit("example.com", -5).await.unwrap();
        assert_eq!(store.read_claim_credit("example.com").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_keep_alive_expires() {
        let store = MemoryStore::new();
        let tok = Uuid::new_v4();

        store.write_keep_alive(tok, Duration::from_secs(60)).await.unwrap();
        assert!(store.fetcher_alive(tok).await.unwrap());

        store.write_keep_alive(tok, Duration::ZERO).await.unwrap();
        assert!(!store.fetcher_alive(tok).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_link_history_is_scoped() {
        let store = MemoryStore::new();
        store.insert_link(&link("example.com", "", "/a", 0)).await.unwrap();
        store.insert_link(&link("example.com", "", "/a", 9)).await.unwrap();
        store.insert_link(&link("example.com", "", "/ab", 0)).await.unwrap();

        store
            .delete_link_history(&UrlKey::new("example.com", "", "/a", "http"))
            .await
            .unwrap();

        let rows = store.scan_links("example.com").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key.path, "/ab");
    }

    #[tokio::test]
    async fn test_truncate_all_resets_everything() {
        let store = MemoryStore::new();
        store.set_max_priority(Some(4));
        store.upsert_domain(DomainInfo::new("example.com", Priority(1)));
        store.insert_link(&link("example.com", "", "/", 0)).await.unwrap();
        store.add_claim_credit("example.com", 3).await.unwrap();

        store.truncate_all().await.unwrap();

        assert!(store.find_domain("example.com").await.unwrap().is_none());
        assert!(store.scan_links("example.com").await.unwrap().is_empty());
        assert_eq!(store.read_claim_credit("example.com").await.unwrap(), 0);
        assert_eq!(store.max_priority().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_segment_lifecycle() {
        let store = MemoryStore::new();
        let key = UrlKey::new("example.com", "", "/", "http");
        store
            .insert_segment(&SegmentRow {
                key: key.clone(),
                time: not_yet_crawled(),
            })
            .await
            .unwrap();

        assert_eq!(store.segments_for_domain("example.com").await.unwrap().len(), 1);

        store.delete_segments("example.com").await.unwrap();
        assert!(store.segments_for_domain("example.com").await.unwrap().is_empty());
    }
}
