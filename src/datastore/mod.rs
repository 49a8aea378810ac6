//! Datastore façade
//!
//! The surface fetcher processes program against: claiming and releasing
//! domains, draining segments, recording fetch results and parsed links,
//! and the keep-alive heartbeat. The model-query surface consumed by
//! operational tooling lives in [`queries`].

mod claim;
mod queries;

pub use queries::DomainUpdate;

use crate::cache::DomainCache;
use crate::config::Config;
use crate::model::{DomainInfo, LinkRow, HEADER_JOIN};
use crate::store::Store;
use crate::url::CrawlUrl;
use crate::{Result, UrlError};
use chrono::{DateTime, Utc};
use claim::ClaimState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Outcome of one URL fetch, produced by a fetcher process.
///
/// The control plane records these fields verbatim; headers and body are
/// never interpreted.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// The URL that was requested.
    pub url: CrawlUrl,

    /// URLs produced by following redirects from `url`, in order.
    pub redirected_from: Vec<CrawlUrl>,

    /// When the fetch happened.
    pub fetch_time: DateTime<Utc>,

    /// HTTP status, when a response arrived.
    pub status: Option<i32>,

    /// Response headers; repeated headers keep every value.
    pub headers: Option<HashMap<String, Vec<String>>>,

    /// Transport- or protocol-level failure, when the fetch died.
    pub error: Option<String>,

    /// True when robots.txt forbade the fetch.
    pub robots_excluded: bool,

    pub mime: Option<String>,

    /// Content fingerprint.
    pub fnv: Option<i64>,

    pub body: Option<String>,
}

impl FetchResult {
    /// A bare result for a URL, with no response recorded.
    pub fn new(url: CrawlUrl, fetch_time: DateTime<Utc>) -> Self {
        Self {
            url,
            redirected_from: Vec::new(),
            fetch_time,
            status: None,
            headers: None,
            error: None,
            robots_excluded: false,
            mime: None,
            fnv: None,
            body: None,
        }
    }
}

/// One fetcher process's handle on the shared corpus.
///
/// Each instance owns a fresh 128-bit token identifying the process in
/// `domain_info.claim_tok` and `active_fetchers`. All methods are safe to
/// call from concurrent tasks within the process.
pub struct Datastore {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: Config,
    pub(crate) token: Uuid,
    pub(crate) claim: Mutex<ClaimState>,
    existence: DomainCache,
}

impl Datastore {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        let existence = DomainCache::new(config.links.added_domains_cache_size);
        Self {
            store,
            config,
            token: Uuid::new_v4(),
            claim: Mutex::new(ClaimState::default()),
            existence,
        }
    }

    /// This process's claim token.
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Refreshes this fetcher's liveness row.
    ///
    /// Must be called on a cadence comfortably shorter than the configured
    /// `active-fetchers-ttl`, or the dispatcher will reclaim this process's
    /// domains as stranded.
    pub async fn keep_alive(&self) -> Result<()> {
        self.store
            .write_keep_alive(self.token, self.config.fetcher.active_fetchers_ttl)
            .await?;
        Ok(())
    }

    /// Releases a claimed domain: erases its segment and clears the claim.
    ///
    /// The two writes are not atomic. A crash in between leaves the domain
    /// unclaimed but undispatched, which the next dispatcher pass repairs.
    pub async fn unclaim_host(&self, dom: &str) -> Result<()> {
        self.store.delete_segments(dom).await?;
        self.store.release_domain(dom).await?;
        Ok(())
    }

    /// Releases every dispatched domain in the corpus.
    ///
    /// Recovery tool for a full fleet restart; per-domain failures are
    /// logged and skipped so one bad row cannot wedge the sweep.
    pub async fn unclaim_all(&self) -> Result<()> {
        for info in self.store.scan_all_domains().await? {
            if !info.dispatched {
                continue;
            }
            if let Err(err) = self.unclaim_host(&info.dom).await {
                tracing::warn!("unclaim of {} failed: {err}", info.dom);
            }
        }
        Ok(())
    }

    /// The URLs of a claimed domain's current segment.
    ///
    /// Returns an empty batch when the read fails; the fetcher treats that
    /// the same as an exhausted segment and moves on.
    pub async fn links_for_host(&self, dom: &str) -> Vec<CrawlUrl> {
        match self.store.segments_for_domain(dom).await {
            Ok(rows) => rows
                .iter()
                .map(|row| CrawlUrl::from_key(&row.key, row.time))
                .collect(),
            Err(err) => {
                tracing::error!("segment read for {dom} failed: {err}");
                Vec::new()
            }
        }
    }

    /// Records the outcome of one fetch as a new history row.
    ///
    /// When the fetch was redirected, one row per hop records the
    /// predecessor-to-successor link; every hop row carries the chain's
    /// final fetch time.
    pub async fn store_url_fetch_results(&self, fr: &FetchResult) -> Result<()> {
        let chain: Vec<&CrawlUrl> = std::iter::once(&fr.url)
            .chain(fr.redirected_from.iter())
            .collect();

        let mut row = LinkRow::at(fr.url.key(), fr.fetch_time);
        row.status = fr.status;
        row.error = fr.error.clone();
        row.robots_excluded = fr.robots_excluded;
        row.mime = fr.mime.clone();
        row.fnv = fr.fnv;
        row.body = fr.body.clone();
        row.headers = fr.headers.as_ref().map(join_headers);
        if let Some(next) = chain.get(1) {
            row.redto_url = Some(next.to_string());
        }
        self.store.insert_link(&row).await?;

        for pair in chain.windows(2).skip(1) {
            let mut hop = LinkRow::at(pair[0].key(), fr.fetch_time);
            hop.redto_url = Some(pair[1].to_string());
            self.store.insert_link(&hop).await?;
        }

        Ok(())
    }

    /// Records a URL parsed out of a fetched page.
    ///
    /// Unknown domains are either created (when `add-new-domains` is set)
    /// or cause the link to be silently dropped. Known URLs get an epoch
    /// history row; the epoch row of an already-known URL is simply
    /// rewritten with identical content.
    pub async fn store_parsed_url(&self, url: &CrawlUrl, _fr: &FetchResult) -> Result<()> {
        if url.dom.is_empty() {
            return Err(UrlError::MissingDomain(url.to_string()).into());
        }

        if !self.domain_exists(&url.dom).await? {
            if !self.config.links.add_new_domains {
                tracing::debug!("dropping link on unknown domain: {url}");
                return Ok(());
            }
            self.add_domain_with_exclude_reason(&url.dom, "").await?;
        }

        self.store.insert_link(&LinkRow::parsed(url.key())).await?;
        Ok(())
    }

    /// Checks the existence cache, falling back to the store on a miss.
    async fn domain_exists(&self, dom: &str) -> Result<bool> {
        if let Some(known) = self.existence.get(dom) {
            return Ok(known);
        }
        let exists = self.store.find_domain(dom).await?.is_some();
        self.existence.set(dom, exists);
        Ok(exists)
    }

    /// Creates a `domain_info` row, guarding against the dispatcher racing
    /// in before the exclude reason lands.
    ///
    /// The insert-if-absent writes the row with `excluded = true`; the
    /// follow-up update then settles the real exclusion state. Errors are
    /// returned to the caller rather than retried here.
    pub async fn add_domain_with_exclude_reason(&self, dom: &str, reason: &str) -> Result<()> {
        let mut info = DomainInfo::new(dom, self.config.links.default_domain_priority);
        info.excluded = true;
        info.exclude_reason = (!reason.is_empty()).then(|| reason.to_string());
        self.store.insert_domain_if_absent(&info).await?;

        let excluded = !reason.is_empty();
        self.store
            .set_domain_exclusion(dom, excluded, excluded.then_some(reason))
            .await?;

        self.existence.set(dom, true);
        Ok(())
    }
}

/// Flattens multi-valued headers into the stored single-value map, joining
/// repeats with the NUL separator.
fn join_headers(headers: &HashMap<String, Vec<String>>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, values)| {
            let mut joined = String::new();
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    joined.push(HEADER_JOIN);
                }
                joined.push_str(value);
            }
            (name.clone(), joined)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{not_yet_crawled, Priority, SegmentRow};
    use crate::store::MemoryStore;

    fn datastore() -> (Arc<MemoryStore>, Datastore) {
        let store = Arc::new(MemoryStore::new());
        let ds = Datastore::new(store.clone(), Config::default());
        (store, ds)
    }

    #[tokio::test]
    async fn test_store_parsed_url_creates_domain_and_epoch_row() {
        let (store, ds) = datastore();
        let url = CrawlUrl::parse("http://sub.example.com/page").unwrap();
        let fr = FetchResult::new(url.clone(), Utc::now());

        ds.store_parsed_url(&url, &fr).await.unwrap();

        let info = store.find_domain("example.com").await.unwrap().unwrap();
        assert!(!info.excluded);
        assert_eq!(info.claim_tok, crate::ZERO_TOKEN);

        let history = store.link_history(&url.key()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].time, not_yet_crawled());
    }

    #[tokio::test]
    async fn test_store_parsed_url_drops_unknown_domain_when_disabled() {
        let store = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.links.add_new_domains = false;
        let ds = Datastore::new(store.clone(), config);

        let url = CrawlUrl::parse("http://example.com/").unwrap();
        let fr = FetchResult::new(url.clone(), Utc::now());
        ds.store_parsed_url(&url, &fr).await.unwrap();

        assert!(store.find_domain("example.com").await.unwrap().is_none());
        assert!(store.link_history(&url.key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_results_row_carries_fields() {
        let (store, ds) = datastore();
        let url = CrawlUrl::parse("http://example.com/page").unwrap();
        let when = Utc::now();

        let mut fr = FetchResult::new(url.clone(), when);
        fr.status = Some(200);
        fr.mime = Some("text/html".to_string());
        fr.fnv = Some(42);
        fr.headers = Some(HashMap::from([(
            "set-cookie".to_string(),
            vec!["a=1".to_string(), "b=2".to_string()],
        )]));
        ds.store_url_fetch_results(&fr).await.unwrap();

        let history = store.link_history(&url.key()).await.unwrap();
        assert_eq!(history.len(), 1);
        let row = &history[0];
        assert_eq!(row.status, Some(200));
        assert_eq!(row.mime.as_deref(), Some("text/html"));
        assert_eq!(row.fnv, Some(42));
        assert_eq!(
            row.headers.as_ref().unwrap()["set-cookie"],
            "a=1\u{0}b=2"
        );
    }

    #[tokio::test]
    async fn test_fetch_results_record_redirect_chain() {
        let (store, ds) = datastore();
        let a = CrawlUrl::parse("http://example.com/a").unwrap();
        let b = CrawlUrl::parse("http://example.com/b").unwrap();
        let c = CrawlUrl::parse("http://example.com/c").unwrap();
        let when = Utc::now();

        let mut fr = FetchResult::new(a.clone(), when);
        fr.status = Some(200);
        fr.redirected_from = vec![b.clone(), c.clone()];
        ds.store_url_fetch_results(&fr).await.unwrap();

        let row_a = &store.link_history(&a.key()).await.unwrap()[0];
        assert_eq!(row_a.redto_url.as_deref(), Some("http://example.com/b"));
        assert_eq!(row_a.status, Some(200));

        let row_b = &store.link_history(&b.key()).await.unwrap()[0];
        assert_eq!(row_b.redto_url.as_deref(), Some("http://example.com/c"));
        assert_eq!(row_b.time, when);

        assert!(store.link_history(&c.key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unclaim_host_clears_segment_and_claim() {
        let (store, ds) = datastore();
        let mut info = DomainInfo::new("example.com", Priority(0));
        info.dispatched = true;
        store.upsert_domain(info);
        store
            .cas_claim_domain("example.com", ds.token(), Utc::now())
            .await
            .unwrap();
        store
            .insert_segment(&SegmentRow {
                key: crate::model::UrlKey::new("example.com", "", "/", "http"),
                time: not_yet_crawled(),
            })
            .await
            .unwrap();

        ds.unclaim_host("example.com").await.unwrap();

        let info = store.find_domain("example.com").await.unwrap().unwrap();
        assert!(!info.dispatched);
        assert_eq!(info.claim_tok, crate::ZERO_TOKEN);
        assert_eq!(info.queued_links, 0);
        assert!(ds.links_for_host("example.com").await.is_empty());
    }

    #[tokio::test]
    async fn test_add_domain_records_exclude_reason() {
        let (store, ds) = datastore();
        ds.add_domain_with_exclude_reason("spam.com", "manual review")
            .await
            .unwrap();

        let info = store.find_domain("spam.com").await.unwrap().unwrap();
        assert!(info.excluded);
        assert_eq!(info.exclude_reason.as_deref(), Some("manual review"));
    }

    #[tokio::test]
    async fn test_add_domain_without_reason_is_not_excluded() {
        let (store, ds) = datastore();
        ds.add_domain_with_exclude_reason("fine.com", "").await.unwrap();

        let info = store.find_domain("fine.com").await.unwrap().unwrap();
        assert!(!info.excluded);
        assert_eq!(info.exclude_reason, None);
    }

    #[tokio::test]
    async fn test_keep_alive_registers_token() {
        let (store, ds) = datastore();
        ds.keep_alive().await.unwrap();
        assert!(store.fetcher_alive(ds.token()).await.unwrap());
    }
}
