//! Link-normalization correction
//!
//! Older corpus rows may sit under denormalized keys: mixed-case hosts,
//! session ids baked into paths, unsorted query strings. When correction is
//! enabled, segment generation pipes every candidate URL through here and
//! the store is rewritten to the canonical key, history and all.

use crate::store::{Store, StoreResult};
use crate::url::CrawlUrl;

/// Rewrites a denormalized URL's rows under its canonical key.
///
/// Already-canonical URLs pass through untouched. When the canonical TLD+1
/// differs from the stored one, a `domain_info` row is cloned for the new
/// domain first (the old domain row is intentionally left in place). All
/// `time` rows move, the full crawl history rather than just the latest
/// fetch, and the old rows are then deleted.
///
/// Any failure mid-rewrite abandons the correction and returns the original
/// URL; a partially moved history stays queryable under both keys until a
/// later pass retries.
pub(crate) async fn correct_url_normalization(
    store: &dyn Store,
    url: CrawlUrl,
    purge_sids: &[String],
) -> CrawlUrl {
    let Some(canon) = url.normalized_form(purge_sids) else {
        return url;
    };

    match move_url_rows(store, &url, &canon).await {
        Ok(()) => {
            tracing::debug!("corrected {url} -> {canon}");
            canon
        }
        Err(err) => {
            tracing::error!("correction of {url} failed, keeping original: {err}");
            url
        }
    }
}

async fn move_url_rows(store: &dyn Store, from: &CrawlUrl, to: &CrawlUrl) -> StoreResult<()> {
    if from.dom != to.dom {
        // Carry the old domain's full row over so the new domain inherits
        // priority and exclusion state.
        if let Some(mut info) = store.find_domain(&from.dom).await? {
            info.dom = to.dom.clone();
            store.insert_domain_if_absent(&info).await?;
        }
    }

    let to_key = to.key();
    for row in store.link_history(&from.key()).await? {
        let mut moved = row;
        moved.key = to_key.clone();
        store.insert_link(&moved).await?;
    }

    store.delete_link_history(&from.key()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DomainInfo, LinkRow, Priority, UrlKey};
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn sids() -> Vec<String> {
        vec!["jsessionid".to_string(), "phpsessid".to_string()]
    }

    #[tokio::test]
    async fn test_canonical_url_untouched() {
        let store = MemoryStore::new();
        let url = CrawlUrl::parse("http://example.com/p?a=1").unwrap();
        let out = correct_url_normalization(&store, url.clone(), &sids()).await;
        assert_eq!(out.key(), url.key());
    }

    #[tokio::test]
    async fn test_moves_full_history() {
        let store = MemoryStore::new();
        let old_key = UrlKey::new("example.com", "", "/p?b=2&a=1", "http");

        let epoch = LinkRow::parsed(old_key.clone());
        let mut fetched = LinkRow::at(old_key.clone(), Utc::now());
        fetched.status = Some(200);
        store.insert_link(&epoch).await.unwrap();
        store.insert_link(&fetched).await.unwrap();

        let url = CrawlUrl::from_key(&old_key, fetched.time);
        let out = correct_url_normalization(&store, url, &sids()).await;
        assert_eq!(out.path, "/p?a=1&b=2");

        let moved = store.link_history(&out.key()).await.unwrap();
        assert_eq!(moved.len(), 2);
        assert_eq!(moved[1].status, Some(200));

        assert!(store.link_history(&old_key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_domain_row_cloned_on_tld_change() {
        let store = MemoryStore::new();
        let mut info = DomainInfo::new("EXAMPLE.com", Priority(3));
        info.excluded = true;
        info.exclude_reason = Some("listed".to_string());
        store.upsert_domain(info);

        let old_key = UrlKey::new("EXAMPLE.com", "", "/", "http");
        store.insert_link(&LinkRow::parsed(old_key.clone())).await.unwrap();

        let url = CrawlUrl::from_key(&old_key, crate::model::not_yet_crawled());
        let out = correct_url_normalization(&store, url, &sids()).await;
        assert_eq!(out.dom, "example.com");

        let cloned = store.find_domain("example.com").await.unwrap().unwrap();
        assert_eq!(cloned.priority, Priority(3));
        assert!(cloned.excluded);

        // The old row stays.
        assert!(store.find_domain("EXAMPLE.com").await.unwrap().is_some());
    }
}
