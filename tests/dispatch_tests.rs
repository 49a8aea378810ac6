//! End-to-end dispatcher tests
//!
//! Each test seeds an in-memory store the way a running corpus would look,
//! drives full dispatcher passes, and checks the resulting segments and
//! domain rows.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use webherd::config::Config;
use webherd::model::{not_yet_crawled, DomainInfo, LinkRow, SegmentRow, UrlKey, ZERO_TOKEN};
use webherd::store::{MemoryStore, Store};
use webherd::{Dispatcher, Priority};

fn dispatcher_config() -> Config {
    let mut config = Config::default();
    config.dispatcher.num_concurrent_domains = 2;
    config.dispatcher.min_link_refresh_time = Duration::from_secs(60 * 60);
    config
}

fn ready_domain(dom: &str) -> DomainInfo {
    let mut info = DomainInfo::new(dom, Priority::MAX);
    info.dispatched = false;
    info
}

fn epoch_link(dom: &str, path: &str) -> LinkRow {
    LinkRow::parsed(UrlKey::new(dom, "", path, "http"))
}

fn crawled_link(dom: &str, path: &str, time: DateTime<Utc>) -> LinkRow {
    let mut row = LinkRow::at(UrlKey::new(dom, "", path, "http"), time);
    row.status = Some(200);
    row
}

fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::days(days)
}

async fn run_once(store: Arc<MemoryStore>, config: Config) {
    let mut dispatcher = Dispatcher::new(store, config);
    dispatcher.run_once().await.unwrap();
}

#[tokio::test]
async fn test_basic_dispatch() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_domain(ready_domain("test.com"));
    store.insert_link(&epoch_link("test.com", "/")).await.unwrap();

    run_once(store.clone(), dispatcher_config()).await;

    let segments = store.segments_for_domain("test.com").await.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].key, UrlKey::new("test.com", "", "/", "http"));
    assert_eq!(segments[0].time, not_yet_crawled());

    let info = store.find_domain("test.com").await.unwrap().unwrap();
    assert!(info.dispatched);
    assert_eq!(info.queued_links, 1);
    assert_eq!(info.uncrawled_links, 1);
    assert_eq!(info.claim_tok, ZERO_TOKEN);
}

#[tokio::test]
async fn test_mixed_batch_with_getnow() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_domain(ready_domain("test.com"));

    for i in 1..=3 {
        let mut row = epoch_link("test.com", &format!("/getnow{i}"));
        row.getnow = true;
        store.insert_link(&row).await.unwrap();
    }
    for i in 1..=9 {
        store
            .insert_link(&epoch_link("test.com", &format!("/new{i}")))
            .await
            .unwrap();
    }
    for age in 1..=4 {
        store
            .insert_link(&crawled_link(
                "test.com",
                &format!("/old{age}"),
                days_ago(age),
            ))
            .await
            .unwrap();
    }

    let mut config = dispatcher_config();
    config.dispatcher.max_links_per_segment = 9;
    config.dispatcher.refresh_percentage = 33;
    run_once(store.clone(), config).await;

    let segments = store.segments_for_domain("test.com").await.unwrap();
    assert_eq!(segments.len(), 9);

    let paths: Vec<&str> = segments.iter().map(|s| s.key.path.as_str()).collect();

    // Every get-now URL is present.
    for i in 1..=3 {
        assert!(paths.contains(&format!("/getnow{i}").as_str()));
    }

    // 33% of the remaining six slots rounds to two recrawls: the oldest two.
    assert!(paths.contains(&"/old4"));
    assert!(paths.contains(&"/old3"));
    assert!(!paths.contains(&"/old2"));
    assert!(!paths.contains(&"/old1"));

    // The rest is filled from the uncrawled pool.
    let new_count = paths.iter().filter(|p| p.starts_with("/new")).count();
    assert_eq!(new_count, 4);
}

#[tokio::test]
async fn test_refresh_age_suppression() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_domain(ready_domain("test.com"));
    for age in 1..=4 {
        store
            .insert_link(&crawled_link(
                "test.com",
                &format!("/old{age}"),
                days_ago(age),
            ))
            .await
            .unwrap();
    }

    let mut config = dispatcher_config();
    config.dispatcher.min_link_refresh_time = Duration::from_secs(49 * 60 * 60);
    run_once(store.clone(), config).await;

    let segments = store.segments_for_domain("test.com").await.unwrap();
    let mut paths: Vec<&str> = segments.iter().map(|s| s.key.path.as_str()).collect();
    paths.sort_unstable();
    assert_eq!(paths, vec!["/old3", "/old4"]);
}

#[tokio::test]
async fn test_stranded_claim_cleanup() {
    let store = Arc::new(MemoryStore::new());
    let live_tok = Uuid::new_v4();
    let dead_tok = Uuid::new_v4();
    let seeded_time = days_ago(2);

    for (dom, tok) in [("ok.com", live_tok), ("dead.com", dead_tok)] {
        let mut info = DomainInfo::new(dom, Priority::MAX);
        info.dispatched = true;
        info.claim_tok = tok;
        store.upsert_domain(info);

        for i in 1..=2 {
            store
                .insert_link(&epoch_link(dom, &format!("/page{i}")))
                .await
                .unwrap();
            store
                .insert_segment(&SegmentRow {
                    key: UrlKey::new(dom, "", &format!("/page{i}"), "http"),
                    time: seeded_time,
                })
                .await
                .unwrap();
        }
    }

    // Only the live fetcher heartbeats.
    store
        .write_keep_alive(live_tok, Duration::from_secs(600))
        .await
        .unwrap();

    let config = dispatcher_config();
    let mut dispatcher = Dispatcher::new(store.clone(), config);
    dispatcher.run_once().await.unwrap();
    dispatcher.run_once().await.unwrap();

    // The dead fetcher's domain was reclaimed and re-dispatched: claim
    // cleared, segment rows rebuilt with the not-yet-crawled sentinel.
    let dead = store.find_domain("dead.com").await.unwrap().unwrap();
    assert_eq!(dead.claim_tok, ZERO_TOKEN);
    assert!(dead.dispatched);

    let dead_segments = store.segments_for_domain("dead.com").await.unwrap();
    assert_eq!(dead_segments.len(), 2);
    for segment in &dead_segments {
        assert_eq!(segment.time, not_yet_crawled());
    }

    // The live fetcher's domain is untouched.
    let ok = store.find_domain("ok.com").await.unwrap().unwrap();
    assert_eq!(ok.claim_tok, live_tok);
    assert!(ok.dispatched);

    let ok_segments = store.segments_for_domain("ok.com").await.unwrap();
    assert_eq!(ok_segments.len(), 2);
    for segment in &ok_segments {
        assert_eq!(segment.time, seeded_time);
    }
}

#[tokio::test]
async fn test_url_correction_during_dispatch() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_domain(ready_domain("a5.com"));

    let denormalized = UrlKey::new(
        "a5.com",
        "",
        "/page1.com?foo=bar&jsessionID=ABC&baz=niffler",
        "http",
    );
    store
        .insert_link(&LinkRow::parsed(denormalized.clone()))
        .await
        .unwrap();

    let mut config = dispatcher_config();
    config.dispatcher.correct_link_normalization = true;
    run_once(store.clone(), config).await;

    // The stored row moved to the canonical key and the old key is gone.
    let canonical = UrlKey::new("a5.com", "", "/page1.com?baz=niffler&foo=bar", "http");
    let history = store.link_history(&canonical).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].time, not_yet_crawled());
    assert!(store.link_history(&denormalized).await.unwrap().is_empty());

    // The segment points at the corrected URL.
    let segments = store.segments_for_domain("a5.com").await.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].key, canonical);
}

#[tokio::test]
async fn test_excluded_domain_never_dispatched() {
    let store = Arc::new(MemoryStore::new());
    let mut info = ready_domain("banned.com");
    info.excluded = true;
    info.exclude_reason = Some("listed".to_string());
    store.upsert_domain(info);
    store.insert_link(&epoch_link("banned.com", "/")).await.unwrap();

    run_once(store.clone(), dispatcher_config()).await;

    assert!(store.segments_for_domain("banned.com").await.unwrap().is_empty());
    let info = store.find_domain("banned.com").await.unwrap().unwrap();
    assert!(!info.dispatched);
}

#[tokio::test]
async fn test_empty_dispatch_recorded_and_suppressed() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_domain(ready_domain("bare.com"));

    let config = dispatcher_config();
    run_once(store.clone(), config.clone()).await;

    // No links at all: nothing dispatched, the empty pass is recorded.
    let info = store.find_domain("bare.com").await.unwrap().unwrap();
    assert!(!info.dispatched);
    assert!(info.last_empty_dispatch > info.last_dispatch);
    let first_empty = info.last_empty_dispatch;

    // Within the retry interval the domain is skipped entirely.
    run_once(store.clone(), config).await;
    let info = store.find_domain("bare.com").await.unwrap().unwrap();
    assert_eq!(info.last_empty_dispatch, first_empty);
}

#[tokio::test]
async fn test_segment_cap_bounds_uncrawled_pool() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_domain(ready_domain("big.com"));
    for i in 0..40 {
        store
            .insert_link(&epoch_link("big.com", &format!("/page{i:02}")))
            .await
            .unwrap();
    }

    let mut config = dispatcher_config();
    config.dispatcher.max_links_per_segment = 10;
    run_once(store.clone(), config).await;

    let segments = store.segments_for_domain("big.com").await.unwrap();
    assert_eq!(segments.len(), 10);

    let info = store.find_domain("big.com").await.unwrap().unwrap();
    assert_eq!(info.queued_links, 10);
    assert_eq!(info.tot_links, 40);
    assert_eq!(info.uncrawled_links, 40);
}

#[tokio::test]
async fn test_dispatcher_run_stops_on_signal() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_domain(ready_domain("test.com"));
    store.insert_link(&epoch_link("test.com", "/")).await.unwrap();

    let mut config = dispatcher_config();
    config.dispatcher.dispatch_interval = Duration::from_secs(3600);

    let dispatcher = Dispatcher::new(store.clone(), config);
    let stop = dispatcher.stop_handle();
    let handle = tokio::spawn(dispatcher.run());

    // Let the first pass land, then ask for shutdown.
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatcher did not stop promptly")
        .unwrap();

    assert_eq!(store.segments_for_domain("test.com").await.unwrap().len(), 1);
}
