use crate::model::Priority;
use crate::url::DEFAULT_PURGE_SIDS;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for webherd
///
/// Every field has a default, so an empty TOML file (or no file at all)
/// yields a usable configuration. Duration-valued options are written as
/// human-readable strings (`"30s"`, `"49h"`) and validated at load time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub links: LinkConfig,
    pub fetcher: FetcherConfig,
    pub dispatcher: DispatcherConfig,
}

/// Wide-column store connection and retry settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Contact points, `host:port`
    pub hosts: Vec<String>,

    pub keyspace: String,

    /// Retry budget for transient query failures
    #[serde(rename = "num-query-retries")]
    pub num_query_retries: u32,
}

/// Link-insertion behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// If false, parsed URLs on unknown domains are silently dropped
    #[serde(rename = "add-new-domains")]
    pub add_new_domains: bool,

    /// Capacity of the domain-existence cache
    #[serde(rename = "added-domains-cache-size")]
    pub added_domains_cache_size: usize,

    /// Priority assigned to newly discovered domains
    #[serde(rename = "default-domain-priority")]
    pub default_domain_priority: Priority,

    /// Session-id parameter names purged during normalization, matched
    /// case-insensitively in both paths and query strings
    #[serde(rename = "purge-sid-list")]
    pub purge_sid_list: Vec<String>,
}

/// Fetcher-side liveness settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// TTL written into `active_fetchers`; a fetcher that stops calling
    /// `keep_alive` for this long is considered dead
    #[serde(rename = "active-fetchers-ttl", with = "humantime_serde")]
    pub active_fetchers_ttl: Duration,
}

/// Dispatcher pass and segment-generation settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Worker-pool size for concurrent segment generation
    #[serde(rename = "num-concurrent-domains")]
    pub num_concurrent_domains: usize,

    /// Wait between dispatcher passes
    #[serde(rename = "dispatch-interval", with = "humantime_serde")]
    pub dispatch_interval: Duration,

    /// Minimum age before a crawled link may be re-emitted in a segment
    #[serde(rename = "min-link-refresh-time", with = "humantime_serde")]
    pub min_link_refresh_time: Duration,

    /// Hard cap on segment size
    #[serde(rename = "max-links-per-segment")]
    pub max_links_per_segment: usize,

    /// 0-100; share of the non-getnow segment slice reserved for recrawls
    #[serde(rename = "refresh-percentage")]
    pub refresh_percentage: u8,

    /// Enable the URL-correction rewrite during segment generation
    #[serde(rename = "correct-link-normalization")]
    pub correct_link_normalization: bool,

    /// Skip period after a pass found nothing to dispatch for a domain
    #[serde(rename = "empty-dispatch-retry-interval", with = "humantime_serde")]
    pub empty_dispatch_retry_interval: Duration,

    /// Fraction of the fetcher TTL used as the liveness-cache expiry
    #[serde(rename = "active-fetchers-cacheratio")]
    pub active_fetchers_cacheratio: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1:9042".to_string()],
            keyspace: "webherd".to_string(),
            num_query_retries: 3,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            add_new_domains: true,
            added_domains_cache_size: 4096,
            default_domain_priority: Priority(0),
            purge_sid_list: DEFAULT_PURGE_SIDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            active_fetchers_ttl: Duration::from_secs(15 * 60),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_concurrent_domains: 8,
            dispatch_interval: Duration::from_secs(10 * 60),
            min_link_refresh_time: Duration::from_secs(60 * 60),
            max_links_per_segment: 500,
            refresh_percentage: 25,
            correct_link_normalization: false,
            empty_dispatch_retry_interval: Duration::from_secs(2 * 60 * 60),
            active_fetchers_cacheratio: 0.75,
        }
    }
}
