//! Webherd: a distributed crawl control plane
//!
//! This crate coordinates a fleet of independent fetcher processes over a
//! shared wide-column store. Fetchers claim domains, drain per-domain URL
//! batches ("segments"), record fetch results, and release their claims. A
//! separate dispatcher process scans the corpus, builds the next segment for
//! each ready domain, and reclaims work stranded by dead fetchers.

pub mod cache;
pub mod config;
pub mod datastore;
pub mod dispatcher;
pub mod model;
pub mod store;
pub mod url;

use thiserror::Error;

/// Main error type for webherd operations
#[derive(Debug, Error)]
pub enum HerdError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("Link batch partially failed: {0:?}")]
    PartialInsert(Vec<String>),

    #[error("Unknown domain: {0}")]
    UnknownDomain(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("URL is not absolute: {0}")]
    NotAbsolute(String),

    #[error("No registerable domain in host: {0}")]
    MissingDomain(String),
}

/// Result type alias for webherd operations
pub type Result<T> = std::result::Result<T, HerdError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use datastore::{Datastore, FetchResult};
pub use dispatcher::Dispatcher;
pub use model::{not_yet_crawled, DomainInfo, LinkRow, Priority, SegmentRow, ZERO_TOKEN};
pub use url::CrawlUrl;
