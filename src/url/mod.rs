//! The canonical URL value used across the control plane
//!
//! A [`CrawlUrl`] is identified by the five-tuple
//! `(dom, subdom, path, proto, last_crawled)`, the same tuple that keys the
//! `links` table, and knows how to produce its canonical (normalized) form
//! and a stable fingerprint.

mod domain;
mod normalize;

pub use domain::split_host;
pub use normalize::{canonicalize, DEFAULT_PURGE_SIDS};

use crate::model::{not_yet_crawled, UrlKey};
use crate::{UrlError, UrlResult};
use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use std::hash::Hasher;
use url::Url;

/// A URL decomposed the way the store keys it.
///
/// `path` carries the path together with any query string; fragments are
/// dropped at parse time and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlUrl {
    /// Lowercase scheme, `http` or `https`.
    pub proto: String,

    /// Subdomain labels left of the registerable domain; empty for a bare
    /// domain.
    pub subdom: String,

    /// Registerable domain (TLD+1).
    pub dom: String,

    /// Path plus optional `?query`.
    pub path: String,

    /// Time of the most recent fetch; the epoch sentinel if never fetched.
    pub last_crawled: DateTime<Utc>,
}

impl CrawlUrl {
    /// Parses an absolute http(s) URL into its keyed form.
    ///
    /// Relative references, non-http schemes, and hosts without a
    /// registerable domain are rejected.
    pub fn parse(raw: &str) -> UrlResult<Self> {
        let parsed = Url::parse(raw).map_err(|e| match e {
            url::ParseError::RelativeUrlWithoutBase => UrlError::NotAbsolute(raw.to_string()),
            other => UrlError::Parse(other.to_string()),
        })?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(UrlError::InvalidScheme(parsed.scheme().to_string()));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| UrlError::MissingDomain(raw.to_string()))?;
        let (dom, subdom) = split_host(host)?;

        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            proto: parsed.scheme().to_string(),
            subdom,
            dom,
            path,
            last_crawled: not_yet_crawled(),
        })
    }

    /// Rebuilds a URL from a stored row key.
    pub fn from_key(key: &UrlKey, last_crawled: DateTime<Utc>) -> Self {
        Self {
            proto: key.proto.clone(),
            subdom: key.subdom.clone(),
            dom: key.dom.clone(),
            path: key.path.clone(),
            last_crawled,
        }
    }

    /// The four-column store key.
    pub fn key(&self) -> UrlKey {
        UrlKey::new(
            self.dom.clone(),
            self.subdom.clone(),
            self.path.clone(),
            self.proto.clone(),
        )
    }

    /// The five-tuple identity used everywhere as this URL's primary key.
    pub fn primary_key(&self) -> (String, String, String, String, DateTime<Utc>) {
        (
            self.dom.clone(),
            self.subdom.clone(),
            self.path.clone(),
            self.proto.clone(),
            self.last_crawled,
        )
    }

    /// Full host, `subdom.dom` or bare `dom`.
    pub fn host(&self) -> String {
        if self.subdom.is_empty() {
            self.dom.clone()
        } else {
            format!("{}.{}", self.subdom, self.dom)
        }
    }

    /// Returns the canonical form of this URL, or `None` when it is already
    /// canonical.
    pub fn normalized_form(&self, purge_sids: &[String]) -> Option<CrawlUrl> {
        let canon = canonicalize(self, purge_sids);
        if canon.key() == self.key() {
            None
        } else {
            Some(canon)
        }
    }

    /// FNV-1a fingerprint of the canonical string form.
    pub fn fingerprint(&self, purge_sids: &[String]) -> i64 {
        let canon = canonicalize(self, purge_sids);
        let mut hasher = FnvHasher::default();
        hasher.write(canon.to_string().as_bytes());
        hasher.finish() as i64
    }
}

impl std::fmt::Display for CrawlUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.proto, self.host(), self.path)
    }
}
