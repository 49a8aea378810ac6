//! URL canonicalization
//!
//! The corpus accumulates denormalized URLs from parsed pages: mixed-case
//! hosts, session-id junk in paths and query strings, unsorted parameters.
//! Canonicalization maps each of those to a single stable form so the
//! per-URL crawl history lands on one key.

use crate::url::CrawlUrl;

/// Default session-id parameter names purged from paths and query strings.
pub const DEFAULT_PURGE_SIDS: &[&str] = &["jsessionid", "phpsessid"];

/// Returns the canonical form of a URL.
///
/// # Normalization Steps
///
/// 1. Lowercase the scheme and the host (which may change the TLD+1 split)
/// 2. Drop `;name=value` path segments whose name is a session id
/// 3. Drop query parameters whose name is a session id
/// 4. Sort the remaining query parameters lexicographically
///
/// Session-id names are matched case-insensitively against `purge_sids`.
/// The transformation is idempotent: canonicalizing a canonical URL is a
/// no-op.
pub fn canonicalize(url: &CrawlUrl, purge_sids: &[String]) -> CrawlUrl {
    let (path, query) = match url.path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (url.path.as_str(), None),
    };

    let mut path = strip_path_sids(path, purge_sids);
    if let Some(query) = query {
        let cleaned = clean_query(query, purge_sids);
        if !cleaned.is_empty() {
            path.push('?');
            path.push_str(&cleaned);
        }
    }

    CrawlUrl {
        proto: url.proto.to_lowercase(),
        subdom: url.subdom.to_lowercase(),
        dom: url.dom.to_lowercase(),
        path,
        last_crawled: url.last_crawled,
    }
}

/// Removes session-id matrix parameters (`;name=value`) from a path.
///
/// Non-session matrix parameters are preserved in place.
fn strip_path_sids(path: &str, purge_sids: &[String]) -> String {
    if !path.contains(';') {
        return path.to_string();
    }

    path.split('/')
        .map(|segment| {
            let mut parts = segment.split(';');
            // The leading part is the segment proper; the rest are matrix params.
            let mut out = parts.next().unwrap_or("").to_string();
            for param in parts {
                if !is_session_param(param, purge_sids) {
                    out.push(';');
                    out.push_str(param);
                }
            }
            out
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Drops session-id parameters from a raw query string and sorts the rest.
fn clean_query(query: &str, purge_sids: &[String]) -> String {
    let mut params: Vec<&str> = query
        .split('&')
        .filter(|p| !p.is_empty() && !is_session_param(p, purge_sids))
        .collect();

    params.sort_unstable();
    params.join("&")
}

/// Checks a `name=value` (or bare `name`) pair against the purge list,
/// case-insensitively.
fn is_session_param(param: &str, purge_sids: &[String]) -> bool {
    let name = param.split('=').next().unwrap_or(param);
    purge_sids.iter().any(|sid| sid.eq_ignore_ascii_case(name))
}
