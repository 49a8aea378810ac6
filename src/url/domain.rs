use crate::{UrlError, UrlResult};

/// Splits a host into its registerable domain (TLD+1) and subdomain parts.
///
/// The registerable domain is the public suffix plus one label, so
/// `example.co.uk` stays whole while `blog.example.co.uk` splits into
/// `("example.co.uk", "blog")`. A host with no subdomain yields an empty
/// subdomain string.
///
/// # Examples
///
/// ```
/// use webherd::url::split_host;
///
/// assert_eq!(
///     split_host("blog.example.com").unwrap(),
///     ("example.com".to_string(), "blog".to_string())
/// );
/// assert_eq!(
///     split_host("example.com").unwrap(),
///     ("example.com".to_string(), "".to_string())
/// );
/// ```
pub fn split_host(host: &str) -> UrlResult<(String, String)> {
    let host = host.to_lowercase();
    let dom = psl::domain_str(&host)
        .ok_or_else(|| UrlError::MissingDomain(host.clone()))?
        .to_string();

    let subdom = host[..host.len() - dom.len()]
        .trim_end_matches('.')
        .to_string();

    Ok((dom, subdom))
}
