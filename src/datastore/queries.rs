//! Model queries consumed by operational tooling
//!
//! Read-mostly lookups over domains and links plus the bulk link-insert
//! path. Link listings are distinct per URL (latest fetch row only) and
//! paginate by the five-tuple key of the last URL of the previous page.

use crate::datastore::Datastore;
use crate::model::{DomainInfo, LinkRow, Priority, UrlKey};
use crate::url::{canonicalize, CrawlUrl};
use crate::{HerdError, Result};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};

/// Field-wise update applied by [`Datastore::update_domain`]; `None` leaves
/// the column untouched.
#[derive(Debug, Clone, Default)]
pub struct DomainUpdate {
    pub priority: Option<Priority>,
    pub excluded: Option<bool>,
    pub exclude_reason: Option<String>,
}

impl Datastore {
    /// Single-domain lookup.
    pub async fn find_domain(&self, dom: &str) -> Result<Option<DomainInfo>> {
        Ok(self.store.find_domain(dom).await?)
    }

    /// Pages domains in scan order, starting strictly after `seed`.
    pub async fn list_domains(
        &self,
        seed: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DomainInfo>> {
        Ok(self.store.scan_domains(seed, limit).await?)
    }

    /// The most recent history row of one URL, if any.
    pub async fn find_link(&self, url: &CrawlUrl) -> Result<Option<LinkRow>> {
        let history = self.store.link_history(&url.key()).await?;
        Ok(history.into_iter().max_by_key(|row| row.time))
    }

    /// Every history row of one URL, oldest first.
    pub async fn list_link_historical(&self, url: &CrawlUrl) -> Result<Vec<LinkRow>> {
        Ok(self.store.link_history(&url.key()).await?)
    }

    /// Lists distinct links under a domain: one row per URL, carrying its
    /// latest fetch.
    ///
    /// `seed` is the key of the last URL of the previous page; pass `None`
    /// for the first page. `filter` drops URLs whose string form does not
    /// match.
    pub async fn list_links(
        &self,
        dom: &str,
        seed: Option<&UrlKey>,
        limit: usize,
        filter: Option<&Regex>,
    ) -> Result<Vec<LinkRow>> {
        // url string -> (latest time seen, index in `out`); a later-arriving
        // row with a newer time replaces the entry in place.
        let mut latest: HashMap<String, (chrono::DateTime<chrono::Utc>, usize)> = HashMap::new();
        let mut out: Vec<LinkRow> = Vec::new();
        let mut cursor = seed.cloned();

        loop {
            let rows = self.store.links_page(dom, cursor.as_ref(), limit).await?;
            if rows.is_empty() {
                break;
            }
            cursor = rows.last().map(|row| row.key.clone());

            for row in rows {
                let display = CrawlUrl::from_key(&row.key, row.time).to_string();
                if let Some(filter) = filter {
                    if !filter.is_match(&display) {
                        continue;
                    }
                }

                match latest.get(&display) {
                    Some(&(seen, index)) => {
                        if row.time > seen {
                            latest.insert(display, (row.time, index));
                            out[index] = row;
                        }
                    }
                    None => {
                        latest.insert(display, (row.time, out.len()));
                        out.push(row);
                    }
                }
            }

            if out.len() >= limit {
                break;
            }
        }

        out.truncate(limit);
        Ok(out)
    }

    /// Parses, normalizes, and inserts a batch of URLs as epoch rows,
    /// creating any missing domains along the way.
    ///
    /// Bad inputs do not stop the batch: every failure is collected and the
    /// remaining URLs proceed. A non-empty `exclude_reason` soft-excludes
    /// each newly created domain, so the URLs are stored but never
    /// dispatched.
    pub async fn insert_links(&self, links: &[&str], exclude_reason: &str) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let mut parsed: Vec<CrawlUrl> = Vec::new();
        let mut domains: BTreeSet<String> = BTreeSet::new();
        for raw in links {
            match CrawlUrl::parse(raw) {
                Ok(url) => {
                    let url = canonicalize(&url, &self.config.links.purge_sid_list);
                    domains.insert(url.dom.clone());
                    parsed.push(url);
                }
                Err(err) => errors.push(format!("{raw}: {err}")),
            }
        }

        for dom in &domains {
            let known = match self.find_domain(dom).await {
                Ok(info) => info.is_some(),
                Err(err) => {
                    errors.push(format!("{dom}: {err}"));
                    continue;
                }
            };
            if !known {
                if let Err(err) = self.add_domain_with_exclude_reason(dom, exclude_reason).await {
                    errors.push(format!("{dom}: {err}"));
                }
            }
        }

        for url in &parsed {
            if let Err(err) = self.store.insert_link(&LinkRow::parsed(url.key())).await {
                errors.push(format!("{url}: {err}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HerdError::PartialInsert(errors))
        }
    }

    /// Convenience single-URL form of [`Self::insert_links`].
    pub async fn insert_link(&self, link: &str, exclude_reason: &str) -> Result<()> {
        self.insert_links(&[link], exclude_reason).await
    }

    /// Applies a field-wise update to a domain row.
    pub async fn update_domain(&self, dom: &str, update: DomainUpdate) -> Result<()> {
        if self.store.find_domain(dom).await?.is_none() {
            return Err(HerdError::UnknownDomain(dom.to_string()));
        }

        if let Some(priority) = update.priority {
            if !priority.is_valid() {
                return Err(HerdError::Config(crate::ConfigError::Validation(format!(
                    "priority {priority} is not an allowed priority class"
                ))));
            }
            self.store.set_domain_priority(dom, priority).await?;
        }

        if update.excluded.is_some() || update.exclude_reason.is_some() {
            let current = self.store.find_domain(dom).await?;
            let current = current.as_ref();
            let excluded = update
                .excluded
                .unwrap_or_else(|| current.map(|i| i.excluded).unwrap_or(false));
            let reason = update
                .exclude_reason
                .or_else(|| current.and_then(|i| i.exclude_reason.clone()));
            self.store
                .set_domain_exclusion(dom, excluded, reason.as_deref())
                .await?;
        }

        Ok(())
    }
}
