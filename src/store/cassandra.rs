//! Cassandra-compatible store implementation
//!
//! All CQL lives here. The claim protocol's exclusivity rests on the
//! lightweight-transaction (`IF`) updates in this file; everything else is
//! plain reads and upserts. Transient query failures are retried up to the
//! configured budget before surfacing as [`StoreError`]s.

use crate::model::{
    DispatchStats, DomainInfo, LinkRow, Priority, SegmentRow, UrlKey, ZERO_TOKEN,
};
use crate::store::{Store, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::deserialize::row::ColumnIterator;
use scylla::deserialize::DeserializeValue;
use scylla::frame::response::result::CqlValue;
use scylla::frame::value::{Counter, CqlTimestamp};
use scylla::serialize::row::SerializeRow;
use scylla::transport::errors::QueryError;
use scylla::{QueryResult, Session, SessionBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Delay between retries of a transiently failed query.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Columns selected for a full `domain_info` row, in struct order.
const DOMAIN_COLUMNS: &str = "dom, priority, claim_tok, claim_time, dispatched, excluded, \
     exclude_reason, tot_links, uncrawled_links, queued_links, last_dispatch, last_empty_dispatch";

/// Columns selected for a full `links` row, in struct order.
const LINK_COLUMNS: &str = "dom, subdom, path, proto, time, status, error, robots_excluded, \
     redto_url, getnow, mime, fnv, body, headers";

type DomainTuple = (
    String,
    i32,
    Uuid,
    CqlTimestamp,
    bool,
    bool,
    Option<String>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<CqlTimestamp>,
    Option<CqlTimestamp>,
);

type LinkTuple = (
    String,
    String,
    String,
    String,
    CqlTimestamp,
    Option<i32>,
    Option<String>,
    Option<bool>,
    Option<String>,
    Option<bool>,
    Option<String>,
    Option<i64>,
    Option<String>,
    Option<HashMap<String, String>>,
);

/// [`Store`] backed by a Cassandra-compatible cluster
pub struct CassandraStore {
    session: Arc<Session>,
    retries: u32,
}

impl CassandraStore {
    /// Connects to the cluster and switches to the given keyspace.
    pub async fn connect(hosts: &[String], keyspace: &str, retries: u32) -> StoreResult<Self> {
        let session = SessionBuilder::new()
            .known_nodes(hosts)
            .build()
            .await
            .map_err(|e| StoreError::Session(e.to_string()))?;

        session
            .use_keyspace(keyspace, false)
            .await
            .map_err(|e| StoreError::Session(e.to_string()))?;

        Ok(Self {
            session: Arc::new(session),
            retries,
        })
    }

    /// Runs a query, retrying transient failures up to the retry budget.
    async fn execute(
        &self,
        query: &str,
        values: impl SerializeRow + Clone,
    ) -> StoreResult<QueryResult> {
        let mut attempt = 0;
        loop {
            match self.session.query_unpaged(query, values.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(
                        "query failed (attempt {attempt}/{}), retrying: {err}",
                        self.retries
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn dt_to_ts(dt: DateTime<Utc>) -> CqlTimestamp {
        CqlTimestamp(dt.timestamp_millis())
    }

    fn ts_to_dt(ts: CqlTimestamp) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ts.0).unwrap_or_default()
    }

    fn domain_from_tuple(t: DomainTuple) -> DomainInfo {
        let (
            dom,
            priority,
            claim_tok,
            claim_time,
            dispatched,
            excluded,
            exclude_reason,
            tot_links,
            uncrawled_links,
            queued_links,
            last_dispatch,
            last_empty_dispatch,
        ) = t;
        DomainInfo {
            dom,
            priority: Priority(priority as i8),
            claim_tok,
            claim_time: Self::ts_to_dt(claim_time),
            dispatched,
            excluded,
            exclude_reason,
            tot_links: tot_links.unwrap_or(0) as u64,
            uncrawled_links: uncrawled_links.unwrap_or(0) as u64,
            queued_links: queued_links.unwrap_or(0) as u64,
            last_dispatch: last_dispatch.map(Self::ts_to_dt).unwrap_or_default(),
            last_empty_dispatch: last_empty_dispatch.map(Self::ts_to_dt).unwrap_or_default(),
        }
    }

    fn link_from_tuple(t: LinkTuple) -> LinkRow {
        let (
            dom,
            subdom,
            path,
            proto,
            time,
            status,
            error,
            robots_excluded,
            redto_url,
            getnow,
            mime,
            fnv,
            body,
            headers,
        ) = t;
        LinkRow {
            key: UrlKey::new(dom, subdom, path, proto),
            time: Self::ts_to_dt(time),
            status,
            error,
            robots_excluded: robots_excluded.unwrap_or(false),
            redto_url,
            getnow: getnow.unwrap_or(false),
            mime,
            fnv,
            body,
            headers,
        }
    }

    fn collect_domains(result: QueryResult) -> StoreResult<Vec<DomainInfo>> {
        let rows = result
            .into_rows_result()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows
            .rows::<DomainTuple>()
            .map_err(|e| StoreError::Decode(e.to_string()))?
        {
            out.push(Self::domain_from_tuple(
                row.map_err(|e| StoreError::Decode(e.to_string()))?,
            ));
        }
        Ok(out)
    }

    fn collect_links(result: QueryResult) -> StoreResult<Vec<LinkRow>> {
        let rows = result
            .into_rows_result()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows
            .rows::<LinkTuple>()
            .map_err(|e| StoreError::Decode(e.to_string()))?
        {
            out.push(Self::link_from_tuple(
                row.map_err(|e| StoreError::Decode(e.to_string()))?,
            ));
        }
        Ok(out)
    }

    /// Extracts the `[applied]` flag of a lightweight-transaction result.
    ///
    /// The result shape differs between the applied and not-applied cases
    /// (the latter carries the current column values), so only the leading
    /// boolean is inspected.
    fn lwt_applied(result: QueryResult) -> StoreResult<bool> {
        let rows = result
            .into_rows_result()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut row = rows
            .first_row::<ColumnIterator>()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let first_raw = row
            .next()
            .transpose()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let first = match first_raw {
            Some(raw) => Some(
                Option::<CqlValue>::deserialize(raw.spec.typ(), raw.slice)
                    .map_err(|e| StoreError::Decode(e.to_string()))?,
            ),
            None => None,
        };
        match first {
            Some(Some(CqlValue::Boolean(applied))) => Ok(applied),
            _ => Err(StoreError::Decode(
                "conditional update returned no [applied] column".to_string(),
            )),
        }
    }
}

impl From<QueryError> for StoreError {
    fn from(err: QueryError) -> Self {
        StoreError::Query(err.to_string())
    }
}

#[async_trait]
impl Store for CassandraStore {
    async fn insert_domain_if_absent(&self, info: &DomainInfo) -> StoreResult<bool> {
        let query = format!(
            "INSERT INTO domain_info ({DOMAIN_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS"
        );
        let result = self
            .execute(
                &query,
                (
                    info.dom.as_str(),
                    info.priority.value() as i32,
                    info.claim_tok,
                    Self::dt_to_ts(info.claim_time),
                    info.dispatched,
                    info.excluded,
                    info.exclude_reason.as_deref(),
                    info.tot_links as i64,
                    info.uncrawled_links as i64,
                    info.queued_links as i64,
                    Self::dt_to_ts(info.last_dispatch),
                    Self::dt_to_ts(info.last_empty_dispatch),
                ),
            )
            .await?;
        Self::lwt_applied(result)
    }

    async fn find_domain(&self, dom: &str) -> StoreResult<Option<DomainInfo>> {
        let query = format!("SELECT {DOMAIN_COLUMNS} FROM domain_info WHERE dom = ?");
        let result = self.execute(&query, (dom,)).await?;
        Ok(Self::collect_domains(result)?.into_iter().next())
    }

    async fn set_domain_exclusion(
        &self,
        dom: &str,
        excluded: bool,
        reason: Option<&str>,
    ) -> StoreResult<()> {
        self.execute(
            "UPDATE domain_info SET excluded = ?, exclude_reason = ? WHERE dom = ?",
            (excluded, reason, dom),
        )
        .await?;
        Ok(())
    }

    async fn set_domain_priority(&self, dom: &str, priority: Priority) -> StoreResult<()> {
        self.execute(
            "UPDATE domain_info SET priority = ? WHERE dom = ?",
            (priority.value() as i32, dom),
        )
        .await?;
        Ok(())
    }

    async fn cas_claim_domain(
        &self,
        dom: &str,
        tok: Uuid,
        when: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = self
            .execute(
                "UPDATE domain_info SET claim_tok = ?, claim_time = ? WHERE dom = ? \
                 IF dispatched = true AND claim_tok = ?",
                (tok, Self::dt_to_ts(when), dom, ZERO_TOKEN),
            )
            .await?;
        Self::lwt_applied(result)
    }

    async fn release_domain(&self, dom: &str) -> StoreResult<()> {
        self.execute(
            "UPDATE domain_info SET dispatched = false, claim_tok = ?, queued_links = 0 \
             WHERE dom = ?",
            (ZERO_TOKEN, dom),
        )
        .await?;
        Ok(())
    }

    async fn mark_dispatched(&self, dom: &str, stats: DispatchStats) -> StoreResult<()> {
        self.execute(
            "UPDATE domain_info SET dispatched = true, last_dispatch = ?, tot_links = ?, \
             uncrawled_links = ?, queued_links = ? WHERE dom = ?",
            (
                Self::dt_to_ts(stats.last_dispatch),
                stats.tot_links as i64,
                stats.uncrawled_links as i64,
                stats.queued_links as i64,
                dom,
            ),
        )
        .await?;
        Ok(())
    }

    async fn record_empty_dispatch(&self, dom: &str, when: DateTime<Utc>) -> StoreResult<()> {
        self.execute(
            "UPDATE domain_info SET last_empty_dispatch = ? WHERE dom = ?",
            (Self::dt_to_ts(when), dom),
        )
        .await?;
        Ok(())
    }

    async fn scan_claimable(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<(String, Priority)>> {
        let result = match cursor {
            Some(cursor) => {
                self.execute(
                    "SELECT dom, priority FROM domain_info WHERE token(dom) > token(?) \
                     AND claim_tok = ? AND dispatched = true LIMIT ? ALLOW FILTERING",
                    (cursor, ZERO_TOKEN, limit as i32),
                )
                .await?
            }
            None => {
                self.execute(
                    "SELECT dom, priority FROM domain_info WHERE claim_tok = ? \
                     AND dispatched = true LIMIT ? ALLOW FILTERING",
                    (ZERO_TOKEN, limit as i32),
                )
                .await?
            }
        };

        let rows = result
            .into_rows_result()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows
            .rows::<(String, i32)>()
            .map_err(|e| StoreError::Decode(e.to_string()))?
        {
            let (dom, priority) = row.map_err(|e| StoreError::Decode(e.to_string()))?;
            out.push((dom, Priority(priority as i8)));
        }
        Ok(out)
    }

    async fn scan_domains(&self, seed: Option<&str>, limit: usize) -> StoreResult<Vec<DomainInfo>> {
        let result = match seed {
            Some(seed) => {
                let query = format!(
                    "SELECT {DOMAIN_COLUMNS} FROM domain_info \
                     WHERE token(dom) > token(?) LIMIT ?"
                );
                self.execute(&query, (seed, limit as i32)).await?
            }
            None => {
                let query = format!("SELECT {DOMAIN_COLUMNS} FROM domain_info LIMIT ?");
                self.execute(&query, (limit as i32,)).await?
            }
        };
        Self::collect_domains(result)
    }

    async fn scan_all_domains(&self) -> StoreResult<Vec<DomainInfo>> {
        let query = format!("SELECT {DOMAIN_COLUMNS} FROM domain_info");
        let result = self.execute(&query, ()).await?;
        Self::collect_domains(result)
    }

    async fn domains_claimed_by(&self, tok: Uuid) -> StoreResult<Vec<String>> {
        let result = self
            .execute(
                "SELECT dom FROM domain_info WHERE claim_tok = ? ALLOW FILTERING",
                (tok,),
            )
            .await?;
        let rows = result
            .into_rows_result()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows
            .rows::<(String,)>()
            .map_err(|e| StoreError::Decode(e.to_string()))?
        {
            out.push(row.map_err(|e| StoreError::Decode(e.to_string()))?.0);
        }
        Ok(out)
    }

    async fn add_claim_credit(&self, dom: &str, delta: i64) -> StoreResult<()> {
        self.execute(
            "UPDATE domain_counters SET next_crawl = next_crawl + ? WHERE dom = ?",
            (delta, dom),
        )
        .await?;
        Ok(())
    }

    async fn read_claim_credit(&self, dom: &str) -> StoreResult<i64> {
        let result = self
            .execute("SELECT next_crawl FROM domain_counters WHERE dom = ?", (dom,))
            .await?;
        let rows = result
            .into_rows_result()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut iter = rows
            .rows::<(Counter,)>()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        match iter.next() {
            Some(row) => Ok(row.map_err(|e| StoreError::Decode(e.to_string()))?.0 .0),
            None => Ok(0),
        }
    }

    async fn insert_link(&self, row: &LinkRow) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO links ({LINK_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        self.execute(
            &query,
            (
                row.key.dom.as_str(),
                row.key.subdom.as_str(),
                row.key.path.as_str(),
                row.key.proto.as_str(),
                Self::dt_to_ts(row.time),
                row.status,
                row.error.as_deref(),
                row.robots_excluded,
                row.redto_url.as_deref(),
                row.getnow,
                row.mime.as_deref(),
                row.fnv,
                row.body.as_deref(),
                row.headers.as_ref(),
            ),
        )
        .await?;
        Ok(())
    }

    async fn link_history(&self, key: &UrlKey) -> StoreResult<Vec<LinkRow>> {
        let query = format!(
            "SELECT {LINK_COLUMNS} FROM links \
             WHERE dom = ? AND subdom = ? AND path = ? AND proto = ?"
        );
        let result = self
            .execute(
                &query,
                (
                    key.dom.as_str(),
                    key.subdom.as_str(),
                    key.path.as_str(),
                    key.proto.as_str(),
                ),
            )
            .await?;
        Self::collect_links(result)
    }

    async fn scan_links(&self, dom: &str) -> StoreResult<Vec<LinkRow>> {
        // Relaxed read: segment generation tolerates staleness, the cost of
        // a stale row is at most one extra refetch.
        let query = format!("SELECT {LINK_COLUMNS} FROM links WHERE dom = ?");
        let result = self.execute(&query, (dom,)).await?;
        Self::collect_links(result)
    }

    async fn links_page(
        &self,
        dom: &str,
        seed: Option<&UrlKey>,
        limit: usize,
    ) -> StoreResult<Vec<LinkRow>> {
        let Some(seed) = seed else {
            let query = format!("SELECT {LINK_COLUMNS} FROM links WHERE dom = ? LIMIT ?");
            let result = self.execute(&query, (dom, limit as i32)).await?;
            return Self::collect_links(result);
        };

        // Resuming mid-partition takes three successively wider clustering
        // ranges: same (subdom, path) past the seed proto, same subdom past
        // the seed path, then past the seed subdom.
        let mut out = Vec::new();

        let query = format!(
            "SELECT {LINK_COLUMNS} FROM links \
             WHERE dom = ? AND subdom = ? AND path = ? AND proto > ? LIMIT ?"
        );
        let result = self
            .execute(
                &query,
                (
                    dom,
                    seed.subdom.as_str(),
                    seed.path.as_str(),
                    seed.proto.as_str(),
                    limit as i32,
                ),
            )
            .await?;
        out.extend(Self::collect_links(result)?);

        if out.len() < limit {
            let query = format!(
                "SELECT {LINK_COLUMNS} FROM links \
                 WHERE dom = ? AND subdom = ? AND path > ? LIMIT ?"
            );
            let result = self
                .execute(
                    &query,
                    (
                        dom,
                        seed.subdom.as_str(),
                        seed.path.as_str(),
                        (limit - out.len()) as i32,
                    ),
                )
                .await?;
            out.extend(Self::collect_links(result)?);
        }

        if out.len() < limit {
            let query = format!(
                "SELECT {LINK_COLUMNS} FROM links WHERE dom = ? AND subdom > ? LIMIT ?"
            );
            let result = self
                .execute(
                    &query,
                    (dom, seed.subdom.as_str(), (limit - out.len()) as i32),
                )
                .await?;
            out.extend(Self::collect_links(result)?);
        }

        Ok(out)
    }

    async fn delete_link_history(&self, key: &UrlKey) -> StoreResult<()> {
        self.execute(
            "DELETE FROM links WHERE dom = ? AND subdom = ? AND path = ? AND proto = ?",
            (
                key.dom.as_str(),
                key.subdom.as_str(),
                key.path.as_str(),
                key.proto.as_str(),
            ),
        )
        .await?;
        Ok(())
    }

    async fn insert_segment(&self, row: &SegmentRow) -> StoreResult<()> {
        self.execute(
            "INSERT INTO segments (dom, subdom, path, proto, time) VALUES (?, ?, ?, ?, ?)",
            (
                row.key.dom.as_str(),
                row.key.subdom.as_str(),
                row.key.path.as_str(),
                row.key.proto.as_str(),
                Self::dt_to_ts(row.time),
            ),
        )
        .await?;
        Ok(())
    }

    async fn segments_for_domain(&self, dom: &str) -> StoreResult<Vec<SegmentRow>> {
        let result = self
            .execute(
                "SELECT dom, subdom, path, proto, time FROM segments WHERE dom = ?",
                (dom,),
            )
            .await?;
        let rows = result
            .into_rows_result()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows
            .rows::<(String, String, String, String, CqlTimestamp)>()
            .map_err(|e| StoreError::Decode(e.to_string()))?
        {
            let (dom, subdom, path, proto, time) =
                row.map_err(|e| StoreError::Decode(e.to_string()))?;
            out.push(SegmentRow {
                key: UrlKey::new(dom, subdom, path, proto),
                time: Self::ts_to_dt(time),
            });
        }
        Ok(out)
    }

    async fn delete_segments(&self, dom: &str) -> StoreResult<()> {
        self.execute("DELETE FROM segments WHERE dom = ?", (dom,))
            .await?;
        Ok(())
    }

    async fn write_keep_alive(&self, tok: Uuid, ttl: Duration) -> StoreResult<()> {
        self.execute(
            "INSERT INTO active_fetchers (tok) VALUES (?) USING TTL ?",
            (tok, ttl.as_secs() as i32),
        )
        .await?;
        Ok(())
    }

    async fn fetcher_alive(&self, tok: Uuid) -> StoreResult<bool> {
        let result = self
            .execute("SELECT tok FROM active_fetchers WHERE tok = ?", (tok,))
            .await?;
        let rows = result
            .into_rows_result()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut iter = rows
            .rows::<(Uuid,)>()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(iter.next().is_some())
    }

    async fn max_priority(&self) -> StoreResult<Option<i8>> {
        let result = self
            .execute(
                "SELECT val FROM walker_globals WHERE key = 'max_priority'",
                (),
            )
            .await?;
        let rows = result
            .into_rows_result()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut iter = rows
            .rows::<(i32,)>()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        match iter.next() {
            Some(row) => Ok(Some(
                row.map_err(|e| StoreError::Decode(e.to_string()))?.0 as i8,
            )),
            None => Ok(None),
        }
    }

    async fn truncate_all(&self) -> StoreResult<()> {
        for table in [
            "domain_info",
            "domain_counters",
            "links",
            "segments",
            "active_fetchers",
            "walker_globals",
        ] {
            self.execute(&format!("TRUNCATE {table}"), ()).await?;
        }
        Ok(())
    }
}
