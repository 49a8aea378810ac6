//! The dispatcher
//!
//! A long-lived loop that keeps the fleet fed: every pass scans the whole
//! `domain_info` table, queues each ready domain to a worker pool for
//! segment generation, and reclaims domains whose owning fetcher has
//! stopped heartbeating. A single stop signal drains in-flight work before
//! shutdown returns.

mod correct;
mod segment;

use crate::config::Config;
use crate::model::{DomainInfo, ZERO_TOKEN};
use crate::store::Store;
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

/// Quit-poll granularity during the inter-pass sleep.
const QUIT_POLL: Duration = Duration::from_millis(10);

/// Backoff between liveness-read retries.
const LIVENESS_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Stranded-claim recovery abandons a token after this many store errors.
const MAX_CLEANUP_ERRORS: usize = 5;

/// State shared with worker and recovery tasks.
pub(crate) struct DispatchShared {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: Config,

    /// Tokens whose cleanup has been launched. Treated as alive by the
    /// liveness check so a token is never reclaimed twice.
    removed_toks: StdMutex<HashSet<Uuid>>,
}

/// Requests dispatcher shutdown from another task.
#[derive(Clone)]
pub struct StopHandle {
    quit: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Signals the dispatcher to stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.quit.send(true);
    }
}

/// The dispatcher process
///
/// [`Dispatcher::run`] blocks until a [`StopHandle`] fires; tests and
/// one-shot tooling drive single passes through [`Dispatcher::run_once`].
pub struct Dispatcher {
    shared: Arc<DispatchShared>,

    /// Liveness cache: token -> last time `active_fetchers` confirmed it.
    /// Only the dispatcher's own loop touches this, never the workers.
    active_toks: HashMap<Uuid, Instant>,

    quit: Arc<watch::Sender<bool>>,
    quit_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        let (quit, quit_rx) = watch::channel(false);
        Self {
            shared: Arc::new(DispatchShared {
                store,
                config,
                removed_toks: StdMutex::new(HashSet::new()),
            }),
            active_toks: HashMap::new(),
            quit: Arc::new(quit),
            quit_rx,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            quit: self.quit.clone(),
        }
    }

    fn should_quit(&self) -> bool {
        *self.quit_rx.borrow()
    }

    /// Runs dispatcher passes until stopped.
    ///
    /// A failed pass is logged and retried after the normal interval; only
    /// the stop signal ends the loop. Between passes the sleep polls the
    /// signal every few milliseconds so shutdown stays prompt.
    pub async fn run(mut self) {
        tracing::info!(
            "dispatcher running, {} segment workers",
            self.shared.config.dispatcher.num_concurrent_domains
        );

        loop {
            if let Err(err) = self.run_once().await {
                tracing::error!("dispatcher pass failed: {err}");
            }
            if self.should_quit() {
                break;
            }

            let deadline = Instant::now() + self.shared.config.dispatcher.dispatch_interval;
            while Instant::now() < deadline {
                if self.should_quit() {
                    tracing::info!("dispatcher stopping");
                    return;
                }
                tokio::time::sleep(QUIT_POLL).await;
            }
        }

        tracing::info!("dispatcher stopped");
    }

    /// One full pass over the corpus.
    ///
    /// Ready domains (undispatched, unexcluded, and past any empty-dispatch
    /// cooldown) go to the segment workers; claimed domains whose fetcher
    /// has expired go to stranded-claim recovery. Returns once all spawned
    /// work has drained.
    pub async fn run_once(&mut self) -> Result<()> {
        let domains = self.shared.store.scan_all_domains().await?;
        let now = Utc::now();

        let workers_wanted = self.shared.config.dispatcher.num_concurrent_domains;
        let (tx, rx) = mpsc::channel::<String>(workers_wanted);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(workers_wanted);
        for _ in 0..workers_wanted {
            let shared = self.shared.clone();
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let dom = { rx.lock().await.recv().await };
                    match dom {
                        Some(dom) => {
                            if let Err(err) = shared.generate_segment(&dom).await {
                                tracing::error!("segment generation for {dom} failed: {err}");
                            }
                        }
                        None => break,
                    }
                }
            }));
        }

        let mut recoveries = Vec::new();
        for info in domains {
            if self.should_quit() {
                break;
            }

            if !info.dispatched && !info.excluded {
                if empty_dispatch_suppressed(
                    &info,
                    now,
                    self.shared.config.dispatcher.empty_dispatch_retry_interval,
                ) {
                    continue;
                }
                if tx.send(info.dom).await.is_err() {
                    break;
                }
            } else if info.is_claimed() && !self.fetcher_is_alive(info.claim_tok).await {
                let tok = info.claim_tok;
                self.shared.removed_toks.lock().unwrap().insert(tok);
                let shared = self.shared.clone();
                recoveries.push(tokio::spawn(async move {
                    shared.clean_stranded_claims(tok).await;
                }));
            }
        }

        // Closing the channel lets the workers drain and exit.
        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
        for recovery in recoveries {
            let _ = recovery.await;
        }

        Ok(())
    }

    /// Liveness check for a claim token, backed by `active_fetchers`.
    ///
    /// The zero token and tokens already queued for cleanup read as alive.
    /// Cache entries older than `ttl * cacheratio` are refreshed from the
    /// store, retrying until the read succeeds: a read failure must never
    /// be mistaken for a dead fetcher, or live work would be reclaimed.
    async fn fetcher_is_alive(&mut self, tok: Uuid) -> bool {
        if tok == ZERO_TOKEN {
            return true;
        }
        if self.shared.removed_toks.lock().unwrap().contains(&tok) {
            return true;
        }

        let ttl = self.shared.config.fetcher.active_fetchers_ttl;
        let cachetime = Duration::from_secs_f64(
            ttl.as_secs_f64() * self.shared.config.dispatcher.active_fetchers_cacheratio,
        );
        if let Some(seen) = self.active_toks.get(&tok) {
            if seen.elapsed() < cachetime {
                return true;
            }
        }

        loop {
            match self.shared.store.fetcher_alive(tok).await {
                Ok(true) => {
                    self.active_toks.insert(tok, Instant::now());
                    return true;
                }
                Ok(false) => {
                    self.active_toks.remove(&tok);
                    return false;
                }
                Err(err) => {
                    tracing::warn!("liveness read for {tok} failed, retrying: {err}");
                    tokio::time::sleep(LIVENESS_RETRY_BACKOFF).await;
                }
            }
        }
    }
}

impl DispatchShared {
    /// Releases every domain stranded by a dead fetcher token: segments
    /// deleted, claim and dispatched flags cleared. Gives up on the token
    /// after [`MAX_CLEANUP_ERRORS`] store failures; the next pass retries.
    async fn clean_stranded_claims(&self, tok: Uuid) {
        tracing::info!("reclaiming domains stranded by {tok}");

        let doms = match self.store.domains_claimed_by(tok).await {
            Ok(doms) => doms,
            Err(err) => {
                tracing::error!("stranded-claim scan for {tok} failed: {err}");
                return;
            }
        };

        let mut errors = 0usize;
        for dom in doms {
            if errors >= MAX_CLEANUP_ERRORS {
                tracing::error!("abandoning cleanup of {tok} after {errors} errors");
                return;
            }
            if let Err(err) = self.store.delete_segments(&dom).await {
                tracing::error!("segment delete for {dom} failed: {err}");
                errors += 1;
                continue;
            }
            if let Err(err) = self.store.release_domain(&dom).await {
                tracing::error!("claim release for {dom} failed: {err}");
                errors += 1;
                continue;
            }
            tracing::info!("reclaimed {dom}");
        }
    }
}

/// A domain whose last pass produced nothing is skipped until the retry
/// interval elapses.
fn empty_dispatch_suppressed(
    info: &DomainInfo,
    now: DateTime<Utc>,
    retry_interval: Duration,
) -> bool {
    if info.last_empty_dispatch <= info.last_dispatch {
        return false;
    }
    match chrono::Duration::from_std(retry_interval) {
        Ok(interval) => now.signed_duration_since(info.last_empty_dispatch) < interval,
        Err(_) => true,
    }
}
