//! Single-flight access to holder counts on top of the shared cache.
//!
//! Every caller that needs a value the cache does not have goes through
//! [`HolderFetcher`]: the first one claims the mint and performs the fetch,
//! everyone else waits for that claim to end and reads the result.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use holder_watch_domain::{
    CacheEntry, CacheState, FailureCache, FetchErrorKind, HolderCache, Mint,
};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::rpc::{FetchError, HolderSource};

/// How the value in a [`Lookup`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched {
    /// Served from the cache without waiting.
    Cached,
    /// This caller performed the upstream fetch.
    Origin,
    /// Another caller's in-flight fetch produced the value.
    Joined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub entry: CacheEntry,
    pub fetched: Fetched,
}

impl Lookup {
    /// Only the caller that went upstream reports an uncached value.
    pub fn cached(&self) -> bool {
        self.fetched != Fetched::Origin
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LookupError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("a recent fetch failed ({}); retry shortly", .0.as_ref())]
    RecentFailure(FetchErrorKind),
    #[error("a fetch for this mint is still in progress")]
    StillPending,
    #[error("fetch task ended unexpectedly: {0}")]
    Interrupted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Refreshed(u64),
    /// Another fetch already holds the claim for this mint.
    Skipped,
    Failed(FetchError),
}

/// Releases a claim on drop unless it was settled by an upsert.
struct ClaimGuard<'a> {
    cache: &'a HolderCache,
    mint: &'a Mint,
    armed: bool,
}

impl<'a> ClaimGuard<'a> {
    fn new(cache: &'a HolderCache, mint: &'a Mint) -> Self {
        Self {
            cache,
            mint,
            armed: true,
        }
    }

    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.release_pending(self.mint);
        }
    }
}

#[derive(Clone)]
pub struct HolderFetcher {
    cache: Arc<HolderCache>,
    failures: Arc<FailureCache>,
    source: Arc<dyn HolderSource>,
    pending_wait: Duration,
}

impl HolderFetcher {
    pub fn new(
        cache: Arc<HolderCache>,
        failures: Arc<FailureCache>,
        source: Arc<dyn HolderSource>,
        pending_wait: Duration,
    ) -> Self {
        Self {
            cache,
            failures,
            source,
            pending_wait,
        }
    }

    pub fn cache(&self) -> &Arc<HolderCache> {
        &self.cache
    }

    /// Returns the cached value for `mint`, fetching it first when the mint
    /// has never been seen.
    pub async fn lookup(&self, mint: &Mint) -> Result<Lookup, LookupError> {
        if let Some(entry) = self.cache.get(mint) {
            self.cache.record_request(mint);
            return Ok(Lookup {
                entry,
                fetched: Fetched::Cached,
            });
        }

        let lookup = self.first_fetch(mint).await?;
        self.cache.record_request(mint);
        Ok(lookup)
    }

    async fn first_fetch(&self, mint: &Mint) -> Result<Lookup, LookupError> {
        if let Some(kind) = self.failures.recent(mint) {
            debug!(mint = %mint, kind = kind.as_ref(), "failing fast after recent error");
            return Err(LookupError::RecentFailure(kind));
        }

        if !self.cache.mark_pending(mint) {
            return self.join(mint).await;
        }

        // Someone may have stored a value between our read and the claim.
        if self.cache.get(mint).is_some() {
            self.cache.release_pending(mint);
            return self.settled(mint);
        }

        // The claimed fetch runs detached so a dropped caller cannot leave the
        // mint pending forever.
        let fetcher = self.clone();
        let key = mint.clone();
        let task = tokio::spawn(async move { fetcher.fetch_claimed(&key).await });

        let entry = match task.await {
            Ok(result) => result?,
            Err(err) => return Err(LookupError::Interrupted(err.to_string())),
        };
        Ok(Lookup {
            entry,
            fetched: Fetched::Origin,
        })
    }

    async fn fetch_claimed(&self, mint: &Mint) -> Result<CacheEntry, FetchError> {
        let guard = ClaimGuard::new(&self.cache, mint);
        match self.source.fetch_holder_count(mint).await {
            Ok(count) => {
                let now = Utc::now();
                self.cache.upsert(mint, count, now);
                guard.settle();
                self.failures.clear(mint);
                counter!("holder_first_fetch_total", "result" => "ok").increment(1);
                debug!(mint = %mint, holders = count, "first fetch stored");

                Ok(self.cache.get(mint).unwrap_or(CacheEntry {
                    mint: mint.clone(),
                    holder_count: count,
                    last_updated: now,
                    state: CacheState::Fresh,
                    refreshing: false,
                }))
            }
            Err(err) => {
                // Recorded before the claim ends so woken waiters see it.
                self.failures.record(mint, err.kind());
                drop(guard);
                counter!(
                    "holder_first_fetch_total",
                    "result" => err.kind().as_ref().to_owned()
                )
                .increment(1);
                warn!(mint = %mint, %err, "first fetch failed");
                Err(err)
            }
        }
    }

    async fn join(&self, mint: &Mint) -> Result<Lookup, LookupError> {
        if let Some(pending) = self.cache.subscribe(mint) {
            if !pending.wait(self.pending_wait).await {
                debug!(mint = %mint, wait = ?self.pending_wait, "gave up waiting on fetch");
                return Err(LookupError::StillPending);
            }
        }
        self.settled(mint)
    }

    /// Reads the outcome of a claim that has ended.
    fn settled(&self, mint: &Mint) -> Result<Lookup, LookupError> {
        if let Some(entry) = self.cache.get(mint) {
            return Ok(Lookup {
                entry,
                fetched: Fetched::Joined,
            });
        }
        match self.failures.recent(mint) {
            Some(kind) => Err(LookupError::RecentFailure(kind)),
            None => Err(LookupError::StillPending),
        }
    }

    /// Fetches a new value for `mint` unless a fetch is already running. A
    /// failure leaves the stored value and timestamp untouched.
    pub async fn refresh(&self, mint: &Mint) -> RefreshOutcome {
        if !self.cache.mark_pending(mint) {
            return RefreshOutcome::Skipped;
        }
        let guard = ClaimGuard::new(&self.cache, mint);
        match self.source.fetch_holder_count(mint).await {
            Ok(count) => {
                self.cache.upsert(mint, count, Utc::now());
                guard.settle();
                RefreshOutcome::Refreshed(count)
            }
            Err(err) => RefreshOutcome::Failed(err),
        }
    }

    /// Fetches a current value for `mint`, sharing a fetch that is already in
    /// flight instead of starting a second one.
    pub async fn poll(&self, mint: &Mint) -> Result<CacheEntry, LookupError> {
        match self.refresh(mint).await {
            RefreshOutcome::Refreshed(_) => self
                .cache
                .get(mint)
                .ok_or(LookupError::StillPending),
            RefreshOutcome::Failed(err) => Err(LookupError::Fetch(err)),
            RefreshOutcome::Skipped => self.join(mint).await.map(|lookup| lookup.entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::task::JoinSet;

    use super::*;
    use crate::testing::{transport_error, usdc, wsol, ScriptedSource};

    fn fetcher(source: Arc<ScriptedSource>, wait: Duration) -> HolderFetcher {
        HolderFetcher::new(
            Arc::new(HolderCache::default()),
            Arc::new(FailureCache::default()),
            source,
            wait,
        )
    }

    #[tokio::test]
    async fn first_lookup_fetches_then_serves_cache() {
        let source = Arc::new(ScriptedSource::fixed(42));
        let fetcher = fetcher(source.clone(), Duration::from_secs(1));

        let first = fetcher.lookup(&wsol()).await.unwrap();
        assert_eq!(first.fetched, Fetched::Origin);
        assert!(!first.cached());
        assert_eq!(first.entry.holder_count, 42);

        let second = fetcher.lookup(&wsol()).await.unwrap();
        assert!(second.cached());
        assert_eq!(second.entry.last_updated, first.entry.last_updated);
        assert_eq!(source.calls(), 1);
        assert_eq!(fetcher.cache().tracked()[0].request_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_lookups_share_one_fetch() {
        let source =
            Arc::new(ScriptedSource::fixed(7).with_delay(Duration::from_millis(100)));
        let fetcher = fetcher(source.clone(), Duration::from_secs(5));

        let mut set = JoinSet::new();
        for _ in 0..16 {
            let fetcher = fetcher.clone();
            set.spawn(async move { fetcher.lookup(&wsol()).await });
        }

        let mut origins = 0;
        while let Some(result) = set.join_next().await {
            let lookup = result.unwrap().unwrap();
            assert_eq!(lookup.entry.holder_count, 7);
            if lookup.fetched == Fetched::Origin {
                origins += 1;
            }
        }
        assert_eq!(origins, 1);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn failed_first_fetch_leaves_no_entry_and_fails_fast() {
        let source = Arc::new(ScriptedSource::failing());
        let fetcher = fetcher(source.clone(), Duration::from_secs(1));

        let err = fetcher.lookup(&wsol()).await.unwrap_err();
        assert_eq!(err, LookupError::Fetch(transport_error()));
        assert!(fetcher.cache().get(&wsol()).is_none());
        assert!(fetcher.cache().is_empty());

        let err = fetcher.lookup(&wsol()).await.unwrap_err();
        assert_eq!(err, LookupError::RecentFailure(FetchErrorKind::Transport));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn waiter_gives_up_after_bound() {
        let source =
            Arc::new(ScriptedSource::fixed(1).with_delay(Duration::from_millis(300)));
        let fetcher = fetcher(source.clone(), Duration::from_millis(20));

        let winner = {
            let fetcher = fetcher.clone();
            tokio::spawn(async move { fetcher.lookup(&wsol()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(
            fetcher.lookup(&wsol()).await.unwrap_err(),
            LookupError::StillPending
        );
        assert_eq!(winner.await.unwrap().unwrap().entry.holder_count, 1);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn abandoned_lookup_still_populates_cache() {
        let source =
            Arc::new(ScriptedSource::fixed(5).with_delay(Duration::from_millis(50)));
        let fetcher = fetcher(source.clone(), Duration::from_secs(1));

        let caller = {
            let fetcher = fetcher.clone();
            tokio::spawn(async move { fetcher.lookup(&usdc()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let entry = fetcher.cache().get(&usdc()).expect("fetch completed");
        assert_eq!(entry.holder_count, 5);
        assert!(!fetcher.cache().is_pending(&usdc()));
    }

    #[tokio::test]
    async fn refresh_skips_claimed_mint_and_keeps_value_on_failure() {
        let source = Arc::new(ScriptedSource::scripted(
            vec![Ok(10)],
            Err(transport_error()),
        ));
        let fetcher = fetcher(source.clone(), Duration::from_secs(1));

        assert_eq!(fetcher.refresh(&wsol()).await, RefreshOutcome::Refreshed(10));
        let before = fetcher.cache().get(&wsol()).unwrap();

        assert!(fetcher.cache().mark_pending(&wsol()));
        assert_eq!(fetcher.refresh(&wsol()).await, RefreshOutcome::Skipped);
        fetcher.cache().release_pending(&wsol());

        assert!(matches!(
            fetcher.refresh(&wsol()).await,
            RefreshOutcome::Failed(_)
        ));
        let after = fetcher.cache().get(&wsol()).unwrap();
        assert_eq!(after.holder_count, before.holder_count);
        assert_eq!(after.last_updated, before.last_updated);
        assert!(!fetcher.cache().is_pending(&wsol()));
    }

    #[tokio::test]
    async fn poll_reports_fresh_counts() {
        let source = Arc::new(ScriptedSource::scripted(vec![Ok(3), Ok(4)], Ok(4)));
        let fetcher = fetcher(source, Duration::from_secs(1));

        assert_eq!(fetcher.poll(&wsol()).await.unwrap().holder_count, 3);
        assert_eq!(fetcher.poll(&wsol()).await.unwrap().holder_count, 4);
    }
}
