use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::gauge;
use moka::sync::Cache;
use tokio::sync::watch;
use tracing::debug;

use crate::model::{CacheEntry, CacheState, CacheStats, FetchErrorKind, Mint, TrackedToken};

/// Holder count and the instant it was observed. Replaced as a unit so a
/// reader can never pair a count with another write's timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    holder_count: u64,
    last_updated: DateTime<Utc>,
}

#[derive(Debug)]
struct Slot {
    snapshot: Option<Snapshot>,
    /// Present while a fetch for the key is in flight. Dropping the sender is
    /// the completion signal for every subscribed waiter.
    inflight: Option<watch::Sender<()>>,
    request_count: u64,
    first_seen: DateTime<Utc>,
}

impl Slot {
    fn placeholder(now: DateTime<Utc>) -> Self {
        Self {
            snapshot: None,
            inflight: None,
            request_count: 0,
            first_seen: now,
        }
    }

    /// Age-based state of the stored value. A refresh in flight does not
    /// hide staleness; only a valueless first-fetch placeholder is `Pending`.
    fn state(&self, now: DateTime<Utc>, ttl: Duration) -> CacheState {
        let Some(snapshot) = self.snapshot else {
            return CacheState::Pending;
        };
        let expired = (now - snapshot.last_updated)
            .to_std()
            .map(|age| age >= ttl)
            .unwrap_or(false);
        if expired {
            CacheState::Stale
        } else {
            CacheState::Fresh
        }
    }
}

/// Concurrent per-mint store of the latest known holder count.
///
/// Every operation touches a single key under that key's shard lock, so
/// contention on one mint never blocks reads or writes of another. Entries
/// are never evicted; the set of keys only grows.
#[derive(Debug)]
pub struct HolderCache {
    entries: DashMap<Mint, Slot>,
    ttl: Duration,
}

impl HolderCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the latest entry for `mint` if a value has ever been stored.
    pub fn get(&self, mint: &Mint) -> Option<CacheEntry> {
        self.get_at(mint, Utc::now())
    }

    /// Same as [`HolderCache::get`] with staleness evaluated against `now`.
    pub fn get_at(&self, mint: &Mint, now: DateTime<Utc>) -> Option<CacheEntry> {
        let slot = self.entries.get(mint)?;
        let snapshot = slot.snapshot?;
        Some(CacheEntry {
            mint: mint.clone(),
            holder_count: snapshot.holder_count,
            last_updated: snapshot.last_updated,
            state: slot.state(now, self.ttl),
            refreshing: slot.inflight.is_some(),
        })
    }

    /// Stores a new count for `mint` and ends any in-flight claim on it.
    ///
    /// Writes are monotonic per key: a write stamped before the stored
    /// `last_updated` is dropped and `false` is returned.
    pub fn upsert(&self, mint: &Mint, holder_count: u64, now: DateTime<Utc>) -> bool {
        let mut slot = self
            .entries
            .entry(mint.clone())
            .or_insert_with(|| Slot::placeholder(now));
        slot.inflight = None;

        if let Some(existing) = slot.snapshot {
            if now < existing.last_updated {
                debug!(mint = %mint, "dropping out-of-order holder count");
                return false;
            }
        }
        let first_value = slot.snapshot.is_none();
        slot.snapshot = Some(Snapshot {
            holder_count,
            last_updated: now,
        });
        drop(slot);

        if first_value {
            gauge!("holder_cache_tracked").set(self.list_identifiers().len() as f64);
        }
        true
    }

    /// Claims the in-flight fetch for `mint`. Returns `true` when this caller
    /// won and must later call [`HolderCache::upsert`] or
    /// [`HolderCache::release_pending`]; `false` when a fetch is already
    /// running.
    pub fn mark_pending(&self, mint: &Mint) -> bool {
        match self.entries.entry(mint.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.inflight.is_some() {
                    return false;
                }
                slot.inflight = Some(watch::channel(()).0);
                true
            }
            Entry::Vacant(vacant) => {
                let mut slot = Slot::placeholder(Utc::now());
                slot.inflight = Some(watch::channel(()).0);
                vacant.insert(slot);
                true
            }
        }
    }

    /// Ends an in-flight claim without a new value. The previous value, if
    /// any, is kept; a key that never held a value is forgotten so a later
    /// request can retry the first fetch.
    pub fn release_pending(&self, mint: &Mint) {
        if let Entry::Occupied(mut occupied) = self.entries.entry(mint.clone()) {
            if occupied.get().snapshot.is_none() {
                occupied.remove();
            } else {
                occupied.get_mut().inflight = None;
            }
        }
    }

    /// Subscribes to the fetch currently in flight for `mint`, if any.
    pub fn subscribe(&self, mint: &Mint) -> Option<PendingFetch> {
        let slot = self.entries.get(mint)?;
        slot.inflight.as_ref().map(|sender| PendingFetch {
            receiver: sender.subscribe(),
        })
    }

    pub fn is_pending(&self, mint: &Mint) -> bool {
        self.entries
            .get(mint)
            .map(|slot| slot.inflight.is_some())
            .unwrap_or(false)
    }

    /// Counts an API lookup against `mint` if the key is known.
    pub fn record_request(&self, mint: &Mint) {
        if let Some(mut slot) = self.entries.get_mut(mint) {
            slot.request_count = slot.request_count.saturating_add(1);
        }
    }

    /// Snapshot of every key holding a value.
    pub fn list_identifiers(&self) -> Vec<Mint> {
        self.entries
            .iter()
            .filter(|item| item.snapshot.is_some())
            .map(|item| item.key().clone())
            .collect()
    }

    pub fn tracked(&self) -> Vec<TrackedToken> {
        let now = Utc::now();
        let mut tokens: Vec<TrackedToken> = self
            .entries
            .iter()
            .filter_map(|item| {
                let snapshot = item.snapshot?;
                Some(TrackedToken {
                    mint: item.key().clone(),
                    holders: snapshot.holder_count,
                    last_updated: snapshot.last_updated.timestamp(),
                    request_count: item.request_count,
                    first_seen: item.first_seen.timestamp(),
                    state: item.state(now, self.ttl),
                    refreshing: item.inflight.is_some(),
                })
            })
            .collect();
        tokens.sort_by(|a, b| a.mint.cmp(&b.mint));
        tokens
    }

    pub fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let mut stats = CacheStats::default();
        for item in self.entries.iter() {
            if item.inflight.is_some() {
                stats.pending_tokens += 1;
            }
            if item.snapshot.is_none() {
                continue;
            }
            stats.total_tracked_tokens += 1;
            stats.total_requests += item.request_count;
            if item.state(now, self.ttl) == CacheState::Stale {
                stats.stale_tokens += 1;
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HolderCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}

/// Handle on a fetch started by another caller.
#[derive(Debug)]
pub struct PendingFetch {
    receiver: watch::Receiver<()>,
}

impl PendingFetch {
    /// Waits up to `limit` for the in-flight fetch to finish. Returns `true`
    /// when it finished (successfully or not), `false` on timeout.
    pub async fn wait(mut self, limit: Duration) -> bool {
        // The sender never publishes; `changed` resolves only once it is
        // dropped, which is when the claim ends.
        tokio::time::timeout(limit, self.receiver.changed())
            .await
            .is_ok()
    }
}

/// Short-lived memory of failed first fetches so a burst of requests for an
/// unreachable mint does not turn into a burst of RPC calls.
#[derive(Debug)]
pub struct FailureCache {
    failures: Cache<Mint, FetchErrorKind>,
}

impl FailureCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5);
    pub const DEFAULT_CAPACITY: u64 = 10_000;

    pub fn new(ttl: Duration) -> Self {
        Self {
            failures: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(Self::DEFAULT_CAPACITY)
                .build(),
        }
    }

    pub fn record(&self, mint: &Mint, kind: FetchErrorKind) {
        self.failures.insert(mint.clone(), kind);
    }

    pub fn recent(&self, mint: &Mint) -> Option<FetchErrorKind> {
        self.failures.get(mint)
    }

    pub fn clear(&self, mint: &Mint) {
        self.failures.invalidate(mint);
    }
}

impl Default for FailureCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;

    fn mint() -> Mint {
        Mint::parse("So11111111111111111111111111111111111111112").unwrap()
    }

    fn other_mint() -> Mint {
        Mint::parse("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v").unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn upsert_then_get_returns_exact_value() {
        let cache = HolderCache::new(Duration::from_secs(30));
        assert!(cache.upsert(&mint(), 1_234, at(1_000)));

        let entry = cache.get_at(&mint(), at(1_000)).expect("entry present");
        assert_eq!(entry.holder_count, 1_234);
        assert_eq!(entry.last_updated, at(1_000));
        assert_eq!(entry.state, CacheState::Fresh);
    }

    #[test]
    fn entries_past_ttl_are_stale_but_kept() {
        let cache = HolderCache::new(Duration::from_secs(30));
        cache.upsert(&mint(), 10, at(1_000));

        let entry = cache.get_at(&mint(), at(1_031)).expect("still served");
        assert_eq!(entry.state, CacheState::Stale);
        assert_eq!(entry.holder_count, 10);
        assert_eq!(cache.list_identifiers(), vec![mint()]);
    }

    #[test]
    fn older_writes_never_move_timestamp_backwards() {
        let cache = HolderCache::default();
        cache.upsert(&mint(), 10, at(2_000));
        assert!(!cache.upsert(&mint(), 99, at(1_500)));

        let entry = cache.get_at(&mint(), at(2_000)).unwrap();
        assert_eq!(entry.holder_count, 10);
        assert_eq!(entry.last_updated, at(2_000));
    }

    #[test]
    fn mark_pending_admits_a_single_winner() {
        let cache = HolderCache::default();
        assert!(cache.mark_pending(&mint()));
        assert!(!cache.mark_pending(&mint()));
        assert!(cache.mark_pending(&other_mint()));

        // a pending key without a value is invisible to readers
        assert!(cache.get(&mint()).is_none());
        assert!(cache.list_identifiers().is_empty());

        cache.upsert(&mint(), 5, Utc::now());
        assert!(!cache.is_pending(&mint()));
        assert!(cache.mark_pending(&mint()));
    }

    #[test]
    fn release_forgets_keys_that_never_held_a_value() {
        let cache = HolderCache::default();
        assert!(cache.mark_pending(&mint()));
        cache.release_pending(&mint());
        assert!(cache.is_empty());
        assert!(cache.mark_pending(&mint()));
    }

    #[test]
    fn release_keeps_previous_value() {
        let cache = HolderCache::new(Duration::from_secs(30));
        cache.upsert(&mint(), 42, at(1_000));
        assert!(cache.mark_pending(&mint()));
        let refreshing = cache.get_at(&mint(), at(1_001)).unwrap();
        assert_eq!(refreshing.state, CacheState::Fresh);
        assert!(refreshing.refreshing);

        cache.release_pending(&mint());
        let entry = cache.get_at(&mint(), at(1_001)).unwrap();
        assert_eq!(entry.holder_count, 42);
        assert_eq!(entry.last_updated, at(1_000));
        assert_eq!(entry.state, CacheState::Fresh);
        assert!(!entry.refreshing);
    }

    #[test]
    fn expired_entry_stays_stale_while_refresh_is_in_flight() {
        let cache = HolderCache::new(Duration::from_secs(30));
        cache.upsert(&mint(), 42, at(1_000));
        assert!(cache.mark_pending(&mint()));

        let entry = cache.get_at(&mint(), at(1_100)).unwrap();
        assert_eq!(entry.state, CacheState::Stale);
        assert!(entry.is_stale());
        assert!(entry.refreshing);
        assert_eq!(entry.holder_count, 42);

        let stats = cache.stats();
        assert_eq!(stats.pending_tokens, 1);
        assert!(cache.tracked()[0].refreshing);
    }

    #[test]
    fn request_counts_feed_stats() {
        let cache = HolderCache::new(Duration::from_secs(30));
        cache.upsert(&mint(), 1, Utc::now());
        cache.record_request(&mint());
        cache.record_request(&mint());
        cache.record_request(&other_mint());
        cache.mark_pending(&other_mint());

        let stats = cache.stats();
        assert_eq!(stats.total_tracked_tokens, 1);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.pending_tokens, 1);

        let tracked = cache.tracked();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].request_count, 2);
    }

    #[tokio::test]
    async fn waiters_wake_when_claim_ends() {
        let cache = Arc::new(HolderCache::default());
        assert!(cache.mark_pending(&mint()));
        let pending = cache.subscribe(&mint()).expect("fetch in flight");

        let writer = Arc::clone(&cache);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.upsert(&mint(), 7, Utc::now());
        });

        assert!(pending.wait(Duration::from_secs(2)).await);
        assert_eq!(cache.get(&mint()).unwrap().holder_count, 7);
    }

    #[tokio::test]
    async fn waiters_time_out_while_claim_is_held() {
        let cache = HolderCache::default();
        assert!(cache.mark_pending(&mint()));
        let pending = cache.subscribe(&mint()).unwrap();
        assert!(!pending.wait(Duration::from_millis(20)).await);
    }

    #[test]
    fn no_subscription_without_inflight_fetch() {
        let cache = HolderCache::default();
        assert!(cache.subscribe(&mint()).is_none());
        cache.upsert(&mint(), 1, Utc::now());
        assert!(cache.subscribe(&mint()).is_none());
    }

    #[test]
    fn failure_cache_remembers_kind() {
        let failures = FailureCache::default();
        assert_eq!(failures.recent(&mint()), None);
        failures.record(&mint(), FetchErrorKind::RateLimited);
        assert_eq!(failures.recent(&mint()), Some(FetchErrorKind::RateLimited));
        failures.clear(&mint());
        assert_eq!(failures.recent(&mint()), None);
    }

    #[test]
    fn failure_cache_expires() {
        let failures = FailureCache::new(Duration::from_millis(20));
        failures.record(&mint(), FetchErrorKind::Timeout);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(failures.recent(&mint()), None);
    }
}
