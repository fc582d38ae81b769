use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct CacheEntry<T> {
    data: T,
    expires_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, ttl: Duration) -> Self {
        Self {
            data,
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    pub fn data(&self) -> &T {
        &self.data
    }
}

/// Concurrent map whose entries expire after a TTL.
///
/// Expired entries behave as absent. They are physically removed by a lazy
/// sweep that runs at most once per `sweep_period`, or by [`purge_expired`].
///
/// [`purge_expired`]: ExpiringMap::purge_expired
#[derive(Clone)]
pub struct ExpiringMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache: Arc<DashMap<K, CacheEntry<V>>>,
    default_ttl: Duration,
    sweep_period: Duration,
    last_cleanup: Arc<std::sync::Mutex<Instant>>,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration, sweep_period: Duration) -> Self {
        Self {
            cache: Arc::new(DashMap::new()),
            default_ttl,
            sweep_period,
            last_cleanup: Arc::new(std::sync::Mutex::new(Instant::now())),
        }
    }

    /// Perform lazy cleanup if enough time has passed
    fn maybe_cleanup(&self) {
        // Check if cleanup is needed (non-blocking)
        if let Ok(mut last_cleanup) = self.last_cleanup.try_lock()
            && last_cleanup.elapsed() >= self.sweep_period
        {
            *last_cleanup = Instant::now();
            drop(last_cleanup);

            self.cache.retain(|_, entry| !entry.is_expired());
        }
    }

    /// Drop every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.cache.len())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.maybe_cleanup();

        self.cache.get(key).and_then(|entry| {
            if entry.is_expired() {
                None
            } else {
                Some(entry.data().clone())
            }
        })
    }

    pub fn insert(&self, key: K, value: V) {
        self.maybe_cleanup();

        self.cache
            .insert(key, CacheEntry::new(value, self.default_ttl));
    }

    /// Insert only if no live entry exists for `key`.
    ///
    /// The check and the write happen under the same shard lock, so of any
    /// number of concurrent callers for one key exactly one gets `true`.
    pub fn try_insert(&self, key: K, value: V) -> bool {
        self.maybe_cleanup();

        match self.cache.entry(key) {
            Entry::Occupied(entry) if !entry.get().is_expired() => false,
            Entry::Occupied(mut entry) => {
                entry.insert(CacheEntry::new(value, self.default_ttl));
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(CacheEntry::new(value, self.default_ttl));
                true
            }
        }
    }

    /// Modify the live entry for `key` (starting from `V::default()` when
    /// absent or expired) and restart its TTL, atomically.
    pub fn upsert(&self, key: K, f: impl FnOnce(&mut V))
    where
        V: Default,
    {
        self.maybe_cleanup();

        match self.cache.entry(key) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                if slot.is_expired() {
                    slot.data = V::default();
                }
                f(&mut slot.data);
                slot.expires_at = Instant::now() + self.default_ttl;
            }
            Entry::Vacant(entry) => {
                let mut data = V::default();
                f(&mut data);
                entry.insert(CacheEntry::new(data, self.default_ttl));
            }
        }
    }

    /// Remove and return a live entry. Only one concurrent caller can win.
    pub fn take(&self, key: &K) -> Option<V> {
        self.cache
            .remove(key)
            .and_then(|(_, entry)| (!entry.is_expired()).then_some(entry.data))
    }

    pub fn invalidate(&self, key: &K) {
        self.cache.remove(key);
    }
}

/// Remembers recently consumed upstream callback codes.
///
/// Entries outlive the protocol validity of the code itself; they exist only
/// so a reloaded or double-submitted callback is not processed twice.
#[derive(Clone)]
pub struct ReplayGuard {
    seen: ExpiringMap<String, ()>,
}

impl ReplayGuard {
    pub fn new(ttl: Duration, sweep_period: Duration) -> Self {
        Self {
            seen: ExpiringMap::new(ttl, sweep_period),
        }
    }

    /// `true` for the first caller presenting `code`, `false` for every later one.
    pub fn first_use(&self, code: &str) -> bool {
        self.seen.try_insert(code.to_string(), ())
    }

    pub fn purge_expired(&self) -> usize {
        self.seen.purge_expired()
    }
}

#[derive(Clone, Debug)]
struct CachedToken {
    token: Option<String>,
    expires_at: Instant,
}

/// Single shared slot for a provider-level bearer token.
///
/// The slot is refreshed lazily on access. The lock is held for the duration of
/// a refresh, so concurrent callers queue behind one refresh instead of each
/// issuing their own. A refresh that produced no token is remembered until the
/// slot expires as well.
pub struct TokenSlot {
    ttl: Duration,
    margin: Duration,
    slot: Mutex<Option<CachedToken>>,
}

impl TokenSlot {
    pub fn new(ttl: Duration, margin: Duration) -> Self {
        Self {
            ttl,
            margin,
            slot: Mutex::new(None),
        }
    }

    pub async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<Option<String>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<String>, E>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref()
            && cached.expires_at > Instant::now()
        {
            return Ok(cached.token.clone());
        }

        let token = refresh().await?;
        *slot = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + self.ttl.saturating_sub(self.margin),
        });
        Ok(token)
    }
}
