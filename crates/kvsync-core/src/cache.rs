//! Local read-through / write-through cache
//!
//! [`LocalCache`] sits in front of the current connection. Reads are
//! served from the cache while the entry is fresh and fall back to a remote
//! `get` otherwise. Writes update the cache before the remote write is awaited
//! and roll back if the store rejects them.
//!
//! Freshness is only enforced once [`LocalCache::expire`] has been called.
//! From then on entries older than `max_age` are invisible to reads and a
//! background sweep evicts them periodically. An entry exactly `max_age`
//! old is still fresh.
//!
//! ## Remote failures
//!
//! A failed remote request is returned to the caller and never writes the
//! cache. Without a live connection requests fail with `NotConnected`;
//! cached entries survive a reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};
use crate::event::{SubscribeOptions, TransactionId, Value};
use crate::key::Key;
use crate::primitives::Connection;

/// Sweep interval used when [`LocalCache::expire`] is given none
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// What to do with keys the store reports as missing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissPolicy {
    /// Cache the miss like any other value
    #[default]
    Remember,
    /// Ask the store again on every read
    Requery,
}

/// Cache settings, usually derived from the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub misses: MissPolicy,
    /// Entries older than this are stale; `None` keeps entries forever
    pub max_age: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            misses: MissPolicy::default(),
            max_age: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    /// `None` marks a key known to be absent
    value: Option<Value>,
    refreshed_at: Instant,
    revision: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Key, CacheEntry>,
    max_age: Option<Duration>,
    revision: u64,
    sweeper: Option<JoinHandle<()>>,
}

impl CacheState {
    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        self.max_age
            .map_or(true, |max_age| now.duration_since(entry.refreshed_at) <= max_age)
    }

    fn fresh(&self, key: &Key, now: Instant) -> Option<&CacheEntry> {
        self.entries
            .get(key)
            .filter(|entry| self.is_fresh(entry, now))
    }

    fn store(&mut self, key: Key, value: Option<Value>) -> u64 {
        self.revision += 1;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                refreshed_at: Instant::now(),
                revision: self.revision,
            },
        );
        self.revision
    }

    /// Record a value that came from the store
    fn record(&mut self, key: &Key, value: Option<Value>, misses: MissPolicy) {
        match (value, misses) {
            (None, MissPolicy::Requery) => {
                self.entries.remove(key);
            }
            (value, _) => {
                self.store(key.clone(), value);
            }
        }
    }

    fn written_since(&self, key: &Key, revision: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.revision > revision)
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let Some(max_age) = self.max_age else {
            return 0;
        };
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.refreshed_at) <= max_age);
        before - self.entries.len()
    }
}

impl Drop for CacheState {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Cache in front of whichever connection is current
pub struct LocalCache<C: Connection> {
    connections: watch::Receiver<Option<Arc<C>>>,
    state: Arc<Mutex<CacheState>>,
    misses: MissPolicy,
}

impl<C: Connection> Clone for LocalCache<C> {
    fn clone(&self) -> Self {
        Self {
            connections: self.connections.clone(),
            state: self.state.clone(),
            misses: self.misses,
        }
    }
}

impl<C: Connection> LocalCache<C> {
    /// Cache in front of a single fixed connection
    pub fn new(connection: Arc<C>, misses: MissPolicy) -> Self {
        let (_, connections) = watch::channel(Some(connection));
        Self::following(connections, misses)
    }

    /// Cache that follows the connection published on `connections`
    pub fn following(connections: watch::Receiver<Option<Arc<C>>>, misses: MissPolicy) -> Self {
        Self {
            connections,
            state: Arc::default(),
            misses,
        }
    }

    /// Follow `connections` and arm expiry when the policy has a `max_age`
    pub fn with_policy(
        connections: watch::Receiver<Option<Arc<C>>>,
        policy: &CachePolicy,
    ) -> Self {
        let cache = Self::following(connections, policy.misses);
        if let Some(max_age) = policy.max_age {
            cache.expire(max_age, Some(policy.sweep_interval));
        }
        cache
    }

    /// The connection requests go to right now
    pub fn connection(&self) -> ClientResult<Arc<C>> {
        self.connections
            .borrow()
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        lock(&self.state)
    }

    /// Number of cached entries, stale ones included until swept
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Fresh cached entry without contacting the store
    ///
    /// `Some(None)` means the key is cached as absent.
    pub fn peek(&self, key: &Key) -> Option<Option<Value>> {
        self.lock()
            .fresh(key, Instant::now())
            .map(|entry| entry.value.clone())
    }

    /// Drop one entry so the next read goes to the store
    pub fn invalidate(&self, key: &Key) {
        self.lock().entries.remove(key);
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Read a key, from the cache when fresh
    pub async fn get(&self, key: &Key) -> ClientResult<Option<Value>> {
        let started = {
            let state = self.lock();
            if let Some(entry) = state.fresh(key, Instant::now()) {
                trace!(key = %key, "Cache hit");
                return Ok(entry.value.clone());
            }
            state.revision
        };

        let value = self.connection()?.get(key).await?;

        let mut state = self.lock();
        if state.written_since(key, started) {
            trace!(key = %key, "Local write during read, keeping it");
        } else {
            state.record(key, value.clone(), self.misses);
        }
        Ok(value)
    }

    /// Write a key, updating the cache before the store confirms
    ///
    /// If the store rejects the write the previous entry is restored, unless
    /// the key was written again in the meantime.
    pub async fn set(&self, key: &Key, value: Value) -> ClientResult<()> {
        let connection = self.connection()?;
        let (previous, revision) = {
            let mut state = self.lock();
            let previous = state.entries.remove(key);
            let revision = state.store(key.clone(), Some(value.clone()));
            (previous, revision)
        };

        if let Err(e) = connection.set(key, value).await {
            let mut state = self.lock();
            if !state.written_since(key, revision) {
                match previous {
                    Some(entry) => {
                        state.entries.insert(key.clone(), entry);
                    }
                    None => {
                        state.entries.remove(key);
                    }
                }
                debug!(key = %key, error = %e, "Write rejected, cache rolled back");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Delete a key in the store, then forget it locally
    pub async fn delete(&self, key: &Key) -> ClientResult<Option<Value>> {
        let removed = self.connection()?.delete(key).await?;
        self.lock().record(key, None, self.misses);
        Ok(removed)
    }

    /// Subscribe to a key, refreshing the cache before `callback` runs
    ///
    /// The subscription lives until the returned handle is dropped.
    pub async fn subscribe<F>(
        &self,
        key: &Key,
        options: SubscribeOptions,
        mut callback: F,
    ) -> ClientResult<CacheSubscription>
    where
        F: FnMut(Option<Value>) + Send + 'static,
    {
        let mut subscription = self.connection()?.subscribe(key, options).await?;
        let id = subscription.id();
        let state = self.state.clone();
        let misses = self.misses;
        let key = key.clone();

        let task = tokio::spawn(async move {
            while let Some(value) = subscription.recv().await {
                lock(&state).record(&key, value.clone(), misses);
                callback(value);
            }
            trace!(key = %key, "Cache subscription ended");
        });

        Ok(CacheSubscription { id, task })
    }

    /// Arm expiry: entries older than `max_age` become stale
    ///
    /// Starts a sweep every `interval` (one second by default). Calling this
    /// again replaces the previous sweep.
    pub fn expire(&self, max_age: Duration, interval: Option<Duration>) {
        let interval = interval
            .filter(|interval| !interval.is_zero())
            .unwrap_or(DEFAULT_SWEEP_INTERVAL);
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&self.state), interval));

        let mut state = self.lock();
        state.max_age = Some(max_age);
        if let Some(previous) = state.sweeper.replace(sweeper) {
            previous.abort();
        }
        debug!(
            max_age_ms = max_age.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "Cache expiry armed"
        );
    }
}

async fn sweep_loop(state: Weak<Mutex<CacheState>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            break;
        };
        let evicted = lock(&state).sweep(Instant::now());
        if evicted > 0 {
            debug!(evicted, "Evicted stale cache entries");
        }
    }
}

/// Handle to a cache subscription; dropping it unsubscribes
pub struct CacheSubscription {
    id: TransactionId,
    task: JoinHandle<()>,
}

impl CacheSubscription {
    pub fn id(&self) -> TransactionId {
        self.id
    }
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
