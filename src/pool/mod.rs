//! Outbound connection pool.
//!
//! # Responsibilities
//! - Keep idle client connections per destination and sender configuration
//! - Hand each idle connection to exactly one caller
//! - Bound how long a lease waits and how many idle entries a key keeps
//! - Track connections checked out per key
//! - Evict connections idle for too long
//!
//! # Design Decisions
//! - An idle entry leaves the queue under the slot lock, so hand-off is atomic
//! - Waiters park on a per-key `Notify` instead of polling
//! - A lease waits only while the key has connections checked out; with none
//!   out nothing can come back, so it misses at once

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::observability::metrics;

/// Destination authority plus sender configuration fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub authority: String,
    pub fingerprint: u64,
}

impl PoolKey {
    pub fn new(authority: impl Into<String>, fingerprint: u64) -> Self {
        Self {
            authority: authority.into(),
            fingerprint,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:x}", self.authority, self.fingerprint)
    }
}

#[derive(Debug)]
struct Idle<T> {
    conn: T,
    since: Instant,
}

#[derive(Debug, Default)]
struct Tracker {
    checked_out: AtomicUsize,
    available: Notify,
}

/// One connection of a key held outside the pool: leased or being dialed.
///
/// Dropping it without returning the connection wakes one waiter, which
/// then re-checks whether anything can still come back.
#[derive(Debug)]
pub struct Checkout {
    tracker: Arc<Tracker>,
}

impl Checkout {
    fn new(tracker: &Arc<Tracker>) -> Self {
        tracker.checked_out.fetch_add(1, Ordering::SeqCst);
        Self {
            tracker: Arc::clone(tracker),
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        self.tracker.checked_out.fetch_sub(1, Ordering::SeqCst);
        self.tracker.available.notify_one();
    }
}

#[derive(Debug)]
struct Slot<T> {
    idle: Mutex<VecDeque<Idle<T>>>,
    tracker: Arc<Tracker>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            tracker: Arc::default(),
        }
    }
}

/// Idle connections keyed by [`PoolKey`].
#[derive(Debug)]
pub struct ConnectionPool<T> {
    slots: DashMap<PoolKey, Arc<Slot<T>>>,
    max_idle_per_key: usize,
    max_wait: Duration,
    idle_timeout: Duration,
    eviction_interval: Duration,
}

impl<T> ConnectionPool<T> {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            slots: DashMap::new(),
            max_idle_per_key: config.max_idle_per_key,
            max_wait: Duration::from_millis(config.max_wait_ms),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            eviction_interval: Duration::from_secs(config.eviction_interval_secs.max(1)),
        }
    }

    fn slot(&self, key: &PoolKey) -> Arc<Slot<T>> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(&slot);
        }
        Arc::clone(&self.slots.entry(key.clone()).or_default())
    }

    /// Count a connection of `key` opened outside the pool, such as a fresh
    /// dial, until the returned guard is dropped.
    pub fn checkout(&self, key: &PoolKey) -> Checkout {
        Checkout::new(&self.slot(key).tracker)
    }

    /// Connections of `key` currently held outside the pool.
    pub fn checked_out(&self, key: &PoolKey) -> usize {
        self.slots
            .get(key)
            .map(|slot| slot.tracker.checked_out.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Take the most recently returned idle connection, if any is fresh.
    pub fn try_lease(&self, key: &PoolKey) -> Option<(T, Checkout)> {
        let slot = self.slots.get(key).map(|s| Arc::clone(&s))?;
        self.take(&slot, Instant::now())
    }

    fn take(&self, slot: &Slot<T>, now: Instant) -> Option<(T, Checkout)> {
        let mut idle = slot.idle.lock().expect("pool slot mutex poisoned");
        while let Some(entry) = idle.pop_back() {
            if now.duration_since(entry.since) < self.idle_timeout {
                return Some((entry.conn, Checkout::new(&slot.tracker)));
            }
            tracing::trace!("Dropping stale pooled connection");
        }
        None
    }

    /// Lease an idle connection. While other connections of the key are
    /// checked out, waits up to the configured max wait for one to come
    /// back. `None` is a pool miss.
    pub async fn lease(&self, key: &PoolKey) -> Option<(T, Checkout)> {
        let slot = self.slot(key);
        let deadline = tokio::time::Instant::now() + self.max_wait;

        let leased = loop {
            let notified = slot.tracker.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(leased) = self.take(&slot, Instant::now()) {
                break Some(leased);
            }
            if slot.tracker.checked_out.load(Ordering::SeqCst) == 0 {
                break None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break None;
            }
        };

        metrics::record_pool_lease(leased.is_some());
        tracing::trace!(key = %key, hit = leased.is_some(), "Pool lease");
        leased
    }

    /// Return a connection for reuse. Returns `false` (and drops it) when the
    /// key already holds `max_idle_per_key` idle connections.
    pub fn release(&self, key: &PoolKey, conn: T) -> bool {
        let slot = self.slot(key);
        {
            let mut idle = slot.idle.lock().expect("pool slot mutex poisoned");
            if idle.len() >= self.max_idle_per_key {
                tracing::debug!(key = %key, "Pool full, dropping connection");
                return false;
            }
            idle.push_back(Idle {
                conn,
                since: Instant::now(),
            });
        }
        slot.tracker.available.notify_one();
        true
    }

    /// Drop connections idle longer than the idle timeout as of `now`.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut evicted = 0;
        for slot in self.slots.iter() {
            let mut idle = slot.idle.lock().expect("pool slot mutex poisoned");
            let before = idle.len();
            idle.retain(|entry| now.duration_since(entry.since) < self.idle_timeout);
            evicted += before - idle.len();
        }
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted idle pooled connections");
        }
        evicted
    }

    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.slots
            .get(key)
            .map(|slot| slot.idle.lock().expect("pool slot mutex poisoned").len())
            .unwrap_or(0)
    }

    pub fn total_idle(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.idle.lock().expect("pool slot mutex poisoned").len())
            .sum()
    }

    /// Drop every idle connection.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.idle.lock().expect("pool slot mutex poisoned").clear();
        }
    }
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// Run periodic eviction on `handle` until the pool is dropped.
    pub fn spawn_evictor(self: &Arc<Self>, handle: &Handle) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let every = self.eviction_interval;
        handle.spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                pool.evict_idle(Instant::now());
            }
        })
    }
}
