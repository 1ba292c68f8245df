//! Server-side TLS session cache with a size bound and a validity period.
//!
//! rustls' built-in memory cache only bounds the number of sessions; listeners
//! also carry a session timeout, so entries here remember when they were stored.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustls::server::StoresServerSessions;

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    stored_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Vec<u8>, Entry>,
    /// Insertion order, oldest first. May hold keys already taken.
    order: VecDeque<Vec<u8>>,
}

/// Bounded session store whose entries expire after `ttl`.
#[derive(Debug)]
pub struct ExpiringSessionCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl ExpiringSessionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            ttl,
        }
    }

    /// Number of live (possibly expired but not yet purged) sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("session cache mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_fresh(&self, entry: &Entry) -> bool {
        entry.stored_at.elapsed() < self.ttl
    }
}

impl StoresServerSessions for ExpiringSessionCache {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let mut inner = self.inner.lock().expect("session cache mutex poisoned");

        if inner.entries.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        }
        while inner.entries.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }

        inner.order.push_back(key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
        true
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("session cache mutex poisoned");
        let fresh = inner.entries.get(key).map(|e| self.is_fresh(e))?;
        if fresh {
            inner.entries.get(key).map(|e| e.value.clone())
        } else {
            inner.entries.remove(key);
            inner.order.retain(|k| k.as_slice() != key);
            None
        }
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("session cache mutex poisoned");
        let entry = inner.entries.remove(key)?;
        inner.order.retain(|k| k.as_slice() != key);
        self.is_fresh(&entry).then_some(entry.value)
    }

    fn can_cache(&self) -> bool {
        self.capacity > 0
    }
}
