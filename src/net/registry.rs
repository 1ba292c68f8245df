//! Registry of open channels, used to close them all at shutdown.
//!
//! # Responsibilities
//! - Track every accepted or dialed channel with its peer address
//! - Signal each channel's driving task to close
//! - Wait (bounded) until all channels are gone

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::net::connection::ConnectionId;
use crate::observability::metrics;

#[derive(Debug)]
struct Channel {
    peer: SocketAddr,
    close_tx: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct Inner {
    channels: DashMap<ConnectionId, Channel>,
    active: AtomicU64,
    closing: AtomicBool,
}

/// Shared set of live channels. Cloning shares the same registry.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<Inner>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new channel. The returned guard unregisters on drop.
    ///
    /// After `close_all` has run, new channels are born closed.
    pub fn register(&self, peer: SocketAddr) -> ChannelGuard {
        let id = ConnectionId::new();
        let (close_tx, close_rx) = watch::channel(false);
        self.inner.channels.insert(id, Channel { peer, close_tx });
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        // Checked after insertion: a concurrent close_all either sees the
        // entry or has already raised the flag.
        if self.inner.closing.load(Ordering::SeqCst) {
            if let Some(channel) = self.inner.channels.get(&id) {
                channel.close_tx.send_replace(true);
            }
        }
        metrics::record_connection_opened();
        tracing::trace!(connection_id = %id, peer = %peer, "Channel registered");

        ChannelGuard {
            registry: Arc::clone(&self.inner),
            id,
            close_rx,
        }
    }

    /// Signal every channel to close. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        self.inner.closing.store(true, Ordering::SeqCst);
        let mut signalled = 0;
        for entry in self.inner.channels.iter() {
            entry.close_tx.send_replace(true);
            signalled += 1;
            tracing::trace!(connection_id = %entry.key(), peer = %entry.peer, "Closing channel");
        }
        signalled
    }

    pub fn len(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.channels.is_empty()
    }

    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Block the current thread until no channel is left or `timeout` elapses.
    /// Returns `true` when the registry drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while self.active_count() > 0 {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

/// Guard that tracks a channel's lifetime.
/// Unregisters the channel when dropped.
#[derive(Debug)]
pub struct ChannelGuard {
    registry: Arc<Inner>,
    id: ConnectionId,
    close_rx: watch::Receiver<bool>,
}

impl ChannelGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn close_requested(&self) -> bool {
        *self.close_rx.borrow()
    }

    /// Resolves once the registry asks this channel to close.
    pub async fn closed(&mut self) {
        while !*self.close_rx.borrow_and_update() {
            if self.close_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.registry.channels.remove(&self.id);
        self.registry.active.fetch_sub(1, Ordering::SeqCst);
        metrics::record_connection_closed();
        tracing::trace!(connection_id = %self.id, "Channel closed");
    }
}
