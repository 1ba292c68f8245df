//! Process-wide thread groups and the channel registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;

use crate::config::ThreadCounts;
use crate::error::ShutdownError;
use crate::lifecycle::ThreadPool;
use crate::net::registry::ChannelRegistry;

/// Threads of the group that serializes pipelined response writes.
pub const PIPELINING_THREAD_COUNT: usize = 8;

const PIPELINING_POOL_NAME: &str = "pipelining-thread-pool";

/// Thread groups shared by every connector of one factory.
#[derive(Debug)]
pub struct ResourceGroups {
    acceptor: ThreadPool,
    worker: ThreadPool,
    client: ThreadPool,
    http3: ThreadPool,
    pipelining: Mutex<Option<Arc<ThreadPool>>>,
    channels: ChannelRegistry,
    shut_down: AtomicBool,
}

impl ResourceGroups {
    pub fn new(counts: &ThreadCounts) -> std::io::Result<Self> {
        Ok(Self {
            acceptor: ThreadPool::new("acceptor-thread-pool", counts.acceptor)?,
            worker: ThreadPool::new("worker-thread-pool", counts.worker)?,
            client: ThreadPool::new("client-thread-pool", counts.client)?,
            http3: ThreadPool::new("http3-thread-pool", counts.http3)?,
            pipelining: Mutex::new(None),
            channels: ChannelRegistry::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn acceptor(&self) -> &Handle {
        self.acceptor.handle()
    }

    pub fn worker(&self) -> &Handle {
        self.worker.handle()
    }

    pub fn client(&self) -> &Handle {
        self.client.handle()
    }

    pub fn http3(&self) -> &Handle {
        self.http3.handle()
    }

    /// Handle of the pipelining group, if one has been created.
    pub fn pipelining(&self) -> Option<Handle> {
        self.pipelining
            .lock()
            .expect("pipelining pool mutex poisoned")
            .as_ref()
            .map(|pool| pool.handle().clone())
    }

    /// The pipelining group, created on first use and reused afterwards.
    pub fn pipelining_group(&self) -> std::io::Result<Handle> {
        if self.is_shut_down() {
            return Err(std::io::Error::other("resource groups are shut down"));
        }
        let mut slot = self.pipelining.lock().expect("pipelining pool mutex poisoned");
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.handle().clone());
        }
        let pool = Arc::new(ThreadPool::new(PIPELINING_POOL_NAME, PIPELINING_THREAD_COUNT)?);
        let handle = pool.handle().clone();
        *slot = Some(pool);
        tracing::info!(threads = PIPELINING_THREAD_COUNT, "Pipelining thread pool created");
        Ok(handle)
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Close every channel, then stop each group in order, waiting up to
    /// `timeout` per step. A second call is a no-op.
    ///
    /// Called from inside an async runtime, the groups are released without
    /// waiting and [`ShutdownError::Interrupted`] is returned.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("Resource groups already shut down");
            return Ok(());
        }
        if Handle::try_current().is_ok() {
            self.release_now();
            return Err(ShutdownError::Interrupted(
                "blocking shutdown called from an async context".to_string(),
            ));
        }

        let signalled = self.channels.close_all();
        tracing::info!(channels = signalled, "Closing channels");
        if !self.channels.wait_idle(timeout) {
            tracing::warn!(
                remaining = self.channels.active_count(),
                "Channels still open after drain deadline"
            );
        }

        let mut incomplete = Vec::new();
        self.each_pool(|pool| {
            pool.shutdown_graceful(timeout);
        });
        // Stopping the worker group drops the tasks that still held channels.
        let remaining = self.channels.active_count();
        if remaining > 0 {
            incomplete.push(format!("{} channel(s)", remaining));
        }

        tracing::info!("Resource groups shut down");
        if incomplete.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError::Incomplete(incomplete))
        }
    }

    /// Same steps as [`shutdown`](Self::shutdown) without waiting for drain.
    pub fn shutdown_now(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_now();
    }

    fn release_now(&self) {
        let signalled = self.channels.close_all();
        tracing::info!(channels = signalled, "Closing channels immediately");
        self.each_pool(|pool| {
            pool.shutdown_now();
        });
    }

    /// Visit the groups in shutdown order.
    fn each_pool(&self, mut f: impl FnMut(&ThreadPool)) {
        f(&self.worker);
        f(&self.acceptor);
        f(&self.http3);
        f(&self.client);
        let pipelining = self
            .pipelining
            .lock()
            .expect("pipelining pool mutex poisoned")
            .clone();
        if let Some(pool) = pipelining {
            f(&pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts() -> ThreadCounts {
        ThreadCounts {
            acceptor: 1,
            worker: 1,
            client: 1,
            http3: 1,
        }
    }

    #[test]
    fn pipelining_group_is_created_once() {
        let groups = ResourceGroups::new(&counts()).unwrap();
        assert!(groups.pipelining().is_none());

        groups.pipelining_group().unwrap();
        let first = groups.pipelining.lock().unwrap().clone().unwrap();
        let handle = groups.pipelining_group().unwrap();
        let second = groups.pipelining.lock().unwrap().clone().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.threads(), PIPELINING_THREAD_COUNT);

        let (tx, rx) = std::sync::mpsc::channel();
        handle.spawn(async move {
            tx.send(std::thread::current().name().map(str::to_string)).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(name.as_deref(), Some(PIPELINING_POOL_NAME));
        drop((first, second));

        groups.shutdown(Duration::from_millis(200)).unwrap();
        assert!(groups.pipelining_group().is_err());
    }

    #[test]
    fn shutdown_twice_is_a_no_op() {
        let groups = ResourceGroups::new(&counts()).unwrap();
        let peer = "127.0.0.1:1".parse().unwrap();
        let mut guard = groups.channels().register(peer);
        groups.worker().spawn(async move {
            guard.closed().await;
        });

        groups.shutdown(Duration::from_secs(1)).unwrap();
        assert_eq!(groups.channels().active_count(), 0);
        groups.shutdown(Duration::from_secs(1)).unwrap();
        assert_eq!(groups.channels().active_count(), 0);
    }

    #[test]
    fn channel_stuck_outside_pools_is_reported() {
        let groups = ResourceGroups::new(&counts()).unwrap();
        let _held = groups.channels().register("127.0.0.1:1".parse().unwrap());

        match groups.shutdown(Duration::from_millis(20)) {
            Err(ShutdownError::Incomplete(what)) => assert_eq!(what, vec!["1 channel(s)".to_string()]),
            other => panic!("expected incomplete shutdown, got {:?}", other),
        }
        assert!(groups.shutdown(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn shutdown_now_does_not_block() {
        let groups = ResourceGroups::new(&counts()).unwrap();
        let _held = groups.channels().register("127.0.0.1:1".parse().unwrap());
        groups.shutdown_now();
        groups.shutdown_now();
        assert!(groups.is_shut_down());
    }

    #[tokio::test]
    async fn blocking_shutdown_inside_runtime_is_interrupted() {
        let groups = ResourceGroups::new(&counts()).unwrap();
        assert!(matches!(
            groups.shutdown(Duration::from_secs(1)),
            Err(ShutdownError::Interrupted(_))
        ));
        assert!(groups.shutdown(Duration::from_secs(1)).is_ok());
    }
}
