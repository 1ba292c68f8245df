//! A named, fixed-size thread group backed by a tokio runtime.

use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

/// Fixed-size worker thread group.
///
/// Tasks are scheduled through [`ThreadPool::handle`]; the runtime itself
/// is only taken out again to shut it down.
#[derive(Debug)]
pub struct ThreadPool {
    name: String,
    threads: usize,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
}

impl ThreadPool {
    pub fn new(name: &str, threads: usize) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name(name)
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        tracing::debug!(pool = name, threads, "Thread pool started");

        Ok(Self {
            name: name.to_string(),
            threads: threads.max(1),
            runtime: Mutex::new(Some(runtime)),
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_shut_down(&self) -> bool {
        self.runtime.lock().expect("thread pool mutex poisoned").is_none()
    }

    /// Stop the pool, waiting up to `timeout` for running tasks to yield.
    /// Returns `false` when the pool was already stopped.
    ///
    /// Must not be called from inside an async context.
    pub fn shutdown_graceful(&self, timeout: Duration) -> bool {
        let Some(runtime) = self.take() else {
            return false;
        };
        runtime.shutdown_timeout(timeout);
        tracing::debug!(pool = %self.name, "Thread pool stopped");
        true
    }

    /// Stop the pool without waiting. Safe from any context.
    pub fn shutdown_now(&self) -> bool {
        let Some(runtime) = self.take() else {
            return false;
        };
        runtime.shutdown_background();
        tracing::debug!(pool = %self.name, "Thread pool released");
        true
    }

    fn take(&self) -> Option<Runtime> {
        self.runtime.lock().expect("thread pool mutex poisoned").take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_tasks_and_stops_once() {
        let pool = ThreadPool::new("test-pool", 2).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        pool.handle().spawn(async move {
            tx.send(std::thread::current().name().map(str::to_string)).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(name.as_deref(), Some("test-pool"));

        assert!(pool.shutdown_graceful(Duration::from_millis(100)));
        assert!(pool.is_shut_down());
        assert!(!pool.shutdown_graceful(Duration::from_millis(100)));
        assert!(!pool.shutdown_now());
    }
}
