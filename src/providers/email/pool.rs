//! Async adapter over blocking mail clients.
//!
//! Protocol I/O blocks, so every call is moved onto tokio's blocking pool.
//! A semaphore bounds how many such calls run at once across the process.

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};

use super::{FolderState, MailClient, ProtocolError, RemoteId, Result};
use crate::domain::{Envelope, Protocol, SyncCheckpoint};

/// Bounded runner for blocking protocol work.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
}

impl BlockingPool {
    /// Creates a pool allowing `size` concurrent blocking calls (at least one).
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Runs `f` on a blocking worker once a permit is free.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ProtocolError::Worker(e.to_string()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| ProtocolError::Worker(e.to_string()))?
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(4)
    }
}

/// A [`MailClient`] that can be awaited.
///
/// Uses a tokio Mutex with `blocking_lock` inside the worker so each call
/// has exclusive access to the session.
#[derive(Clone)]
pub struct PooledClient {
    inner: Arc<Mutex<Box<dyn MailClient>>>,
    pool: BlockingPool,
    protocol: Protocol,
}

impl PooledClient {
    pub fn new(client: Box<dyn MailClient>, pool: BlockingPool) -> Self {
        let protocol = client.protocol();
        Self {
            inner: Arc::new(Mutex::new(client)),
            pool,
            protocol,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn MailClient) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        self.pool
            .run(move || {
                let mut client = inner.blocking_lock();
                f(&mut **client)
            })
            .await
    }

    pub async fn connect(&self) -> Result<()> {
        self.call(|c| c.connect()).await
    }

    pub async fn list_folders(&self) -> Result<Vec<String>> {
        self.call(|c| c.list_folders()).await
    }

    pub async fn select_folder(&self, name: &str) -> Result<FolderState> {
        let name = name.to_string();
        self.call(move |c| c.select_folder(&name)).await
    }

    pub async fn new_identifiers(&self, checkpoint: &SyncCheckpoint) -> Result<Vec<RemoteId>> {
        let checkpoint = checkpoint.clone();
        self.call(move |c| c.new_identifiers(&checkpoint)).await
    }

    pub async fn fetch_headers(&self, id: &RemoteId) -> Result<Envelope> {
        let id = id.clone();
        self.call(move |c| c.fetch_headers(&id)).await
    }

    pub async fn fetch_body(&self, id: &RemoteId) -> Result<Vec<u8>> {
        let id = id.clone();
        self.call(move |c| c.fetch_body(&id)).await
    }

    /// Closes the session; failures are only logged.
    pub async fn disconnect(&self) {
        if let Err(e) = self
            .call(|c| {
                c.disconnect();
                Ok(())
            })
            .await
        {
            tracing::debug!(error = %e, "disconnect worker failed");
        }
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::super::script::ScriptDialer;
    use super::super::{Credentials, Pop3Client};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn run_returns_closure_result() {
        let pool = BlockingPool::new(2);
        let value = pool.run(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn run_propagates_errors() {
        let pool = BlockingPool::new(1);
        let err = pool
            .run(|| -> Result<()> { Err(ProtocolError::Parse("x".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Parse(_)));
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let pool = BlockingPool::new(1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    pool.run(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pooled_client_drives_blocking_client() {
        let dialer = ScriptDialer::single("+OK ready\r\n+OK\r\n+OK\r\n+OK\r\n1 a\r\n.\r\n");
        let client = Pop3Client::new(dialer, Credentials::new("u", "p"));
        let pooled = PooledClient::new(Box::new(client), BlockingPool::new(1));

        assert_eq!(pooled.protocol(), Protocol::Pop3);
        pooled.connect().await.unwrap();
        pooled.select_folder("INBOX").await.unwrap();
        let ids = pooled
            .new_identifiers(&SyncCheckpoint::empty(Protocol::Pop3))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        pooled.disconnect().await;
    }
}
