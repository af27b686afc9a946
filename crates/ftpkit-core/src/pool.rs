use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, error, warn};

use crate::ftp::FtpSession;
use crate::params::ConnectionParameters;
use crate::types::FtpKitError;

/// An FTP session checked out of the pool. Deref gives access to the
/// underlying [`FtpSession`]; the caller must hand it back through
/// [`FtpPool::release`] on every exit path.
pub struct PooledFtp {
    session: FtpSession,
    id: u64,
}

impl std::fmt::Debug for PooledFtp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledFtp")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl std::ops::Deref for PooledFtp {
    type Target = FtpSession;

    fn deref(&self) -> &FtpSession {
        &self.session
    }
}

impl std::ops::DerefMut for PooledFtp {
    fn deref_mut(&mut self) -> &mut FtpSession {
        &mut self.session
    }
}

struct ReadyQueue {
    tx: mpsc::Sender<PooledFtp>,
    rx: Arc<Mutex<mpsc::Receiver<PooledFtp>>>,
}

struct PoolState {
    /// `None` while the pool is closed.
    queue: Option<ReadyQueue>,
    /// Ids of sessions created by this pool; releases of anything else are
    /// dropped with a warning.
    tracked: HashSet<u64>,
}

/// Bounded pool of pre-authenticated FTP control sessions shared across
/// asynchronous callers.
///
/// The FTP protocol is command-oriented and blocking, so every wire call
/// runs on a worker thread via [`FtpPool::run_blocking`]; concurrency is
/// bounded by `max_workers` permits. The scheduler thread never blocks on
/// network I/O.
pub struct FtpPool {
    params: ConnectionParameters,
    state: Mutex<PoolState>,
    workers: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl FtpPool {
    /// Create a closed pool owning its own worker-permit budget.
    pub fn new(params: ConnectionParameters) -> Self {
        let workers = Arc::new(Semaphore::new(params.max_workers));
        Self::with_workers(params, workers)
    }

    /// Create a closed pool borrowing an externally supplied worker-permit
    /// budget (shared with the transfer orchestrator).
    pub fn with_workers(params: ConnectionParameters, workers: Arc<Semaphore>) -> Self {
        Self {
            params,
            state: Mutex::new(PoolState {
                queue: None,
                tracked: HashSet::new(),
            }),
            workers,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    /// The worker-permit budget bounding concurrent blocking jobs.
    pub fn worker_permits(&self) -> Arc<Semaphore> {
        self.workers.clone()
    }

    /// Run a blocking closure on a worker thread, bounded by the pool's
    /// permit budget.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T, FtpKitError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FtpKitError::Cancelled)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| FtpKitError::Ftp(format!("Worker task failed: {e}")))
    }

    /// Initialize the pool: open `max_connections` sessions in parallel
    /// under a total deadline of the configured timeout. Idempotent.
    pub async fn open(&self) -> Result<(), FtpKitError> {
        self.params.validate()?;

        let mut state = self.state.lock().await;
        if state.queue.is_some() {
            return Ok(());
        }

        let count = self.params.max_connections;
        let mut jobs = Vec::with_capacity(count);
        for _ in 0..count {
            let params = self.params.clone();
            jobs.push(tokio::task::spawn_blocking(move || {
                FtpSession::connect(&params)
            }));
        }

        let deadline = self.params.timeout();
        let joined = if deadline.is_zero() {
            futures_util::future::join_all(jobs).await
        } else {
            tokio::time::timeout(deadline, futures_util::future::join_all(jobs))
                .await
                .map_err(|_| {
                    error!("FTP connection pool failed to initialize within the timeout period.");
                    FtpKitError::Ftp("FTP connection pool initialization timed out.".to_string())
                })?
        };

        let mut sessions = Vec::with_capacity(count);
        for result in joined {
            let session = result
                .map_err(|e| FtpKitError::Ftp(format!("Connection task failed: {e}")))??;
            sessions.push(session);
        }

        let (tx, rx) = mpsc::channel(count);
        state.tracked.clear();
        for session in sessions {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            state.tracked.insert(id);
            if tx.try_send(PooledFtp { session, id }).is_err() {
                // Capacity equals the session count, so this cannot happen.
                warn!("Ready-queue rejected a freshly opened connection.");
            }
        }
        state.queue = Some(ReadyQueue {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        });

        debug!(
            connections = count,
            "FTP connection pool has been initialized"
        );
        Ok(())
    }

    /// Acquire a session, suspending until one is available.
    pub async fn get(&self) -> Result<PooledFtp, FtpKitError> {
        let rx = {
            let state = self.state.lock().await;
            match &state.queue {
                Some(queue) => queue.rx.clone(),
                None => {
                    error!("There is no active connection pool to acquire an FTP connection from.");
                    return Err(FtpKitError::PoolNotOpen);
                }
            }
        };
        let mut rx = rx.lock().await;
        rx.recv().await.ok_or(FtpKitError::PoolNotOpen)
    }

    /// Return a session to the ready-queue. Sessions this pool never
    /// created are dropped with a warning instead.
    pub async fn release(&self, pooled: PooledFtp) -> Result<(), FtpKitError> {
        let tx = {
            let state = self.state.lock().await;
            let Some(queue) = &state.queue else {
                error!("No active connection pool available to release the FTP connection.");
                return Err(FtpKitError::PoolNotOpen);
            };
            if !state.tracked.contains(&pooled.id) {
                warn!("Released FTP connection was not tracked.");
                return Ok(());
            }
            queue.tx.clone()
        };
        if tx.send(pooled).await.is_err() {
            // The pool closed while this session was checked out; dropping
            // it closes the socket.
            return Err(FtpKitError::PoolNotOpen);
        }
        Ok(())
    }

    /// Close every pooled session in parallel on worker threads. Idempotent.
    /// Outstanding checkouts are not reclaimed; releasing them afterwards
    /// fails with [`FtpKitError::PoolNotOpen`] and the sessions close on
    /// drop.
    pub async fn close(&self) -> Result<(), FtpKitError> {
        let mut state = self.state.lock().await;
        let Some(queue) = state.queue.take() else {
            debug!("No pool to close.");
            return Ok(());
        };
        state.tracked.clear();
        drop(queue.tx);

        let mut sessions = Vec::new();
        {
            let mut rx = queue.rx.lock().await;
            while let Ok(pooled) = rx.try_recv() {
                sessions.push(pooled);
            }
        }

        let mut jobs = Vec::with_capacity(sessions.len());
        for pooled in sessions {
            jobs.push(tokio::task::spawn_blocking(move || pooled.session.quit()));
        }
        for result in futures_util::future::join_all(jobs).await {
            match result {
                Ok(Ok(())) => {}
                // The stream already closed on drop inside `quit`.
                Ok(Err(e)) => warn!("Unable to close the FTP connection gracefully: {e}"),
                Err(e) => warn!("Connection close task failed: {e}"),
            }
        }

        debug!("All FTP connections in the pool and tracked set have been closed.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Credentials;

    fn params() -> ConnectionParameters {
        let mut params =
            ConnectionParameters::new("127.0.0.1", Credentials::new("test", "test")).unwrap();
        params.max_connections = 2;
        params.max_workers = 4;
        params.timeout_secs = 1;
        params
    }

    #[tokio::test]
    async fn test_get_on_closed_pool() {
        let pool = FtpPool::new(params());
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, FtpKitError::PoolNotOpen));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_when_never_opened() {
        let pool = FtpPool::new(params());
        pool.close().await.unwrap();
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_fails_without_server() {
        // Nothing listens on this port, so every connect job fails and the
        // pool must stay closed.
        let mut params = params();
        params.port = 1;
        let pool = FtpPool::new(params);

        assert!(pool.open().await.is_err());
        assert!(matches!(
            pool.get().await.unwrap_err(),
            FtpKitError::PoolNotOpen
        ));
    }

    #[tokio::test]
    async fn test_run_blocking_returns_value() {
        let pool = FtpPool::new(params());
        let value = pool.run_blocking(|| 41 + 1).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_blocking_bounded_by_worker_permits() {
        let mut params = params();
        params.max_workers = 1;
        let pool = Arc::new(FtpPool::new(params));

        let concurrent = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run_blocking(move || {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[ignore = "requires a live FTP server on 127.0.0.1:21"]
    async fn test_open_get_release_cycle() {
        let pool = FtpPool::new(params());
        pool.open().await.unwrap();
        pool.open().await.unwrap(); // idempotent

        let first = pool.get().await.unwrap();
        let second = pool.get().await.unwrap();
        pool.release(first).await.unwrap();
        pool.release(second).await.unwrap();

        pool.close().await.unwrap();
        assert!(matches!(
            pool.get().await.unwrap_err(),
            FtpKitError::PoolNotOpen
        ));
    }
}
