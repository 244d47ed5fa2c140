//! Per-target connection pool
//!
//! A semaphore bounds the number of leased connections to `max_size`; idle
//! connections are kept for reuse. A lease is an RAII guard: dropping it
//! returns the connection to the idle list whether the caller succeeded,
//! failed or was cancelled. Connections that hit a connection-level error are
//! discarded instead.

use crate::backend::{Backend, BackendError, BackendResult, Connection, RowCursor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Sizing and timeout settings for one pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Connections opened up front by `prewarm`
    pub core_size: usize,
    /// Upper bound on concurrently leased connections
    pub max_size: usize,
    /// How long `lease` waits for a free slot
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            core_size: 2,
            max_size: 10,
            acquire_timeout: Duration::from_millis(5000),
        }
    }
}

/// Pool statistics
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub leases: AtomicU64,
    pub timeouts: AtomicU64,
    pub connections_created: AtomicU64,
    pub connection_failures: AtomicU64,
    pub discarded: AtomicU64,
}

impl PoolMetrics {
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            leases: self.leases.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `PoolMetrics`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolMetricsSnapshot {
    pub leases: u64,
    pub timeouts: u64,
    pub connections_created: u64,
    pub connection_failures: u64,
    pub discarded: u64,
}

/// Bounded pool of connections to one backend instance
pub struct ConnectionPool {
    target: String,
    backend: Arc<dyn Backend>,
    settings: PoolSettings,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    metrics: PoolMetrics,
}

impl ConnectionPool {
    pub fn new(target: impl Into<String>, backend: Arc<dyn Backend>, settings: PoolSettings) -> Self {
        let max_size = settings.max_size.max(1);
        Self {
            target: target.into(),
            backend,
            semaphore: Arc::new(Semaphore::new(max_size)),
            settings,
            idle: Mutex::new(Vec::new()),
            metrics: PoolMetrics::default(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Number of idle connections ready for reuse
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of leases currently out
    pub fn leased_count(&self) -> usize {
        self.settings.max_size.max(1) - self.semaphore.available_permits()
    }

    /// Open connections until `core_size` are idle
    ///
    /// Failures are logged, not returned; returns how many were opened.
    pub async fn prewarm(&self) -> usize {
        let wanted = self
            .settings
            .core_size
            .min(self.settings.max_size)
            .saturating_sub(self.idle_count());

        let mut opened = 0;
        for _ in 0..wanted {
            match self.open().await {
                Ok(conn) => {
                    self.idle.lock().push(conn);
                    opened += 1;
                }
                Err(e) => {
                    tracing::warn!(instance = %self.target, error = %e, "Failed to pre-warm connection");
                    break;
                }
            }
        }

        tracing::debug!(instance = %self.target, opened, "Pre-warmed connection pool");
        opened
    }

    /// Lease a connection, waiting at most `acquire_timeout` for a free slot
    pub async fn lease(self: &Arc<Self>) -> BackendResult<PooledConnection> {
        let permit = match tokio::time::timeout(
            self.settings.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BackendError::PoolClosed(self.target.clone())),
            Err(_) => {
                self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(BackendError::PoolTimeout {
                    target: self.target.clone(),
                    timeout_ms: self.settings.acquire_timeout.as_millis() as u64,
                });
            }
        };

        let idle = self.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.open().await?,
        };

        self.metrics.leases.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            broken: false,
            _permit: permit,
        })
    }

    /// Stop handing out leases and drop idle connections
    pub fn close(&self) {
        self.semaphore.close();
        self.idle.lock().clear();
    }

    async fn open(&self) -> BackendResult<Box<dyn Connection>> {
        match self.backend.connect(&self.target).await {
            Ok(conn) => {
                self.metrics
                    .connections_created
                    .fetch_add(1, Ordering::Relaxed);
                Ok(conn)
            }
            Err(e) => {
                self.metrics
                    .connection_failures
                    .fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn release(&self, conn: Box<dyn Connection>, broken: bool) {
        if broken || self.semaphore.is_closed() {
            self.metrics.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.idle.lock().push(conn);
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.target)
            .field("backend", &self.backend.name())
            .field("settings", &self.settings)
            .field("idle", &self.idle_count())
            .finish()
    }
}

/// A leased connection, returned to its pool on drop
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<ConnectionPool>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("target", &self.pool.target)
            .field("broken", &self.broken)
            .finish()
    }
}

impl PooledConnection {
    pub fn target(&self) -> &str {
        self.pool.target()
    }

    /// Discard the connection instead of returning it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub async fn query(&mut self, sql: &str) -> BackendResult<Box<dyn RowCursor>> {
        let result = self.connection()?.query(sql).await;
        self.observe(result)
    }

    pub async fn execute_batch(&mut self, statements: &[String]) -> BackendResult<()> {
        let result = self.connection()?.execute_batch(statements).await;
        self.observe(result)
    }

    pub async fn ping(&mut self) -> BackendResult<()> {
        let result = self.connection()?.ping().await;
        self.observe(result)
    }

    fn connection(&mut self) -> BackendResult<&mut Box<dyn Connection>> {
        let target = self.pool.target.clone();
        self.conn.as_mut().ok_or(BackendError::PoolClosed(target))
    }

    fn observe<T>(&mut self, result: BackendResult<T>) -> BackendResult<T> {
        if let Err(e) = &result {
            if e.is_connection_error() {
                self.broken = true;
            }
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.broken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn pool(backend: &MemoryBackend, settings: PoolSettings) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            "mem://a",
            Arc::new(backend.clone()),
            settings,
        ))
    }

    #[tokio::test]
    async fn test_prewarm_to_core_size() {
        let backend = MemoryBackend::new();
        let pool = pool(&backend, PoolSettings::default());

        assert_eq!(pool.prewarm().await, 2);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.metrics().connections_created, 2);
    }

    #[tokio::test]
    async fn test_lease_returns_on_drop() {
        let backend = MemoryBackend::new();
        let pool = pool(&backend, PoolSettings::default());

        {
            let mut lease = pool.lease().await.unwrap();
            lease.ping().await.unwrap();
            assert_eq!(pool.leased_count(), 1);
        }

        assert_eq!(pool.leased_count(), 0);
        assert_eq!(pool.idle_count(), 1);

        // The idle connection is reused
        let _lease = pool.lease().await.unwrap();
        assert_eq!(pool.metrics().connections_created, 1);
    }

    #[tokio::test]
    async fn test_lease_times_out_at_max_size() {
        let backend = MemoryBackend::new();
        let settings = PoolSettings {
            core_size: 0,
            max_size: 1,
            acquire_timeout: Duration::from_millis(20),
        };
        let pool = pool(&backend, settings);

        let _held = pool.lease().await.unwrap();
        let err = pool.lease().await.unwrap_err();
        assert!(matches!(err, BackendError::PoolTimeout { timeout_ms: 20, .. }));
        assert_eq!(pool.metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_discarded() {
        let backend = MemoryBackend::new();
        let pool = pool(&backend, PoolSettings::default());

        {
            let mut lease = pool.lease().await.unwrap();
            lease.mark_broken();
        }

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.metrics().discarded, 1);
        assert_eq!(pool.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_lease_is_released() {
        let backend = MemoryBackend::new();
        let pool = pool(&backend, PoolSettings::default());

        let task_pool = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            let _lease = task_pool.lease().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();
        let _ = handle.await;

        assert_eq!(pool.leased_count(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_counted() {
        let backend = MemoryBackend::new();
        backend.set_available("mem://a", false);
        let pool = pool(&backend, PoolSettings::default());

        assert!(pool.lease().await.is_err());
        assert_eq!(pool.metrics().connection_failures, 1);
        assert_eq!(pool.leased_count(), 0);
    }
}
