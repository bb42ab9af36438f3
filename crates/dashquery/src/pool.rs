//! Bounded connection pool
//!
//! Connections are created once and recycled for the life of the pool. A
//! counting semaphore keeps the number of checked-out connections at or below
//! capacity; callers queue on it for at most the acquire timeout. Each
//! connection sits behind its own lock, and a permit holder always finds one
//! of them free.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{QueryError, Result};

/// Fixed set of reusable backing-store connections
pub struct ConnectionPool<C> {
    slots: Vec<Arc<Mutex<C>>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    acquired: AtomicU64,
    timeouts: AtomicU64,
}

impl<C: Send + 'static> ConnectionPool<C> {
    /// Create a pool over `connections`
    ///
    /// # Arguments
    /// * `connections` - Every connection the pool will ever hand out
    /// * `acquire_timeout` - Longest wait in [`acquire`](Self::acquire)
    ///
    /// # Errors
    /// * `Config` - `connections` is empty
    pub fn new(connections: Vec<C>, acquire_timeout: Duration) -> Result<Arc<Self>> {
        if connections.is_empty() {
            return Err(QueryError::Config("pool needs at least one connection".to_string()));
        }
        let capacity = connections.len();
        Ok(Arc::new(Self {
            slots: connections
                .into_iter()
                .map(|conn| Arc::new(Mutex::new(conn)))
                .collect(),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }))
    }

    /// Check out a connection, waiting up to the acquire timeout
    ///
    /// # Returns
    /// * `Ok(conn)` - Connection held until the guard is dropped
    /// * `Err(PoolTimeout)` - No connection freed up in time
    /// * `Err(PoolClosed)` - Pool was closed
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<C>> {
        let permit = match timeout(self.acquire_timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(QueryError::PoolClosed),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    capacity = self.capacity,
                    waited_ms = self.acquire_timeout.as_millis() as u64,
                    "connection pool exhausted"
                );
                return Err(QueryError::PoolTimeout {
                    waited: self.acquire_timeout,
                });
            }
        };

        // Slots unlock before their permits are released
        let Some(conn) = self
            .slots
            .iter()
            .find_map(|slot| Arc::clone(slot).try_lock_owned().ok())
        else {
            return Err(QueryError::PoolClosed);
        };

        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active.fetch_max(active, Ordering::AcqRel);
        self.acquired.fetch_add(1, Ordering::Relaxed);
        debug!(active, capacity = self.capacity, "connection acquired");

        Ok(PooledConnection {
            conn,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Return a connection to the pool
    pub fn release(&self, conn: PooledConnection<C>) {
        drop(conn);
    }

    /// Stop handing out connections; waiting callers get `PoolClosed`
    pub fn close(&self) {
        self.permits.close();
    }

    fn check_in(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }
}

impl<C> ConnectionPool<C> {
    /// Total number of connections
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Connections currently checked out
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously checked-out connections
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::Acquire)
    }

    /// Successful acquisitions
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Acquisitions that gave up waiting
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Connections sitting in the pool
    pub fn idle(&self) -> usize {
        self.capacity.saturating_sub(self.active())
    }
}

/// Checked-out connection; returns to the pool on drop
pub struct PooledConnection<C: Send + 'static> {
    // Dropped before the permit: the connection goes back first
    conn: OwnedMutexGuard<C>,
    pool: Arc<ConnectionPool<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Send + 'static> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C: Send + 'static> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C: Send + 'static> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        self.pool.check_in();
    }
}
