//! Checked-out connections and the per-call failover budget.

use std::fmt;
use std::sync::Arc;

use super::ConnectionPool;
use crate::backend::{BackendKind, BackendTransport};

/// One connection checked out of a pool.
///
/// Dropping the lease returns the slot; `ConnectionPool::release` is the
/// explicit spelling of the same thing.
pub struct ConnectionLease {
    pool: Arc<ConnectionPool>,
    index: usize,
    transport: Arc<dyn BackendTransport>,
}

impl ConnectionLease {
    pub(super) fn new(
        pool: Arc<ConnectionPool>,
        index: usize,
        transport: Arc<dyn BackendTransport>,
    ) -> Self {
        Self {
            pool,
            index,
            transport,
        }
    }

    /// Position of this connection within its pool
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> BackendKind {
        self.pool.kind()
    }

    /// Stable identity of the endpoint behind this connection
    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    pub fn transport(&self) -> Arc<dyn BackendTransport> {
        Arc::clone(&self.transport)
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("kind", &self.pool.kind())
            .field("index", &self.index)
            .field("endpoint", &self.transport.endpoint())
            .finish()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.pool.release_slot(self.index);
    }
}

/// Attempts left for one logical call: one per pool slot.
#[derive(Debug, Clone, Copy)]
pub struct FailoverBudget {
    attempts: usize,
    limit: usize,
}

impl FailoverBudget {
    pub fn new(pool_len: usize) -> Self {
        Self {
            attempts: 0,
            limit: pool_len,
        }
    }

    /// Record one more attempt. False once every slot has been tried.
    pub fn try_consume(&mut self) -> bool {
        if self.attempts >= self.limit {
            return false;
        }
        self.attempts += 1;
        true
    }

    /// Attempts made so far
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Result of a pooled call plus which connection served it.
#[derive(Debug, Clone)]
pub struct Served<T> {
    pub value: T,
    pub index: usize,
    pub endpoint: String,
    /// Connections tried, including the one that succeeded
    pub attempts: usize,
}

impl<T> Served<T> {
    /// Failovers that happened before success
    pub fn failovers(&self) -> usize {
        self.attempts.saturating_sub(1)
    }
}
